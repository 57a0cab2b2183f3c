//! 设备列表差异计算

use std::collections::HashSet;

use super::types::{DeviceConfig, DeviceId};

/// 两次拉取之间的设备差异
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDiff {
    /// 本次出现、上次没有的设备
    pub new_devices: Vec<DeviceConfig>,

    /// 上次存在、本次消失的设备
    pub removed_devices: Vec<DeviceId>,
}

impl DeviceDiff {
    pub fn is_empty(&self) -> bool {
        self.new_devices.is_empty() && self.removed_devices.is_empty()
    }
}

/// 计算上一轮快照与本次拉取结果的差异
///
/// `current` 为 `None` 或空列表时，上一轮的所有设备都视为已移除。
/// 两边都存在的设备不出现在结果中。
pub fn diff_devices(previous: &[DeviceConfig], current: Option<&[DeviceConfig]>) -> DeviceDiff {
    let current = match current {
        Some(list) if !list.is_empty() => list,
        _ => {
            return DeviceDiff {
                new_devices: Vec::new(),
                removed_devices: previous.iter().map(|d| d.device_id.clone()).collect(),
            };
        }
    };

    let previous_ids: HashSet<&DeviceId> = previous.iter().map(|d| &d.device_id).collect();
    let current_ids: HashSet<&DeviceId> = current.iter().map(|d| &d.device_id).collect();

    let new_devices = current
        .iter()
        .filter(|d| !previous_ids.contains(&d.device_id))
        .cloned()
        .collect();

    let removed_devices = previous
        .iter()
        .filter(|d| !current_ids.contains(&d.device_id))
        .map(|d| d.device_id.clone())
        .collect();

    DeviceDiff {
        new_devices,
        removed_devices,
    }
}

/// 去掉重复 ID，保留第一次出现的配置，返回被丢弃的 ID
pub fn dedup_devices(devices: &mut Vec<DeviceConfig>) -> Vec<DeviceId> {
    let mut seen = HashSet::new();
    let mut dropped = Vec::new();

    devices.retain(|d| {
        if seen.insert(d.device_id.clone()) {
            true
        } else {
            dropped.push(d.device_id.clone());
            false
        }
    });

    dropped
}
