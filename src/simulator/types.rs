//! 模拟器相关的类型定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// 设备唯一标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// 注册表中的单个设备配置
///
/// 相等性和哈希只看 `device_id`，其余字段只是交给设备工厂的模拟参数。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub device_id: DeviceId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// 设备类型，由工厂决定具体的设备实现
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
impl DeviceConfig {
    /// 创建只有 ID 的设备配置
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            host_name: None,
            key: None,
            kind: None,
            parameters: serde_json::Map::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

impl PartialEq for DeviceConfig {
    fn eq(&self, other: &Self) -> bool {
        self.device_id == other.device_id
    }
}

impl Eq for DeviceConfig {}

impl Hash for DeviceConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.device_id.hash(state);
    }
}

/// 注册表一次拉取的设备快照
pub type DeviceList = Vec<DeviceConfig>;

/// 设备生命周期状态，不在管理器中即为已移除
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// 正在启动
    Starting,
    /// 运行中
    Running,
    /// 正在停止
    Stopping,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Starting => write!(f, "启动中"),
            DeviceState::Running => write!(f, "运行中"),
            DeviceState::Stopping => write!(f, "停止中"),
        }
    }
}

/// 设备生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// 开始启动
    Starting { device_id: DeviceId },

    /// 启动成功
    Started { device_id: DeviceId },

    /// 启动失败
    StartFailed { device_id: DeviceId, error: String },

    /// 开始停止
    Stopping { device_id: DeviceId },

    /// 已停止（停止失败也会发送，标识已经释放）
    Stopped { device_id: DeviceId },
}

/// 单次同步周期的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// 新发现的设备数
    pub new_devices: usize,

    /// 被移除的设备数
    pub removed_devices: usize,

    /// 已提交启动的设备数
    pub start_requested: usize,

    /// 构建失败的设备数
    pub construction_failed: usize,

    /// 本周期拉取是否失败
    pub fetch_failed: bool,
}

/// 模拟器主循环错误
#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    #[error("同步周期异常终止: {0}")]
    CycleFailed(String),
}
