use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::simulated::{DeviceProfile, SimulatedDevice};
use crate::config::{DeviceDefaults, SimulatorConfig};
use crate::logger::DeviceLogger;
use crate::simulator::{DeviceConfig, DeviceFactory, DeviceWorker, FactoryError};

const TELEMETRY_INTERVAL_PARAM: &str = "telemetryIntervalSeconds";
const BASE_TEMPERATURE_PARAM: &str = "baseTemperature";
const BASE_RPM_PARAM: &str = "baseRpm";

/// 支持的设备类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Engine,
    Heartbeat,
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "engine" => Ok(DeviceKind::Engine),
            "heartbeat" => Ok(DeviceKind::Heartbeat),
            other => Err(other.to_string()),
        }
    }
}

/// 根据设备配置构造模拟设备
pub struct SimulatedDeviceFactory {
    defaults: DeviceDefaults,
    log_dir: Option<PathBuf>,
}

impl SimulatedDeviceFactory {
    pub fn new(defaults: DeviceDefaults, log_dir: Option<PathBuf>) -> Self {
        Self { defaults, log_dir }
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        let log_dir = config
            .logging
            .device_log_files
            .then(|| PathBuf::from(&config.logging.log_dir));
        Self::new(config.device.clone(), log_dir)
    }

    fn telemetry_interval(&self, config: &DeviceConfig) -> Result<Duration, FactoryError> {
        let seconds = match config.parameters.get(TELEMETRY_INTERVAL_PARAM) {
            None => self.defaults.telemetry_interval_seconds,
            Some(value) => value.as_u64().filter(|s| *s > 0).ok_or_else(|| {
                FactoryError::InvalidParameters {
                    device_id: config.device_id.clone(),
                    reason: format!("{} 必须为正整数，实际为 {}", TELEMETRY_INTERVAL_PARAM, value),
                }
            })?,
        };
        Ok(Duration::from_secs(seconds))
    }

    fn profile(&self, kind: DeviceKind, config: &DeviceConfig) -> Result<DeviceProfile, FactoryError> {
        Ok(match kind {
            DeviceKind::Engine => DeviceProfile::Engine {
                base_temperature: number_param(config, BASE_TEMPERATURE_PARAM, 70.0)?,
                base_rpm: number_param(config, BASE_RPM_PARAM, 1500.0)?,
            },
            DeviceKind::Heartbeat => DeviceProfile::Heartbeat,
        })
    }
}

fn number_param(config: &DeviceConfig, name: &str, default: f64) -> Result<f64, FactoryError> {
    match config.parameters.get(name) {
        None => Ok(default),
        Some(value) => value.as_f64().ok_or_else(|| FactoryError::InvalidParameters {
            device_id: config.device_id.clone(),
            reason: format!("{} 必须为数字，实际为 {}", name, value),
        }),
    }
}

impl DeviceFactory for SimulatedDeviceFactory {
    fn create_worker(&self, config: &DeviceConfig) -> Result<Arc<dyn DeviceWorker>, FactoryError> {
        let kind_name = config.kind.as_deref().unwrap_or(self.defaults.default_kind.as_str());
        let kind: DeviceKind = kind_name.parse().map_err(|kind| FactoryError::UnsupportedKind {
            device_id: config.device_id.clone(),
            kind,
        })?;

        let interval = self.telemetry_interval(config)?;
        let profile = self.profile(kind, config)?;
        let logger = DeviceLogger::new(config.device_id.as_str(), self.log_dir.as_deref());

        debug!(
            "构造设备 {} (类型: {:?}, 遥测间隔: {:?}, 主机: {}, 密钥: {})",
            config.device_id,
            kind,
            interval,
            config.host_name.as_deref().unwrap_or("-"),
            if config.key.is_some() { "已配置" } else { "无" }
        );

        Ok(Arc::new(SimulatedDevice::new(
            config.device_id.clone(),
            profile,
            interval,
            logger,
        )))
    }
}
