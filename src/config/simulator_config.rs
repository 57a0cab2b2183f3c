use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::registry::RetryConfig;

/// 默认设备轮询间隔（秒）
pub const DEFAULT_DEVICE_POLL_INTERVAL_SECONDS: u64 = 120;

/// 覆盖轮询间隔的环境变量
pub const POLL_INTERVAL_ENV: &str = "DEVICE_POLL_INTERVAL_SECONDS";

/// 覆盖注册表地址的环境变量（file 类型为路径，http 类型为 URL）
pub const REGISTRY_LOCATION_ENV: &str = "DEVICE_REGISTRY_LOCATION";

/// 覆盖日志目录的环境变量
pub const LOG_DIR_ENV: &str = "SIMULATOR_LOG_DIR";

/// 完整的模拟器配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub simulator: SimulatorSettings,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
    pub device: DeviceDefaults,
}

/// 同步循环配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    /// 轮询间隔（秒），必须为正整数
    pub device_poll_interval_seconds: u64,

    /// 构建或启动失败的设备是否在下一轮重试
    pub retry_failed_devices: bool,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            device_poll_interval_seconds: DEFAULT_DEVICE_POLL_INTERVAL_SECONDS,
            retry_failed_devices: false,
        }
    }
}

impl SimulatorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.device_poll_interval_seconds)
    }
}

/// 注册表来源
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistrySource {
    /// 本地 JSON 文件
    File { path: String },

    /// HTTP 接口，返回 JSON
    Http {
        url: String,
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for RegistrySource {
    fn default() -> Self {
        Self::File {
            path: "config/devices.json".to_string(),
        }
    }
}

/// 注册表配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(flatten)]
    pub source: RegistrySource,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志目录
    pub log_dir: String,

    /// 默认日志级别（RUST_LOG 优先）
    pub level: String,

    /// 是否为每个设备单独写日志文件
    pub device_log_files: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            level: "info".to_string(),
            device_log_files: true,
        }
    }
}

/// 设备默认参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDefaults {
    /// 遥测发送间隔（秒）
    pub telemetry_interval_seconds: u64,

    /// 未指定类型时使用的设备类型
    pub default_kind: String,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self {
            telemetry_interval_seconds: 15,
            default_kind: "engine".to_string(),
        }
    }
}

impl SimulatorConfig {
    /// 从 TOML 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_toml(&content)
    }

    /// 从 TOML 字符串解析配置
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// 加载配置：文件存在时读取文件，否则使用默认值；随后应用环境变量并校验
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 使用环境变量覆盖配置
    ///
    /// 无法解析的轮询间隔直接报错，不回退到默认值。
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(POLL_INTERVAL_ENV) {
            self.simulator.device_poll_interval_seconds =
                parse_poll_interval(&raw).ok_or_else(|| {
                    ConfigError::ValidationError(format!(
                        "{} 必须为正整数秒数，实际为: {:?}",
                        POLL_INTERVAL_ENV, raw
                    ))
                })?;
        }

        if let Some(location) = lookup(REGISTRY_LOCATION_ENV) {
            match &mut self.registry.source {
                RegistrySource::File { path } => *path = location,
                RegistrySource::Http { url, .. } => *url = location,
            }
        }

        if let Some(log_dir) = lookup(LOG_DIR_ENV) {
            self.logging.log_dir = log_dir;
        }

        Ok(())
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulator.device_poll_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "device_poll_interval_seconds 必须大于 0".to_string(),
            ));
        }

        if self.device.telemetry_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "telemetry_interval_seconds 必须大于 0".to_string(),
            ));
        }

        match &self.registry.source {
            RegistrySource::File { path } if path.trim().is_empty() => {
                return Err(ConfigError::ValidationError("注册表文件路径为空".to_string()));
            }
            RegistrySource::Http { url, .. } if !url.starts_with("http://") && !url.starts_with("https://") => {
                return Err(ConfigError::ValidationError(format!("无效的注册表 URL: {}", url)));
            }
            _ => {}
        }

        Ok(())
    }
}

fn parse_poll_interval(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|secs| *secs > 0)
}

/// 配置错误
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO 错误: {0}")]
    IoError(String),

    #[error("解析错误: {0}")]
    ParseError(String),

    #[error("验证错误: {0}")]
    ValidationError(String),
}
