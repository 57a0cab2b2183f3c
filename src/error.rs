use thiserror::Error;

use crate::config::ConfigError;
use crate::simulator::{RegistryError, SimulatorError};

/// 应用程序统一错误类型
#[derive(Error, Debug)]
pub enum AppError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 设备注册表错误
    #[error("注册表错误: {0}")]
    Registry(#[from] RegistryError),

    /// 模拟器主循环错误
    #[error("模拟器错误: {0}")]
    Simulator(#[from] SimulatorError),
}

/// AppError 的 Result 类型别名
pub type Result<T> = std::result::Result<T, AppError>;
