//! 模拟器配置

mod simulator_config;

pub use simulator_config::{
    ConfigError, DeviceDefaults, LoggingConfig, RegistryConfig, RegistrySource, SimulatorConfig,
    SimulatorSettings,
};
