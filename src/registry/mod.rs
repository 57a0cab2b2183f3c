//! 设备注册表客户端
//!
//! 提供本地文件和 HTTP 两种注册表实现，统一包装重试逻辑

mod file;
mod http;
mod retry;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::{RegistryConfig, RegistrySource};
use crate::simulator::{DeviceConfig, DeviceList, DeviceRegistry, RegistryError};

pub use file::FileDeviceRegistry;
pub use http::HttpDeviceRegistry;
pub use retry::{RetryConfig, RetryingRegistry};
#[cfg(test)]
pub use retry::RetryStrategy;

/// 注册表返回的数据格式：设备数组，或包含 `devices` 字段的对象
#[derive(Deserialize)]
#[serde(untagged)]
enum DeviceListPayload {
    List(Vec<DeviceConfig>),
    Wrapped { devices: Vec<DeviceConfig> },
}

/// 解析注册表返回的 JSON，空内容视为空列表
pub fn parse_device_list(content: &str) -> Result<DeviceList, RegistryError> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let payload: DeviceListPayload = serde_json::from_str(content)
        .map_err(|e| RegistryError::InvalidData(format!("解析设备列表失败: {}", e)))?;

    Ok(match payload {
        DeviceListPayload::List(devices) => devices,
        DeviceListPayload::Wrapped { devices } => devices,
    })
}

/// 根据配置创建注册表客户端
pub fn build_registry(config: &RegistryConfig) -> Result<Arc<dyn DeviceRegistry>, RegistryError> {
    let inner: Arc<dyn DeviceRegistry> = match &config.source {
        RegistrySource::File { path } => Arc::new(FileDeviceRegistry::new(path)),
        RegistrySource::Http { url, timeout_secs } => Arc::new(HttpDeviceRegistry::new(
            url.clone(),
            Duration::from_secs(*timeout_secs),
        )?),
    };

    Ok(Arc::new(RetryingRegistry::new(inner, config.retry.clone())))
}
