use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, error};

use super::parse_device_list;
use crate::simulator::{DeviceList, DeviceRegistry, RegistryError};

/// 通过 HTTP 接口获取设备列表的注册表
pub struct HttpDeviceRegistry {
    client: Client,
    url: String,
}

impl HttpDeviceRegistry {
    /// 创建新的 HTTP 注册表客户端
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Network(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DeviceRegistry for HttpDeviceRegistry {
    async fn fetch_device_list(&self) -> Result<Option<DeviceList>, RegistryError> {
        debug!("请求设备列表: {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| RegistryError::Network(format!("发送请求失败: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            debug!("注册表暂无数据: {}", status);
            return Ok(None);
        }

        let body = response
            .text()
            .await
            .map_err(|e| RegistryError::Network(format!("读取响应失败: {}", e)))?;

        if !status.is_success() {
            error!("注册表请求失败: {} - {}", status, body);
            return Err(RegistryError::Unavailable(format!("{} - {}", status, body)));
        }

        parse_device_list(&body).map(Some)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
