use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::parse_device_list;
use crate::simulator::{DeviceList, DeviceRegistry, RegistryError};

/// 基于本地 JSON 文件的设备注册表
///
/// 每次拉取都重新读取文件，文件不存在视为注册表暂无数据。
pub struct FileDeviceRegistry {
    path: PathBuf,
}

impl FileDeviceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DeviceRegistry for FileDeviceRegistry {
    async fn fetch_device_list(&self) -> Result<Option<DeviceList>, RegistryError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("设备列表文件不存在: {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        parse_device_list(&content).map(Some)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}
