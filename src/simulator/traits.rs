use std::sync::Arc;

use async_trait::async_trait;

use super::types::{DeviceConfig, DeviceId, DeviceList};

/// 设备注册表 trait，提供期望运行的设备列表
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// 拉取当前设备列表
    ///
    /// `Ok(None)` 表示注册表暂时没有数据，与空列表一样按“没有期望设备”处理。
    async fn fetch_device_list(&self) -> Result<Option<DeviceList>, RegistryError>;

    /// 注册表描述（用于日志）
    fn describe(&self) -> String;
}

/// 设备工厂 trait，根据配置构建可运行的设备
pub trait DeviceFactory: Send + Sync {
    /// 构建设备实例，失败时返回错误而不是 panic
    fn create_worker(&self, config: &DeviceConfig) -> Result<Arc<dyn DeviceWorker>, FactoryError>;
}

/// 设备运行单元 trait
///
/// `start` 和 `stop` 都必须是幂等的：重复启动为空操作，重复停止不得报错。
#[async_trait]
pub trait DeviceWorker: Send + Sync {
    /// 获取设备 ID
    fn id(&self) -> &DeviceId;

    /// 启动设备
    async fn start(&self) -> Result<(), WorkerError>;

    /// 停止设备并释放资源
    async fn stop(&self) -> Result<(), WorkerError>;
}

/// 注册表相关错误
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("注册表不可用: {0}")]
    Unavailable(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("数据格式错误: {0}")]
    InvalidData(String),

    #[error("读取失败: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// 数据格式错误重试也无济于事
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RegistryError::InvalidData(_))
    }
}

/// 设备构建错误
#[derive(thiserror::Error, Debug)]
pub enum FactoryError {
    #[error("不支持的设备类型: {kind} (设备: {device_id})")]
    UnsupportedKind { device_id: DeviceId, kind: String },

    #[error("无效的设备参数: {device_id}: {reason}")]
    InvalidParameters { device_id: DeviceId, reason: String },
}

/// 设备运行错误
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("启动失败: {0}")]
    StartFailed(String),

    #[error("后台任务异常: {0}")]
    TaskJoin(String),
}
