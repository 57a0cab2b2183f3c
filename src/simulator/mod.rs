//! 设备同步模块
//!
//! 注册表拉取、差异计算、设备生命周期管理

mod diff;
mod manager;
mod reconciler;
mod traits;
mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use manager::DeviceManager;
pub use reconciler::Reconciler;
pub use traits::{DeviceFactory, DeviceRegistry, DeviceWorker, FactoryError, RegistryError, WorkerError};
pub use types::{DeviceConfig, DeviceEvent, DeviceId, DeviceList, SimulatorError};
