//! 模拟设备
//!
//! `SimulatedDeviceFactory` 按设备类型和参数构造 `SimulatedDevice`，
//! 设备启动后周期性生成遥测数据。

mod factory;
mod simulated;

pub use factory::SimulatedDeviceFactory;
