mod config;
mod device;
mod error;
mod logger;
mod registry;
mod simulator;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use config::SimulatorConfig;
use device::SimulatedDeviceFactory;
use error::AppError;
use simulator::{DeviceEvent, DeviceManager, Reconciler};

const DEFAULT_CONFIG_PATH: &str = "config/simulator.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // 配置错误直接退出
    let config = SimulatorConfig::load(&config_path).map_err(AppError::Config)?;
    let _log_guard = logger::init_tracing(&config.logging)?;

    info!("加载配置: {}", config_path);

    if let Err(e) = run(config).await {
        error!("模拟器异常退出: {}", e);
        return Err(e.into());
    }

    info!("模拟器已退出");
    Ok(())
}

async fn run(config: SimulatorConfig) -> error::Result<()> {
    let registry = registry::build_registry(&config.registry)?;
    let factory = Arc::new(SimulatedDeviceFactory::from_config(&config));
    let mut reconciler = Reconciler::new(registry, factory, &config.simulator);

    spawn_event_logger(reconciler.manager());

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("收到退出信号，正在停止模拟器...");
                shutdown.cancel();
            }
            Err(e) => error!("监听退出信号失败: {}", e),
        }
    });

    reconciler.run(token).await
}

/// 把设备生命周期事件写入日志
fn spawn_event_logger(manager: &DeviceManager) {
    let mut events = manager.subscribe_events();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(DeviceEvent::StartFailed { device_id, error }) => {
                    warn!("设备 {} 启动失败: {}", device_id, error);
                }
                Ok(DeviceEvent::Starting { device_id }) => debug!("设备事件: {} 启动中", device_id),
                Ok(DeviceEvent::Started { device_id }) => debug!("设备事件: {} 已启动", device_id),
                Ok(DeviceEvent::Stopping { device_id }) => debug!("设备事件: {} 停止中", device_id),
                Ok(DeviceEvent::Stopped { device_id }) => debug!("设备事件: {} 已停止", device_id),
                Err(RecvError::Lagged(skipped)) => warn!("设备事件积压，丢弃 {} 条", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
