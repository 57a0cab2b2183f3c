//! 设备同步主循环
//!
//! 周期性拉取注册表中的设备列表，与上一轮快照比较后启动新设备、停止被移除的设备。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::diff::{dedup_devices, diff_devices};
use super::manager::DeviceManager;
use super::traits::{DeviceFactory, DeviceRegistry, DeviceWorker};
use super::types::{CycleReport, DeviceConfig, DeviceList, SimulatorError};
use crate::config::SimulatorSettings;
use crate::error::Result;

/// 设备同步器
pub struct Reconciler {
    registry: Arc<dyn DeviceRegistry>,
    factory: Arc<dyn DeviceFactory>,
    manager: DeviceManager,
    poll_interval: Duration,

    /// 为 true 时构建或启动失败的设备不计入快照，下一轮重新尝试
    retry_failed_devices: bool,

    /// 上一轮拉取到的设备列表
    snapshot: DeviceList,
}

impl Reconciler {
    /// 创建新的同步器
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        factory: Arc<dyn DeviceFactory>,
        settings: &SimulatorSettings,
    ) -> Self {
        Self {
            registry,
            factory,
            manager: DeviceManager::new(),
            poll_interval: settings.poll_interval(),
            retry_failed_devices: settings.retry_failed_devices,
            snapshot: Vec::new(),
        }
    }

    /// 获取设备管理器
    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    /// 上一轮的设备快照
    #[cfg(test)]
    pub fn snapshot(&self) -> &[DeviceConfig] {
        &self.snapshot
    }

    /// 运行同步循环直到取消
    ///
    /// 无论正常取消还是异常退出，返回前都会停止全部设备。
    pub async fn run(&mut self, token: CancellationToken) -> Result<()> {
        info!(
            "********** 启动模拟器 ********** (注册表: {}, 轮询间隔: {}s)",
            self.registry.describe(),
            self.poll_interval.as_secs()
        );

        let result = match AssertUnwindSafe(self.run_cycles(&token)).catch_unwind().await {
            Ok(()) => Ok(()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("同步周期异常终止: {}", message);
                Err(SimulatorError::CycleFailed(message).into())
            }
        };

        self.manager.stop_all().await;
        result
    }

    async fn run_cycles(&mut self, token: &CancellationToken) {
        while !token.is_cancelled() {
            let report = self.reconcile_once().await;
            self.log_cycle(&report).await;

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("********** 收到取消信号，模拟器停止 **********");
    }

    /// 执行一轮同步：拉取、比较、停止、启动
    pub async fn reconcile_once(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let devices = match self.registry.fetch_device_list().await {
            Ok(Some(mut devices)) => {
                let dropped = dedup_devices(&mut devices);
                if !dropped.is_empty() {
                    warn!("注册表返回了重复的设备 ID，已忽略: {:?}", dropped);
                }
                if devices.is_empty() {
                    debug!("注册表中没有设备");
                }
                Some(devices)
            }
            Ok(None) => {
                debug!("注册表暂无数据");
                None
            }
            Err(e) => {
                error!("拉取设备列表失败: {}", e);
                report.fetch_failed = true;
                None
            }
        };

        if self.retry_failed_devices {
            let failed = self.manager.take_failed().await;
            if !failed.is_empty() {
                debug!("以下设备启动失败，本轮重新尝试: {:?}", failed);
                self.snapshot.retain(|d| !failed.contains(&d.device_id));
            }
        }

        let diff = diff_devices(&self.snapshot, devices.as_deref());
        report.new_devices = diff.new_devices.len();
        report.removed_devices = diff.removed_devices.len();

        if diff.is_empty() {
            debug!("设备列表无变化");
        }

        if report.new_devices > 0 {
            info!("********** 发现 {} 个新设备 **********", report.new_devices);
        }
        if report.removed_devices > 0 {
            info!("********** 移除 {} 个设备 **********", report.removed_devices);
        }

        // 先替换快照再执行启停，正在启动的设备不会在下一轮被重复请求
        self.snapshot = devices.unwrap_or_default();

        if !diff.removed_devices.is_empty() {
            self.manager.stop_devices(&diff.removed_devices).await;
        }

        if !diff.new_devices.is_empty() {
            let mut workers: Vec<Arc<dyn DeviceWorker>> = Vec::with_capacity(diff.new_devices.len());

            for config in &diff.new_devices {
                info!("********** 正在配置新设备: {} **********", config.device_id);
                match self.factory.create_worker(config) {
                    Ok(worker) => workers.push(worker),
                    Err(e) => {
                        error!("设备构建失败，本轮跳过: {} ({})", config.device_id, e);
                        report.construction_failed += 1;
                        if self.retry_failed_devices {
                            self.snapshot.retain(|d| d.device_id != config.device_id);
                        }
                    }
                }
            }

            report.start_requested = workers.len();
            self.manager.start_devices(workers).await;
        }

        report
    }

    async fn log_cycle(&self, report: &CycleReport) {
        let tracked = self.manager.tracked_devices().await.len();
        let running = self.manager.running_devices().await.len();

        if report.fetch_failed || report.construction_failed > 0 {
            warn!(
                "本轮同步存在失败 (拉取失败: {}, 构建失败: {}), 管理中 {} 个设备，运行中 {} 个",
                report.fetch_failed, report.construction_failed, tracked, running
            );
        } else {
            debug!(
                "本轮同步完成: 新增 {}, 移除 {}, 请求启动 {}, 管理中 {}, 运行中 {}",
                report.new_devices, report.removed_devices, report.start_requested, tracked, running
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知 panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::simulator::test_support::{ids, MockFactory, MockRegistry};
    use crate::simulator::traits::RegistryError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(poll_seconds: u64, retry_failed_devices: bool) -> SimulatorSettings {
        SimulatorSettings {
            device_poll_interval_seconds: poll_seconds,
            retry_failed_devices,
        }
    }

    fn reconciler(
        registry: &Arc<MockRegistry>,
        factory: &Arc<MockFactory>,
        retry_failed_devices: bool,
    ) -> Reconciler {
        Reconciler::new(
            Arc::clone(registry) as Arc<dyn DeviceRegistry>,
            Arc::clone(factory) as Arc<dyn DeviceFactory>,
            &settings(120, retry_failed_devices),
        )
    }

    fn snapshot_ids(reconciler: &Reconciler) -> Vec<&str> {
        reconciler
            .snapshot()
            .iter()
            .map(|d| d.device_id.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_add_remove_and_empty_cycles() {
        let registry = MockRegistry::new();
        let factory = MockFactory::new();
        let mut reconciler = reconciler(&registry, &factory, false);

        registry.push_devices(&["A", "B"]);
        registry.push_devices(&["B", "C"]);
        registry.push_absent();

        let report = reconciler.reconcile_once().await;
        reconciler.manager().wait_pending().await;
        assert_eq!(report.new_devices, 2);
        assert_eq!(report.start_requested, 2);
        assert_eq!(snapshot_ids(&reconciler), vec!["A", "B"]);
        assert_eq!(reconciler.manager().running_devices().await, ids(&["A", "B"]));

        let report = reconciler.reconcile_once().await;
        reconciler.manager().wait_pending().await;
        assert_eq!(report.new_devices, 1);
        assert_eq!(report.removed_devices, 1);
        assert_eq!(reconciler.manager().running_devices().await, ids(&["B", "C"]));
        assert!(!factory.workers("A")[0].is_running());
        // B 没有被重启
        assert_eq!(factory.workers("B").len(), 1);
        assert_eq!(factory.workers("B")[0].start_count(), 1);
        assert_eq!(factory.workers("B")[0].stop_count(), 0);

        let report = reconciler.reconcile_once().await;
        reconciler.manager().wait_pending().await;
        assert_eq!(report.removed_devices, 2);
        assert!(reconciler.manager().tracked_devices().await.is_empty());
        assert!(reconciler.snapshot().is_empty());
        assert!(factory.running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_error_counts_as_no_devices() {
        let registry = MockRegistry::new();
        let factory = MockFactory::new();
        let mut reconciler = reconciler(&registry, &factory, false);

        registry.push_devices(&["A"]);
        registry.push_error("503");
        registry.push_devices(&["A"]);

        reconciler.reconcile_once().await;
        let report = reconciler.reconcile_once().await;
        reconciler.manager().wait_pending().await;
        assert!(report.fetch_failed);
        assert_eq!(report.removed_devices, 1);
        assert!(reconciler.manager().running_devices().await.is_empty());

        let report = reconciler.reconcile_once().await;
        reconciler.manager().wait_pending().await;
        assert!(!report.fetch_failed);
        assert_eq!(report.new_devices, 1);
        assert_eq!(reconciler.manager().running_devices().await, ids(&["A"]));
        assert_eq!(factory.workers("A").len(), 2);
    }

    #[tokio::test]
    async fn test_construction_failure_is_skipped() {
        let registry = MockRegistry::new();
        let factory = MockFactory::new();
        factory.fail_for("D");
        let mut reconciler = reconciler(&registry, &factory, false);

        registry.push_devices(&["D", "E"]);
        let report = reconciler.reconcile_once().await;
        reconciler.manager().wait_pending().await;

        assert_eq!(report.construction_failed, 1);
        assert_eq!(report.start_requested, 1);
        assert_eq!(reconciler.manager().running_devices().await, ids(&["E"]));
        assert_eq!(reconciler.manager().device_state(&"D".into()).await, None);

        // 默认行为：失败的设备仍在快照里，不会被重试
        factory.recover("D");
        let report = reconciler.reconcile_once().await;
        assert_eq!(report.new_devices, 0);
        assert!(factory.workers("D").is_empty());
    }

    #[tokio::test]
    async fn test_retry_failed_devices_on_next_cycle() {
        let registry = MockRegistry::new();
        let factory = MockFactory::new();
        factory.fail_for("D");
        let mut reconciler = reconciler(&registry, &factory, true);

        registry.push_devices(&["D", "E"]);
        reconciler.reconcile_once().await;
        reconciler.manager().wait_pending().await;
        assert_eq!(snapshot_ids(&reconciler), vec!["E"]);

        factory.recover("D");
        let report = reconciler.reconcile_once().await;
        reconciler.manager().wait_pending().await;
        assert_eq!(report.new_devices, 1);
        assert_eq!(reconciler.manager().running_devices().await, ids(&["D", "E"]));
    }

    #[tokio::test]
    async fn test_duplicate_ids_start_once() {
        let registry = MockRegistry::new();
        let factory = MockFactory::new();
        let mut reconciler = reconciler(&registry, &factory, false);

        registry.push_devices(&["A", "A", "B"]);
        let report = reconciler.reconcile_once().await;
        reconciler.manager().wait_pending().await;

        assert_eq!(report.new_devices, 2);
        assert_eq!(factory.workers("A").len(), 1);
        assert_eq!(snapshot_ids(&reconciler), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_start_is_not_requested_again() {
        let registry = MockRegistry::new();
        let factory = MockFactory::with_start_delay(Duration::from_secs(600));
        let mut reconciler = reconciler(&registry, &factory, false);

        registry.push_devices(&["A"]);
        reconciler.reconcile_once().await;
        let report = reconciler.reconcile_once().await;

        assert_eq!(report.new_devices, 0);
        assert_eq!(factory.workers("A").len(), 1);
        reconciler.manager().stop_all().await;
        assert!(factory.running_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_stops_everything() {
        let registry = MockRegistry::new();
        let factory = MockFactory::new();
        registry.push_devices(&["A", "B"]);

        let mut reconciler = reconciler(&registry, &factory, false);
        let manager = reconciler.manager().clone();
        let token = CancellationToken::new();
        let run_token = token.clone();
        let started = tokio::time::Instant::now();

        let handle = tokio::spawn(async move { reconciler.run(run_token).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.running_devices().await, ids(&["A", "B"]));

        token.cancel();
        let result = handle.await.unwrap();

        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(120));
        assert_eq!(registry.fetch_count(), 1);
        assert!(manager.tracked_devices().await.is_empty());
        for worker in factory.all_workers() {
            assert!(!worker.is_running());
            assert_eq!(worker.stop_count(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_polls_at_interval() {
        let registry = MockRegistry::new();
        let factory = MockFactory::new();
        registry.push_devices(&["A"]);
        registry.push_devices(&["A", "B"]);

        let mut reconciler = reconciler(&registry, &factory, false);
        let manager = reconciler.manager().clone();
        let token = CancellationToken::new();
        let run_token = token.clone();

        let handle = tokio::spawn(async move { reconciler.run(run_token).await });

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.fetch_count(), 1);

        tokio::time::sleep(Duration::from_secs(70)).await;
        assert_eq!(registry.fetch_count(), 2);
        assert_eq!(manager.running_devices().await, ids(&["A", "B"]));

        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(factory.running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_already_cancelled_still_stops_all() {
        let registry = MockRegistry::new();
        let factory = MockFactory::new();
        let mut reconciler = reconciler(&registry, &factory, false);

        let token = CancellationToken::new();
        token.cancel();
        reconciler.run(token).await.unwrap();

        assert_eq!(registry.fetch_count(), 0);
    }

    /// 第一次返回设备，之后 panic
    struct PanickingRegistry {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeviceRegistry for PanickingRegistry {
        async fn fetch_device_list(&self) -> std::result::Result<Option<DeviceList>, RegistryError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Some(vec![DeviceConfig::new("A")]))
            } else {
                panic!("注册表内部错误");
            }
        }

        fn describe(&self) -> String {
            "panicking".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_failure_stops_all_and_propagates() {
        let factory = MockFactory::new();
        let registry = Arc::new(PanickingRegistry {
            calls: AtomicUsize::new(0),
        });
        let mut reconciler = Reconciler::new(
            registry,
            Arc::clone(&factory) as Arc<dyn DeviceFactory>,
            &settings(5, false),
        );

        let result = reconciler.run(CancellationToken::new()).await;

        match result {
            Err(AppError::Simulator(SimulatorError::CycleFailed(message))) => {
                assert!(message.contains("注册表内部错误"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(reconciler.manager().tracked_devices().await.is_empty());
        assert!(factory.running_ids().is_empty());
        assert_eq!(factory.workers("A")[0].stop_count(), 1);
    }
}
