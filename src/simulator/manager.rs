//! 设备生命周期管理
//!
//! 管理 `DeviceId -> 设备实例` 映射，负责批量启动、批量停止和全部停止。
//! 映射表只在读写时加锁，设备自身的 `start`/`stop` 永远在锁外执行。

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::traits::{DeviceWorker, WorkerError};
use super::types::{DeviceEvent, DeviceId, DeviceState};

/// 设备停止完成信号，可被多个等待者共享
type StopSignal = Shared<BoxFuture<'static, ()>>;

/// 映射表中的设备条目（启动中或运行中）
struct DeviceEntry {
    generation: u64,
    state: DeviceState,
    worker: Arc<dyn DeviceWorker>,
}

/// 正在停止的设备
struct StoppingEntry {
    generation: u64,
    done: StopSignal,
}

#[derive(Default)]
struct DeviceTable {
    entries: HashMap<DeviceId, DeviceEntry>,
    stopping: HashMap<DeviceId, StoppingEntry>,

    /// 启动中被移除的实例，启动任务停止旧实例后通过它通知等待者
    detached: HashMap<u64, oneshot::Sender<()>>,

    failed: HashSet<DeviceId>,
    generation: u64,
}

impl DeviceTable {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

/// 设备生命周期管理器
///
/// 克隆出的实例共享同一张映射表。
#[derive(Clone)]
pub struct DeviceManager {
    /// 设备映射表
    table: Arc<Mutex<DeviceTable>>,

    /// 启动/停止后台任务计数
    tasks: TaskTracker,

    /// 事件发送器
    event_tx: broadcast::Sender<DeviceEvent>,
}

impl DeviceManager {
    /// 创建新的设备管理器
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            table: Arc::new(Mutex::new(DeviceTable::default())),
            tasks: TaskTracker::new(),
            event_tx,
        }
    }

    /// 订阅事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.event_tx.subscribe()
    }

    /// 批量启动设备，不等待启动完成
    ///
    /// 每个设备的启动在独立任务中进行，单个设备失败不影响其他设备。
    /// 如果同一 ID 已有运行中的实例，新实例会等旧实例停止后再启动。
    pub async fn start_devices(&self, workers: Vec<Arc<dyn DeviceWorker>>) {
        for worker in workers {
            let device_id = worker.id().clone();

            let (generation, previous) = {
                let mut table = self.table.lock().await;
                let generation = table.next_generation();
                table.failed.remove(&device_id);

                match table.entries.remove(&device_id) {
                    Some(old) if old.state == DeviceState::Running => {
                        warn!("设备已在运行，先停止旧实例: {}", device_id);
                        self.retire(&mut table, device_id.clone(), old.generation, old.worker);
                    }
                    Some(old) => {
                        warn!("设备仍在启动，旧实例启动结束并停止后再启动: {}", device_id);
                        self.detach(&mut table, device_id.clone(), old.generation);
                    }
                    None => {}
                }

                let previous = table.stopping.get(&device_id).map(|s| s.done.clone());

                table.entries.insert(
                    device_id.clone(),
                    DeviceEntry {
                        generation,
                        state: DeviceState::Starting,
                        worker: Arc::clone(&worker),
                    },
                );

                (generation, previous)
            };

            let _ = self.event_tx.send(DeviceEvent::Starting {
                device_id: device_id.clone(),
            });

            let manager = self.clone();
            self.tasks.spawn(async move {
                manager.run_start(device_id, generation, worker, previous).await;
            });
        }
    }

    /// 批量停止设备，不等待停止完成；未知 ID 直接忽略
    pub async fn stop_devices(&self, device_ids: &[DeviceId]) {
        let mut table = self.table.lock().await;

        for device_id in device_ids {
            match table.entries.remove(device_id) {
                Some(entry) if entry.state == DeviceState::Running => {
                    self.retire(&mut table, device_id.clone(), entry.generation, entry.worker);
                }
                Some(entry) => {
                    debug!("设备仍在启动，启动完成后停止: {}", device_id);
                    self.detach(&mut table, device_id.clone(), entry.generation);
                }
                None => debug!("设备未被管理，忽略停止请求: {}", device_id),
            }
        }
    }

    /// 停止全部设备并等待完成
    ///
    /// 调用时仍在启动中的设备会在启动结束后被立即停止，本方法返回前
    /// 所有启动和停止任务都已结束。
    pub async fn stop_all(&self) {
        let pending: Vec<StopSignal> = {
            let mut table = self.table.lock().await;
            let entries: Vec<(DeviceId, DeviceEntry)> = table.entries.drain().collect();

            for (device_id, entry) in entries {
                if entry.state == DeviceState::Running {
                    self.retire(&mut table, device_id, entry.generation, entry.worker);
                } else {
                    self.detach(&mut table, device_id, entry.generation);
                }
            }

            table.stopping.values().map(|s| s.done.clone()).collect()
        };

        info!("正在停止全部设备: {} 个", pending.len());
        join_all(pending).await;
        self.wait_pending().await;
        info!("全部设备已停止");
    }

    /// 等待所有进行中的启动/停止任务结束
    pub async fn wait_pending(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// 获取设备当前状态，未被管理时返回 None
    #[cfg(test)]
    pub async fn device_state(&self, device_id: &DeviceId) -> Option<DeviceState> {
        let table = self.table.lock().await;
        table
            .entries
            .get(device_id)
            .map(|entry| entry.state)
            .or_else(|| {
                table
                    .stopping
                    .contains_key(device_id)
                    .then_some(DeviceState::Stopping)
            })
    }

    /// 获取所有启动中或运行中的设备
    pub async fn tracked_devices(&self) -> Vec<DeviceId> {
        let table = self.table.lock().await;
        let mut ids: Vec<DeviceId> = table.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 获取所有运行中的设备
    pub async fn running_devices(&self) -> Vec<DeviceId> {
        let table = self.table.lock().await;
        let mut ids: Vec<DeviceId> = table
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == DeviceState::Running)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// 取出上次调用以来启动失败的设备
    pub async fn take_failed(&self) -> HashSet<DeviceId> {
        std::mem::take(&mut self.table.lock().await.failed)
    }

    async fn run_start(
        self,
        device_id: DeviceId,
        generation: u64,
        worker: Arc<dyn DeviceWorker>,
        previous: Option<StopSignal>,
    ) {
        if let Some(done) = previous {
            debug!("等待旧实例停止: {}", device_id);
            done.await;
        }

        debug!("正在启动设备: {}", device_id);
        let result = match AssertUnwindSafe(worker.start()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::StartFailed("启动过程中发生 panic".to_string())),
        };

        let mut table = self.table.lock().await;
        let is_current = table
            .entries
            .get(&device_id)
            .is_some_and(|entry| entry.generation == generation);

        if let Ok(()) = result {
            if is_current {
                if let Some(entry) = table.entries.get_mut(&device_id) {
                    entry.state = DeviceState::Running;
                }
                drop(table);

                info!("设备已启动: {}", device_id);
                let _ = self.event_tx.send(DeviceEvent::Started { device_id });
                return;
            }
            info!("设备启动完成时已被移除，立即停止: {}", device_id);
        }

        if let Err(e) = &result {
            error!("设备启动失败: {} ({})", device_id, e);
            let _ = self.event_tx.send(DeviceEvent::StartFailed {
                device_id: device_id.clone(),
                error: e.to_string(),
            });
            if is_current {
                table.entries.remove(&device_id);
                table.failed.insert(device_id.clone());
            }
        }

        // 启动失败也可能占用了部分资源，同样执行停止
        let detached = table.detached.remove(&generation);
        match detached {
            Some(notify) => {
                drop(table);
                stop_signal(device_id, worker).await;
                let _ = notify.send(());
            }
            None => self.retire(&mut table, device_id, generation, worker),
        }
    }

    /// 将运行中的设备转入停止流程
    ///
    /// 调用方必须持有映射表锁；停止本身在后台任务中执行。停止失败时
    /// 设备同样会被移出映射表。
    fn retire(
        &self,
        table: &mut DeviceTable,
        device_id: DeviceId,
        generation: u64,
        worker: Arc<dyn DeviceWorker>,
    ) {
        let done = stop_signal(device_id.clone(), worker);
        self.track_stopping(table, device_id, generation, done);
    }

    /// 将仍在启动的设备转入停止流程
    ///
    /// 设备由它自己的启动任务在启动结束后停止，停止完成前该 ID 保持
    /// `Stopping` 状态，新实例会等待它。
    fn detach(&self, table: &mut DeviceTable, device_id: DeviceId, generation: u64) {
        let (notify, stopped) = oneshot::channel();
        table.detached.insert(generation, notify);

        // 发送端被丢弃（启动任务异常退出）同样视为停止完成
        let done: StopSignal = async move {
            let _ = stopped.await;
        }
        .boxed()
        .shared();

        self.track_stopping(table, device_id, generation, done);
    }

    fn track_stopping(
        &self,
        table: &mut DeviceTable,
        device_id: DeviceId,
        generation: u64,
        done: StopSignal,
    ) {
        let _ = self.event_tx.send(DeviceEvent::Stopping {
            device_id: device_id.clone(),
        });

        table.stopping.insert(
            device_id.clone(),
            StoppingEntry {
                generation,
                done: done.clone(),
            },
        );

        let stop = done.clone();
        let table_ref = Arc::clone(&self.table);
        let event_tx = self.event_tx.clone();
        self.tasks.spawn(async move {
            stop.await;

            {
                let mut table = table_ref.lock().await;
                if table
                    .stopping
                    .get(&device_id)
                    .is_some_and(|s| s.generation == generation)
                {
                    table.stopping.remove(&device_id);
                }
            }

            let _ = event_tx.send(DeviceEvent::Stopped { device_id });
        });
    }
}

/// 构造停止设备的共享 future，停止失败或 panic 都视为已释放
fn stop_signal(device_id: DeviceId, worker: Arc<dyn DeviceWorker>) -> StopSignal {
    async move {
        match AssertUnwindSafe(worker.stop()).catch_unwind().await {
            Ok(Ok(())) => info!("设备已停止: {}", device_id),
            Ok(Err(e)) => warn!("设备停止失败，已释放: {} ({})", device_id, e),
            Err(_) => error!("设备停止过程中发生 panic，已释放: {}", device_id),
        }
    }
    .boxed()
    .shared()
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}
