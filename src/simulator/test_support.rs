//! 测试用的设备、工厂和注册表

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::traits::{DeviceFactory, DeviceRegistry, DeviceWorker, FactoryError, RegistryError, WorkerError};
use super::types::{DeviceConfig, DeviceId, DeviceList};

/// 记录启动/停止次数的设备
pub struct MockWorker {
    id: DeviceId,
    running: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    start_delay: Option<Duration>,
    stop_delay: Option<Duration>,
    fail_start: bool,
    fail_stop: bool,
    panic_start: bool,
    started_at: Mutex<Option<Instant>>,
    stopped_at: Mutex<Option<Instant>>,
}

impl MockWorker {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self::build(id))
    }

    fn build(id: &str) -> Self {
        Self {
            id: DeviceId::from(id),
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            start_delay: None,
            stop_delay: None,
            fail_start: false,
            fail_stop: false,
            panic_start: false,
            started_at: Mutex::new(None),
            stopped_at: Mutex::new(None),
        }
    }

    fn modify(self: Arc<Self>, f: impl FnOnce(&mut Self)) -> Arc<Self> {
        let mut inner = Arc::try_unwrap(self).unwrap_or_else(|_| panic!("MockWorker 已被共享"));
        f(&mut inner);
        Arc::new(inner)
    }

    pub fn with_start_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        self.modify(|w| w.start_delay = Some(delay))
    }

    pub fn with_stop_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        self.modify(|w| w.stop_delay = Some(delay))
    }

    pub fn failing_start(self: Arc<Self>) -> Arc<Self> {
        self.modify(|w| w.fail_start = true)
    }

    pub fn failing_stop(self: Arc<Self>) -> Arc<Self> {
        self.modify(|w| w.fail_stop = true)
    }

    pub fn panicking_start(self: Arc<Self>) -> Arc<Self> {
        self.modify(|w| w.panic_start = true)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock().unwrap()
    }

    pub fn stopped_at(&self) -> Option<Instant> {
        *self.stopped_at.lock().unwrap()
    }
}

#[async_trait]
impl DeviceWorker for MockWorker {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    async fn start(&self) -> Result<(), WorkerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.started_at.lock().unwrap() = Some(Instant::now());

        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_start {
            panic!("模拟启动 panic: {}", self.id);
        }
        if self.fail_start {
            return Err(WorkerError::StartFailed(format!("模拟启动失败: {}", self.id)));
        }

        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.stop_delay {
            tokio::time::sleep(delay).await;
        }

        self.running.store(false, Ordering::SeqCst);
        *self.stopped_at.lock().unwrap() = Some(Instant::now());

        if self.fail_stop {
            return Err(WorkerError::TaskJoin(format!("模拟停止失败: {}", self.id)));
        }
        Ok(())
    }
}

/// 记录所有已构建设备的工厂
#[derive(Default)]
pub struct MockFactory {
    created: Mutex<HashMap<DeviceId, Vec<Arc<MockWorker>>>>,
    failing: Mutex<HashSet<DeviceId>>,
    start_delay: Option<Duration>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_start_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            start_delay: Some(delay),
            ..Self::default()
        })
    }

    /// 让指定设备的构建失败
    pub fn fail_for(&self, id: &str) {
        self.failing.lock().unwrap().insert(DeviceId::from(id));
    }

    pub fn recover(&self, id: &str) {
        self.failing.lock().unwrap().remove(&DeviceId::from(id));
    }

    /// 某个设备构建过的所有实例
    pub fn workers(&self, id: &str) -> Vec<Arc<MockWorker>> {
        self.created
            .lock()
            .unwrap()
            .get(&DeviceId::from(id))
            .cloned()
            .unwrap_or_default()
    }

    /// 当前处于运行状态的设备 ID
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .created
            .lock()
            .unwrap()
            .values()
            .flatten()
            .filter(|w| w.is_running())
            .map(|w| w.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn all_workers(&self) -> Vec<Arc<MockWorker>> {
        self.created.lock().unwrap().values().flatten().cloned().collect()
    }
}

impl DeviceFactory for MockFactory {
    fn create_worker(&self, config: &DeviceConfig) -> Result<Arc<dyn DeviceWorker>, FactoryError> {
        if self.failing.lock().unwrap().contains(&config.device_id) {
            return Err(FactoryError::InvalidParameters {
                device_id: config.device_id.clone(),
                reason: "模拟构建失败".to_string(),
            });
        }

        let worker = MockWorker::new(config.device_id.as_str());
        let worker = match self.start_delay {
            Some(delay) => worker.with_start_delay(delay),
            None => worker,
        };

        self.created
            .lock()
            .unwrap()
            .entry(config.device_id.clone())
            .or_default()
            .push(Arc::clone(&worker));

        Ok(worker)
    }
}

/// 按脚本依次返回结果的注册表，脚本耗尽后重复最后一次成功结果
#[derive(Default)]
pub struct MockRegistry {
    script: Mutex<VecDeque<Result<Option<DeviceList>, RegistryError>>>,
    last: Mutex<Option<DeviceList>>,
    fetches: AtomicUsize,
}

impl MockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_devices(&self, ids: &[&str]) {
        let devices = ids.iter().map(|id| DeviceConfig::new(*id)).collect();
        self.script.lock().unwrap().push_back(Ok(Some(devices)));
    }

    pub fn push_absent(&self) {
        self.script.lock().unwrap().push_back(Ok(None));
    }

    pub fn push_error(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(RegistryError::Unavailable(message.to_string())));
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceRegistry for MockRegistry {
    async fn fetch_device_list(&self) -> Result<Option<DeviceList>, RegistryError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(devices)) => {
                *self.last.lock().unwrap() = devices.clone();
                Ok(devices)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// 把 ID 列表转换为 DeviceId
pub fn ids(raw: &[&str]) -> Vec<DeviceId> {
    raw.iter().map(|id| DeviceId::from(*id)).collect()
}
