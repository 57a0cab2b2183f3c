//! 模拟设备实现
//!
//! 启动后按固定间隔生成遥测数据并写入设备日志，停止时取消后台任务并等待其退出。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::logger::DeviceLogger;
use crate::simulator::{DeviceId, DeviceWorker, WorkerError};

/// 设备模拟参数
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceProfile {
    /// 发动机：温度和转速读数
    Engine { base_temperature: f64, base_rpm: f64 },

    /// 只发送心跳
    Heartbeat,
}

impl DeviceProfile {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceProfile::Engine { .. } => "engine",
            DeviceProfile::Heartbeat => "heartbeat",
        }
    }

    fn readings(&self, sequence: u64) -> serde_json::Value {
        match self {
            DeviceProfile::Engine {
                base_temperature,
                base_rpm,
            } => {
                let step = sequence as f64;
                serde_json::json!({
                    "temperature": base_temperature + 5.0 * (step * 0.3).sin(),
                    "rpm": base_rpm + 50.0 * (step * 0.2).cos(),
                })
            }
            DeviceProfile::Heartbeat => serde_json::json!({ "status": "alive" }),
        }
    }
}

/// 单条遥测消息
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryMessage<'a> {
    message_id: Uuid,
    device_id: &'a DeviceId,
    kind: &'static str,
    sequence: u64,
    timestamp: DateTime<Utc>,
    readings: serde_json::Value,
}

struct TelemetryTask {
    token: CancellationToken,
    handle: JoinHandle<u64>,
}

/// 模拟设备
pub struct SimulatedDevice {
    id: DeviceId,
    profile: DeviceProfile,
    interval: Duration,
    logger: DeviceLogger,
    task: Mutex<Option<TelemetryTask>>,
}

impl SimulatedDevice {
    pub fn new(id: DeviceId, profile: DeviceProfile, interval: Duration, logger: DeviceLogger) -> Self {
        Self {
            id,
            profile,
            interval,
            logger,
            task: Mutex::new(None),
        }
    }

    /// 是否正在发送遥测
    #[cfg(test)]
    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }
}

async fn telemetry_loop(
    device_id: DeviceId,
    profile: DeviceProfile,
    interval: Duration,
    logger: DeviceLogger,
    token: CancellationToken,
) -> u64 {
    let mut ticker = tokio::time::interval(interval);
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let message = TelemetryMessage {
                    message_id: Uuid::new_v4(),
                    device_id: &device_id,
                    kind: profile.kind(),
                    sequence,
                    timestamp: Utc::now(),
                    readings: profile.readings(sequence),
                };

                match serde_json::to_string(&message) {
                    Ok(json) => logger.debug(&json),
                    Err(e) => logger.warn(&format!("遥测序列化失败: {}", e)),
                }
                sequence += 1;
            }
        }
    }

    sequence
}

#[async_trait]
impl DeviceWorker for SimulatedDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    async fn start(&self) -> Result<(), WorkerError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            self.logger.debug("设备已在运行，忽略启动请求");
            return Ok(());
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(telemetry_loop(
            self.id.clone(),
            self.profile.clone(),
            self.interval,
            self.logger.clone(),
            token.clone(),
        ));
        *task = Some(TelemetryTask { token, handle });

        self.logger.info(&format!(
            "设备已启动 (类型: {}, 遥测间隔: {}s)",
            self.profile.kind(),
            self.interval.as_secs()
        ));
        Ok(())
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };

        task.token.cancel();
        let sent = task
            .handle
            .await
            .map_err(|e| WorkerError::TaskJoin(e.to_string()))?;

        self.logger.info(&format!("设备已停止，共发送 {} 条遥测", sent));
        Ok(())
    }
}
