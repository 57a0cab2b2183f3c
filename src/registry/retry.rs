use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::simulator::{DeviceList, DeviceRegistry, RegistryError};

/// 重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RetryStrategy {
    /// 立即重试
    #[serde(rename = "immediate")]
    Immediate,

    /// 固定延迟重试
    #[serde(rename = "fixed")]
    FixedDelay { delay_ms: u64 },

    /// 指数退避重试
    #[serde(rename = "exponential")]
    ExponentialBackoff {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },

    /// 无重试
    #[serde(rename = "none")]
    None,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::exponential(500, 5000, 2.0)
    }
}

impl RetryStrategy {
    /// 获取下一次重试的延迟时间
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryStrategy::Immediate => Some(Duration::from_millis(0)),
            RetryStrategy::FixedDelay { delay_ms } => Some(Duration::from_millis(*delay_ms)),
            RetryStrategy::ExponentialBackoff {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64 * multiplier.powi(attempt as i32)) as u64;
                Some(Duration::from_millis(delay.min(*max_delay_ms)))
            }
            RetryStrategy::None => None,
        }
    }

    /// 创建指数退避策略
    pub fn exponential(initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self::ExponentialBackoff {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        }
    }

    /// 创建固定延迟策略
    #[cfg(test)]
    pub fn fixed(delay_ms: u64) -> Self {
        Self::FixedDelay { delay_ms }
    }
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大尝试次数（包含第一次）
    pub max_attempts: u32,

    /// 重试策略
    pub strategy: RetryStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// 创建新的重试配置
    #[cfg(test)]
    pub fn new(max_attempts: u32, strategy: RetryStrategy) -> Self {
        Self {
            max_attempts,
            strategy,
        }
    }

    /// 执行带重试的操作，`should_retry` 返回 false 的错误立即返回
    pub async fn execute<F, Fut, T, E, R>(&self, mut operation: F, should_retry: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        R: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("操作在第 {} 次重试后成功", attempt);
                    }
                    return Ok(result);
                }
                Err(e) => {
                    attempt += 1;
                    warn!("操作失败（第 {} 次尝试）: {}", attempt, e);

                    if attempt >= max_attempts || !should_retry(&e) {
                        return Err(e);
                    }

                    match self.strategy.next_delay(attempt - 1) {
                        Some(delay) => {
                            debug!("等待 {:?} 后重试", delay);
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e),
                    }
                }
            }
        }
    }
}

/// 带重试的注册表包装
pub struct RetryingRegistry {
    inner: Arc<dyn DeviceRegistry>,
    retry: RetryConfig,
}

impl RetryingRegistry {
    pub fn new(inner: Arc<dyn DeviceRegistry>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl DeviceRegistry for RetryingRegistry {
    async fn fetch_device_list(&self) -> Result<Option<DeviceList>, RegistryError> {
        self.retry
            .execute(|| self.inner.fetch_device_list(), RegistryError::is_retryable)
            .await
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}
