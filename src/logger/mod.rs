use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// 初始化全局日志：控制台 + 按天滚动的文件
///
/// 返回的 guard 需要一直持有，否则文件日志会丢失尾部。
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("device_simulator={},warn", config.level)))?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "simulator.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .try_init()?;

    Ok(guard)
}

/// 设备日志记录器
///
/// 每个模拟设备写一个独立的文本文件，同时转发到 tracing。
#[derive(Clone)]
pub struct DeviceLogger {
    device_id: String,
    log_path: Option<PathBuf>,
    file_handle: Arc<Mutex<Option<std::fs::File>>>,
}

impl DeviceLogger {
    /// 为指定设备创建日志记录器，`log_dir` 为 None 时只输出到 tracing
    pub fn new(device_id: &str, log_dir: Option<&Path>) -> Self {
        let log_path = log_dir.map(|dir| dir.join(format!("device_{}.log", sanitize(device_id))));

        DeviceLogger {
            device_id: device_id.to_string(),
            log_path,
            file_handle: Arc::new(Mutex::new(None)),
        }
    }

    /// 日志文件路径
    #[cfg(test)]
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    fn lock_file(&self) -> MutexGuard<'_, Option<std::fs::File>> {
        match self.file_handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 写入日志到文件
    fn write_to_file(&self, message: &str) {
        let Some(path) = &self.log_path else {
            return;
        };

        let mut file_guard = self.lock_file();

        if file_guard.is_none() {
            let opened = path
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|_| OpenOptions::new().create(true).append(true).open(path));

            match opened {
                Ok(file) => *file_guard = Some(file),
                Err(e) => {
                    tracing::warn!(device = %self.device_id, "打开设备日志文件失败: {:?}", e);
                    return;
                }
            }
        }

        if let Some(ref mut file) = *file_guard {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let log_line = format!("{} [{}] {}\n", timestamp, self.device_id, message);

            if let Err(e) = file.write_all(log_line.as_bytes()) {
                tracing::warn!(device = %self.device_id, "写入设备日志失败: {:?}", e);
            }
        }
    }

    /// 记录 INFO 级别日志
    pub fn info(&self, message: &str) {
        self.write_to_file(&format!("INFO  {}", message));
        tracing::info!(device = %self.device_id, "{}", message);
    }

    /// 记录 WARN 级别日志
    pub fn warn(&self, message: &str) {
        self.write_to_file(&format!("WARN  {}", message));
        tracing::warn!(device = %self.device_id, "{}", message);
    }

    /// 记录 DEBUG 级别日志（只写文件和 tracing debug）
    pub fn debug(&self, message: &str) {
        self.write_to_file(&format!("DEBUG {}", message));
        tracing::debug!(device = %self.device_id, "{}", message);
    }
}

/// 设备 ID 可能包含路径分隔符
fn sanitize(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}
