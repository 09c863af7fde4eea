use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("等待互斥文件超时: {} ({waited_ms}ms)", path.display())]
    MutexTimeout { path: PathBuf, waited_ms: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON 序列化失败: {0}")]
    Json(#[from] sonic_rs::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn mutex_timeout(path: impl Into<PathBuf>, waited_ms: u64) -> Self {
        Self::MutexTimeout {
            path: path.into(),
            waited_ms,
        }
    }

    /// 是否为互斥文件等待超时（调用方可据此决定降级或重试）。
    pub fn is_mutex_timeout(&self) -> bool {
        matches!(self, Self::MutexTimeout { .. })
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_timeout_is_classified() {
        let err = AppError::mutex_timeout("/tmp/x.lock", 1500);
        assert!(err.is_mutex_timeout());
        assert!(err.to_string().contains("1500ms"));

        let err = AppError::config("bad");
        assert!(!err.is_mutex_timeout());
        assert_eq!(err.to_string(), "配置错误: bad");
    }
}
