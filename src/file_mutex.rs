//! 基于哨兵文件的跨进程互斥。
//!
//! - 获取：`create_new` 独占创建哨兵文件，已存在则按轮询间隔重试直到超时
//! - 过期回收：哨兵文件的修改时间超过阈值时视为持有者已崩溃，内容未变才删除后重试
//! - 释放：删除哨兵文件后关闭句柄；只删除自己写入的那一份

use crate::error::{AppError, AppResult};
use crate::persist;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const DEFAULT_MUTEX_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MUTEX_POLL: Duration = Duration::from_millis(25);
pub const DEFAULT_MUTEX_STALE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FileMutex {
    path: PathBuf,
    timeout: Duration,
    poll: Duration,
    stale_after: Duration,
}

/// 持有期间哨兵文件存在；`release` 或 drop 时删除。
#[derive(Debug)]
pub struct FileMutexGuard {
    path: PathBuf,
    token: String,
    file: Option<tokio::fs::File>,
}

impl FileMutex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_MUTEX_TIMEOUT,
            poll: DEFAULT_MUTEX_POLL,
            stale_after: DEFAULT_MUTEX_STALE,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll.max(Duration::from_millis(1));
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn acquire(&self) -> AppResult<FileMutexGuard> {
        persist::ensure_parent_dir(&self.path).await?;
        let started = Instant::now();
        let token = format!("{} {}", std::process::id(), uuid::Uuid::new_v4().simple());

        loop {
            match self.try_create(&token).await {
                Ok(file) => {
                    return Ok(FileMutexGuard {
                        path: self.path.clone(),
                        token,
                        file: Some(file),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            if let Some(seen) = self.stale_content().await {
                if remove_if_unchanged(&self.path, &seen).await? {
                    tracing::warn!(path = %self.path.display(), "互斥文件已过期，强制删除后重试");
                }
                continue;
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                return Err(AppError::mutex_timeout(
                    self.path.clone(),
                    elapsed.as_millis().min(u64::MAX as u128) as u64,
                ));
            }
            tokio::time::sleep(self.poll.min(self.timeout - elapsed)).await;
        }
    }

    async fn try_create(&self, token: &str) -> std::io::Result<tokio::fs::File> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await?;
        fill_sentinel(&self.path, file, token).await
    }

    /// 哨兵已过期时返回判定前读到的内容，用于删除前确认没有被他人替换。
    ///
    /// 先读内容再看修改时间：两者之间若被替换，新文件的修改时间是新的，不会误判为过期。
    async fn stale_content(&self) -> Option<String> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        let modified = tokio::fs::metadata(&self.path).await.ok()?.modified().ok()?;
        let stale = SystemTime::now()
            .duration_since(modified)
            .is_ok_and(|age| age > self.stale_after);
        stale.then_some(content)
    }
}

impl FileMutexGuard {
    /// 删除哨兵文件并关闭句柄。哨兵已被他人回收时不会误删对方的文件。
    pub async fn release(mut self) -> AppResult<()> {
        let result = remove_if_owned(&self.path, &self.token).await;
        self.file.take();
        result
    }
}

impl Drop for FileMutexGuard {
    fn drop(&mut self) {
        if self.file.take().is_none() {
            return;
        }
        // 未显式 release（例如 panic 或提前返回）：同步兜底删除。
        if std::fs::read_to_string(&self.path).is_ok_and(|c| c == self.token) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// 写入持有者标记；写入失败时删除已创建的空哨兵，否则所有人都要等到它过期。
async fn fill_sentinel<W>(path: &Path, mut writer: W, token: &str) -> std::io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    let written = async {
        writer.write_all(token.as_bytes()).await?;
        writer.flush().await
    }
    .await;
    match written {
        Ok(()) => Ok(writer),
        Err(e) => {
            drop(writer);
            if let Err(rm) = tokio::fs::remove_file(path).await
                && rm.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), error = %rm, "删除写入失败的互斥文件失败");
            }
            Err(e)
        }
    }
}

/// 内容仍与过期判定时一致才删除；返回是否删除。
async fn remove_if_unchanged(path: &Path, seen: &str) -> AppResult<bool> {
    match tokio::fs::read_to_string(path).await {
        Ok(current) if current == seen => {}
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_owned(path: &Path, token: &str) -> AppResult<()> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content == token => {}
        Ok(_) => {
            tracing::warn!(path = %path.display(), "互斥文件已被其他进程回收，跳过删除");
            return Ok(());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
