//! 模型锁：跨进程按模型互斥，带租约续期与崩溃回收。
//!
//! 共享状态是一个 JSON 文件（锁键 -> 持有者），所有读改写都在 [`FileMutex`] 保护下进行：
//! 获取互斥 -> 读取状态（缺失/损坏视为空）-> 清理他人的过期条目 -> 执行操作
//! -> 有变化才写回 -> 删除互斥文件。
//!
//! 他人条目的清理规则：
//! - 持有进程已不存在：立即删除（短命进程退出后不必等满租约）
//! - 心跳在租约内：保留
//! - 心跳超过硬过期时间：即使 PID 仍存活也删除（PID 复用/时钟偏差）
//! - 介于两者之间：保留

use crate::error::AppResult;
use crate::file_mutex::{
    DEFAULT_MUTEX_POLL, DEFAULT_MUTEX_STALE, DEFAULT_MUTEX_TIMEOUT, FileMutex,
};
use crate::persist;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

pub const LOCK_FILE_VERSION: u32 = 1;
pub const DEFAULT_LEASE: Duration = Duration::from_secs(15);
pub const DEFAULT_HARD_STALE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelLockEntry {
    pub instance_id: String,
    pub pid: u32,
    /// epoch 毫秒
    pub acquired_at: i64,
    /// epoch 毫秒
    pub heartbeat_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockFile {
    #[serde(default = "lock_file_version")]
    version: u32,
    #[serde(default)]
    locks: BTreeMap<String, ModelLockEntry>,
}

impl Default for LockFile {
    fn default() -> Self {
        Self {
            version: LOCK_FILE_VERSION,
            locks: BTreeMap::new(),
        }
    }
}

fn lock_file_version() -> u32 {
    LOCK_FILE_VERSION
}

/// 进程存活探测。
pub trait ProcessProbe: Send + Sync + fmt::Debug {
    fn is_alive(&self, pid: u32) -> bool;
}

/// 向 PID 发送 0 号信号判断进程是否存在（非 unix 平台一律视为存活）。
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        pid_alive(pid)
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: 0 号信号不会投递，只做存在性与权限检查。
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM：进程存在但属于其他用户。
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub lease: Duration,
    pub hard_stale: Duration,
    pub heartbeat_interval: Duration,
    pub mutex_timeout: Duration,
    pub mutex_poll: Duration,
    pub mutex_stale: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LEASE,
            hard_stale: DEFAULT_HARD_STALE,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            mutex_timeout: DEFAULT_MUTEX_TIMEOUT,
            mutex_poll: DEFAULT_MUTEX_POLL,
            mutex_stale: DEFAULT_MUTEX_STALE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcquireOptions {
    /// 0 表示只尝试一次、不等待。
    pub timeout: Duration,
    pub poll: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            poll: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOutcome {
    pub acquired: bool,
    pub held_by: Option<ModelLockEntry>,
}

#[derive(Debug)]
pub struct ModelLockCoordinator {
    state_path: PathBuf,
    mutex: FileMutex,
    instance_id: String,
    pid: u32,
    settings: LockSettings,
    probe: Arc<dyn ProcessProbe>,
}

impl ModelLockCoordinator {
    pub fn new(state_path: impl Into<PathBuf>, settings: LockSettings) -> Self {
        let state_path = state_path.into();
        let mutex = FileMutex::new(mutex_path_for(&state_path))
            .with_timeout(settings.mutex_timeout)
            .with_poll_interval(settings.mutex_poll)
            .with_stale_after(settings.mutex_stale);
        Self {
            state_path,
            mutex,
            instance_id: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            settings,
            probe: Arc::new(SignalProbe),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// 获取锁：未被持有或已由本实例持有（刷新心跳）即成功；
    /// 否则在 `timeout` 内按 `min(poll, 剩余时间)` 轮询。
    pub async fn acquire(&self, key: &str, opts: AcquireOptions) -> AppResult<AcquireOutcome> {
        let started = Instant::now();
        loop {
            let holder = self.try_claim(key).await?;
            let Some(holder) = holder else {
                tracing::debug!(key, instance = %self.instance_id, "模型锁获取成功");
                return Ok(AcquireOutcome {
                    acquired: true,
                    held_by: None,
                });
            };

            let elapsed = started.elapsed();
            if elapsed >= opts.timeout {
                tracing::debug!(
                    key,
                    holder = %holder.instance_id,
                    pid = holder.pid,
                    "模型锁被其他实例持有"
                );
                return Ok(AcquireOutcome {
                    acquired: false,
                    held_by: Some(holder),
                });
            }
            let wait = opts.poll.max(Duration::from_millis(1));
            tokio::time::sleep(wait.min(opts.timeout - elapsed)).await;
        }
    }

    /// 续期心跳；锁已不属于本实例时返回 false，调用方应停止心跳循环。
    pub async fn refresh(&self, key: &str) -> AppResult<bool> {
        self.mutate(|locks, now| match locks.get_mut(key) {
            Some(e) if e.instance_id == self.instance_id => {
                e.heartbeat_at = now;
                (true, true)
            }
            _ => (false, false),
        })
        .await
    }

    /// 释放本实例持有的锁；返回是否确实删除了条目。
    pub async fn release(&self, key: &str) -> AppResult<bool> {
        self.mutate(|locks, _| {
            let owned = locks
                .get(key)
                .is_some_and(|e| e.instance_id == self.instance_id);
            if owned {
                locks.remove(key);
            }
            (owned, owned)
        })
        .await
    }

    /// 释放本实例持有的全部锁（会话结束时调用）；返回删除数量。
    pub async fn release_all(&self) -> AppResult<usize> {
        self.mutate(|locks, _| {
            let before = locks.len();
            locks.retain(|_, e| e.instance_id != self.instance_id);
            let removed = before - locks.len();
            (removed, removed > 0)
        })
        .await
    }

    /// 读取当前锁表（不加互斥，仅用于诊断展示）。
    pub async fn snapshot(&self) -> BTreeMap<String, ModelLockEntry> {
        persist::read_json_or_default::<LockFile>(&self.state_path)
            .await
            .locks
    }

    /// 启动后台心跳：每隔 `heartbeat_interval` 续期一次，失去所有权后自动退出。
    ///
    /// 返回的句柄在 drop 时终止任务；tokio 任务不会阻止进程退出。
    pub fn spawn_heartbeat(self: &Arc<Self>, key: impl Into<String>) -> HeartbeatHandle {
        let key = key.into();
        let coordinator = Arc::clone(self);
        let task_key = key.clone();
        let period = self.settings.heartbeat_interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match coordinator.refresh(&task_key).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(key = %task_key, "模型锁已被回收，停止心跳");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(key = %task_key, error = %e, "模型锁心跳续期失败");
                    }
                }
            }
        });
        HeartbeatHandle { key, task }
    }

    /// 尝试占有；返回 None 表示成功，否则返回当前持有者。
    async fn try_claim(&self, key: &str) -> AppResult<Option<ModelLockEntry>> {
        self.mutate(|locks, now| match locks.get_mut(key) {
            Some(e) if e.instance_id == self.instance_id => {
                e.heartbeat_at = now;
                e.pid = self.pid;
                (None, true)
            }
            Some(e) => (Some(e.clone()), false),
            None => {
                locks.insert(
                    key.to_string(),
                    ModelLockEntry {
                        instance_id: self.instance_id.clone(),
                        pid: self.pid,
                        acquired_at: now,
                        heartbeat_at: now,
                    },
                );
                (None, true)
            }
        })
        .await
    }

    async fn mutate<T, F>(&self, op: F) -> AppResult<T>
    where
        F: FnOnce(&mut BTreeMap<String, ModelLockEntry>, i64) -> (T, bool),
    {
        let guard = self.mutex.acquire().await?;
        let result = self.mutate_locked(op).await;
        let released = guard.release().await;
        let value = result?;
        released?;
        Ok(value)
    }

    async fn mutate_locked<T, F>(&self, op: F) -> AppResult<T>
    where
        F: FnOnce(&mut BTreeMap<String, ModelLockEntry>, i64) -> (T, bool),
    {
        let mut state: LockFile = persist::read_json_or_default(&self.state_path).await;
        let now = Utc::now().timestamp_millis();
        let pruned = self.prune_stale(&mut state.locks, now);
        let (value, changed) = op(&mut state.locks, now);
        if pruned || changed {
            state.version = LOCK_FILE_VERSION;
            persist::write_json_atomic(&self.state_path, &state).await?;
        }
        Ok(value)
    }

    fn prune_stale(&self, locks: &mut BTreeMap<String, ModelLockEntry>, now: i64) -> bool {
        let before = locks.len();
        locks.retain(|key, e| {
            if e.instance_id == self.instance_id {
                return true;
            }
            if !self.probe.is_alive(e.pid) {
                tracing::info!(key = %key, pid = e.pid, "模型锁持有进程已退出，回收");
                return false;
            }
            let age = now.saturating_sub(e.heartbeat_at);
            if age <= duration_ms(self.settings.lease) {
                return true;
            }
            if age > duration_ms(self.settings.hard_stale) {
                tracing::warn!(key = %key, pid = e.pid, age_ms = age, "模型锁心跳严重过期，强制回收");
                return false;
            }
            true
        });
        locks.len() != before
    }
}

/// 心跳任务句柄。
#[derive(Debug)]
pub struct HeartbeatHandle {
    key: String,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn mutex_path_for(state_path: &Path) -> PathBuf {
    let name = state_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "model-locks.json".to_string());
    state_path.with_file_name(format!("{name}.mutex"))
}

fn duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}
