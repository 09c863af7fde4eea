//! 模型选择编排：用量 -> 候选 -> 忽略/冷却过滤 -> 排序 -> 预留额度 -> 模型锁 -> 切换模型。
//!
//! 每次调用只产生一个结果（true/false）。所有终止失败都只通过宿主提示一次，不返回错误。

use crate::candidate::{Candidate, build_candidates, combine_candidates, dedupe_candidates};
use crate::config::Config;
use crate::cooldown::CooldownManager;
use crate::logging::{self, LogLevel};
use crate::mapping::{MappingEntry, MappingResolver};
use crate::model_lock::{AcquireOptions, HeartbeatHandle, ModelLockCoordinator};
use crate::ranker::{selection_reason, sort_candidates};
use crate::routing::{LoadedConfig, ModelRef};
use crate::usage::{UsageSnapshot, is_rate_limit_error};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
}

/// 宿主提供的外部能力：用量拉取、模型注册表、切换模型、用户提示、状态栏。
pub trait SelectorHost: Send + Sync {
    fn fetch_usages(
        &self,
        disabled_providers: &[String],
    ) -> impl Future<Output = Vec<UsageSnapshot>> + Send;

    fn find_model(&self, provider: &str, id: &str) -> Option<ModelRef>;

    fn current_model(&self) -> Option<ModelRef>;

    /// 返回 false 表示宿主拒绝切换。
    fn set_model(&self, model: &ModelRef) -> impl Future<Output = bool> + Send;

    fn notify(&self, message: &str, level: NotifyLevel);

    /// None 表示清空状态栏。
    fn set_status(&self, status: Option<&str>);
}

#[derive(Debug, Clone)]
pub struct SelectorSettings {
    /// 获取模型锁的最长等待时间；0 表示只尝试一次。
    pub lock_timeout: Duration,
    pub lock_poll: Duration,
    pub log_level: LogLevel,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::ZERO,
            lock_poll: Duration::from_millis(250),
            log_level: LogLevel::Off,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// 调用方已拉取好的用量；None 时由宿主现拉。
    pub usages: Option<Vec<UsageSnapshot>>,
    /// 本次是否需要占用模型锁。
    pub acquire_lock: bool,
}

impl RunOptions {
    pub fn with_usages(usages: Vec<UsageSnapshot>) -> Self {
        Self {
            usages: Some(usages),
            acquire_lock: false,
        }
    }

    pub fn locking(mut self) -> Self {
        self.acquire_lock = true;
        self
    }
}

#[derive(Debug)]
struct HeldLock {
    key: String,
    heartbeat: HeartbeatHandle,
}

impl HeldLock {
    /// 心跳任务退出意味着续期时发现锁已被回收。
    fn is_live(&self) -> bool {
        !self.heartbeat.is_finished()
    }
}

/// 选中的目标：模型、来源候选（兜底时为 None）、对应的锁键。
struct Choice {
    model: ModelRef,
    candidate: Option<Candidate>,
    lock_key: Option<String>,
    reason: String,
}

pub struct ModelSelector<H> {
    host: H,
    resolver: MappingResolver,
    cooldowns: Mutex<CooldownManager>,
    locks: Option<Arc<ModelLockCoordinator>>,
    settings: SelectorSettings,
    running: AtomicBool,
    held: Mutex<Option<HeldLock>>,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<H: SelectorHost> ModelSelector<H> {
    pub fn new(
        host: H,
        cooldowns: CooldownManager,
        locks: Option<Arc<ModelLockCoordinator>>,
        settings: SelectorSettings,
    ) -> Self {
        Self {
            host,
            resolver: MappingResolver::new(),
            cooldowns: Mutex::new(cooldowns),
            locks,
            settings,
            running: AtomicBool::new(false),
            held: Mutex::new(None),
        }
    }

    /// 按进程设置构建：冷却文件与锁文件都放在数据目录下。
    pub fn from_config(host: H, cfg: &Config) -> Self {
        let cooldowns = CooldownManager::new(cfg.cooldown_path(), cfg.cooldown_duration());
        let locks = Arc::new(ModelLockCoordinator::new(cfg.lock_path(), cfg.lock_settings()));
        Self::new(host, cooldowns, Some(locks), cfg.selector_settings())
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn lock_coordinator(&self) -> Option<&Arc<ModelLockCoordinator>> {
        self.locks.as_ref()
    }

    /// 执行一次选择。已有选择在进行时立即返回 false。
    pub async fn run_selector(&self, config: &LoadedConfig, opts: RunOptions) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("已有选择流程在运行，本次调用跳过");
            return false;
        }
        let _guard = RunGuard(&self.running);
        self.run_inner(config, opts).await
    }

    /// 把上一次选中的候选放入冷却，然后重新选择。
    pub async fn skip_current(&self, config: &LoadedConfig, opts: RunOptions) -> bool {
        {
            let mut cooldowns = self.cooldowns.lock().await;
            cooldowns.load().await;
            let Some(last) = cooldowns.last_selected().map(str::to_string) else {
                return self.fail("No previously selected usage bucket to skip");
            };
            cooldowns.set_cooldown_encoded(&last, now_ms());
            save_cooldowns(&cooldowns).await;
            tracing::info!(key = %last, "已跳过上次选中的用量桶");
        }
        self.run_selector(config, opts).await
    }

    /// 清空所有冷却；返回清除的条目数。
    pub async fn clear_cooldowns(&self) -> usize {
        let mut cooldowns = self.cooldowns.lock().await;
        cooldowns.load().await;
        let n = cooldowns.clear_all();
        if n > 0 {
            save_cooldowns(&cooldowns).await;
        }
        n
    }

    /// 会话结束：停止心跳并释放本实例持有的全部模型锁。
    pub async fn release_all_locks(&self) -> usize {
        self.held.lock().await.take();
        let Some(locks) = &self.locks else {
            return 0;
        };
        match locks.release_all().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "释放全部模型锁失败");
                0
            }
        }
    }

    async fn run_inner(&self, config: &LoadedConfig, opts: RunOptions) -> bool {
        let mappings = config.mappings.as_slice();
        let now = now_ms();
        let fetched = opts.usages.is_none();
        let usages = match opts.usages {
            Some(u) => u,
            None => self.host.fetch_usages(&config.disabled_providers).await,
        };
        let usages: Vec<UsageSnapshot> = usages
            .into_iter()
            .filter(|s| !config.is_provider_disabled(&s.provider))
            .collect();

        let mut cooldowns = self.cooldowns.lock().await;
        cooldowns.load().await;
        let mut dirty = cooldowns.prune_expired(now);

        // 拉取错误先处理：限流快照本身没有窗口，不能被"无窗口"提前返回吞掉。
        for s in &usages {
            let Some(err) = s.error.as_deref() else {
                continue;
            };
            if is_rate_limit_error(err) {
                if is_provider_ignored(&s.provider, s.account.as_deref(), mappings) {
                    continue;
                }
                dirty |= cooldowns.set_or_extend_provider_cooldown(
                    &s.provider,
                    s.account.as_deref(),
                    now,
                );
                tracing::warn!(provider = %s.provider, account = ?s.account, "provider 触发限流，进入冷却");
                self.host.notify(
                    &format!("{} is rate limited; skipping it for a while", label_of(s)),
                    NotifyLevel::Warning,
                );
            } else if fetched {
                tracing::warn!(provider = %s.provider, error = %err, "拉取用量失败");
                self.host.notify(
                    &format!("Failed to fetch usage for {}: {err}", label_of(s)),
                    NotifyLevel::Warning,
                );
            }
        }

        let candidates = build_candidates(&usages);
        if candidates.is_empty() {
            if dirty {
                save_cooldowns(&cooldowns).await;
            }
            self.host.set_status(None);
            return self.fail("No usage windows available");
        }

        let candidates = dedupe_candidates(combine_candidates(candidates, mappings, &self.resolver));
        let visible: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| self.resolver.find_ignore_mapping(c, mappings).is_none())
            .collect();
        if visible.is_empty() {
            if dirty {
                save_cooldowns(&cooldowns).await;
            }
            return self.fail("All usage buckets are ignored by mappings");
        }

        let active: Vec<Candidate> = visible
            .iter()
            .filter(|c| !cooldowns.is_on_cooldown(c, now))
            .cloned()
            .collect();
        let pool = if active.is_empty() {
            // 全部在冷却中：视为卡死状态，清空冷却后用未过滤的集合重新排序。
            let cleared = cooldowns.clear_all();
            dirty = true;
            tracing::warn!(cleared, "所有候选都在冷却中，已清空冷却");
            self.host.notify(
                "All usage buckets were on cooldown; cooldowns cleared",
                NotifyLevel::Warning,
            );
            visible
        } else {
            active
        };
        if dirty {
            save_cooldowns(&cooldowns).await;
        }
        drop(cooldowns);

        let ranked = sort_candidates(pool, &config.priority, mappings, &self.resolver);
        logging::ranking(self.settings.log_level, &ranked);

        let top = &ranked[0];
        let Some(top_target) = self
            .resolver
            .find_model_mapping(top, mappings)
            .and_then(MappingEntry::model)
        else {
            return self.fail(&format!("No model mapping for {}", top.describe()));
        };
        if self.host.find_model(&top_target.provider, &top_target.id).is_none() {
            return self.fail(&format!("Mapped model not found: {top_target}"));
        }

        // 预留额度：剩余不高于自身映射 reserve 的候选在排序后剔除。
        let mut usable: Vec<(Candidate, ModelRef)> = Vec::new();
        let mut reserve_blocked = false;
        for c in &ranked {
            let Some(mapping) = self.resolver.find_model_mapping(c, mappings) else {
                continue;
            };
            let Some(target) = mapping.model() else {
                continue;
            };
            if c.remaining_percent <= f64::from(mapping.reserve()) {
                if c.is_available() {
                    reserve_blocked = true;
                }
                if self.settings.log_level.detail_enabled() {
                    tracing::info!(
                        candidate = %c.describe(),
                        remaining = c.remaining_percent,
                        reserve = mapping.reserve(),
                        "剩余额度不高于预留，剔除"
                    );
                }
                continue;
            }
            usable.push((c.clone(), target.clone()));
        }

        if usable.is_empty() {
            let reason = if reserve_blocked {
                "All mapped usage buckets are at or below their reserve thresholds"
            } else {
                "All non-ignored usage buckets are exhausted"
            };
            return self.use_fallback(config, reason, opts.acquire_lock).await;
        }

        let choice = if opts.acquire_lock && self.locks.is_some() {
            match self.choose_lockable(&usable, config, mappings).await {
                Some(choice) => choice,
                None => {
                    if config.fallback.is_none() {
                        return self.fail("All mapped models are busy");
                    }
                    return self
                        .use_fallback(config, "All mapped models are busy", true)
                        .await;
                }
            }
        } else {
            let (c, target) = &usable[0];
            let Some(model) = self.host.find_model(&target.provider, &target.id) else {
                return self.fail(&format!("Mapped model not found: {target}"));
            };
            Choice {
                model,
                candidate: Some(c.clone()),
                lock_key: None,
                reason: self.reason_for(c, &usable, config, mappings),
            }
        };

        self.apply(choice).await
    }

    /// 按排名依次尝试各目标模型的锁，返回第一个拿到锁的。
    async fn choose_lockable(
        &self,
        usable: &[(Candidate, ModelRef)],
        config: &LoadedConfig,
        mappings: &[MappingEntry],
    ) -> Option<Choice> {
        let locks = self.locks.as_ref()?;
        let mut tried: Vec<&ModelRef> = Vec::new();
        for (c, target) in usable {
            if tried.contains(&target) {
                continue;
            }
            tried.push(target);

            let Some(model) = self.host.find_model(&target.provider, &target.id) else {
                tracing::warn!(model = %target, "映射的模型不在注册表中，跳过");
                continue;
            };
            let key = model.lock_key();
            match locks.acquire(&key, self.acquire_options()).await {
                Ok(out) if out.acquired => {
                    return Some(Choice {
                        model,
                        candidate: Some(c.clone()),
                        lock_key: Some(key),
                        reason: self.reason_for(c, usable, config, mappings),
                    });
                }
                Ok(out) => {
                    tracing::info!(
                        key = %key,
                        holder_pid = out.held_by.as_ref().map(|h| h.pid),
                        "模型被其他实例占用，尝试下一个"
                    );
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "获取模型锁失败，尝试下一个");
                }
            }
        }
        None
    }

    async fn use_fallback(&self, config: &LoadedConfig, reason: &str, acquire_lock: bool) -> bool {
        let Some(fallback) = &config.fallback else {
            return self.fail(reason);
        };
        let Some(model) = self.host.find_model(&fallback.provider, &fallback.id) else {
            return self.fail(&format!(
                "{reason}; fallback model not found: {}",
                fallback.model()
            ));
        };

        let mut lock_key = None;
        if acquire_lock
            && fallback.lock
            && let Some(locks) = &self.locks
        {
            let key = model.lock_key();
            match locks.acquire(&key, self.acquire_options()).await {
                Ok(out) if out.acquired => lock_key = Some(key),
                Ok(_) => return self.fail("Fallback model lock is busy"),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "获取兜底模型锁失败");
                    return self.fail("Fallback model lock is busy");
                }
            }
        }

        tracing::warn!(model = %model, reason, "没有可用候选，使用兜底模型");
        self.apply(Choice {
            model,
            candidate: None,
            lock_key,
            reason: format!("last-resort fallback ({reason})"),
        })
        .await
    }

    async fn apply(&self, choice: Choice) -> bool {
        let Choice {
            model,
            candidate,
            lock_key,
            reason,
        } = choice;

        let unchanged = self.host.current_model().as_ref() == Some(&model);
        if unchanged {
            tracing::debug!(model = %model, "目标模型与当前模型一致，跳过切换");
        } else if !self.host.set_model(&model).await {
            self.release_unheld(lock_key.as_deref()).await;
            return self.fail(&format!("Failed to set model {model}"));
        }

        self.swap_held_lock(&model, lock_key).await;

        if let Some(c) = &candidate {
            let mut cooldowns = self.cooldowns.lock().await;
            if cooldowns.set_last_selected(c) {
                save_cooldowns(&cooldowns).await;
            }
        }

        let status = match &candidate {
            Some(c) => format!("{model} · {} {:.0}%", c.window_label, c.remaining_percent),
            None => format!("{model} · fallback"),
        };
        self.host.set_status(Some(&status));
        logging::reason(self.settings.log_level, &reason);

        if !unchanged {
            tracing::info!(model = %model, "已切换模型");
            let level = if candidate.is_some() {
                NotifyLevel::Info
            } else {
                NotifyLevel::Warning
            };
            self.host
                .notify(&format!("Switched to {model}: {reason}"), level);
        }
        true
    }

    /// 新锁替换旧锁：为其他模型持有的旧锁总是释放，释放错误只记录日志。
    ///
    /// 同键且心跳仍在运行时保持不变；心跳已退出时，本次重新获取的锁换上新的心跳。
    async fn swap_held_lock(&self, model: &ModelRef, new_key: Option<String>) {
        let target_key = new_key.clone().unwrap_or_else(|| model.lock_key());
        let mut held = self.held.lock().await;
        match held.as_ref() {
            Some(h) if h.key == target_key => {
                if h.is_live() {
                    return;
                }
                if new_key.is_none() {
                    tracing::warn!(key = %h.key, "模型锁心跳已停止且本次未重新获取，放弃持有记录");
                    *held = None;
                    return;
                }
                // 同键重新获取：不能释放，否则会删掉刚写入的条目。
                tracing::info!(key = %h.key, "模型锁已重新获取，重启心跳");
            }
            Some(_) => {
                if let Some(old) = held.take() {
                    let key = old.key.clone();
                    drop(old);
                    if let Some(locks) = &self.locks
                        && let Err(e) = locks.release(&key).await
                    {
                        tracing::warn!(key = %key, error = %e, "释放旧模型锁失败");
                    }
                }
            }
            None => {}
        }

        if let (Some(key), Some(locks)) = (new_key, &self.locks) {
            let heartbeat = locks.spawn_heartbeat(key.clone());
            *held = Some(HeldLock { key, heartbeat });
        }
    }

    /// 切换失败时归还本次新拿的锁（仍在续期的同键锁保留）。
    async fn release_unheld(&self, key: Option<&str>) {
        let (Some(key), Some(locks)) = (key, &self.locks) else {
            return;
        };
        let already_held = self
            .held
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| h.key == key && h.is_live());
        if already_held {
            return;
        }
        if let Err(e) = locks.release(key).await {
            tracing::warn!(key, error = %e, "归还模型锁失败");
        }
    }

    fn reason_for(
        &self,
        winner: &Candidate,
        usable: &[(Candidate, ModelRef)],
        config: &LoadedConfig,
        mappings: &[MappingEntry],
    ) -> String {
        let runner_up = usable.iter().map(|(c, _)| c).find(|c| *c != winner);
        selection_reason(winner, runner_up, &config.priority, mappings, &self.resolver)
    }

    fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions {
            timeout: self.settings.lock_timeout,
            poll: self.settings.lock_poll,
        }
    }

    fn fail(&self, message: &str) -> bool {
        tracing::warn!("选择失败：{message}");
        self.host.notify(message, NotifyLevel::Error);
        false
    }
}

/// provider(+账号) 是否被兜底 ignore 规则整体忽略；被忽略的 provider 不参与健康监测。
pub fn is_provider_ignored(provider: &str, account: Option<&str>, mappings: &[MappingEntry]) -> bool {
    mappings.iter().any(|m| {
        m.is_ignore()
            && m.usage.provider == provider
            && m.usage.is_catch_all()
            && match m.usage.account.as_deref() {
                None => true,
                Some(a) => account == Some(a),
            }
    })
}

async fn save_cooldowns(cooldowns: &CooldownManager) {
    if let Err(e) = cooldowns.save().await {
        tracing::warn!(path = %cooldowns.path().display(), error = %e, "写入冷却状态失败");
    }
}

fn label_of(s: &UsageSnapshot) -> String {
    let name = if s.display_name.trim().is_empty() {
        s.provider.as_str()
    } else {
        s.display_name.as_str()
    };
    match s.account.as_deref() {
        Some(a) => format!("{name} ({a})"),
        None => name.to_string(),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::UsageSelector;

    #[test]
    fn provider_ignore_requires_catch_all_rule() {
        let mappings = vec![
            MappingEntry::ignore(UsageSelector::window("p1", "5h")),
            MappingEntry::ignore(UsageSelector::catch_all("p2").for_account("work")),
            MappingEntry::ignore(UsageSelector::catch_all("p3")),
        ];
        assert!(!is_provider_ignored("p1", None, &mappings));
        assert!(is_provider_ignored("p2", Some("work"), &mappings));
        assert!(!is_provider_ignored("p2", Some("home"), &mappings));
        assert!(!is_provider_ignored("p2", None, &mappings));
        assert!(is_provider_ignored("p3", Some("any"), &mappings));
    }

    #[test]
    fn snapshot_labels_include_account() {
        let s = UsageSnapshot::new("anthropic", Vec::new()).with_account("work");
        assert_eq!(label_of(&s), "anthropic (work)");
    }
}
