//! 冷却管理：在限流信号或用户"跳过"之后，把某个候选或整个 provider(+账号) 临时排除。
//!
//! 状态落在单个 JSON 文件里，任何进程都可以读改写；每个进程只加载一次，
//! 写回时先写临时文件再 rename。

use crate::candidate::{Candidate, CandidateKey};
use crate::error::AppResult;
use crate::persist;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// 旧版键格式的分隔符：`provider|account|window`，`*` 表示整个 provider。
const LEGACY_DELIMITER: char = '|';
const LEGACY_WILDCARD: &str = "*";

/// 冷却键：具体候选，或 provider(+账号) 通配。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CooldownKey {
    Candidate(CandidateKey),
    Provider {
        provider: String,
        account: Option<String>,
    },
}

impl CooldownKey {
    pub fn provider(provider: impl Into<String>, account: Option<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            account,
        }
    }

    /// 编码为 JSON 数组字符串；各分量原样保留，不会因为包含分隔符而冲突。
    pub fn encode(&self) -> String {
        let encoded = match self {
            Self::Candidate(k) => sonic_rs::to_string(&(
                "window",
                &k.provider,
                &k.account,
                &k.window,
                k.synthetic,
            )),
            Self::Provider { provider, account } => {
                sonic_rs::to_string(&("provider", provider, account))
            }
        };
        encoded.unwrap_or_default()
    }

    /// 解析旧版 `provider|account|window[|synthetic]` 键；格式不对时返回 None。
    fn parse_legacy(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split(LEGACY_DELIMITER).collect();
        let (provider, account, window, synthetic) = match parts.as_slice() {
            [provider, account, window] => (provider, account, window, false),
            [provider, account, window, flag] => match *flag {
                "true" => (provider, account, window, true),
                "false" => (provider, account, window, false),
                _ => return None,
            },
            _ => return None,
        };
        if provider.is_empty() {
            return None;
        }
        let account = (!account.is_empty()).then(|| account.to_string());
        if *window == LEGACY_WILDCARD {
            return Some(Self::provider(*provider, account));
        }
        Some(Self::Candidate(CandidateKey {
            provider: provider.to_string(),
            account,
            window: window.to_string(),
            synthetic,
        }))
    }
}

impl From<&Candidate> for CooldownKey {
    fn from(c: &Candidate) -> Self {
        Self::Candidate(c.key())
    }
}

/// 冷却状态文件内容。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownState {
    /// 键 -> 过期时间（epoch 毫秒）。
    #[serde(default)]
    pub cooldowns: BTreeMap<String, i64>,
    #[serde(default)]
    pub last_selected: Option<String>,
}

#[derive(Debug)]
pub struct CooldownManager {
    path: PathBuf,
    duration_ms: i64,
    state: CooldownState,
    loaded: bool,
}

impl CooldownManager {
    pub fn new(path: impl Into<PathBuf>, duration: Duration) -> Self {
        Self {
            path: path.into(),
            duration_ms: duration.as_millis().min(i64::MAX as u128) as i64,
            state: CooldownState::default(),
            loaded: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &CooldownState {
        &self.state
    }

    /// 首次调用时从磁盘加载（之后是空操作）。文件缺失或损坏时使用空状态。
    pub async fn load(&mut self) {
        if self.loaded {
            return;
        }
        let mut state: CooldownState = persist::read_json_or_default(&self.path).await;
        let migrated = migrate_legacy_keys(&mut state);
        if migrated > 0 {
            tracing::info!(migrated, "冷却状态：已为旧版键补充新格式副本");
        }
        self.state = state;
        self.loaded = true;
    }

    pub async fn save(&self) -> AppResult<()> {
        persist::write_json_atomic(&self.path, &self.state).await
    }

    /// 候选本身或其 provider(+账号) 通配键任一未过期即视为冷却中。
    pub fn is_on_cooldown(&self, candidate: &Candidate, now_ms: i64) -> bool {
        let own = CooldownKey::from(candidate);
        let wildcard = CooldownKey::provider(candidate.provider.clone(), candidate.account.clone());
        self.is_key_active(&own, now_ms) || self.is_key_active(&wildcard, now_ms)
    }

    pub fn cooldown_remaining(&self, key: &CooldownKey, now_ms: i64) -> Option<Duration> {
        let expiry = *self.state.cooldowns.get(&key.encode())?;
        (expiry > now_ms).then(|| Duration::from_millis((expiry - now_ms) as u64))
    }

    /// 对具体候选设置冷却（只延长不缩短）。
    pub fn set_cooldown(&mut self, candidate: &Candidate, now_ms: i64) -> bool {
        self.extend_encoded(CooldownKey::from(candidate).encode(), now_ms)
    }

    /// 对已编码的键设置冷却，用于基于 lastSelected 的"跳过"。
    pub fn set_cooldown_encoded(&mut self, encoded: &str, now_ms: i64) -> bool {
        self.extend_encoded(encoded.to_string(), now_ms)
    }

    /// 设置/延长 provider(+账号) 通配冷却到 `now + duration`。
    ///
    /// 只有新的过期时间严格晚于现有值时才会修改；返回是否发生了变化。
    pub fn set_or_extend_provider_cooldown(
        &mut self,
        provider: &str,
        account: Option<&str>,
        now_ms: i64,
    ) -> bool {
        let key = CooldownKey::provider(provider, account.map(str::to_string));
        self.extend_encoded(key.encode(), now_ms)
    }

    /// 移除所有 `expiry <= now` 的条目；返回是否有删除。
    pub fn prune_expired(&mut self, now_ms: i64) -> bool {
        let before = self.state.cooldowns.len();
        self.state.cooldowns.retain(|_, expiry| *expiry > now_ms);
        self.state.cooldowns.len() != before
    }

    pub fn clear_all(&mut self) -> usize {
        let n = self.state.cooldowns.len();
        self.state.cooldowns.clear();
        n
    }

    pub fn last_selected(&self) -> Option<&str> {
        self.state.last_selected.as_deref()
    }

    pub fn set_last_selected(&mut self, candidate: &Candidate) -> bool {
        let encoded = CooldownKey::from(candidate).encode();
        if self.state.last_selected.as_deref() == Some(encoded.as_str()) {
            return false;
        }
        self.state.last_selected = Some(encoded);
        true
    }

    fn is_key_active(&self, key: &CooldownKey, now_ms: i64) -> bool {
        self.state
            .cooldowns
            .get(&key.encode())
            .is_some_and(|expiry| *expiry > now_ms)
    }

    fn extend_encoded(&mut self, encoded: String, now_ms: i64) -> bool {
        let expiry = now_ms.saturating_add(self.duration_ms);
        match self.state.cooldowns.get_mut(&encoded) {
            Some(existing) if *existing >= expiry => false,
            Some(existing) => {
                *existing = expiry;
                true
            }
            None => {
                self.state.cooldowns.insert(encoded, expiry);
                true
            }
        }
    }
}

/// 为旧版键补充新格式副本（保留旧键，新旧查找都能命中）。返回补充的数量。
fn migrate_legacy_keys(state: &mut CooldownState) -> usize {
    let mut additions: Vec<(String, i64)> = Vec::new();
    for (raw, expiry) in &state.cooldowns {
        if raw.starts_with('[') {
            continue;
        }
        let Some(key) = CooldownKey::parse_legacy(raw) else {
            continue;
        };
        additions.push((key.encode(), *expiry));
    }

    let mut added = 0usize;
    for (encoded, expiry) in additions {
        let slot = state.cooldowns.entry(encoded).or_insert_with(|| {
            added += 1;
            expiry
        });
        *slot = (*slot).max(expiry);
    }

    if let Some(last) = state.last_selected.as_deref()
        && !last.starts_with('[')
        && let Some(key) = CooldownKey::parse_legacy(last)
    {
        state.last_selected = Some(key.encode());
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::candidate;

    const NOW: i64 = 1_700_000_000_000;
    const HOUR: Duration = Duration::from_secs(3600);

    fn manager(dir: &tempfile::TempDir) -> CooldownManager {
        CooldownManager::new(dir.path().join("cooldowns.json"), HOUR)
    }

    #[test]
    fn provider_cooldown_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(&dir);
        assert!(m.set_or_extend_provider_cooldown("p1", None, NOW));
        assert!(!m.set_or_extend_provider_cooldown("p1", None, NOW));

        let key = CooldownKey::provider("p1", None);
        let before = m.state().cooldowns[&key.encode()];
        assert!(!m.set_or_extend_provider_cooldown("p1", None, NOW - 10_000));
        assert_eq!(m.state().cooldowns[&key.encode()], before);

        assert!(m.set_or_extend_provider_cooldown("p1", None, NOW + 1));
        assert_eq!(m.state().cooldowns[&key.encode()], before + 1);
    }

    #[test]
    fn wildcard_covers_every_window_of_the_account() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(&dir);
        let mut work = candidate("p1", "5h", 50.0);
        work.account = Some("work".to_string());
        let mut home = work.clone();
        home.account = Some("home".to_string());

        m.set_or_extend_provider_cooldown("p1", Some("work"), NOW);
        assert!(m.is_on_cooldown(&work, NOW + 1));
        assert!(!m.is_on_cooldown(&home, NOW + 1));
        assert!(!m.is_on_cooldown(&work, NOW + HOUR.as_millis() as i64));
    }

    #[test]
    fn candidate_cooldown_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(&dir);
        let c = candidate("p1", "w1", 50.0);
        let other = candidate("p1", "w2", 50.0);
        assert!(m.set_cooldown(&c, NOW));
        assert!(m.is_on_cooldown(&c, NOW));
        assert!(!m.is_on_cooldown(&other, NOW));
        assert_eq!(
            m.cooldown_remaining(&CooldownKey::from(&c), NOW),
            Some(HOUR)
        );

        assert!(!m.prune_expired(NOW));
        assert!(m.prune_expired(NOW + HOUR.as_millis() as i64));
        assert!(m.state().cooldowns.is_empty());
    }

    #[test]
    fn keys_with_delimiters_do_not_collide() {
        let mut a = candidate("p", "c", 1.0);
        a.account = Some("a|b".to_string());
        let mut b = candidate("p", "b|c", 1.0);
        b.account = Some("a".to_string());
        assert_ne!(
            CooldownKey::from(&a).encode(),
            CooldownKey::from(&b).encode()
        );
    }

    #[tokio::test]
    async fn persists_and_migrates_legacy_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        let legacy = format!(
            r#"{{"cooldowns":{{"p1||w1":{},"p2|acct|*":{}}},"lastSelected":"p1||w1"}}"#,
            NOW + 1000,
            NOW + 2000
        );
        tokio::fs::write(&path, legacy).await.unwrap();

        let mut m = CooldownManager::new(&path, HOUR);
        m.load().await;
        assert!(m.is_on_cooldown(&candidate("p1", "w1", 10.0), NOW));
        let mut acct = candidate("p2", "any", 10.0);
        acct.account = Some("acct".to_string());
        assert!(m.is_on_cooldown(&acct, NOW));
        assert!(m.state().cooldowns.contains_key("p1||w1"));
        assert_eq!(
            m.last_selected(),
            Some(CooldownKey::from(&candidate("p1", "w1", 0.0)).encode().as_str())
        );

        m.set_last_selected(&candidate("p3", "w", 1.0));
        m.save().await.unwrap();

        let mut reloaded = CooldownManager::new(&path, HOUR);
        reloaded.load().await;
        assert_eq!(reloaded.state(), m.state());
    }

    #[test]
    fn legacy_keys_carry_the_synthetic_flag() {
        let grouped = CooldownKey::parse_legacy("p1|acct|grp|true");
        let mut synth = candidate("p1", "grp", 10.0);
        synth.account = Some("acct".to_string());
        synth.is_synthetic = true;
        assert_eq!(grouped, Some(CooldownKey::from(&synth)));

        let plain = CooldownKey::parse_legacy("p1||w1|false");
        assert_eq!(plain, Some(CooldownKey::from(&candidate("p1", "w1", 10.0))));

        assert_eq!(CooldownKey::parse_legacy("p1||w1|yes"), None);
        assert_eq!(CooldownKey::parse_legacy("p1|a|b|true|x"), None);
    }

    #[tokio::test]
    async fn migrates_four_part_legacy_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        let legacy = format!(
            r#"{{"cooldowns":{{"p1|acct|grp|true":{}}},"lastSelected":"p1|acct|grp|true"}}"#,
            NOW + 1000
        );
        tokio::fs::write(&path, legacy).await.unwrap();

        let mut m = CooldownManager::new(&path, HOUR);
        m.load().await;
        let mut synth = candidate("p1", "grp", 10.0);
        synth.account = Some("acct".to_string());
        synth.is_synthetic = true;
        assert!(m.is_on_cooldown(&synth, NOW));
        let mut real = synth.clone();
        real.is_synthetic = false;
        assert!(!m.is_on_cooldown(&real, NOW));
        assert_eq!(
            m.last_selected(),
            Some(CooldownKey::from(&synth).encode().as_str())
        );
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        tokio::fs::write(&path, b"\x00garbage").await.unwrap();
        let mut m = CooldownManager::new(&path, HOUR);
        m.load().await;
        assert_eq!(m.state(), &CooldownState::default());
    }
}
