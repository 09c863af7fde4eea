//! 映射规则：把候选解析为路由目标、忽略指令或 combine 分组。
//!
//! 查找按三层特异性进行，每层先匹配账号限定的规则、再匹配不限账号的规则：
//! 1. `window` 精确相等
//! 2. `windowPattern` 正则匹配（编译结果缓存；非法正则视为不匹配）
//! 3. 兜底规则（既无 `window` 也无 `windowPattern`）

use crate::candidate::Candidate;
use crate::error::AppError;
use crate::routing::ModelRef;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// 规则的用量选择器。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSelector {
    pub provider: String,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub window_pattern: Option<String>,
}

impl UsageSelector {
    pub fn catch_all(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            account: None,
            window: None,
            window_pattern: None,
        }
    }

    pub fn window(provider: impl Into<String>, window: impl Into<String>) -> Self {
        Self {
            window: Some(window.into()),
            ..Self::catch_all(provider)
        }
    }

    pub fn pattern(provider: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            window_pattern: Some(pattern.into()),
            ..Self::catch_all(provider)
        }
    }

    pub fn for_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn is_catch_all(&self) -> bool {
        self.window.is_none() && self.window_pattern.is_none()
    }
}

/// 预留额度：剩余百分比不高于该值时，映射的模型视为不可用。取值 0..=99。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reserve(u8);

impl Reserve {
    pub fn new(value: i64) -> Result<Self, AppError> {
        if !(0..=99).contains(&value) {
            return Err(AppError::config(format!(
                "reserve 必须在 0..=99 之间，实际为 {value}"
            )));
        }
        Ok(Self(value as u8))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

/// 规则动作：三者互斥，reserve 只存在于路由动作上。
#[derive(Debug, Clone, PartialEq)]
pub enum MappingAction {
    Model { model: ModelRef, reserve: Reserve },
    Ignore,
    Combine { group: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawMappingEntry")]
pub struct MappingEntry {
    pub usage: UsageSelector,
    pub action: MappingAction,
}

/// 配置文件中的原始形态：`model` / `ignore` / `combine` 平铺在同一层。
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMappingEntry {
    usage: UsageSelector,
    #[serde(default)]
    model: Option<ModelRef>,
    #[serde(default)]
    ignore: Option<bool>,
    #[serde(default)]
    combine: Option<String>,
    #[serde(default)]
    reserve: Option<i64>,
}

impl TryFrom<RawMappingEntry> for MappingEntry {
    type Error = AppError;

    fn try_from(raw: RawMappingEntry) -> Result<Self, Self::Error> {
        let ignore = raw.ignore.unwrap_or(false);
        let combine = raw.combine.filter(|g| !g.trim().is_empty());
        let set = usize::from(raw.model.is_some()) + usize::from(ignore) + usize::from(combine.is_some());
        if set != 1 {
            return Err(AppError::config(format!(
                "映射规则（provider={}）必须且只能设置 model / ignore / combine 之一",
                raw.usage.provider
            )));
        }

        let action = if let Some(model) = raw.model {
            let reserve = match raw.reserve {
                Some(v) => Reserve::new(v)?,
                None => Reserve::default(),
            };
            MappingAction::Model { model, reserve }
        } else {
            if raw.reserve.is_some() {
                return Err(AppError::config(format!(
                    "映射规则（provider={}）只有设置 model 时才能使用 reserve",
                    raw.usage.provider
                )));
            }
            match combine {
                Some(group) => MappingAction::Combine { group },
                None => MappingAction::Ignore,
            }
        };

        Ok(Self {
            usage: raw.usage,
            action,
        })
    }
}

impl MappingEntry {
    pub fn route(usage: UsageSelector, model: ModelRef) -> Self {
        Self {
            usage,
            action: MappingAction::Model {
                model,
                reserve: Reserve::default(),
            },
        }
    }

    pub fn ignore(usage: UsageSelector) -> Self {
        Self {
            usage,
            action: MappingAction::Ignore,
        }
    }

    pub fn combine(usage: UsageSelector, group: impl Into<String>) -> Self {
        Self {
            usage,
            action: MappingAction::Combine {
                group: group.into(),
            },
        }
    }

    /// 只对路由动作生效；其他动作原样返回。
    pub fn with_reserve(mut self, value: Reserve) -> Self {
        if let MappingAction::Model { reserve, .. } = &mut self.action {
            *reserve = value;
        }
        self
    }

    pub fn model(&self) -> Option<&ModelRef> {
        match &self.action {
            MappingAction::Model { model, .. } => Some(model),
            _ => None,
        }
    }

    pub fn reserve(&self) -> u8 {
        match &self.action {
            MappingAction::Model { reserve, .. } => reserve.get(),
            _ => 0,
        }
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self.action, MappingAction::Ignore)
    }

    pub fn combine_group(&self) -> Option<&str> {
        match &self.action {
            MappingAction::Combine { group } => Some(group.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Tier {
    Window,
    Pattern,
    CatchAll,
}

/// 映射解析器。持有正则编译缓存，随选择器实例创建，不使用进程级全局状态。
#[derive(Debug, Default)]
pub struct MappingResolver {
    patterns: Mutex<HashMap<String, Option<Regex>>>,
}

impl MappingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_mapping_by<'m, P>(
        &self,
        candidate: &Candidate,
        mappings: &'m [MappingEntry],
        predicate: P,
    ) -> Option<&'m MappingEntry>
    where
        P: Fn(&MappingEntry) -> bool,
    {
        let relevant: Vec<&MappingEntry> = mappings
            .iter()
            .filter(|m| m.usage.provider == candidate.provider && predicate(m))
            .collect();
        if relevant.is_empty() {
            return None;
        }

        for tier in [Tier::Window, Tier::Pattern, Tier::CatchAll] {
            for account_scoped in [true, false] {
                let found = relevant.iter().copied().find(|m| {
                    account_matches(m, candidate, account_scoped)
                        && self.tier_matches(m, candidate, tier)
                });
                if found.is_some() {
                    return found;
                }
            }
        }
        None
    }

    pub fn find_model_mapping<'m>(
        &self,
        candidate: &Candidate,
        mappings: &'m [MappingEntry],
    ) -> Option<&'m MappingEntry> {
        self.find_mapping_by(candidate, mappings, |m| m.model().is_some())
    }

    pub fn find_ignore_mapping<'m>(
        &self,
        candidate: &Candidate,
        mappings: &'m [MappingEntry],
    ) -> Option<&'m MappingEntry> {
        self.find_mapping_by(candidate, mappings, MappingEntry::is_ignore)
    }

    /// 合成候选永远不参与 combine，避免递归分组。
    pub fn find_combination_mapping<'m>(
        &self,
        candidate: &Candidate,
        mappings: &'m [MappingEntry],
    ) -> Option<&'m MappingEntry> {
        if candidate.is_synthetic {
            return None;
        }
        self.find_mapping_by(candidate, mappings, |m| m.combine_group().is_some())
    }

    pub fn reserve_threshold(&self, candidate: &Candidate, mappings: &[MappingEntry]) -> u8 {
        self.find_model_mapping(candidate, mappings)
            .map(MappingEntry::reserve)
            .unwrap_or(0)
    }

    fn tier_matches(&self, m: &MappingEntry, candidate: &Candidate, tier: Tier) -> bool {
        match tier {
            Tier::Window => m.usage.window.as_deref() == Some(candidate.window_label.as_str()),
            Tier::Pattern => m
                .usage
                .window_pattern
                .as_deref()
                .is_some_and(|p| self.pattern_matches(p, &candidate.window_label)),
            Tier::CatchAll => m.usage.is_catch_all(),
        }
    }

    fn pattern_matches(&self, pattern: &str, label: &str) -> bool {
        let mut cache = self.patterns.lock().unwrap_or_else(|e| e.into_inner());
        let compiled = cache.entry(pattern.to_string()).or_insert_with(|| {
            Regex::new(pattern)
                .inspect_err(|e| {
                    tracing::warn!(pattern, error = %e, "windowPattern 不是合法正则，视为不匹配");
                })
                .ok()
        });
        compiled.as_ref().is_some_and(|re| re.is_match(label))
    }
}

fn account_matches(m: &MappingEntry, candidate: &Candidate, account_scoped: bool) -> bool {
    match (&m.usage.account, account_scoped) {
        (Some(account), true) => candidate.account.as_deref() == Some(account.as_str()),
        (None, false) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::candidate;

    fn route(usage: UsageSelector, id: &str) -> MappingEntry {
        MappingEntry::route(usage, ModelRef::new("host", id))
    }

    fn with_account(mut c: Candidate, account: &str) -> Candidate {
        c.account = Some(account.to_string());
        c
    }

    #[test]
    fn exact_window_beats_pattern_and_catch_all() {
        let r = MappingResolver::new();
        let mappings = vec![
            route(UsageSelector::catch_all("p1"), "any"),
            route(UsageSelector::pattern("p1", "^w"), "pattern"),
            route(UsageSelector::window("p1", "w1"), "exact"),
        ];
        let hit = r.find_model_mapping(&candidate("p1", "w1", 50.0), &mappings);
        assert_eq!(hit.and_then(|m| m.model()).map(|m| m.id.as_str()), Some("exact"));

        let hit = r.find_model_mapping(&candidate("p1", "w2", 50.0), &mappings);
        assert_eq!(hit.and_then(|m| m.model()).map(|m| m.id.as_str()), Some("pattern"));

        let hit = r.find_model_mapping(&candidate("p1", "x", 50.0), &mappings);
        assert_eq!(hit.and_then(|m| m.model()).map(|m| m.id.as_str()), Some("any"));

        assert!(r.find_model_mapping(&candidate("p2", "w1", 50.0), &mappings).is_none());
    }

    #[test]
    fn account_specific_outranks_generic_regardless_of_order() {
        let r = MappingResolver::new();
        let generic = route(UsageSelector::window("p1", "w1"), "generic");
        let scoped = route(UsageSelector::window("p1", "w1").for_account("work"), "scoped");
        let c = with_account(candidate("p1", "w1", 50.0), "work");

        for mappings in [
            vec![generic.clone(), scoped.clone()],
            vec![scoped.clone(), generic.clone()],
        ] {
            let hit = r.find_model_mapping(&c, &mappings).and_then(|m| m.model());
            assert_eq!(hit.map(|m| m.id.as_str()), Some("scoped"));
        }

        let other = with_account(candidate("p1", "w1", 50.0), "home");
        let mappings = vec![scoped, generic];
        let hit = r.find_model_mapping(&other, &mappings).and_then(|m| m.model());
        assert_eq!(hit.map(|m| m.id.as_str()), Some("generic"));
    }

    #[test]
    fn invalid_pattern_is_a_non_match() {
        let r = MappingResolver::new();
        let mappings = vec![
            route(UsageSelector::pattern("p1", "(unclosed"), "bad"),
            route(UsageSelector::catch_all("p1"), "fallback"),
        ];
        let hit = r.find_model_mapping(&candidate("p1", "(unclosed", 50.0), &mappings);
        assert_eq!(
            hit.and_then(|m| m.model()).map(|m| m.id.as_str()),
            Some("fallback")
        );
    }

    #[test]
    fn specialized_lookups_filter_by_action() {
        let r = MappingResolver::new();
        let mappings = vec![
            MappingEntry::ignore(UsageSelector::window("p1", "w1")),
            MappingEntry::combine(UsageSelector::window("p1", "w2"), "g"),
            route(UsageSelector::catch_all("p1"), "m1")
                .with_reserve(Reserve::new(25).unwrap()),
        ];
        let w1 = candidate("p1", "w1", 50.0);
        assert!(r.find_ignore_mapping(&w1, &mappings).is_some());
        assert_eq!(
            r.find_model_mapping(&w1, &mappings)
                .and_then(|m| m.model())
                .map(|m| m.id.as_str()),
            Some("m1")
        );
        assert_eq!(r.reserve_threshold(&w1, &mappings), 25);

        let mut w2 = candidate("p1", "w2", 50.0);
        assert!(r.find_combination_mapping(&w2, &mappings).is_some());
        w2.is_synthetic = true;
        assert!(r.find_combination_mapping(&w2, &mappings).is_none());

        assert_eq!(r.reserve_threshold(&candidate("p9", "w", 1.0), &mappings), 0);
    }

    #[test]
    fn raw_entries_enforce_exclusive_actions() {
        let ok: MappingEntry = sonic_rs::from_str(
            r#"{"usage":{"provider":"p1","windowPattern":"^5h"},"model":{"provider":"a","id":"b"},"reserve":10}"#,
        )
        .unwrap();
        assert_eq!(ok.reserve(), 10);
        assert_eq!(ok.usage.window_pattern.as_deref(), Some("^5h"));

        let ignore: MappingEntry =
            sonic_rs::from_str(r#"{"usage":{"provider":"p1"},"ignore":true}"#).unwrap();
        assert!(ignore.is_ignore());

        for bad in [
            r#"{"usage":{"provider":"p1"}}"#,
            r#"{"usage":{"provider":"p1"},"ignore":true,"combine":"g"}"#,
            r#"{"usage":{"provider":"p1"},"combine":"g","reserve":5}"#,
            r#"{"usage":{"provider":"p1"},"model":{"provider":"a","id":"b"},"reserve":100}"#,
            r#"{"usage":{"provider":"p1"},"model":{"provider":"a","id":"b"},"reserve":-1}"#,
        ] {
            assert!(sonic_rs::from_str::<MappingEntry>(bad).is_err(), "{bad}");
        }
    }
}
