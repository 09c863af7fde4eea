//! 候选构建：把用量窗口拍平成可比较的候选记录，并处理 combine 分组与去重。

use crate::mapping::{MappingEntry, MappingResolver};
use crate::usage::UsageSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// 一个候选：provider + 账号 + 窗口 对应的配额桶。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub provider: String,
    pub account: Option<String>,
    pub display_name: String,
    pub window_label: String,
    /// 已钳制到 [0, 100]。
    pub used_percent: f64,
    /// 恒等于 `100 - used_percent`。
    pub remaining_percent: f64,
    pub resets_at: Option<DateTime<Utc>>,
    /// combine 分组生成的合成候选。
    pub is_synthetic: bool,
}

/// 候选的结构化身份键。各字段可能包含任意字符，因此不做字符串拼接。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateKey {
    pub provider: String,
    pub account: Option<String>,
    pub window: String,
    pub synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    provider: String,
    account: Option<String>,
    group: String,
}

impl Candidate {
    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            provider: self.provider.clone(),
            account: self.account.clone(),
            window: self.window_label.clone(),
            synthetic: self.is_synthetic,
        }
    }

    pub fn is_available(&self) -> bool {
        self.remaining_percent > 0.0
    }

    /// 形如 `provider/account window` 的展示名，用于日志与提示。
    pub fn describe(&self) -> String {
        let name = if self.display_name.trim().is_empty() {
            self.provider.as_str()
        } else {
            self.display_name.as_str()
        };
        match self.account.as_deref() {
            Some(account) => format!("{name} ({account}) {}", self.window_label),
            None => format!("{name} {}", self.window_label),
        }
    }
}

/// 把快照拍平成候选列表。
///
/// - 带错误或没有窗口的快照直接跳过
/// - usedPercent 非有限值（NaN/±Inf）的窗口被丢弃，其余钳制到 [0, 100]
pub fn build_candidates(snapshots: &[UsageSnapshot]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for s in snapshots {
        if s.error.is_some() || s.windows.is_empty() {
            continue;
        }
        for w in &s.windows {
            if !w.used_percent.is_finite() {
                tracing::debug!(
                    provider = %s.provider,
                    window = %w.label,
                    "usedPercent 非有限值，丢弃该窗口"
                );
                continue;
            }
            let used = w.used_percent.clamp(0.0, 100.0);
            out.push(Candidate {
                provider: s.provider.clone(),
                account: s.account.clone(),
                display_name: s.display_name.clone(),
                window_label: w.label.clone(),
                used_percent: used,
                remaining_percent: 100.0 - used,
                resets_at: w.resets_at,
                is_synthetic: false,
            });
        }
    }
    out
}

/// 按 combine 映射把候选合并成"瓶颈"合成候选。
///
/// 同一 (provider, account, group) 内取 remainingPercent 最小者（并列取先出现者），
/// 合成候选沿用它的百分比与重置时间，windowLabel 为分组名。未分组的候选原样保留在前，
/// 合成候选按分组首次出现的顺序追加在后。
pub fn combine_candidates(
    candidates: Vec<Candidate>,
    mappings: &[MappingEntry],
    resolver: &MappingResolver,
) -> Vec<Candidate> {
    let mut out = Vec::with_capacity(candidates.len());
    let mut groups: Vec<(GroupKey, Candidate)> = Vec::new();
    let mut index: HashMap<GroupKey, usize> = HashMap::new();

    for c in candidates {
        let Some(group) = resolver
            .find_combination_mapping(&c, mappings)
            .and_then(|m| m.combine_group())
        else {
            out.push(c);
            continue;
        };

        let key = GroupKey {
            provider: c.provider.clone(),
            account: c.account.clone(),
            group: group.to_string(),
        };
        match index.get(&key) {
            Some(&i) => {
                let bottleneck = &mut groups[i].1;
                if c.remaining_percent < bottleneck.remaining_percent {
                    *bottleneck = c;
                }
            }
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, c));
            }
        }
    }

    for (key, bottleneck) in groups {
        tracing::debug!(
            provider = %key.provider,
            group = %key.group,
            bottleneck = %bottleneck.window_label,
            remaining = bottleneck.remaining_percent,
            "combine 分组合成候选"
        );
        out.push(Candidate {
            window_label: key.group,
            is_synthetic: true,
            ..bottleneck
        });
    }
    out
}

/// 折叠重复候选：同一 (provider, account, window, synthetic) 只保留 remainingPercent 更高者。
pub fn dedupe_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = Vec::with_capacity(candidates.len());
    let mut seen: HashMap<CandidateKey, usize> = HashMap::new();
    for c in candidates {
        match seen.get(&c.key()) {
            Some(&i) => {
                if c.remaining_percent > out[i].remaining_percent {
                    out[i] = c;
                }
            }
            None => {
                seen.insert(c.key(), out.len());
                out.push(c);
            }
        }
    }
    out
}

#[cfg(test)]
pub(crate) fn candidate(provider: &str, window: &str, remaining: f64) -> Candidate {
    Candidate {
        provider: provider.to_string(),
        account: None,
        display_name: provider.to_string(),
        window_label: window.to_string(),
        used_percent: 100.0 - remaining,
        remaining_percent: remaining,
        resets_at: None,
        is_synthetic: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{MappingAction, UsageSelector};
    use crate::usage::UsageWindow;

    fn combine_rule(provider: &str, window: &str, group: &str) -> MappingEntry {
        MappingEntry {
            usage: UsageSelector::window(provider, window),
            action: MappingAction::Combine {
                group: group.to_string(),
            },
        }
    }

    #[test]
    fn build_clamps_and_drops_non_finite() {
        let snap = UsageSnapshot::new(
            "p1",
            vec![
                UsageWindow::new("neg", -12.0),
                UsageWindow::new("over", 140.0),
                UsageWindow::new("mid", 37.5),
                UsageWindow::new("nan", f64::NAN),
                UsageWindow::new("inf", f64::INFINITY),
            ],
        );
        let out = build_candidates(&[snap]);
        let labels: Vec<_> = out.iter().map(|c| c.window_label.as_str()).collect();
        assert_eq!(labels, vec!["neg", "over", "mid"]);
        for c in &out {
            assert!((0.0..=100.0).contains(&c.used_percent));
            assert_eq!(c.remaining_percent, 100.0 - c.used_percent);
        }
        assert_eq!(out[0].remaining_percent, 100.0);
        assert_eq!(out[1].remaining_percent, 0.0);
        assert_eq!(out[2].remaining_percent, 62.5);
    }

    #[test]
    fn build_skips_errored_and_empty_snapshots() {
        let mut errored = UsageSnapshot::new("p1", vec![UsageWindow::new("w", 10.0)]);
        errored.error = Some("HTTP 500".to_string());
        let empty = UsageSnapshot::new("p2", Vec::new());
        let ok = UsageSnapshot::new("p3", vec![UsageWindow::new("w", 10.0)]);
        let out = build_candidates(&[errored, empty, ok]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].provider, "p3");
    }

    #[test]
    fn combine_emits_bottleneck_per_group() {
        let resolver = MappingResolver::new();
        let mappings = vec![
            combine_rule("p1", "a", "shared"),
            combine_rule("p1", "b", "shared"),
        ];
        let out = combine_candidates(
            vec![
                candidate("p1", "a", 80.0),
                candidate("p1", "b", 60.0),
                candidate("p1", "c", 10.0),
            ],
            &mappings,
            &resolver,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].window_label, "c");
        let synthetic = &out[1];
        assert!(synthetic.is_synthetic);
        assert_eq!(synthetic.window_label, "shared");
        assert_eq!(synthetic.remaining_percent, 60.0);
        assert_eq!(synthetic.used_percent, 40.0);
    }

    #[test]
    fn combine_ties_keep_first_member() {
        let resolver = MappingResolver::new();
        let mappings = vec![
            combine_rule("p1", "a", "g"),
            combine_rule("p1", "b", "g"),
        ];
        let reset: DateTime<Utc> = "2030-01-01T00:00:00Z".parse().unwrap();
        let mut first = candidate("p1", "a", 50.0);
        first.resets_at = Some(reset);
        let out = combine_candidates(
            vec![first, candidate("p1", "b", 50.0)],
            &mappings,
            &resolver,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].resets_at, Some(reset));
    }

    #[test]
    fn combine_keys_are_structural() {
        // "a|b" + "c" 与 "a" + "b|c" 拼接后相同，但必须是两个分组。
        let resolver = MappingResolver::new();
        let mappings = vec![
            MappingEntry {
                usage: UsageSelector::catch_all("x"),
                action: MappingAction::Combine {
                    group: "b|c".to_string(),
                },
            },
            MappingEntry {
                usage: UsageSelector::catch_all("x").for_account("a|b"),
                action: MappingAction::Combine {
                    group: "c".to_string(),
                },
            },
        ];
        let mut left = candidate("x", "w1", 30.0);
        left.account = Some("a|b".to_string());
        let mut right = candidate("x", "w2", 70.0);
        right.account = Some("a".to_string());
        let out = combine_candidates(vec![left, right], &mappings, &resolver);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| c.is_synthetic));
    }

    #[test]
    fn synthetic_candidates_are_never_regrouped() {
        let resolver = MappingResolver::new();
        let mappings = vec![MappingEntry {
            usage: UsageSelector::catch_all("p1"),
            action: MappingAction::Combine {
                group: "all".to_string(),
            },
        }];
        let once = combine_candidates(
            vec![candidate("p1", "a", 10.0), candidate("p1", "b", 20.0)],
            &mappings,
            &resolver,
        );
        let twice = combine_candidates(once.clone(), &mappings, &resolver);
        assert_eq!(once, twice);
    }

    #[test]
    fn dedupe_keeps_higher_remaining() {
        let mut synthetic = candidate("p1", "w", 5.0);
        synthetic.is_synthetic = true;
        let out = dedupe_candidates(vec![
            candidate("p1", "w", 20.0),
            synthetic,
            candidate("p1", "w", 40.0),
            candidate("p1", "w", 30.0),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].remaining_percent, 40.0);
        assert!(out[1].is_synthetic);
    }
}
