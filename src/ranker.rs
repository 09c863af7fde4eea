//! 候选排序：两条硬规则 + 用户配置的优先级列表，逐条比较，遇到非零结果即停止。

use crate::candidate::Candidate;
use crate::mapping::{MappingEntry, MappingResolver};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PriorityRule {
    /// 剩余 100% 的候选优先。
    FullAvailability,
    /// 剩余百分比更高者优先。
    RemainingPercent,
    /// 没有重置时间（视为不限量）优先；都有时更早重置者优先。
    EarliestReset,
}

/// 决定两者先后的那条规则。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecidingRule {
    Availability,
    Mapping,
    Priority(PriorityRule),
    Tie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comparison {
    /// `Greater` 表示 a 排在 b 前面。
    pub ordering: Ordering,
    pub rule: DecidingRule,
}

impl Comparison {
    fn decided(ordering: Ordering, rule: DecidingRule) -> Option<Self> {
        (ordering != Ordering::Equal).then_some(Self { ordering, rule })
    }
}

/// 比较两个候选。
///
/// 硬规则 1（有剩余优先于耗尽）先于硬规则 2（有映射优先于无映射）：
/// 有剩余但无映射的候选仍然排在有映射但已耗尽的候选之前。
pub fn compare_candidates(
    a: &Candidate,
    b: &Candidate,
    priority: &[PriorityRule],
    mappings: &[MappingEntry],
    resolver: &MappingResolver,
) -> Comparison {
    if let Some(c) = Comparison::decided(
        a.is_available().cmp(&b.is_available()),
        DecidingRule::Availability,
    ) {
        return c;
    }

    let a_mapped = resolver.find_model_mapping(a, mappings).is_some();
    let b_mapped = resolver.find_model_mapping(b, mappings).is_some();
    if let Some(c) = Comparison::decided(a_mapped.cmp(&b_mapped), DecidingRule::Mapping) {
        return c;
    }

    for &rule in priority {
        let ordering = match rule {
            PriorityRule::FullAvailability => is_full(a).cmp(&is_full(b)),
            PriorityRule::RemainingPercent => a
                .remaining_percent
                .partial_cmp(&b.remaining_percent)
                .unwrap_or(Ordering::Equal),
            PriorityRule::EarliestReset => match (a.resets_at, b.resets_at) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(x), Some(y)) => y.cmp(&x),
            },
        };
        if let Some(c) = Comparison::decided(ordering, DecidingRule::Priority(rule)) {
            return c;
        }
    }

    Comparison {
        ordering: Ordering::Equal,
        rule: DecidingRule::Tie,
    }
}

/// 按排名降序排列；完全并列的候选保持输入顺序。
pub fn sort_candidates(
    mut candidates: Vec<Candidate>,
    priority: &[PriorityRule],
    mappings: &[MappingEntry],
    resolver: &MappingResolver,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| compare_candidates(b, a, priority, mappings, resolver).ordering);
    candidates
}

/// 生成"为什么选中它"的说明文字，用于诊断输出。
pub fn selection_reason(
    winner: &Candidate,
    runner_up: Option<&Candidate>,
    priority: &[PriorityRule],
    mappings: &[MappingEntry],
    resolver: &MappingResolver,
) -> String {
    let Some(other) = runner_up else {
        return format!("{} is the only candidate", winner.describe());
    };

    let w = winner.describe();
    let o = other.describe();
    let cmp = compare_candidates(winner, other, priority, mappings, resolver);
    match cmp.rule {
        DecidingRule::Availability => format!("{w} has quota left while {o} is exhausted"),
        DecidingRule::Mapping => format!("{w} has a model mapping while {o} does not"),
        DecidingRule::Priority(PriorityRule::FullAvailability) => {
            format!("{w} is fully available (fullAvailability)")
        }
        DecidingRule::Priority(PriorityRule::RemainingPercent) => format!(
            "{w} has more remaining ({:.0}% vs {:.0}%, remainingPercent)",
            winner.remaining_percent, other.remaining_percent
        ),
        DecidingRule::Priority(PriorityRule::EarliestReset) => match winner.resets_at {
            None => format!("{w} has no reset limit (earliestReset)"),
            Some(at) => format!(
                "{w} resets sooner at {} (earliestReset)",
                at.format("%Y-%m-%d %H:%M UTC")
            ),
        },
        DecidingRule::Tie => format!("{w} tied with {o}; kept the earlier entry"),
    }
}

fn is_full(c: &Candidate) -> bool {
    c.remaining_percent >= 100.0
}
