use crate::candidate::Candidate;
use std::fmt::Write as _;

/// 诊断日志等级：
/// - off：只输出决策结果
/// - low：额外输出选择理由
/// - medium：额外输出排序后的候选表
/// - high：额外输出每个候选的映射/冷却判定细节
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "reason" => Self::Low,
            "medium" | "table" => Self::Medium,
            "high" | "all" | "trace" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn reason_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn table_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn detail_enabled(self) -> bool {
        self >= Self::High
    }
}

/// 排序后的候选表（第一行为胜出者）。
pub fn format_ranking(ranked: &[Candidate]) -> String {
    let mut out = String::new();
    for (i, c) in ranked.iter().enumerate() {
        let reset = c
            .resets_at
            .map(|at| at.format("%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:>2}. {:<40} 剩余 {:>5.1}%  重置 {}{}",
            i + 1,
            c.describe(),
            c.remaining_percent,
            reset,
            if c.is_synthetic { "  [combine]" } else { "" },
        );
    }
    out
}

pub fn ranking(level: LogLevel, ranked: &[Candidate]) {
    if !level.table_enabled() || ranked.is_empty() {
        return;
    }
    tracing::info!(
        "\n===================== 候选排序 ======================\n{}=====================================================",
        format_ranking(ranked)
    );
}

pub fn reason(level: LogLevel, reason: &str) {
    if level.reason_enabled() {
        tracing::info!("[选择理由] {reason}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::candidate;

    #[test]
    fn parse_levels() {
        assert_eq!(LogLevel::parse("off"), LogLevel::Off);
        assert_eq!(LogLevel::parse("  LOW "), LogLevel::Low);
        assert_eq!(LogLevel::parse("medium"), LogLevel::Medium);
        assert_eq!(LogLevel::parse("all"), LogLevel::High);
        assert_eq!(LogLevel::parse("nonsense"), LogLevel::Off);
        assert!(LogLevel::High.table_enabled());
        assert!(!LogLevel::Low.table_enabled());
    }

    #[test]
    fn ranking_table_lists_every_candidate() {
        let mut synthetic = candidate("p2", "shared", 12.0);
        synthetic.is_synthetic = true;
        let table = format_ranking(&[candidate("p1", "5h", 80.0), synthetic]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(" 1. p1 5h"));
        assert!(lines[1].contains("[combine]"));
    }
}
