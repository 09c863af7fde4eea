//! 用量快照：由外部 provider 拉取器产出的标准化输入。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// provider 上报的单个配额窗口（例如 5 小时窗口、周窗口）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageWindow {
    pub label: String,
    pub used_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
}

/// 一个 provider（+账号）在某次拉取时的用量视图。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub windows: Vec<UsageWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UsageSnapshot {
    pub fn new(provider: impl Into<String>, windows: Vec<UsageWindow>) -> Self {
        let provider = provider.into();
        Self {
            display_name: provider.clone(),
            provider,
            account: None,
            windows,
            error: None,
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn failed(provider: impl Into<String>, error: impl Into<String>) -> Self {
        let mut s = Self::new(provider, Vec::new());
        s.error = Some(error.into());
        s
    }

    pub fn is_rate_limited(&self) -> bool {
        self.error.as_deref().is_some_and(is_rate_limit_error)
    }
}

impl UsageWindow {
    pub fn new(label: impl Into<String>, used_percent: f64) -> Self {
        Self {
            label: label.into(),
            used_percent,
            resets_at: None,
        }
    }

    pub fn resetting_at(mut self, at: DateTime<Utc>) -> Self {
        self.resets_at = Some(at);
        self
    }
}

/// 判断拉取错误是否属于限流类（需要触发 provider 级冷却）。
pub fn is_rate_limit_error(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("429")
        || m.contains("rate limit")
        || m.contains("rate_limit")
        || m.contains("rate-limit")
        || m.contains("too many requests")
        || m.contains("quota exceeded")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_errors_are_detected() {
        assert!(is_rate_limit_error("HTTP 429"));
        assert!(is_rate_limit_error("Rate limit reached for requests"));
        assert!(is_rate_limit_error("error: RATE_LIMIT_EXCEEDED"));
        assert!(is_rate_limit_error("Too Many Requests"));
        assert!(!is_rate_limit_error("HTTP 401 unauthorized"));
        assert!(!is_rate_limit_error("connection reset"));
    }

    #[test]
    fn snapshot_deserializes_from_camel_case() {
        let raw = r#"{
            "provider": "anthropic",
            "account": "work",
            "displayName": "Claude",
            "windows": [
                {"label": "5h", "usedPercent": 42.5, "resetsAt": "2026-01-01T00:00:00Z"},
                {"label": "week", "usedPercent": 10}
            ]
        }"#;
        let s: UsageSnapshot = sonic_rs::from_str(raw).unwrap();
        assert_eq!(s.account.as_deref(), Some("work"));
        assert_eq!(s.windows.len(), 2);
        assert!(s.windows[0].resets_at.is_some());
        assert!(s.windows[1].resets_at.is_none());
        assert!(!s.is_rate_limited());
    }
}
