//! 路由配置：由外部配置加载得到，核心只读取。

use crate::mapping::MappingEntry;
use crate::ranker::PriorityRule;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 宿主模型注册表里的模型标识。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub id: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
        }
    }

    /// 模型锁的键：`provider/id`。
    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.provider, self.id)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.id)
    }
}

/// 兜底模型：没有可用候选时的最后手段。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackConfig {
    pub provider: String,
    pub id: String,
    /// 为 false 时兜底模型不参与模型锁。
    #[serde(default = "default_true")]
    pub lock: bool,
}

impl FallbackConfig {
    pub fn model(&self) -> ModelRef {
        ModelRef::new(self.provider.clone(), self.id.clone())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedConfig {
    #[serde(default)]
    pub mappings: Vec<MappingEntry>,
    #[serde(default = "default_priority")]
    pub priority: Vec<PriorityRule>,
    #[serde(default)]
    pub disabled_providers: Vec<String>,
    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
}

impl LoadedConfig {
    pub fn is_provider_disabled(&self, provider: &str) -> bool {
        self.disabled_providers.iter().any(|p| p == provider)
    }
}

pub fn default_priority() -> Vec<PriorityRule> {
    vec![
        PriorityRule::FullAvailability,
        PriorityRule::EarliestReset,
        PriorityRule::RemainingPercent,
    ]
}
