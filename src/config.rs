use crate::cooldown::DEFAULT_COOLDOWN;
use crate::logging::LogLevel;
use crate::model_lock::LockSettings;
use crate::selector::SelectorSettings;
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_ROUTING_FILE: &str = "./routing.toml";
const DEFAULT_USAGES_FILE: &str = "./usages.json";
const DEFAULT_LOCK_LEASE_MS: u64 = 15_000;
const DEFAULT_LOCK_HARD_STALE_MS: u64 = 5 * 60 * 1000;
const DEFAULT_LOCK_HEARTBEAT_MS: u64 = 5_000;
const DEFAULT_LOCK_POLL_MS: u64 = 250;
const DEFAULT_MUTEX_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MUTEX_STALE_MS: u64 = 30_000;

/// 进程级设置（数据目录、时长参数、日志等级）。路由规则不在这里，见 [`crate::routing`]。
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub routing_file: String,
    pub usages_file: String,

    pub cooldown_minutes: u64,

    pub lock_lease_ms: u64,
    pub lock_hard_stale_ms: u64,
    pub lock_heartbeat_ms: u64,
    pub lock_timeout_ms: u64,
    pub lock_poll_ms: u64,
    pub mutex_timeout_ms: u64,
    pub mutex_stale_ms: u64,

    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
    #[serde(alias = "ROUTING_FILE")]
    routing_file: Option<String>,
    #[serde(alias = "USAGES_FILE")]
    usages_file: Option<String>,

    #[serde(alias = "COOLDOWN_MINUTES")]
    cooldown_minutes: Option<u64>,

    #[serde(alias = "LOCK_LEASE_MS")]
    lock_lease_ms: Option<u64>,
    #[serde(alias = "LOCK_HARD_STALE_MS")]
    lock_hard_stale_ms: Option<u64>,
    #[serde(alias = "LOCK_HEARTBEAT_MS")]
    lock_heartbeat_ms: Option<u64>,
    #[serde(alias = "LOCK_TIMEOUT_MS")]
    lock_timeout_ms: Option<u64>,
    #[serde(alias = "LOCK_POLL_MS")]
    lock_poll_ms: Option<u64>,
    #[serde(alias = "MUTEX_TIMEOUT_MS")]
    mutex_timeout_ms: Option<u64>,
    #[serde(alias = "MUTEX_STALE_MS")]
    mutex_stale_ms: Option<u64>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        let mut cfg = Self::from_figment(Figment::from(Env::raw()));

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    pub fn from_figment(figment: Figment) -> Self {
        let raw = figment.extract::<RawEnv>().unwrap_or_default();
        Self {
            data_dir: raw.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            routing_file: raw
                .routing_file
                .unwrap_or_else(|| DEFAULT_ROUTING_FILE.to_string()),
            usages_file: raw
                .usages_file
                .unwrap_or_else(|| DEFAULT_USAGES_FILE.to_string()),
            cooldown_minutes: raw
                .cooldown_minutes
                .unwrap_or(DEFAULT_COOLDOWN.as_secs() / 60),
            lock_lease_ms: raw.lock_lease_ms.unwrap_or(DEFAULT_LOCK_LEASE_MS),
            lock_hard_stale_ms: raw.lock_hard_stale_ms.unwrap_or(DEFAULT_LOCK_HARD_STALE_MS),
            lock_heartbeat_ms: raw.lock_heartbeat_ms.unwrap_or(DEFAULT_LOCK_HEARTBEAT_MS),
            lock_timeout_ms: raw.lock_timeout_ms.unwrap_or(0),
            lock_poll_ms: raw.lock_poll_ms.unwrap_or(DEFAULT_LOCK_POLL_MS),
            mutex_timeout_ms: raw.mutex_timeout_ms.unwrap_or(DEFAULT_MUTEX_TIMEOUT_MS),
            mutex_stale_ms: raw.mutex_stale_ms.unwrap_or(DEFAULT_MUTEX_STALE_MS),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        }
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.debug)
    }

    pub fn cooldown_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("cooldowns.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("model-locks.json")
    }

    pub fn active_model_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("active-model.json")
    }

    pub fn cooldown_duration(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes.max(1) * 60)
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            lease: Duration::from_millis(self.lock_lease_ms),
            // 硬过期不能短于租约，否则租约内的锁也会被强制回收。
            hard_stale: Duration::from_millis(self.lock_hard_stale_ms.max(self.lock_lease_ms)),
            heartbeat_interval: Duration::from_millis(self.lock_heartbeat_ms.max(1)),
            mutex_timeout: Duration::from_millis(self.mutex_timeout_ms),
            mutex_poll: LockSettings::default().mutex_poll,
            mutex_stale: Duration::from_millis(self.mutex_stale_ms),
        }
    }

    pub fn selector_settings(&self) -> SelectorSettings {
        SelectorSettings {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            lock_poll: Duration::from_millis(self.lock_poll_ms.max(1)),
            log_level: self.log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Serialized;

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let cfg = Config::from_figment(Figment::new());
        assert_eq!(cfg.data_dir, DEFAULT_DATA_DIR);
        assert_eq!(cfg.cooldown_duration(), DEFAULT_COOLDOWN);
        let locks = cfg.lock_settings();
        assert_eq!(locks.lease, Duration::from_secs(15));
        assert_eq!(locks.hard_stale, Duration::from_secs(300));
        assert_eq!(locks.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.selector_settings().lock_timeout, Duration::ZERO);
        assert_eq!(cfg.log_level(), LogLevel::Off);
    }

    #[test]
    fn values_override_defaults() {
        let figment = Figment::new()
            .merge(Serialized::default("data_dir", "/var/lib/qs"))
            .merge(Serialized::default("cooldown_minutes", 5u64))
            .merge(Serialized::default("lock_lease_ms", 20_000u64))
            .merge(Serialized::default("lock_hard_stale_ms", 1_000u64))
            .merge(Serialized::default("debug", "medium"));
        let cfg = Config::from_figment(figment);
        assert_eq!(cfg.lock_path(), PathBuf::from("/var/lib/qs/model-locks.json"));
        assert_eq!(cfg.cooldown_duration(), Duration::from_secs(300));
        assert_eq!(cfg.lock_settings().hard_stale, Duration::from_secs(20));
        assert_eq!(cfg.log_level(), LogLevel::Medium);
    }
}
