use anyhow::Context;
use figment::Figment;
use figment::providers::{Format, Toml};
use quota_switch::config::Config;
use quota_switch::cooldown::CooldownManager;
use quota_switch::model_lock::ModelLockCoordinator;
use quota_switch::persist;
use quota_switch::routing::{LoadedConfig, ModelRef};
use quota_switch::selector::{ModelSelector, NotifyLevel, RunOptions, SelectorHost};
use quota_switch::usage::UsageSnapshot;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "用法: quota-switch [-debug off|low|medium|high] <select [--lock] | skip | locks | clear-cooldowns | status>";

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cfg = Config::load();
    init_tracing(&cfg);

    let args = command_args();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{USAGE}");
        return Ok(ExitCode::from(2));
    };

    match command {
        "select" => {
            let lock = args.iter().any(|a| a == "--lock");
            run_select(&cfg, lock, false).await
        }
        "skip" => run_select(&cfg, false, true).await,
        "locks" => {
            show_locks(&cfg).await;
            Ok(ExitCode::SUCCESS)
        }
        "clear-cooldowns" => {
            let mut cooldowns = CooldownManager::new(cfg.cooldown_path(), cfg.cooldown_duration());
            cooldowns.load().await;
            let n = cooldowns.clear_all();
            cooldowns
                .save()
                .await
                .context("写入冷却状态失败")?;
            println!("已清除 {n} 条冷却");
            Ok(ExitCode::SUCCESS)
        }
        "status" => {
            show_status(&cfg).await;
            Ok(ExitCode::SUCCESS)
        }
        other => {
            eprintln!("未知命令: {other}\n{USAGE}");
            Ok(ExitCode::from(2))
        }
    }
}

async fn run_select(cfg: &Config, lock: bool, skip: bool) -> anyhow::Result<ExitCode> {
    let (routing, models) = load_routing(cfg)?;
    let host = CliHost::new(cfg, models).await;
    let selector = ModelSelector::from_config(host, cfg);

    let opts = RunOptions {
        usages: None,
        acquire_lock: lock,
    };
    let ok = if skip {
        selector.skip_current(&routing, opts).await
    } else {
        selector.run_selector(&routing, opts).await
    };

    if let Some(status) = selector.host().status() {
        println!("{status}");
    }
    if !ok {
        return Ok(ExitCode::FAILURE);
    }

    if lock {
        // 持有模型锁直到 Ctrl-C；心跳在后台续期。
        println!("已持有模型锁，按 Ctrl-C 释放");
        shutdown_signal().await;
        let released = selector.release_all_locks().await;
        tracing::info!("已释放 {released} 个模型锁");
    }
    Ok(ExitCode::SUCCESS)
}

/// 路由配置文件（TOML）。`models` 为可选的模型注册表；缺省时由映射和兜底引用的模型组成。
fn load_routing(cfg: &Config) -> anyhow::Result<(LoadedConfig, Vec<ModelRef>)> {
    let figment = Figment::from(Toml::file(&cfg.routing_file));
    let routing: LoadedConfig = figment
        .extract()
        .with_context(|| format!("解析路由配置失败: {}", cfg.routing_file))?;
    let models = match figment.extract_inner::<Vec<ModelRef>>("models") {
        Ok(models) => models,
        Err(_) => referenced_models(&routing),
    };
    Ok((routing, models))
}

fn referenced_models(routing: &LoadedConfig) -> Vec<ModelRef> {
    let mut models: Vec<ModelRef> = Vec::new();
    let mapped = routing.mappings.iter().filter_map(|m| m.model().cloned());
    let fallback = routing.fallback.iter().map(|f| f.model());
    for model in mapped.chain(fallback) {
        if !models.contains(&model) {
            models.push(model);
        }
    }
    models
}

async fn show_locks(cfg: &Config) {
    let locks = ModelLockCoordinator::new(cfg.lock_path(), cfg.lock_settings());
    let snapshot = locks.snapshot().await;
    if snapshot.is_empty() {
        println!("没有模型锁");
        return;
    }
    let now = chrono::Utc::now().timestamp_millis();
    for (key, e) in snapshot {
        println!(
            "{key}  pid={} instance={} 心跳 {}s 前",
            e.pid,
            e.instance_id,
            now.saturating_sub(e.heartbeat_at) / 1000
        );
    }
}

async fn show_status(cfg: &Config) {
    let active: Option<ModelRef> = persist::read_json_or_default(&cfg.active_model_path()).await;
    match active {
        Some(m) => println!("当前模型: {m}"),
        None => println!("当前模型: -"),
    }

    let mut cooldowns = CooldownManager::new(cfg.cooldown_path(), cfg.cooldown_duration());
    cooldowns.load().await;
    println!("上次选中: {}", cooldowns.last_selected().unwrap_or("-"));
    let now = chrono::Utc::now().timestamp_millis();
    let active_cooldowns: Vec<(&String, &i64)> = cooldowns
        .state()
        .cooldowns
        .iter()
        .filter(|(_, expiry)| **expiry > now)
        .collect();
    if active_cooldowns.is_empty() {
        println!("冷却: 无");
    }
    for (key, expiry) in active_cooldowns {
        println!("冷却: {key} 剩余 {} 分钟", (expiry - now + 59_999) / 60_000);
    }
}

/// 命令行宿主：用量来自 JSON 文件，当前模型持久化在数据目录。
struct CliHost {
    usages_path: PathBuf,
    active_path: PathBuf,
    registry: Vec<ModelRef>,
    active: Mutex<Option<ModelRef>>,
    status: Mutex<Option<String>>,
}

impl CliHost {
    async fn new(cfg: &Config, registry: Vec<ModelRef>) -> Self {
        let active_path = cfg.active_model_path();
        let active: Option<ModelRef> = persist::read_json_or_default(&active_path).await;
        Self {
            usages_path: PathBuf::from(&cfg.usages_file),
            active_path,
            registry,
            active: Mutex::new(active),
            status: Mutex::new(None),
        }
    }

    fn status(&self) -> Option<String> {
        self.status.lock().ok().and_then(|s| s.clone())
    }
}

impl SelectorHost for CliHost {
    async fn fetch_usages(&self, disabled_providers: &[String]) -> Vec<UsageSnapshot> {
        let snapshots: Vec<UsageSnapshot> = persist::read_json_or_default(&self.usages_path).await;
        snapshots
            .into_iter()
            .filter(|s| !disabled_providers.contains(&s.provider))
            .collect()
    }

    fn find_model(&self, provider: &str, id: &str) -> Option<ModelRef> {
        self.registry
            .iter()
            .find(|m| m.provider == provider && m.id == id)
            .cloned()
    }

    fn current_model(&self) -> Option<ModelRef> {
        self.active.lock().ok().and_then(|m| m.clone())
    }

    async fn set_model(&self, model: &ModelRef) -> bool {
        let value = Some(model.clone());
        if let Err(e) = persist::write_json_atomic(&self.active_path, &value).await {
            tracing::warn!("写入当前模型失败：{e:#}");
            return false;
        }
        if let Ok(mut active) = self.active.lock() {
            *active = value;
        }
        true
    }

    fn notify(&self, message: &str, level: NotifyLevel) {
        match level {
            NotifyLevel::Info => println!("{message}"),
            NotifyLevel::Warning => eprintln!("警告: {message}"),
            NotifyLevel::Error => eprintln!("错误: {message}"),
        }
    }

    fn set_status(&self, status: Option<&str>) {
        if let Ok(mut s) = self.status.lock() {
            *s = status.map(str::to_string);
        }
    }
}

/// 去掉 `-debug <level>` 之后的位置参数。
fn command_args() -> Vec<String> {
    let mut out = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "-debug" {
            args.next();
            continue;
        }
        out.push(arg);
    }
    out
}

fn init_tracing(cfg: &Config) {
    // 默认把依赖库日志控制在 warn，本项目自身日志至少为 info，
    // 以免环境中预设的 RUST_LOG=warn 把决策日志过滤掉。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("off")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,quota_switch=info")
        } else if env.contains("quota_switch") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},quota_switch=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，释放模型锁...");
}
