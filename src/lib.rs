pub mod candidate;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod file_mutex;
pub mod logging;
pub mod mapping;
pub mod model_lock;
pub mod persist;
pub mod ranker;
pub mod routing;
pub mod selector;
pub mod usage;
