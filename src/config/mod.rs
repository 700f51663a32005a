pub mod worker;

pub use worker::{BroadcastConfig, ConfigError, LogFormat, WorkerConfig};
