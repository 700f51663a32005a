// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod decision;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod prompt;
pub mod signal;
pub mod stream;
pub mod supervisor;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::WorkerConfig;
pub use crate::decision::{extract, Decision, Extraction};
pub use crate::health::{Dependency, HealthSnapshot, HealthTracker};
pub use crate::supervisor::{Dependencies, Supervisor, WorkerHandle};
