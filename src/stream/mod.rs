//! Append-only log streams: the source of posts and the sink for signals.
//!
//! The consumer and the emitter only see [`StreamStore`]; [`redis::RedisStreams`]
//! is the production backend.

pub mod redis;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Post fields the pipeline reads and mirrors into signal events.
pub const ITEM_FIELDS: [&str; 6] = ["title", "body", "url", "author", "subreddit", "created"];

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("stream backend: {0}")]
    Backend(String),
}

impl StreamError {
    pub fn backend(msg: impl Into<String>) -> Self {
        StreamError::Backend(msg.into())
    }
}

/// Outcome of making sure the consumer group exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBootstrap {
    Created,
    AlreadyExists,
    /// The stream was missing; a placeholder entry was appended first.
    CreatedWithStream,
}

/// One entry claimed from the source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamItem {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

impl StreamItem {
    pub fn new(id: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Field value, or "" when absent.
    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn title(&self) -> &str {
        self.field("title")
    }

    pub fn body(&self) -> &str {
        self.field("body")
    }
}

/// Consumer-group access to the source stream plus appends to the derived one.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Connectivity check.
    async fn ping(&self) -> Result<(), StreamError>;

    /// Create `group` on `stream`, creating the stream if needed.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupBootstrap, StreamError>;

    /// Claim at most one never-delivered entry, waiting up to `block`.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamItem>, StreamError>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError>;

    /// Append one entry; returns the id the stream assigned.
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StreamError>;
}
