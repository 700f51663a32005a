//! External HTTP collaborators behind one-method capability traits.
//!
//! Test doubles implement the traits directly.

pub mod centrifugo;
pub mod groq;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("remote error: {0}")]
    Remote(String),
    #[error("empty response")]
    EmptyResponse,
}

/// Text classifier (LLM chat completion).
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn classify(&self, prompt: &str) -> Result<String, GatewayError>;

    /// Cheapest call that proves credentials and reachability.
    async fn ping(&self) -> Result<(), GatewayError> {
        self.classify("Hello").await.map(|_| ())
    }

    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}

/// Real-time fan-out of signal payloads.
#[async_trait]
pub trait BroadcastClient: Send + Sync {
    async fn publish(&self, channel: &str, payload: &serde_json::Value) -> Result<(), GatewayError>;

    /// Health check; defaults to success for gateways without one.
    async fn check(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

pub type DynInference = Arc<dyn InferenceClient>;
pub type DynBroadcast = Arc<dyn BroadcastClient>;

/// A broadcast client bound to the channel signals are published on.
#[derive(Clone)]
pub struct BroadcastTarget {
    pub client: DynBroadcast,
    pub channel: String,
}

impl BroadcastTarget {
    pub fn new(client: DynBroadcast, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into(),
        }
    }
}

impl std::fmt::Debug for BroadcastTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastTarget")
            .field("channel", &self.channel)
            .finish()
    }
}
