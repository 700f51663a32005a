//! # Signal emission
//! Turns buy/sell decisions into signal events and delivers them to the
//! derived stream and, when configured, the broadcast gateway.
//!
//! The two sinks are independent: each gets exactly one attempt per signal,
//! and a failure in one is recorded without touching the other. No retries
//! happen here; redelivery of the whole item is the only replay path.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::{error, info};

use crate::clock::{Clock, SystemClock};
use crate::decision::{Decision, Extraction};
use crate::gateway::BroadcastTarget;
use crate::health::{Dependency, HealthTracker};
use crate::stream::{StreamItem, StreamStore, ITEM_FIELDS};

/// A buy/sell signal derived from one source item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalEvent {
    pub decision: Decision,
    pub ticker: String,
    pub rationale: String,
    pub source_id: String,
    pub generated_at: DateTime<Utc>,
    /// Copy of the originating item's post fields, absent ones as "".
    pub post: Vec<(String, String)>,
}

impl SignalEvent {
    /// `None` for `NoSignal`: only buy/sell decisions become events.
    pub fn from_decision(
        extraction: &Extraction,
        item: &StreamItem,
        generated_at: DateTime<Utc>,
    ) -> Option<Self> {
        if !extraction.decision.is_signal() {
            return None;
        }
        let post = ITEM_FIELDS
            .iter()
            .map(|name| ((*name).to_string(), item.field(name).to_string()))
            .collect();
        Some(Self {
            decision: extraction.decision,
            ticker: extraction.ticker.clone(),
            rationale: extraction.rationale.clone(),
            source_id: item.id.clone(),
            generated_at,
            post,
        })
    }

    /// Derived-stream entry fields, in a stable order.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("decision".to_string(), self.decision.as_str().to_string()),
            ("ticker".to_string(), self.ticker.clone()),
            ("analysis".to_string(), self.rationale.clone()),
            ("src".to_string(), self.source_id.clone()),
            (
                "time".to_string(),
                self.generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        ];
        fields.extend(
            self.post
                .iter()
                .map(|(k, v)| (format!("post_{k}"), v.clone())),
        );
        fields
    }

    /// Broadcast payload: the same fields as a flat JSON object.
    pub fn to_payload(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Result of one delivery attempt to one sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Derived stream: the assigned entry id. Broadcast: empty.
    Delivered(String),
    Failed(String),
    NotConfigured,
}

impl SinkOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SinkOutcome::Delivered(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitResult {
    /// `NoSignal`: nothing was written anywhere.
    Skipped,
    Emitted {
        event: SignalEvent,
        stream: SinkOutcome,
        broadcast: SinkOutcome,
    },
}

pub struct SignalEmitter {
    streams: Arc<dyn StreamStore>,
    signal_stream: String,
    broadcast: Option<BroadcastTarget>,
    health: Arc<HealthTracker>,
    clock: Arc<dyn Clock>,
}

impl SignalEmitter {
    pub fn new(
        streams: Arc<dyn StreamStore>,
        signal_stream: impl Into<String>,
        broadcast: Option<BroadcastTarget>,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            streams,
            signal_stream: signal_stream.into(),
            broadcast,
            health,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn emit(&self, extraction: &Extraction, item: &StreamItem) -> EmitResult {
        let Some(event) = SignalEvent::from_decision(extraction, item, self.clock.now()) else {
            return EmitResult::Skipped;
        };

        let stream = self.append(&event).await;
        let broadcast = self.publish(&event).await;

        counter!("strategy_signals_emitted_total", "decision" => event.decision.as_str())
            .increment(1);

        EmitResult::Emitted {
            event,
            stream,
            broadcast,
        }
    }

    async fn append(&self, event: &SignalEvent) -> SinkOutcome {
        match self
            .streams
            .append(&self.signal_stream, &event.to_fields())
            .await
        {
            Ok(id) => {
                info!(
                    decision = %event.decision,
                    ticker = %event.ticker,
                    entry = %id,
                    "signal pushed to stream"
                );
                SinkOutcome::Delivered(id)
            }
            Err(e) => {
                let msg = format!("Failed to add signal to stream: {e}");
                error!(decision = %event.decision, ticker = %event.ticker, error = %e, "signal append failed");
                self.health.record_error(msg.clone());
                counter!("strategy_sink_failures_total", "sink" => "stream").increment(1);
                SinkOutcome::Failed(msg)
            }
        }
    }

    async fn publish(&self, event: &SignalEvent) -> SinkOutcome {
        let Some(target) = &self.broadcast else {
            return SinkOutcome::NotConfigured;
        };
        match target
            .client
            .publish(&target.channel, &event.to_payload())
            .await
        {
            Ok(()) => {
                self.health.set_connected(Dependency::BroadcastGateway, true);
                info!(
                    decision = %event.decision,
                    ticker = %event.ticker,
                    channel = %target.channel,
                    "signal broadcast"
                );
                SinkOutcome::Delivered(String::new())
            }
            Err(e) => {
                self.health.set_connected(Dependency::BroadcastGateway, false);
                let msg = format!(
                    "Failed to publish {} on {} to broadcast gateway: {e}",
                    event.decision, event.ticker
                );
                error!(decision = %event.decision, ticker = %event.ticker, error = %e, "broadcast failed");
                self.health.record_error(msg.clone());
                counter!("strategy_sink_failures_total", "sink" => "broadcast").increment(1);
                SinkOutcome::Failed(msg)
            }
        }
    }
}
