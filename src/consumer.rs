//! # Stream consumer
//! Sequential claim → classify → emit → acknowledge loop over one consumer
//! group, one item in flight at a time.
//!
//! Every fault is caught where it happens and written to the health tracker;
//! nothing escapes the loop. Claim failures back off exponentially forever.
//! A claimed item is always acknowledged once its processing has concluded,
//! including when classification failed, so a poison item cannot stall the
//! group. Redelivery after a failed ack is tolerated (at-least-once).

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::clock::{Sleeper, TokioSleeper};
use crate::config::WorkerConfig;
use crate::decision::{self, Extraction};
use crate::gateway::DynInference;
use crate::health::{Dependency, HealthTracker};
use crate::prompt::PromptTemplate;
use crate::signal::{EmitResult, SignalEmitter};
use crate::stream::{StreamItem, StreamStore};

/// Where the consumer is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Claiming,
    Classifying,
    Emitting,
    Acknowledging,
    BackingOff,
}

/// Names identifying the source stream and this consumer within its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub claim_block: Duration,
}

impl ConsumerSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            stream: config.stream.clone(),
            group: config.group.clone(),
            consumer: config.consumer.clone(),
            claim_block: config.claim_block,
        }
    }
}

/// What happened to one claimed item.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub id: String,
    /// `None` when classification failed.
    pub extraction: Option<Extraction>,
    pub emit: Option<EmitResult>,
    pub acknowledged: bool,
}

/// Result of one loop iteration.
#[derive(Debug, Clone)]
pub enum Tick {
    /// The claim timed out without an item.
    Idle,
    Processed(ItemOutcome),
    /// The claim failed; the caller should wait `delay` before the next one.
    ClaimFailed {
        delay: Duration,
        consecutive_failures: u32,
    },
}

pub struct StreamConsumer {
    settings: ConsumerSettings,
    streams: Arc<dyn StreamStore>,
    inference: DynInference,
    emitter: SignalEmitter,
    health: Arc<HealthTracker>,
    prompt: PromptTemplate,
    sleeper: Arc<dyn Sleeper>,
    backoff: Backoff,
    state: ConsumerState,
}

impl StreamConsumer {
    pub fn new(
        settings: ConsumerSettings,
        streams: Arc<dyn StreamStore>,
        inference: DynInference,
        emitter: SignalEmitter,
        health: Arc<HealthTracker>,
        prompt: PromptTemplate,
    ) -> Self {
        Self {
            settings,
            streams,
            inference,
            emitter,
            health,
            prompt,
            sleeper: Arc::new(TokioSleeper),
            backoff: Backoff::default(),
            state: ConsumerState::Idle,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// Shutdown is observed before each claim and while backing off; an item
    /// already claimed is always carried through its acknowledgment first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            stream = %self.settings.stream,
            group = %self.settings.group,
            consumer = %self.settings.consumer,
            "stream consumer started"
        );

        loop {
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            if let Tick::ClaimFailed { delay, .. } = self.tick().await {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                    _ = self.sleeper.sleep(delay) => {}
                }
                self.state = ConsumerState::Idle;
            }
        }

        self.state = ConsumerState::Idle;
        info!(consumer = %self.settings.consumer, "stream consumer stopped");
    }

    /// One iteration: a claim attempt and, if an item arrived, its full
    /// processing. Claim failures are recorded and return the backoff delay
    /// without sleeping.
    pub async fn tick(&mut self) -> Tick {
        self.state = ConsumerState::Claiming;
        let claimed = self
            .streams
            .claim(
                &self.settings.stream,
                &self.settings.group,
                &self.settings.consumer,
                self.settings.claim_block,
            )
            .await;

        match claimed {
            Ok(item) => {
                self.backoff.on_success();
                self.health.set_connected(Dependency::SourceStream, true);
                gauge!("strategy_backoff_delay_ms").set(0.0);
                match item {
                    Some(item) => Tick::Processed(self.process(item).await),
                    None => {
                        self.state = ConsumerState::Idle;
                        Tick::Idle
                    }
                }
            }
            Err(e) => {
                let delay = self.backoff.on_failure();
                let consecutive_failures = self.backoff.consecutive_failures();
                self.health.set_connected(Dependency::SourceStream, false);
                self.health
                    .record_error(format!("Error reading from stream: {e}"));
                error!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    consecutive_failures,
                    "stream claim failed, backing off"
                );
                counter!("strategy_claim_failures_total").increment(1);
                gauge!("strategy_backoff_delay_ms").set(delay.as_millis() as f64);
                self.state = ConsumerState::BackingOff;
                Tick::ClaimFailed {
                    delay,
                    consecutive_failures,
                }
            }
        }
    }

    async fn process(&mut self, item: StreamItem) -> ItemOutcome {
        let started = Instant::now();
        counter!("strategy_items_claimed_total").increment(1);
        info!(id = %item.id, title = item.title(), "processing item");

        self.state = ConsumerState::Classifying;
        let response = self.classify(&item).await;

        let (extraction, emit) = match response {
            Some(response) => {
                self.state = ConsumerState::Emitting;
                let extraction = decision::extract(&response);
                info!(
                    id = %item.id,
                    decision = %extraction.decision,
                    ticker = %extraction.ticker,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "item classified"
                );
                let emit = self.emitter.emit(&extraction, &item).await;
                self.health.record_processed();
                counter!("strategy_items_processed_total").increment(1);
                (Some(extraction), Some(emit))
            }
            None => {
                counter!("strategy_classify_failures_total").increment(1);
                (None, None)
            }
        };

        self.state = ConsumerState::Acknowledging;
        let acknowledged = self.acknowledge(&item.id).await;

        histogram!("strategy_item_duration_ms").record(started.elapsed().as_millis() as f64);
        self.state = ConsumerState::Idle;

        ItemOutcome {
            id: item.id,
            extraction,
            emit,
            acknowledged,
        }
    }

    /// Classification response, or `None` after recording the fault.
    async fn classify(&self, item: &StreamItem) -> Option<String> {
        let prompt = self.prompt.render(item);
        let failure = match self.inference.classify(&prompt).await {
            // whitespace-only text still reached the service; `extract` maps it to NoSignal
            Ok(response) if !response.is_empty() => {
                self.health
                    .set_connected(Dependency::InferenceService, true);
                return Some(response);
            }
            Ok(_) => "Empty response from inference service".to_string(),
            Err(e) => format!("Inference API error: {e}"),
        };

        error!(
            id = %item.id,
            provider = self.inference.provider_name(),
            error = %failure,
            "classification failed, acknowledging item without a signal"
        );
        self.health
            .set_connected(Dependency::InferenceService, false);
        self.health.record_error(failure);
        None
    }

    async fn acknowledge(&self, id: &str) -> bool {
        match self
            .streams
            .ack(&self.settings.stream, &self.settings.group, id)
            .await
        {
            Ok(()) => {
                debug!(id, "item acknowledged");
                true
            }
            Err(e) => {
                warn!(id, error = %e, "acknowledge failed, item may be redelivered");
                self.health
                    .record_error(format!("Failed to acknowledge message: {e}"));
                counter!("strategy_ack_failures_total").increment(1);
                false
            }
        }
    }
}
