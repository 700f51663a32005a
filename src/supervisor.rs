//! # Supervisor
//! Startup order and lifetime of the consumer task.
//!
//! `start` bootstraps the consumer group, warms up each dependency to seed
//! the health tracker, then spawns the consumer loop (and, when a broadcast
//! gateway is configured, its periodic health check). `WorkerHandle::shutdown`
//! requests a cooperative stop and waits for both tasks to exit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::clock::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::config::WorkerConfig;
use crate::consumer::{ConsumerSettings, StreamConsumer};
use crate::gateway::{BroadcastTarget, DynInference};
use crate::health::{Dependency, HealthTracker};
use crate::prompt::PromptTemplate;
use crate::signal::SignalEmitter;
use crate::stream::{GroupBootstrap, StreamStore};

/// How often a configured broadcast gateway is re-checked.
pub const BROADCAST_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// External collaborators the worker runs against.
#[derive(Clone)]
pub struct Dependencies {
    pub streams: Arc<dyn StreamStore>,
    pub inference: DynInference,
    pub broadcast: Option<BroadcastTarget>,
    pub sleeper: Arc<dyn Sleeper>,
    pub clock: Arc<dyn Clock>,
}

impl Dependencies {
    /// Real timers and wall clock.
    pub fn new(
        streams: Arc<dyn StreamStore>,
        inference: DynInference,
        broadcast: Option<BroadcastTarget>,
    ) -> Self {
        Self {
            streams,
            inference,
            broadcast,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct Supervisor {
    settings: ConsumerSettings,
    signal_stream: String,
    backoff: Backoff,
    prompt: PromptTemplate,
    deps: Dependencies,
    health: Arc<HealthTracker>,
    broadcast_check_interval: Duration,
}

impl Supervisor {
    pub fn new(
        config: &WorkerConfig,
        prompt: PromptTemplate,
        deps: Dependencies,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            settings: ConsumerSettings::from_config(config),
            signal_stream: config.signal_stream.clone(),
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            prompt,
            deps,
            health,
            broadcast_check_interval: BROADCAST_CHECK_INTERVAL,
        }
    }

    pub fn with_broadcast_check_interval(mut self, every: Duration) -> Self {
        self.broadcast_check_interval = every.max(Duration::from_millis(1));
        self
    }

    /// Bootstrap, warm up, and spawn the consumer. Only a failed group
    /// bootstrap aborts startup.
    pub async fn start(self) -> Result<WorkerHandle> {
        let bootstrap = self.bootstrap_group().await?;
        info!(
            stream = %self.settings.stream,
            group = %self.settings.group,
            consumer = %self.settings.consumer,
            ?bootstrap,
            "starting strategy worker"
        );

        self.warm_up().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = self.deps.broadcast.clone().map(|target| {
            spawn_broadcast_monitor(
                target,
                self.health.clone(),
                self.broadcast_check_interval,
                shutdown_rx.clone(),
            )
        });

        let emitter = SignalEmitter::new(
            self.deps.streams.clone(),
            self.signal_stream,
            self.deps.broadcast.clone(),
            self.health.clone(),
        )
        .with_clock(self.deps.clock.clone());

        let consumer = StreamConsumer::new(
            self.settings,
            self.deps.streams,
            self.deps.inference,
            emitter,
            self.health,
            self.prompt,
        )
        .with_backoff(self.backoff)
        .with_sleeper(self.deps.sleeper);

        let consumer = tokio::spawn(consumer.run(shutdown_rx));

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            consumer,
            monitor,
        })
    }

    async fn bootstrap_group(&self) -> Result<GroupBootstrap> {
        match self
            .deps
            .streams
            .ensure_group(&self.settings.stream, &self.settings.group)
            .await
        {
            Ok(outcome) => {
                self.health.set_connected(Dependency::SourceStream, true);
                Ok(outcome)
            }
            Err(e) => {
                self.health.set_connected(Dependency::SourceStream, false);
                self.health
                    .record_error(format!("Consumer group bootstrap failed: {e}"));
                Err(e).with_context(|| {
                    format!(
                        "ensuring consumer group {} on stream {}",
                        self.settings.group, self.settings.stream
                    )
                })
            }
        }
    }

    /// Ping every dependency once and record the result. Never fails.
    pub async fn warm_up(&self) {
        match self.deps.streams.ping().await {
            Ok(()) => self.health.set_connected(Dependency::SourceStream, true),
            Err(e) => {
                warn!(error = %e, "source stream ping failed");
                self.health.set_connected(Dependency::SourceStream, false);
                self.health
                    .record_error(format!("Source stream ping failed: {e}"));
            }
        }

        info!(provider = self.deps.inference.provider_name(), "testing inference connectivity");
        match self.deps.inference.ping().await {
            Ok(()) => {
                info!("inference connectivity test successful");
                self.health.set_connected(Dependency::InferenceService, true);
            }
            Err(e) => {
                warn!(error = %e, "inference connectivity test failed");
                self.health.set_connected(Dependency::InferenceService, false);
                self.health
                    .record_error(format!("Inference connectivity test failed: {e}"));
            }
        }

        match &self.deps.broadcast {
            Some(target) => {
                let status = if check_broadcast(target, &self.health).await {
                    "healthy"
                } else {
                    "unhealthy"
                };
                info!(channel = %target.channel, status, "broadcast integration enabled");
            }
            None => info!("broadcast integration disabled"),
        }
    }
}

/// Run the gateway's health check and store the result.
pub async fn check_broadcast(target: &BroadcastTarget, health: &HealthTracker) -> bool {
    match target.client.check().await {
        Ok(()) => {
            health.set_connected(Dependency::BroadcastGateway, true);
            true
        }
        Err(e) => {
            warn!(error = %e, "broadcast gateway health check failed");
            health.set_connected(Dependency::BroadcastGateway, false);
            health.record_error(format!("Broadcast gateway health check failed: {e}"));
            false
        }
    }
}

fn spawn_broadcast_monitor(
    target: BroadcastTarget,
    health: Arc<HealthTracker>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // first tick fires immediately; warm-up already checked
        ticker.tick().await;
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    check_broadcast(&target, &health).await;
                }
            }
        }
    })
}

/// Running worker. Dropping it without `shutdown` stops the loop as well,
/// but nothing waits for it.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    consumer: JoinHandle<()>,
    monitor: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the tasks to stop without waiting.
    pub fn request_shutdown(&self) {
        // no receivers left means the tasks already exited
        let _ = self.shutdown.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.consumer.is_finished()
    }

    /// Stop cooperatively and wait for the consumer to finish its current item.
    pub async fn shutdown(self) -> Result<()> {
        self.request_shutdown();
        if let Some(monitor) = self.monitor {
            if let Err(e) = monitor.await {
                error!(error = %e, "broadcast monitor task failed");
            }
        }
        self.consumer
            .await
            .map_err(|e| anyhow!("consumer task failed: {e}"))?;
        info!("shutdown complete");
        Ok(())
    }
}
