// tests/common/mod.rs
//
// In-process doubles for the worker's capability traits. No Redis, no HTTP.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use strategy_worker::clock::{Clock, Sleeper};
use strategy_worker::config::WorkerConfig;
use strategy_worker::consumer::{ConsumerSettings, StreamConsumer};
use strategy_worker::gateway::{BroadcastClient, BroadcastTarget, GatewayError, InferenceClient};
use strategy_worker::health::HealthTracker;
use strategy_worker::prompt::PromptTemplate;
use strategy_worker::signal::SignalEmitter;
use strategy_worker::stream::{GroupBootstrap, StreamError, StreamItem, StreamStore};

pub const STREAM: &str = "reddit-events";
pub const GROUP: &str = "strategy";
pub const CONSUMER: &str = "worker-1";
pub const SIGNAL_STREAM: &str = "trade-signals";

pub fn item(id: &str, pairs: &[(&str, &str)]) -> StreamItem {
    StreamItem::new(
        id,
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    )
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StreamsState {
    pending: VecDeque<StreamItem>,
    claim_failures: u32,
    fail_append: bool,
    fail_ack: bool,
    fail_ping: bool,
    fail_group: bool,
    claims: u32,
    acks: Vec<(String, String, String)>,
    appended: Vec<(String, Vec<(String, String)>)>,
    groups: Vec<(String, String)>,
}

#[derive(Default)]
pub struct MemoryStreams {
    state: Mutex<StreamsState>,
}

impl MemoryStreams {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, item: StreamItem) {
        self.state.lock().pending.push_back(item);
    }

    /// The next `n` claims fail.
    pub fn fail_next_claims(&self, n: u32) {
        self.state.lock().claim_failures = n;
    }

    pub fn fail_appends(&self, on: bool) {
        self.state.lock().fail_append = on;
    }

    pub fn fail_acks(&self, on: bool) {
        self.state.lock().fail_ack = on;
    }

    pub fn fail_ping(&self, on: bool) {
        self.state.lock().fail_ping = on;
    }

    pub fn fail_group(&self, on: bool) {
        self.state.lock().fail_group = on;
    }

    pub fn acks(&self) -> Vec<(String, String, String)> {
        self.state.lock().acks.clone()
    }

    pub fn acked_ids(&self) -> Vec<String> {
        self.state.lock().acks.iter().map(|a| a.2.clone()).collect()
    }

    pub fn appended(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.state.lock().appended.clone()
    }

    /// Appended entries as maps, for field lookups.
    pub fn appended_maps(&self) -> Vec<BTreeMap<String, String>> {
        self.appended()
            .into_iter()
            .map(|(_, f)| f.into_iter().collect())
            .collect()
    }

    pub fn groups(&self) -> Vec<(String, String)> {
        self.state.lock().groups.clone()
    }

    pub fn claims(&self) -> u32 {
        self.state.lock().claims
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[async_trait]
impl StreamStore for MemoryStreams {
    async fn ping(&self) -> Result<(), StreamError> {
        if self.state.lock().fail_ping {
            return Err(StreamError::backend("connection refused"));
        }
        Ok(())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupBootstrap, StreamError> {
        let mut s = self.state.lock();
        if s.fail_group {
            return Err(StreamError::backend("connection refused"));
        }
        let key = (stream.to_string(), group.to_string());
        if s.groups.contains(&key) {
            return Ok(GroupBootstrap::AlreadyExists);
        }
        s.groups.push(key);
        Ok(GroupBootstrap::Created)
    }

    async fn claim(
        &self,
        _stream: &str,
        _group: &str,
        _consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamItem>, StreamError> {
        {
            let mut s = self.state.lock();
            s.claims += 1;
            if s.claim_failures > 0 {
                s.claim_failures -= 1;
                return Err(StreamError::backend("NOGROUP or connection reset"));
            }
            if let Some(item) = s.pending.pop_front() {
                return Ok(Some(item));
            }
        }
        // emulate a short block so an idle loop does not spin
        tokio::time::sleep(block.min(Duration::from_millis(5))).await;
        Ok(None)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut s = self.state.lock();
        if s.fail_ack {
            return Err(StreamError::backend("ack timed out"));
        }
        s.acks
            .push((stream.to_string(), group.to_string(), id.to_string()));
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StreamError> {
        let mut s = self.state.lock();
        if s.fail_append {
            return Err(StreamError::backend("OOM command not allowed"));
        }
        s.appended.push((stream.to_string(), fields.to_vec()));
        Ok(format!("{}-0", s.appended.len()))
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

pub struct ScriptedInference {
    script: Mutex<VecDeque<Result<String, String>>>,
    fallback: Result<String, String>,
    prompts: Mutex<Vec<String>>,
    ping_ok: bool,
}

impl ScriptedInference {
    /// Answers every prompt with `response`.
    pub fn always(response: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(response.to_string()),
            prompts: Mutex::new(Vec::new()),
            ping_ok: true,
        })
    }

    /// Fails every call, including the warm-up ping.
    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Err(message.to_string()),
            prompts: Mutex::new(Vec::new()),
            ping_ok: false,
        })
    }

    /// Answers in order, then falls back to `fallback`.
    pub fn scripted(answers: Vec<Result<&str, &str>>, fallback: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(
                answers
                    .into_iter()
                    .map(|a| a.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            fallback: Ok(fallback.to_string()),
            prompts: Mutex::new(Vec::new()),
            ping_ok: true,
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn classify(&self, prompt: &str) -> Result<String, GatewayError> {
        self.prompts.lock().push(prompt.to_string());
        let next = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next.map_err(GatewayError::Remote)
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        if self.ping_ok {
            Ok(())
        } else {
            Err(GatewayError::Status {
                status: 401,
                body: "invalid api key".to_string(),
            })
        }
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}

/// Parks every `classify` call until `release` is called.
pub struct GatedInference {
    response: String,
    entered: Notify,
    gate: Notify,
    calls: Mutex<u32>,
}

impl GatedInference {
    pub fn new(response: &str) -> Arc<Self> {
        Arc::new(Self {
            response: response.to_string(),
            entered: Notify::new(),
            gate: Notify::new(),
            calls: Mutex::new(0),
        })
    }

    /// Resolves once a `classify` call is parked at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl InferenceClient for GatedInference {
    async fn classify(&self, _prompt: &str) -> Result<String, GatewayError> {
        *self.calls.lock() += 1;
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(self.response.clone())
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "gated"
    }
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingBroadcast {
    fail_publish: Mutex<bool>,
    fail_check: Mutex<bool>,
    published: Mutex<Vec<(String, serde_json::Value)>>,
    checks: Mutex<u32>,
}

impl RecordingBroadcast {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_publish(&self, on: bool) {
        *self.fail_publish.lock() = on;
    }

    pub fn fail_check(&self, on: bool) {
        *self.fail_check.lock() = on;
    }

    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.published.lock().len()
    }

    pub fn checks(&self) -> u32 {
        *self.checks.lock()
    }
}

#[async_trait]
impl BroadcastClient for RecordingBroadcast {
    async fn publish(&self, channel: &str, payload: &serde_json::Value) -> Result<(), GatewayError> {
        // every attempt is recorded, failed or not
        self.published
            .lock()
            .push((channel.to_string(), payload.clone()));
        if *self.fail_publish.lock() {
            return Err(GatewayError::Status {
                status: 503,
                body: "centrifugo unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn check(&self) -> Result<(), GatewayError> {
        *self.checks.lock() += 1;
        if *self.fail_check.lock() {
            return Err(GatewayError::Remote("info failed".to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Records requested delays and returns at once.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().push(delay);
        tokio::task::yield_now().await;
    }
}

pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(
            Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap(),
        )))
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.0.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn settings() -> ConsumerSettings {
    ConsumerSettings {
        stream: STREAM.to_string(),
        group: GROUP.to_string(),
        consumer: CONSUMER.to_string(),
        claim_block: Duration::from_millis(5),
    }
}

pub fn config(broadcast: bool) -> WorkerConfig {
    let env = |k: &str| -> Option<String> {
        let v = match k {
            "GROQ_MODEL_NAME" => "test-model",
            "GROQ_API_KEY" => "gsk_test",
            "STREAM" => STREAM,
            "GROUP" => GROUP,
            "CONSUMER" => CONSUMER,
            "SIGNAL_STREAM" => SIGNAL_STREAM,
            "PROMPT_FILE" => "prompt.txt",
            "BACKOFF_BASE_MS" => "100",
            "BACKOFF_MAX_MS" => "1600",
            "CENTRIFUGO_API_URL" if broadcast => "http://centrifugo/api",
            "CENTRIFUGO_API_KEY" if broadcast => "key",
            _ => return None,
        };
        Some(v.to_string())
    };
    WorkerConfig::from_lookup(env).expect("test config is valid")
}

pub struct Rig {
    pub streams: Arc<MemoryStreams>,
    pub inference: Arc<ScriptedInference>,
    /// What the consumer classifies with; `inference` unless overridden.
    pub classifier: Arc<dyn InferenceClient>,
    pub broadcast: Option<Arc<RecordingBroadcast>>,
    pub health: Arc<HealthTracker>,
    pub sleeper: Arc<RecordingSleeper>,
}

impl Rig {
    pub fn new(inference: Arc<ScriptedInference>, broadcast: bool) -> Self {
        Self {
            streams: MemoryStreams::new(),
            classifier: inference.clone(),
            inference,
            broadcast: broadcast.then(RecordingBroadcast::new),
            health: Arc::new(HealthTracker::new(broadcast)),
            sleeper: RecordingSleeper::new(),
        }
    }

    /// Classify with `classifier` instead of the scripted double.
    pub fn with_classifier(mut self, classifier: Arc<dyn InferenceClient>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn target(&self) -> Option<BroadcastTarget> {
        self.broadcast
            .as_ref()
            .map(|b| BroadcastTarget::new(b.clone(), "trade-signals"))
    }

    pub fn emitter(&self) -> SignalEmitter {
        SignalEmitter::new(
            self.streams.clone(),
            SIGNAL_STREAM,
            self.target(),
            self.health.clone(),
        )
    }

    pub fn consumer(&self) -> StreamConsumer {
        StreamConsumer::new(
            settings(),
            self.streams.clone(),
            self.classifier.clone(),
            self.emitter(),
            self.health.clone(),
            PromptTemplate::new("Decide: 0 = none, 1 = buy, 2 = sell"),
        )
        .with_sleeper(self.sleeper.clone())
    }
}
