//! # Dependency health
//! Shared record of dependency connectivity, throughput and recent errors.
//!
//! Every pipeline stage writes here; the probe server only reads. All fields
//! live behind one mutex so a reader always sees a single consistent view:
//! `snapshot()` computes liveness, readiness and health from the same guard
//! it copies the fields from.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::{Clock, SystemClock};

/// Most recent errors kept for the status route.
pub const ERROR_RING_CAPACITY: usize = 100;

/// Readiness without a processed item for longer than this is unhealthy.
pub const DEFAULT_RECENCY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// External dependencies whose connectivity gates readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    SourceStream,
    InferenceService,
    BroadcastGateway,
}

impl Dependency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::SourceStream => "source_stream",
            Dependency::InferenceService => "inference_service",
            Dependency::BroadcastGateway => "broadcast_gateway",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Point-in-time copy of the tracker, with the composite flags computed
/// from the same view.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub started_at: DateTime<Utc>,
    pub taken_at: DateTime<Utc>,
    pub source_stream: bool,
    pub inference_service: bool,
    pub broadcast_gateway: bool,
    pub broadcast_configured: bool,
    pub processed_count: u64,
    pub last_processed: Option<DateTime<Utc>>,
    pub recent_activity: bool,
    pub errors: Vec<ErrorRecord>,
    pub live: bool,
    pub ready: bool,
    pub healthy: bool,
}

impl HealthSnapshot {
    /// The last `n` errors, oldest first.
    pub fn recent_errors(&self, n: usize) -> &[ErrorRecord] {
        let start = self.errors.len().saturating_sub(n);
        &self.errors[start..]
    }

    pub fn uptime(&self) -> chrono::Duration {
        self.taken_at.signed_duration_since(self.started_at)
    }
}

#[derive(Debug, Default)]
struct HealthState {
    source_stream: bool,
    inference_service: bool,
    broadcast_gateway: bool,
    processed_count: u64,
    last_processed: Option<DateTime<Utc>>,
    errors: VecDeque<ErrorRecord>,
}

pub struct HealthTracker {
    inner: Mutex<HealthState>,
    broadcast_configured: bool,
    error_capacity: usize,
    recency_window: chrono::Duration,
    started_at: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTracker")
            .field("broadcast_configured", &self.broadcast_configured)
            .field("error_capacity", &self.error_capacity)
            .field("clock", &self.clock.name())
            .finish()
    }
}

impl HealthTracker {
    /// Tracker on the system clock. `broadcast_configured` decides whether
    /// the broadcast flag takes part in readiness.
    pub fn new(broadcast_configured: bool) -> Self {
        Self::with_clock(broadcast_configured, Arc::new(SystemClock))
    }

    pub fn with_clock(broadcast_configured: bool, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            inner: Mutex::new(HealthState::default()),
            broadcast_configured,
            error_capacity: ERROR_RING_CAPACITY,
            recency_window: to_chrono(DEFAULT_RECENCY_WINDOW),
            started_at,
            clock,
        }
    }

    pub fn with_recency_window(mut self, window: Duration) -> Self {
        self.recency_window = to_chrono(window);
        self
    }

    /// Ring size for error records; 0 is treated as 1.
    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity.max(1);
        self
    }

    pub fn broadcast_configured(&self) -> bool {
        self.broadcast_configured
    }

    pub fn set_connected(&self, dependency: Dependency, connected: bool) {
        let mut state = self.inner.lock();
        match dependency {
            Dependency::SourceStream => state.source_stream = connected,
            Dependency::InferenceService => state.inference_service = connected,
            Dependency::BroadcastGateway => state.broadcast_gateway = connected,
        }
    }

    /// Count one processed item and stamp the time.
    pub fn record_processed(&self) {
        let now = self.clock.now();
        let mut state = self.inner.lock();
        state.processed_count = state.processed_count.saturating_add(1);
        state.last_processed = Some(now);
    }

    /// Append an error; the oldest record is evicted once the ring is full.
    pub fn record_error(&self, message: impl Into<String>) {
        let record = ErrorRecord {
            timestamp: self.clock.now(),
            message: message.into(),
        };
        let mut state = self.inner.lock();
        state.errors.push_back(record);
        while state.errors.len() > self.error_capacity {
            state.errors.pop_front();
        }
    }

    /// Process existence only; dependency state never affects it.
    pub fn is_live(&self) -> bool {
        true
    }

    pub fn is_ready(&self) -> bool {
        let state = self.inner.lock();
        self.ready_in(&state)
    }

    pub fn is_healthy(&self) -> bool {
        let now = self.clock.now();
        let state = self.inner.lock();
        self.ready_in(&state) && self.recent_in(&state, now)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let now = self.clock.now();
        let state = self.inner.lock();
        let ready = self.ready_in(&state);
        let recent_activity = self.recent_in(&state, now);
        HealthSnapshot {
            started_at: self.started_at,
            taken_at: now,
            source_stream: state.source_stream,
            inference_service: state.inference_service,
            broadcast_gateway: state.broadcast_gateway,
            broadcast_configured: self.broadcast_configured,
            processed_count: state.processed_count,
            last_processed: state.last_processed,
            recent_activity,
            errors: state.errors.iter().cloned().collect(),
            live: true,
            ready,
            healthy: ready && recent_activity,
        }
    }

    fn ready_in(&self, state: &HealthState) -> bool {
        let broadcast_ok = !self.broadcast_configured || state.broadcast_gateway;
        state.source_stream && state.inference_service && broadcast_ok
    }

    fn recent_in(&self, state: &HealthState, now: DateTime<Utc>) -> bool {
        state
            .last_processed
            .is_some_and(|ts| now.signed_duration_since(ts) <= self.recency_window)
    }
}

fn to_chrono(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        fn at(ts: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(ts)))
        }
        fn advance(&self, by: chrono::Duration) {
            let mut g = self.0.lock();
            *g += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap()
    }

    fn connect_required(h: &HealthTracker) {
        h.set_connected(Dependency::SourceStream, true);
        h.set_connected(Dependency::InferenceService, true);
    }

    #[test]
    fn live_regardless_of_dependencies() {
        let h = HealthTracker::new(true);
        assert!(h.is_live());
        assert!(!h.is_ready());
        assert!(h.snapshot().live);
    }

    #[test]
    fn ready_requires_every_required_flag() {
        let h = HealthTracker::new(false);
        assert!(!h.is_ready());
        h.set_connected(Dependency::SourceStream, true);
        assert!(!h.is_ready());
        h.set_connected(Dependency::InferenceService, true);
        assert!(h.is_ready());
        h.set_connected(Dependency::SourceStream, false);
        assert!(!h.is_ready());
    }

    #[test]
    fn unconfigured_broadcast_never_affects_readiness() {
        let h = HealthTracker::new(false);
        connect_required(&h);
        h.set_connected(Dependency::BroadcastGateway, false);
        assert!(h.is_ready());
        h.set_connected(Dependency::BroadcastGateway, true);
        assert!(h.is_ready());
    }

    #[test]
    fn configured_broadcast_gates_readiness() {
        let h = HealthTracker::new(true);
        connect_required(&h);
        assert!(!h.is_ready());
        h.set_connected(Dependency::BroadcastGateway, true);
        assert!(h.is_ready());
    }

    #[test]
    fn healthy_needs_recent_processing() {
        let clock = FixedClock::at(t0());
        let h = HealthTracker::with_clock(false, clock.clone());
        connect_required(&h);
        assert!(h.is_ready());
        assert!(!h.is_healthy(), "nothing processed yet");

        h.record_processed();
        assert!(h.is_healthy());

        clock.advance(chrono::Duration::minutes(5));
        assert!(h.is_healthy(), "window is inclusive");

        clock.advance(chrono::Duration::seconds(1));
        assert!(!h.is_healthy());
        assert!(h.is_ready(), "staleness only affects health");
    }

    #[test]
    fn custom_recency_window() {
        let clock = FixedClock::at(t0());
        let h = HealthTracker::with_clock(false, clock.clone())
            .with_recency_window(Duration::from_secs(10));
        connect_required(&h);
        h.record_processed();
        clock.advance(chrono::Duration::seconds(11));
        assert!(!h.is_healthy());
    }

    #[test]
    fn counter_grows_and_stamps_time() {
        let clock = FixedClock::at(t0());
        let h = HealthTracker::with_clock(false, clock.clone());
        h.record_processed();
        clock.advance(chrono::Duration::seconds(30));
        h.record_processed();
        let snap = h.snapshot();
        assert_eq!(snap.processed_count, 2);
        assert_eq!(snap.last_processed, Some(t0() + chrono::Duration::seconds(30)));
        assert_eq!(snap.uptime(), chrono::Duration::seconds(30));
    }

    #[test]
    fn error_ring_evicts_oldest() {
        let h = HealthTracker::new(false).with_error_capacity(3);
        for i in 0..5 {
            h.record_error(format!("e{i}"));
        }
        let snap = h.snapshot();
        let msgs: Vec<_> = snap.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(msgs, vec!["e2", "e3", "e4"]);
        assert_eq!(snap.recent_errors(2).len(), 2);
        assert_eq!(snap.recent_errors(2)[1].message, "e4");
        assert_eq!(snap.recent_errors(10).len(), 3);
    }

    #[test]
    fn default_ring_is_bounded() {
        let h = HealthTracker::new(false);
        for i in 0..(ERROR_RING_CAPACITY + 20) {
            h.record_error(format!("e{i}"));
        }
        let snap = h.snapshot();
        assert_eq!(snap.errors.len(), ERROR_RING_CAPACITY);
        assert_eq!(snap.errors[0].message, "e20");
    }

    #[test]
    fn concurrent_writers_never_tear_the_view() {
        let h = Arc::new(HealthTracker::new(false));
        let mut joins = Vec::new();
        for _ in 0..4 {
            let h = h.clone();
            joins.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    h.set_connected(Dependency::SourceStream, true);
                    h.set_connected(Dependency::InferenceService, true);
                    h.record_processed();
                }
            }));
        }
        for _ in 0..200 {
            let snap = h.snapshot();
            assert_eq!(
                snap.ready,
                snap.source_stream && snap.inference_service,
                "composite flag must match the copied fields"
            );
        }
        for j in joins {
            j.join().unwrap();
        }
        assert_eq!(h.snapshot().processed_count, 2000);
    }
}
