//! Per-provider and per-(vendor, provider-type) circuit breakers.
//!
//! Two breakers act in series ahead of every upstream call: a fine-grained
//! per-provider breaker with a closed/open/half-open state machine, and a
//! coarser per-(vendor, provider-type) breaker used for vendor-wide
//! blackouts and admin "manual open". Both are gated purely on classified
//! failures recorded by the forwarder; neither performs I/O itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tokio::time::Instant;

use tollgate_common::BreakerConfig;

use crate::events::{CircuitBreakerAlertEvent, Event, EventHub, OperationalEvent};

/// The three states from DESIGN §4.2. `Closed` and `HalfOpen` both admit
/// traffic; only `Open` rejects without I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct ProviderBreakerEntry {
    state: CircuitState,
    failure_count: u32,
    half_open_success_count: u32,
    open_until: Option<Instant>,
    last_failure_at: Option<Instant>,
}

impl Default for ProviderBreakerEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_success_count: 0,
            open_until: None,
            last_failure_at: None,
        }
    }
}

/// Snapshot returned to admin/debug callers; mirrors the persisted
/// `CircuitBreakerState` row.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_success_count: u32,
    pub open_until: Option<SystemTime>,
}

/// Per-provider breaker registry. Keyed by an opaque string id (the logical
/// provider/credential id), so the same type serves both the provider-level
/// and the vendor-type-level breaker with different key shapes.
pub struct ProviderBreakerStore {
    entries: RwLock<HashMap<String, ProviderBreakerEntry>>,
    events: EventHub,
}

/// Outcome of a gate check: whether the call may proceed, and if not, when
/// it is expected to become eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Admit,
    Reject,
}

impl ProviderBreakerStore {
    pub fn new(events: EventHub) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Returns whether a call to `key` may proceed right now, performing the
    /// Open -> HalfOpen transition if the open duration has elapsed.
    pub async fn gate(&self, key: &str) -> GateDecision {
        let mut guard = self.entries.write().await;
        let entry = guard.entry(key.to_string()).or_default();
        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => GateDecision::Admit,
            CircuitState::Open => {
                let now = Instant::now();
                if entry.open_until.is_some_and(|until| now >= until) {
                    entry.state = CircuitState::HalfOpen;
                    entry.half_open_success_count = 0;
                    GateDecision::Admit
                } else {
                    GateDecision::Reject
                }
            }
        }
    }

    /// Records a success. In `Closed`, a lone success resets a non-zero
    /// failure counter. In `HalfOpen`, accumulates towards the threshold and
    /// transitions to `Closed` once reached.
    pub async fn record_success(&self, key: &str, config: &BreakerConfig) {
        let mut guard = self.entries.write().await;
        let entry = guard.entry(key.to_string()).or_default();
        match entry.state {
            CircuitState::Closed => {
                entry.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                entry.half_open_success_count += 1;
                if entry.half_open_success_count >= config.half_open_success_threshold {
                    entry.state = CircuitState::Closed;
                    entry.failure_count = 0;
                    entry.half_open_success_count = 0;
                    entry.open_until = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a classified, breaker-countable failure. Disabled breakers
    /// (`failure_threshold == 0`) never trip.
    pub async fn record_failure(&self, key: &str, config: &BreakerConfig) {
        if config.failure_threshold == 0 {
            return;
        }
        let now = Instant::now();
        let mut alert = None;
        {
            let mut guard = self.entries.write().await;
            let entry = guard.entry(key.to_string()).or_default();
            entry.last_failure_at = Some(now);
            match entry.state {
                CircuitState::Closed => {
                    entry.failure_count += 1;
                    if entry.failure_count >= config.failure_threshold {
                        let until = now + Duration::from_millis(config.open_duration_ms);
                        entry.state = CircuitState::Open;
                        entry.open_until = Some(until);
                        alert = Some((entry.failure_count, until));
                    }
                }
                CircuitState::HalfOpen => {
                    let until = now + Duration::from_millis(config.open_duration_ms);
                    entry.state = CircuitState::Open;
                    entry.open_until = Some(until);
                    entry.half_open_success_count = 0;
                    alert = Some((entry.failure_count.max(config.failure_threshold), until));
                }
                CircuitState::Open => {}
            }
        }
        if let Some((failure_count, until)) = alert {
            let open_until_wall = SystemTime::now()
                + until.saturating_duration_since(now);
            self.events
                .emit(Event::Operational(OperationalEvent::CircuitBreakerAlert(
                    CircuitBreakerAlertEvent {
                        at: SystemTime::now(),
                        scope: key.to_string(),
                        failure_count,
                        open_until: open_until_wall,
                    },
                )))
                .await;
        }
    }

    /// Admin reset: clears counters and state entirely (equivalent to a
    /// distributed-KV delete of `circuit:provider:{id}`).
    pub async fn reset(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Admin "smart probe": trip a provider directly from Open to HalfOpen.
    pub async fn force_half_open(&self, key: &str) {
        let mut guard = self.entries.write().await;
        let entry = guard.entry(key.to_string()).or_default();
        entry.state = CircuitState::HalfOpen;
        entry.half_open_success_count = 0;
        entry.open_until = None;
    }

    /// Admin manual open, used for the coarser vendor-type breaker.
    /// `duration = None` means open indefinitely until manually closed.
    pub async fn force_open(&self, key: &str, duration: Option<Duration>) {
        let mut guard = self.entries.write().await;
        let entry = guard.entry(key.to_string()).or_default();
        entry.state = CircuitState::Open;
        entry.open_until = duration.map(|d| Instant::now() + d);
        entry.failure_count = entry.failure_count.max(1);
    }

    pub async fn force_close(&self, key: &str) {
        let mut guard = self.entries.write().await;
        guard.remove(key);
    }

    pub async fn snapshot(&self, key: &str) -> BreakerSnapshot {
        let now = Instant::now();
        let guard = self.entries.read().await;
        match guard.get(key) {
            Some(entry) => BreakerSnapshot {
                state: entry.state,
                failure_count: entry.failure_count,
                half_open_success_count: entry.half_open_success_count,
                open_until: entry
                    .open_until
                    .map(|until| SystemTime::now() + until.saturating_duration_since(now)),
            },
            None => BreakerSnapshot {
                state: CircuitState::Closed,
                failure_count: 0,
                half_open_success_count: 0,
                open_until: None,
            },
        }
    }

    /// `true` if the KV-reconciled state for `key` is currently Open.
    /// On a distributed-KV read miss for an in-memory open/half-open entry
    /// the caller is expected to treat the state as Closed (KV is the
    /// source of truth); this in-process store is the fallback when no KV
    /// is configured.
    pub async fn is_open(&self, key: &str) -> bool {
        let guard = self.entries.read().await;
        match guard.get(key) {
            Some(entry) => entry.state == CircuitState::Open,
            None => false,
        }
    }
}

pub type SharedBreakerStore = Arc<ProviderBreakerStore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            open_duration_ms: 50,
            half_open_success_threshold: 2,
            max_retry_attempts: 2,
        }
    }

    #[tokio::test]
    async fn trips_open_after_threshold_consecutive_failures() {
        let store = ProviderBreakerStore::new(EventHub::new(8));
        let config = cfg(3);
        for _ in 0..2 {
            store.record_failure("p1", &config).await;
        }
        assert_eq!(store.gate("p1").await, GateDecision::Admit);
        store.record_failure("p1", &config).await;
        assert!(store.is_open("p1").await);
        assert_eq!(store.gate("p1").await, GateDecision::Reject);
    }

    #[tokio::test]
    async fn zero_threshold_disables_breaker() {
        let store = ProviderBreakerStore::new(EventHub::new(8));
        let config = cfg(0);
        for _ in 0..100 {
            store.record_failure("p1", &config).await;
        }
        assert!(!store.is_open("p1").await);
        assert_eq!(store.gate("p1").await, GateDecision::Admit);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold_and_reopens_on_failure() {
        let store = ProviderBreakerStore::new(EventHub::new(8));
        let config = cfg(1);
        store.record_failure("p1", &config).await;
        assert!(store.is_open("p1").await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.gate("p1").await, GateDecision::Admit);

        store.record_success("p1", &config).await;
        assert!(!store.is_open("p1").await);
        store.record_success("p1", &config).await;
        assert!(!store.is_open("p1").await);

        // Any failure while half-open reopens immediately.
        store.record_failure("p1", &config).await;
        assert!(store.is_open("p1").await);
    }

    #[tokio::test]
    async fn lone_success_resets_failure_count_without_tripping() {
        let store = ProviderBreakerStore::new(EventHub::new(8));
        let config = cfg(3);
        store.record_failure("p1", &config).await;
        store.record_success("p1", &config).await;
        store.record_failure("p1", &config).await;
        store.record_failure("p1", &config).await;
        // Two consecutive failures post-reset; threshold 3 not yet reached.
        assert!(!store.is_open("p1").await);
    }

    #[tokio::test]
    async fn admin_reset_clears_state() {
        let store = ProviderBreakerStore::new(EventHub::new(8));
        let config = cfg(1);
        store.record_failure("p1", &config).await;
        assert!(store.is_open("p1").await);
        store.reset("p1").await;
        assert!(!store.is_open("p1").await);
        let snap = store.snapshot("p1").await;
        assert_eq!(snap.failure_count, 0);
    }

    #[tokio::test]
    async fn force_half_open_smart_probe() {
        let store = ProviderBreakerStore::new(EventHub::new(8));
        let config = cfg(1);
        store.record_failure("p1", &config).await;
        assert!(store.is_open("p1").await);
        store.force_half_open("p1").await;
        assert_eq!(store.gate("p1").await, GateDecision::Admit);
        store.record_success("p1", &config).await;
        store.record_success("p1", &config).await;
        assert!(!store.is_open("p1").await);
    }
}
