use serde::{Deserialize, Serialize};

pub mod model;
pub use model::{
    BreakerConfig, CodexInstructionsStrategy, DailyResetMode, EndpointConfig,
    EndpointProbeSnapshot, KeySettings, ProviderType, QuotaLimits, QuotaWindow, SelectionConfig,
    TimeoutConfig, UserRole, UserSettings,
};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (not plaintext).
    pub admin_key_hash: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Whether to redact sensitive fields in emitted events.
    pub event_redact_sensitive: bool,
    /// IANA timezone used for fixed-window quota boundaries.
    pub tz: String,
    /// Session TTL in seconds; must be > 0.
    pub session_ttl_secs: u64,
    /// Disables HTTP/2 upstream entirely if false.
    pub enable_http2: bool,
    /// Distributed KV connection for circuit-breaker/session/cost-window stores.
    pub redis_url: Option<String>,
    pub db_pool_max: u32,
    pub db_pool_idle_timeout_secs: u64,
    pub db_pool_connect_timeout_secs: u64,
    pub endpoint_probe_interval_ms: u64,
    pub endpoint_probe_concurrency: u32,
    pub endpoint_probe_timeout_ms: u64,
    pub endpoint_probe_lock_ttl_ms: u64,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub proxy: Option<String>,
    pub dsn: Option<String>,
    pub event_redact_sensitive: Option<bool>,
    pub tz: Option<String>,
    pub session_ttl_secs: Option<u64>,
    pub enable_http2: Option<bool>,
    pub redis_url: Option<String>,
    pub db_pool_max: Option<u32>,
    pub db_pool_idle_timeout_secs: Option<u64>,
    pub db_pool_connect_timeout_secs: Option<u64>,
    pub endpoint_probe_interval_ms: Option<u64>,
    pub endpoint_probe_concurrency: Option<u32>,
    pub endpoint_probe_timeout_ms: Option<u64>,
    pub endpoint_probe_lock_ttl_ms: Option<u64>,
}

macro_rules! overlay_field {
    ($self:ident, $other:ident, $field:ident) => {
        if $other.$field.is_some() {
            $self.$field = $other.$field;
        }
    };
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        overlay_field!(self, other, host);
        overlay_field!(self, other, port);
        overlay_field!(self, other, admin_key_hash);
        overlay_field!(self, other, proxy);
        overlay_field!(self, other, dsn);
        overlay_field!(self, other, event_redact_sensitive);
        overlay_field!(self, other, tz);
        overlay_field!(self, other, session_ttl_secs);
        overlay_field!(self, other, enable_http2);
        overlay_field!(self, other, redis_url);
        overlay_field!(self, other, db_pool_max);
        overlay_field!(self, other, db_pool_idle_timeout_secs);
        overlay_field!(self, other, db_pool_connect_timeout_secs);
        overlay_field!(self, other, endpoint_probe_interval_ms);
        overlay_field!(self, other, endpoint_probe_concurrency);
        overlay_field!(self, other, endpoint_probe_timeout_ms);
        overlay_field!(self, other, endpoint_probe_lock_ttl_ms);
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let session_ttl_secs = self.session_ttl_secs.unwrap_or(300);
        if session_ttl_secs == 0 {
            return Err(GlobalConfigError::MissingField("session_ttl_secs"));
        }
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GlobalConfigError::MissingField("admin_key_hash"))?,
            proxy: self.proxy,
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
            tz: self.tz.unwrap_or_else(|| "UTC".to_string()),
            session_ttl_secs,
            enable_http2: self.enable_http2.unwrap_or(true),
            redis_url: self.redis_url,
            db_pool_max: self.db_pool_max.unwrap_or(20),
            db_pool_idle_timeout_secs: self.db_pool_idle_timeout_secs.unwrap_or(600),
            db_pool_connect_timeout_secs: self.db_pool_connect_timeout_secs.unwrap_or(30),
            endpoint_probe_interval_ms: self.endpoint_probe_interval_ms.unwrap_or(60_000),
            endpoint_probe_concurrency: self.endpoint_probe_concurrency.unwrap_or(4),
            endpoint_probe_timeout_ms: self.endpoint_probe_timeout_ms.unwrap_or(5_000),
            endpoint_probe_lock_ttl_ms: self.endpoint_probe_lock_ttl_ms.unwrap_or(30_000),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            proxy: value.proxy,
            dsn: Some(value.dsn),
            event_redact_sensitive: Some(value.event_redact_sensitive),
            tz: Some(value.tz),
            session_ttl_secs: Some(value.session_ttl_secs),
            enable_http2: Some(value.enable_http2),
            redis_url: value.redis_url,
            db_pool_max: Some(value.db_pool_max),
            db_pool_idle_timeout_secs: Some(value.db_pool_idle_timeout_secs),
            db_pool_connect_timeout_secs: Some(value.db_pool_connect_timeout_secs),
            endpoint_probe_interval_ms: Some(value.endpoint_probe_interval_ms),
            endpoint_probe_concurrency: Some(value.endpoint_probe_concurrency),
            endpoint_probe_timeout_ms: Some(value.endpoint_probe_timeout_ms),
            endpoint_probe_lock_ttl_ms: Some(value.endpoint_probe_lock_ttl_ms),
        }
    }
}
