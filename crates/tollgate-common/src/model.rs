use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Selector-visible provider type. Determines which payload translator and
/// outbound auth convention a provider uses; coarser than the wire `Proto`
/// dialect tag, since several provider types share a wire dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Claude,
    ClaudeAuth,
    Codex,
    Gemini,
    GeminiCli,
    OpenAICompatible,
}

/// Window identifiers shared by User, Key and Provider quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    FiveHour,
    Daily,
    Weekly,
    Monthly,
    Total,
}

impl QuotaWindow {
    pub const ALL: [QuotaWindow; 5] = [
        QuotaWindow::FiveHour,
        QuotaWindow::Daily,
        QuotaWindow::Weekly,
        QuotaWindow::Monthly,
        QuotaWindow::Total,
    ];

    pub fn kv_segment(self) -> &'static str {
        match self {
            QuotaWindow::FiveHour => "5h",
            QuotaWindow::Daily => "daily",
            QuotaWindow::Weekly => "weekly",
            QuotaWindow::Monthly => "monthly",
            QuotaWindow::Total => "total",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum DailyResetMode {
    /// Anchors at a wall-clock time-of-day in the configured timezone.
    Fixed { hour: u8, minute: u8 },
    /// A sliding 24-hour window.
    Rolling,
}

impl Default for DailyResetMode {
    fn default() -> Self {
        DailyResetMode::Rolling
    }
}

/// Per-window USD limits, shared shape between User/Key/Provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_5h_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_daily_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_weekly_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_monthly_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_total_usd: Option<f64>,
}

impl QuotaLimits {
    pub fn get(&self, window: QuotaWindow) -> Option<f64> {
        match window {
            QuotaWindow::FiveHour => self.limit_5h_usd,
            QuotaWindow::Daily => self.limit_daily_usd,
            QuotaWindow::Weekly => self.limit_weekly_usd,
            QuotaWindow::Monthly => self.limit_monthly_usd,
            QuotaWindow::Total => self.limit_total_usd,
        }
    }
}

/// Per-provider circuit-breaker tuning. Zero `failure_threshold` disables the breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default)]
    pub failure_threshold: u32,
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    #[serde(default = "default_half_open_success_threshold")]
    pub half_open_success_threshold: u32,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

fn default_open_duration_ms() -> u64 {
    30 * 60 * 1000
}
fn default_half_open_success_threshold() -> u32 {
    2
}
fn default_max_retry_attempts() -> u32 {
    2
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: default_open_duration_ms(),
            half_open_success_threshold: default_half_open_success_threshold(),
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

/// Forwarder timeout tuning. 0 means unlimited; an idle timeout, if set, must be >= 60_000 ms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_first_byte_timeout_ms")]
    pub first_byte_timeout_streaming_ms: u64,
    #[serde(default)]
    pub streaming_idle_timeout_ms: u64,
    #[serde(default)]
    pub request_timeout_non_streaming_ms: u64,
}

fn default_first_byte_timeout_ms() -> u64 {
    30_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            first_byte_timeout_streaming_ms: default_first_byte_timeout_ms(),
            streaming_idle_timeout_ms: 0,
            request_timeout_non_streaming_ms: 0,
        }
    }
}

impl TimeoutConfig {
    /// Config-load-time validation: an explicit idle timeout below 60s is rejected.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.streaming_idle_timeout_ms != 0 && self.streaming_idle_timeout_ms < 60_000 {
            return Err("streaming_idle_timeout_ms must be 0 or >= 60000");
        }
        Ok(())
    }
}

/// One base URL for a vendor+type. Subject to liveness probes; several may
/// exist for the same logical Provider, ordered by `sort_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub last_probe: Option<EndpointProbeSnapshot>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointProbeSnapshot {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub latency_ms: Option<u64>,
    pub probed_at_unix_ms: i64,
    pub error_type: Option<String>,
}

/// Resolver-visible configuration for a logical Provider, deserialized from
/// `providers.selection_json`. Absent/defaulted fields make a provider behave
/// as a single-endpoint, ungrouped, unthrottled candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_cost_multiplier")]
    pub cost_multiplier: f64,
    #[serde(default)]
    pub group_tag: Option<String>,
    pub provider_type: ProviderType,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub model_redirects: HashMap<String, String>,
    #[serde(default)]
    pub quotas: QuotaLimits,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub codex_instructions_strategy: Option<CodexInstructionsStrategy>,
}

fn default_weight() -> u32 {
    1
}
fn default_cost_multiplier() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodexInstructionsStrategy {
    Passthrough,
    ForceOfficial,
}

/// Per-User extension fields, deserialized from `users.settings_json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub provider_group: Option<String>,
    #[serde(default)]
    pub quotas: QuotaLimits,
    #[serde(default)]
    pub limit_concurrent_sessions: Option<u32>,
    #[serde(default)]
    pub rpm_limit: Option<u32>,
    #[serde(default)]
    pub daily_reset_mode: DailyResetMode,
    #[serde(default)]
    pub allowed_user_agents: Vec<String>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub expired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    User,
}

impl Default for UserRole {
    fn default() -> Self {
        UserRole::User
    }
}

/// Per-Key extension fields, deserialized from `user_keys.settings_json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeySettings {
    #[serde(default)]
    pub provider_group: Option<String>,
    #[serde(default)]
    pub quotas: QuotaLimits,
    #[serde(default)]
    pub limit_concurrent_sessions: Option<u32>,
    #[serde(default)]
    pub rpm_limit: Option<u32>,
    #[serde(default)]
    pub can_login_web_ui: bool,
    #[serde(default)]
    pub cache_ttl_preference: Option<String>,
    #[serde(default)]
    pub allowed_user_agents: Vec<String>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub expired: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_config_defaults_single_endpoint_candidate() {
        let raw = r#"{"provider_type":"claude"}"#;
        let cfg: SelectionConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.priority, 0);
        assert_eq!(cfg.weight, 1);
        assert_eq!(cfg.cost_multiplier, 1.0);
        assert!(cfg.group_tag.is_none());
        assert!(cfg.endpoints.is_empty());
    }

    #[test]
    fn timeout_config_rejects_short_idle_timeout() {
        let cfg = TimeoutConfig {
            first_byte_timeout_streaming_ms: 30_000,
            streaming_idle_timeout_ms: 1_000,
            request_timeout_non_streaming_ms: 0,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn timeout_config_allows_disabled_or_valid_idle_timeout() {
        assert!(TimeoutConfig::default().validate().is_ok());
        let cfg = TimeoutConfig {
            streaming_idle_timeout_ms: 60_000,
            ..TimeoutConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
