use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// The durable per-request usage row (DESIGN §3). Written exactly once per
/// accepted request; retries across providers append to `provider_chain_json`
/// rather than creating extra rows.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "message_requests")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider_id: Option<i64>,
    pub user_id: i64,
    pub user_key_id: i64,
    pub key_string: String,
    pub session_id: Option<String>,
    pub request_sequence: Option<i64>,
    pub model: Option<String>,
    pub original_model: Option<String>,
    pub endpoint: Option<String>,
    pub status_code: Option<i32>,
    pub duration_ms: Option<i64>,
    pub ttfb_ms: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_creation_5m_input_tokens: Option<i64>,
    pub cache_creation_1h_input_tokens: Option<i64>,
    pub cache_read_input_tokens: Option<i64>,
    pub cache_ttl_applied: Option<String>,
    pub context_1m_applied: bool,
    /// Decimal USD, 15 dp scale; stored as text to avoid binary-float rounding.
    pub cost_usd: Option<String>,
    pub cost_multiplier: Option<f64>,
    pub provider_chain_json: Option<Json>,
    pub blocked_by: Option<String>,
    pub blocked_reason: Option<Json>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub user_agent: Option<String>,
    pub messages_count: Option<i32>,
    pub api_type: Option<String>,
    pub special_settings_json: Option<Json>,
    pub created_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "SetNull")]
    pub provider: HasOne<super::providers::Entity>,
    #[sea_orm(belongs_to, from = "user_id", to = "id", on_delete = "Cascade")]
    pub user: HasOne<super::users::Entity>,
    #[sea_orm(belongs_to, from = "user_key_id", to = "id", on_delete = "Cascade")]
    pub user_key: HasOne<super::user_keys::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
