use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Compiled `(pattern, match_type, category, override_response?, override_status?)`
/// used by the failure classifier (DESIGN §4.2) and the response handler to
/// substitute upstream errors with a stable client-facing shape.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "error_rules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub pattern: String,
    /// `contains` | `exact` | `regex`.
    pub match_type: String,
    /// `retryable` | `non_retryable`.
    pub category: String,
    pub override_response_json: Option<Json>,
    pub override_status_code: Option<i32>,
    pub priority: i32,
    pub enabled: bool,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
}

impl ActiveModelBehavior for ActiveModel {}
