use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Ordered request/header-rewrite rule (DESIGN §4.6). Applied in ascending
/// `priority`; later rules see the effect of earlier ones.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_filters")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    /// `header` | `body`.
    pub scope: String,
    /// `remove` | `set` | `json_path` | `text_replace`.
    pub action: String,
    pub target: String,
    pub value: Option<String>,
    /// `global` | `providers` | `groups`; paired with `binding_values_json`.
    pub binding_kind: String,
    pub binding_values_json: Option<Json>,
    pub priority: i32,
    pub enabled: bool,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
}

impl ActiveModelBehavior for ActiveModel {}
