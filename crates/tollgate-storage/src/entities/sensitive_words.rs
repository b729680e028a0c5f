use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One sensitive-content rule (DESIGN §4.6). The flattened text view of an
/// inbound request's messages is scanned against every enabled row; the
/// first match blocks the request with `blocked_by = "sensitive"`.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sensitive_words")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub pattern: String,
    /// `contains` | `exact` | `regex`.
    pub match_type: String,
    pub enabled: bool,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
}

impl ActiveModelBehavior for ActiveModel {}
