use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One versioned price-table row for a model (DESIGN §6: "effectively
/// immutable, versioned"). `price_json` decodes as `tollgate_dispatch::ModelPrice`.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "model_prices")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "model_price_model_name")]
    pub model_name: String,
    pub price_json: Json,
    pub version: i32,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
}

impl ActiveModelBehavior for ActiveModel {}
