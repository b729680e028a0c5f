use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "provider_name")]
    pub name: String,
    pub config_json: Json,
    /// Resolver-visible tuning (priority/weight/quotas/breaker/...), decoded as
    /// `tollgate_common::SelectionConfig`. `None` rows behave as a single-endpoint,
    /// ungrouped, unthrottled candidate.
    pub selection_json: Option<Json>,
    pub enabled: bool,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub credentials: HasMany<super::credentials::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
