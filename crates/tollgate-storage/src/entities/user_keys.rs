use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "user_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    #[sea_orm(column_name = "key_hash")]
    #[sea_orm(unique_key = "user_key_hash")]
    pub api_key: String,
    pub label: Option<String>,
    /// Resolver/quota-visible extension fields, decoded as
    /// `tollgate_common::KeySettings`. `None` behaves as an unrestricted key
    /// that inherits only its user's limits.
    pub settings_json: Option<Json>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "user_id", to = "id", on_delete = "Cascade")]
    pub user: HasOne<super::users::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
