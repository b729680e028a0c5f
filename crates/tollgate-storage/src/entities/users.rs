use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "user_name")]
    pub name: String,
    /// Resolver/quota-visible extension fields, decoded as
    /// `tollgate_common::UserSettings`. `None` behaves as a default `User` role
    /// with no group, quota or rpm limits.
    pub settings_json: Option<Json>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub keys: HasMany<super::user_keys::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
