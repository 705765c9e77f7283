use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[sea_orm(column_name = "key_value")]
    #[sea_orm(unique_key = "token_key")]
    pub key: String,
    #[sea_orm(column_name = "token_group")]
    pub group: Option<String>,
    pub remaining_quota: i64,
    pub unlimited_quota: bool,
    /// Comma-separated model allow-list; null/empty means unrestricted.
    pub models: Option<String>,
    pub enabled: bool,
    pub billing_by_request: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "user_id", to = "id", on_delete = "Cascade")]
    pub user: HasOne<super::users::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
