use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "user_username")]
    pub username: String,
    /// Role level; thresholds map to user/admin/root.
    pub role: i16,
    pub enabled: bool,
    #[sea_orm(column_name = "user_group")]
    pub group: String,
    /// Console/API bearer credential, distinct from relay tokens.
    pub access_token: Option<String>,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
