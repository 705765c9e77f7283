use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    /// Upstream protocol family tag.
    pub kind: String,
    pub enabled: bool,
    #[sea_orm(column_name = "served_groups")]
    pub groups: String,
    #[sea_orm(column_name = "served_models")]
    pub models: String,
    pub base_url: Option<String>,
    pub api_key: String,
    pub weight: i64,
    #[sea_orm(column_type = "Json", nullable)]
    pub model_remap: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub config: Option<Json>,
    pub auto_ban: Option<bool>,
    pub used_quota: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
