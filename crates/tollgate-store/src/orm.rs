use sea_orm::sea_query::{Expr, ExprTrait as _};
use sea_orm::{
    ActiveValue, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, EntityTrait,
    Schema,
};
use sea_orm::{ColumnTrait, QueryFilter};
use time::OffsetDateTime;

use crate::entities;
use crate::rows::{ChannelRow, ConsumeLogEntry, Role, TokenRow, UserRow};
use crate::store::{Store, StoreError, StoreResult};

/// SeaORM-backed [`Store`] (sqlite/mysql/postgres, selected by DSN).
#[derive(Clone)]
pub struct OrmStore {
    db: DatabaseConnection,
}

impl OrmStore {
    /// Connect a pooled store; the returned value is `Clone` and shares its
    /// pool, so one connect at bootstrap serves the process.
    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let db = Database::connect(dsn).await?;
        // Sqlite needs foreign keys switched on for cascade integrity.
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn channel_from_model(m: entities::channels::Model) -> ChannelRow {
    ChannelRow {
        id: m.id,
        name: m.name,
        kind: m.kind,
        enabled: m.enabled,
        groups: m.groups,
        models: m.models,
        base_url: m.base_url,
        api_key: m.api_key,
        weight: m.weight,
        model_remap: m.model_remap,
        config: m.config,
        auto_ban: m.auto_ban,
        used_quota: m.used_quota,
    }
}

fn token_from_model(m: entities::tokens::Model) -> TokenRow {
    TokenRow {
        id: m.id,
        user_id: m.user_id,
        name: m.name,
        key: m.key,
        group: m.group,
        remaining_quota: m.remaining_quota,
        unlimited_quota: m.unlimited_quota,
        models: m.models,
        enabled: m.enabled,
        billing_by_request: m.billing_by_request,
    }
}

fn user_from_model(m: entities::users::Model) -> UserRow {
    UserRow {
        id: m.id,
        username: m.username,
        role: Role::from_i16(m.role),
        enabled: m.enabled,
        group: m.group,
        access_token: m.access_token,
        quota: m.quota,
        used_quota: m.used_quota,
        request_count: m.request_count,
    }
}

#[async_trait::async_trait]
impl Store for OrmStore {
    async fn sync(&self) -> StoreResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Users)
            .register(entities::Tokens)
            .register(entities::Channels)
            .register(entities::ConsumeLogs)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn load_channels(&self) -> StoreResult<Vec<ChannelRow>> {
        let rows = entities::Channels::find().all(&self.db).await?;
        Ok(rows.into_iter().map(channel_from_model).collect())
    }

    async fn get_channel(&self, channel_id: i64) -> StoreResult<Option<ChannelRow>> {
        let row = entities::Channels::find_by_id(channel_id).one(&self.db).await?;
        Ok(row.map(channel_from_model))
    }

    async fn set_channel_enabled(&self, channel_id: i64, enabled: bool) -> StoreResult<()> {
        use entities::channels::Column;
        entities::Channels::update_many()
            .col_expr(Column::Enabled, Expr::value(enabled))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(channel_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn bump_channel_usage(&self, channel_id: i64, quota: i64) -> StoreResult<()> {
        use entities::channels::Column;
        entities::Channels::update_many()
            .col_expr(Column::UsedQuota, Expr::col(Column::UsedQuota).add(quota))
            .filter(Column::Id.eq(channel_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn get_user(&self, user_id: i64) -> StoreResult<Option<UserRow>> {
        let row = entities::Users::find_by_id(user_id).one(&self.db).await?;
        Ok(row.map(user_from_model))
    }

    async fn get_user_by_access_token(&self, access_token: &str) -> StoreResult<Option<UserRow>> {
        use entities::users::Column;
        let row = entities::Users::find()
            .filter(Column::AccessToken.eq(access_token))
            .one(&self.db)
            .await?;
        Ok(row.map(user_from_model))
    }

    async fn apply_user_quota_delta(&self, user_id: i64, delta: i64) -> StoreResult<()> {
        use entities::users::Column;
        let result = entities::Users::update_many()
            .col_expr(Column::Quota, Expr::col(Column::Quota).add(delta))
            .filter(Column::Id.eq(user_id))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(StoreError::RowMissing(format!("user {user_id}")));
        }
        Ok(())
    }

    async fn bump_user_usage(&self, user_id: i64, quota: i64) -> StoreResult<()> {
        use entities::users::Column;
        entities::Users::update_many()
            .col_expr(Column::UsedQuota, Expr::col(Column::UsedQuota).add(quota))
            .col_expr(Column::RequestCount, Expr::col(Column::RequestCount).add(1))
            .filter(Column::Id.eq(user_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn get_token_by_key(&self, key: &str) -> StoreResult<Option<TokenRow>> {
        use entities::tokens::Column;
        let row = entities::Tokens::find()
            .filter(Column::Key.eq(key))
            .one(&self.db)
            .await?;
        Ok(row.map(token_from_model))
    }

    async fn pre_consume_token_quota(&self, token_id: i64, amount: i64) -> StoreResult<()> {
        use entities::tokens::Column;
        if amount == 0 {
            return Ok(());
        }
        // Guarded decrement: the filter keeps the ledger non-negative without
        // a read-modify-write window. Unlimited tokens skip the ledger.
        let result = entities::Tokens::update_many()
            .col_expr(
                Column::RemainingQuota,
                Expr::col(Column::RemainingQuota).sub(amount),
            )
            .filter(Column::Id.eq(token_id))
            .filter(Column::UnlimitedQuota.eq(false))
            .filter(Column::RemainingQuota.gte(amount))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 1 {
            return Ok(());
        }
        let unlimited = entities::Tokens::find_by_id(token_id)
            .one(&self.db)
            .await?
            .map(|m| m.unlimited_quota)
            .ok_or_else(|| StoreError::RowMissing(format!("token {token_id}")))?;
        if unlimited {
            Ok(())
        } else {
            Err(StoreError::InsufficientTokenQuota)
        }
    }

    async fn post_consume_token_quota(&self, token_id: i64, delta: i64) -> StoreResult<()> {
        use entities::tokens::Column;
        if delta == 0 {
            return Ok(());
        }
        entities::Tokens::update_many()
            .col_expr(
                Column::RemainingQuota,
                Expr::col(Column::RemainingQuota).add(delta),
            )
            .filter(Column::Id.eq(token_id))
            .filter(Column::UnlimitedQuota.eq(false))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn record_consume_log(&self, entry: &ConsumeLogEntry) -> StoreResult<()> {
        let now = OffsetDateTime::now_utc();
        let active = entities::consume_logs::ActiveModel {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(entry.user_id),
            channel_id: ActiveValue::Set(entry.channel_id),
            token_id: ActiveValue::Set(entry.token_id),
            model: ActiveValue::Set(entry.model.clone()),
            prompt_tokens: ActiveValue::Set(entry.prompt_tokens),
            completion_tokens: ActiveValue::Set(entry.completion_tokens),
            quota: ActiveValue::Set(entry.quota),
            ratio_detail: ActiveValue::Set(entry.ratio_detail.clone()),
            elapsed_ms: ActiveValue::Set(entry.elapsed_ms),
            is_stream: ActiveValue::Set(entry.is_stream),
            content: ActiveValue::Set(entry.content.clone()),
            created_at: ActiveValue::Set(now),
        };
        entities::ConsumeLogs::insert(active).exec(&self.db).await?;
        Ok(())
    }
}
