use std::sync::Arc;

use async_trait::async_trait;

use crate::rows::{ChannelRow, ConsumeLogEntry, TokenRow, UserRow};

pub type StoreResult<T> = Result<T, StoreError>;
pub type SharedStore = Arc<dyn Store>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("token quota would go negative")]
    InsufficientTokenQuota,
    #[error("row missing: {0}")]
    RowMissing(String),
    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Durable record store consulted by the relay pipeline.
///
/// Ledger mutations (`pre_consume_token_quota`, `post_consume_token_quota`,
/// `apply_user_quota_delta`) must be expressed as atomic deltas in the
/// backing store, never as read-modify-write at the caller. The token and
/// user quota columns are the source of truth; the in-memory quota cache is
/// an accelerator kept consistent through the same deltas.
#[async_trait]
pub trait Store: Send + Sync {
    /// Entity-first schema sync, run once at bootstrap.
    async fn sync(&self) -> StoreResult<()>;

    // Channels
    async fn load_channels(&self) -> StoreResult<Vec<ChannelRow>>;
    async fn get_channel(&self, channel_id: i64) -> StoreResult<Option<ChannelRow>>;
    async fn set_channel_enabled(&self, channel_id: i64, enabled: bool) -> StoreResult<()>;
    /// Concurrent increments must not lose updates.
    async fn bump_channel_usage(&self, channel_id: i64, quota: i64) -> StoreResult<()>;

    // Users
    async fn get_user(&self, user_id: i64) -> StoreResult<Option<UserRow>>;
    async fn get_user_by_access_token(&self, access_token: &str) -> StoreResult<Option<UserRow>>;
    async fn apply_user_quota_delta(&self, user_id: i64, delta: i64) -> StoreResult<()>;
    async fn bump_user_usage(&self, user_id: i64, quota: i64) -> StoreResult<()>;

    // Tokens
    async fn get_token_by_key(&self, key: &str) -> StoreResult<Option<TokenRow>>;
    /// Withhold `amount` from the token's ledger; fails with
    /// [`StoreError::InsufficientTokenQuota`] instead of going negative.
    /// No-op for unlimited tokens.
    async fn pre_consume_token_quota(&self, token_id: i64, amount: i64) -> StoreResult<()>;
    /// Apply a signed settlement delta (or a refund) to the token's ledger.
    async fn post_consume_token_quota(&self, token_id: i64, delta: i64) -> StoreResult<()>;

    // Logs
    async fn record_consume_log(&self, entry: &ConsumeLogEntry) -> StoreResult<()>;
}
