use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::rows::{ChannelRow, ConsumeLogEntry, TokenRow, UserRow};
use crate::store::{Store, StoreError, StoreResult};

/// In-memory [`Store`]: the billing/distributor test double, also usable as
/// an ephemeral backend via `--dsn memory://`.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<i64, UserRow>,
    tokens: HashMap<i64, TokenRow>,
    channels: HashMap<i64, ChannelRow>,
    logs: Vec<ConsumeLogEntry>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn put_user(&self, user: UserRow) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.users.insert(user.id, user);
        }
    }

    pub fn put_token(&self, token: TokenRow) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.tokens.insert(token.id, token);
        }
    }

    pub fn put_channel(&self, channel: ChannelRow) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.channels.insert(channel.id, channel);
        }
    }

    pub fn token(&self, token_id: i64) -> Option<TokenRow> {
        self.inner.lock().ok()?.tokens.get(&token_id).cloned()
    }

    pub fn user(&self, user_id: i64) -> Option<UserRow> {
        self.inner.lock().ok()?.users.get(&user_id).cloned()
    }

    pub fn channel(&self, channel_id: i64) -> Option<ChannelRow> {
        self.inner.lock().ok()?.channels.get(&channel_id).cloned()
    }

    pub fn logs(&self) -> Vec<ConsumeLogEntry> {
        self.inner
            .lock()
            .map(|inner| inner.logs.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Store for MemStore {
    async fn sync(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn load_channels(&self) -> StoreResult<Vec<ChannelRow>> {
        let inner = self.guard()?;
        let mut rows: Vec<ChannelRow> = inner.channels.values().cloned().collect();
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn get_channel(&self, channel_id: i64) -> StoreResult<Option<ChannelRow>> {
        Ok(self.guard()?.channels.get(&channel_id).cloned())
    }

    async fn set_channel_enabled(&self, channel_id: i64, enabled: bool) -> StoreResult<()> {
        if let Some(channel) = self.guard()?.channels.get_mut(&channel_id) {
            channel.enabled = enabled;
        }
        Ok(())
    }

    async fn bump_channel_usage(&self, channel_id: i64, quota: i64) -> StoreResult<()> {
        if let Some(channel) = self.guard()?.channels.get_mut(&channel_id) {
            channel.used_quota += quota;
        }
        Ok(())
    }

    async fn get_user(&self, user_id: i64) -> StoreResult<Option<UserRow>> {
        Ok(self.guard()?.users.get(&user_id).cloned())
    }

    async fn get_user_by_access_token(&self, access_token: &str) -> StoreResult<Option<UserRow>> {
        let inner = self.guard()?;
        Ok(inner
            .users
            .values()
            .find(|user| user.access_token.as_deref() == Some(access_token))
            .cloned())
    }

    async fn apply_user_quota_delta(&self, user_id: i64, delta: i64) -> StoreResult<()> {
        let mut inner = self.guard()?;
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::RowMissing(format!("user {user_id}")))?;
        user.quota += delta;
        Ok(())
    }

    async fn bump_user_usage(&self, user_id: i64, quota: i64) -> StoreResult<()> {
        if let Some(user) = self.guard()?.users.get_mut(&user_id) {
            user.used_quota += quota;
            user.request_count += 1;
        }
        Ok(())
    }

    async fn get_token_by_key(&self, key: &str) -> StoreResult<Option<TokenRow>> {
        let inner = self.guard()?;
        Ok(inner.tokens.values().find(|token| token.key == key).cloned())
    }

    async fn pre_consume_token_quota(&self, token_id: i64, amount: i64) -> StoreResult<()> {
        if amount == 0 {
            return Ok(());
        }
        let mut inner = self.guard()?;
        let token = inner
            .tokens
            .get_mut(&token_id)
            .ok_or_else(|| StoreError::RowMissing(format!("token {token_id}")))?;
        if token.unlimited_quota {
            return Ok(());
        }
        if token.remaining_quota < amount {
            return Err(StoreError::InsufficientTokenQuota);
        }
        token.remaining_quota -= amount;
        Ok(())
    }

    async fn post_consume_token_quota(&self, token_id: i64, delta: i64) -> StoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut inner = self.guard()?;
        let token = inner
            .tokens
            .get_mut(&token_id)
            .ok_or_else(|| StoreError::RowMissing(format!("token {token_id}")))?;
        if !token.unlimited_quota {
            token.remaining_quota += delta;
        }
        Ok(())
    }

    async fn record_consume_log(&self, entry: &ConsumeLogEntry) -> StoreResult<()> {
        self.guard()?.logs.push(entry.clone());
        Ok(())
    }
}
