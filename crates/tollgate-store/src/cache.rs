use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::store::{Store, StoreError, StoreResult};

/// Short-TTL cache of user quota balances.
///
/// The cached balance is the single hot shared mutable resource of the relay:
/// every mutation is an atomic delta against the per-user `AtomicI64`, never
/// read-modify-write at the caller. The durable user quota column remains the
/// source of truth; each cache delta is paired with the same durable delta,
/// so a TTL reload from the store converges rather than losing updates.
///
/// A cache miss that cannot be filled from the store fails closed: the error
/// propagates, the caller must not treat the user as having unlimited funds.
pub struct QuotaCache {
    ttl: Duration,
    slots: RwLock<HashMap<i64, Slot>>,
}

struct Slot {
    balance: Arc<AtomicI64>,
    loaded_at: Instant,
}

/// Outcome of an atomic reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    /// Debit applied; carries the balance observed before the debit.
    Debited { before: i64 },
    /// The debit would have driven the balance negative; nothing changed.
    Insufficient { balance: i64 },
}

impl QuotaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: RwLock::new(HashMap::new()),
        }
    }

    async fn balance_handle(
        &self,
        store: &dyn Store,
        user_id: i64,
    ) -> StoreResult<Arc<AtomicI64>> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(&user_id)
                && slot.loaded_at.elapsed() < self.ttl
            {
                return Ok(slot.balance.clone());
            }
        }

        let durable = store
            .get_user(user_id)
            .await?
            .ok_or_else(|| StoreError::RowMissing(format!("user {user_id}")))?
            .quota;

        let mut slots = self.slots.write().await;
        match slots.get_mut(&user_id) {
            Some(slot) if slot.loaded_at.elapsed() < self.ttl => Ok(slot.balance.clone()),
            Some(slot) => {
                slot.balance.store(durable, Ordering::SeqCst);
                slot.loaded_at = Instant::now();
                Ok(slot.balance.clone())
            }
            None => {
                let balance = Arc::new(AtomicI64::new(durable));
                slots.insert(
                    user_id,
                    Slot {
                        balance: balance.clone(),
                        loaded_at: Instant::now(),
                    },
                );
                Ok(balance)
            }
        }
    }

    /// Current cached balance, loading from the store on miss or expiry.
    pub async fn balance(&self, store: &dyn Store, user_id: i64) -> StoreResult<i64> {
        let handle = self.balance_handle(store, user_id).await?;
        Ok(handle.load(Ordering::SeqCst))
    }

    /// Atomically withhold `amount` unless the balance would go negative.
    ///
    /// Check and debit are a single compare-exchange loop so two racing
    /// reservations cannot both slip past the check.
    pub async fn try_debit(
        &self,
        store: &dyn Store,
        user_id: i64,
        amount: i64,
    ) -> StoreResult<DebitOutcome> {
        let handle = self.balance_handle(store, user_id).await?;
        let result = handle.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            (current >= amount).then_some(current - amount)
        });
        Ok(match result {
            Ok(before) => DebitOutcome::Debited { before },
            Err(balance) => DebitOutcome::Insufficient { balance },
        })
    }

    /// Apply a signed delta (settlement correction or refund).
    pub async fn apply_delta(
        &self,
        store: &dyn Store,
        user_id: i64,
        delta: i64,
    ) -> StoreResult<()> {
        let handle = self.balance_handle(store, user_id).await?;
        handle.fetch_add(delta, Ordering::SeqCst);
        Ok(())
    }
}

/// Short-TTL cache of the user enabled flag, consulted on every request so a
/// disable takes effect within one TTL window.
pub struct UserStatusCache {
    ttl: Duration,
    entries: RwLock<HashMap<i64, (bool, Instant)>>,
}

impl UserStatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn is_enabled(&self, store: &dyn Store, user_id: i64) -> StoreResult<bool> {
        {
            let entries = self.entries.read().await;
            if let Some((enabled, at)) = entries.get(&user_id)
                && at.elapsed() < self.ttl
            {
                return Ok(*enabled);
            }
        }
        let enabled = store
            .get_user(user_id)
            .await?
            .ok_or_else(|| StoreError::RowMissing(format!("user {user_id}")))?
            .enabled;
        self.entries
            .write()
            .await
            .insert(user_id, (enabled, Instant::now()));
        Ok(enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;
    use crate::rows::{Role, UserRow};

    fn user(id: i64, quota: i64) -> UserRow {
        UserRow {
            id,
            username: format!("u{id}"),
            role: Role::User,
            enabled: true,
            group: "default".into(),
            access_token: None,
            quota,
            used_quota: 0,
            request_count: 0,
        }
    }

    #[tokio::test]
    async fn debit_refuses_to_go_negative() {
        let store = MemStore::new();
        store.put_user(user(1, 100));
        let cache = QuotaCache::new(Duration::from_secs(30));

        let outcome = cache.try_debit(&store, 1, 60).await.unwrap();
        assert_eq!(outcome, DebitOutcome::Debited { before: 100 });

        let outcome = cache.try_debit(&store, 1, 60).await.unwrap();
        assert_eq!(outcome, DebitOutcome::Insufficient { balance: 40 });
        assert_eq!(cache.balance(&store, 1).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn missing_user_fails_closed() {
        let store = MemStore::new();
        let cache = QuotaCache::new(Duration::from_secs(30));
        let err = cache.balance(&store, 42).await.unwrap_err();
        assert!(matches!(err, StoreError::RowMissing(_)));
    }

    #[tokio::test]
    async fn concurrent_debits_never_overdraw() {
        let store = Arc::new(MemStore::new());
        store.put_user(user(1, 1_000));
        let cache = Arc::new(QuotaCache::new(Duration::from_secs(30)));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.try_debit(store.as_ref(), 1, 30).await.unwrap()
            }));
        }
        let mut debited = 0;
        for task in tasks {
            if matches!(task.await.unwrap(), DebitOutcome::Debited { .. }) {
                debited += 1;
            }
        }
        // 33 debits of 30 fit into 1000; the 34th must be refused.
        assert_eq!(debited, 33);
        assert_eq!(cache.balance(store.as_ref(), 1).await.unwrap(), 10);
    }
}
