use std::sync::Arc;
use std::time::SystemTime;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use tollgate_protocol::Usage;
use tollgate_store::cache::QuotaCache;
use tollgate_store::{ConsumeLogEntry, SharedStore, StoreError};

use crate::events::{EventHub, OpsEvent};

/// Post-response bookkeeping for one completed request: the settlement
/// correction, the consumption log append, and the lifetime counters.
#[derive(Debug, Clone)]
pub struct SettlementJob {
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub usage: Usage,
    /// Final quota computed from usage.
    pub quota: i64,
    /// Amount withheld at reserve time (zero when the trust shortcut applied).
    pub reserved: i64,
    pub ratio_detail: String,
    pub elapsed_ms: i64,
    pub is_stream: bool,
    pub content: Option<String>,
}

/// Apply one settlement: `delta = quota − reserved` corrects both the token
/// ledger and the cached balance, the durable user column absorbs the full
/// final cost, and exactly one log entry is appended.
pub async fn apply_settlement(
    store: &SharedStore,
    cache: &QuotaCache,
    job: &SettlementJob,
) -> Result<(), StoreError> {
    let delta = job.quota - job.reserved;

    cache
        .apply_delta(store.as_ref(), job.user_id, -delta)
        .await?;
    store
        .post_consume_token_quota(job.token_id, job.reserved - job.quota)
        .await?;
    store.apply_user_quota_delta(job.user_id, -job.quota).await?;
    store
        .record_consume_log(&ConsumeLogEntry {
            user_id: job.user_id,
            channel_id: job.channel_id,
            token_id: job.token_id,
            model: job.model.clone(),
            prompt_tokens: job.usage.prompt_tokens,
            completion_tokens: job.usage.completion_tokens,
            quota: job.quota,
            ratio_detail: job.ratio_detail.clone(),
            elapsed_ms: job.elapsed_ms,
            is_stream: job.is_stream,
            content: job.content.clone(),
        })
        .await?;
    store.bump_user_usage(job.user_id, job.quota).await?;
    store.bump_channel_usage(job.channel_id, job.quota).await?;
    Ok(())
}

/// Bounded queue decoupling settlement from the response path.
///
/// Enqueue never blocks: when the queue is full the job is applied on a
/// detached task instead. The worker retries a failed job once; a second
/// failure becomes a dead-letter event with enough detail to reconcile the
/// ledger by hand.
#[derive(Clone)]
pub struct SettlementQueue {
    tx: mpsc::Sender<SettlementJob>,
    store: SharedStore,
    cache: Arc<QuotaCache>,
}

impl SettlementQueue {
    pub fn start(
        store: SharedStore,
        cache: Arc<QuotaCache>,
        events: EventHub,
        capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<SettlementJob>(capacity);
        {
            let store = store.clone();
            let cache = cache.clone();
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    run_job(&store, &cache, &events, job).await;
                }
            });
        }
        Self { tx, store, cache }
    }

    pub fn submit(&self, job: SettlementJob) {
        if let Err(mpsc::error::TrySendError::Full(job)) = self.tx.try_send(job) {
            warn!(event = "settlement_queue_full", user_id = job.user_id);
            let store = self.store.clone();
            let cache = self.cache.clone();
            tokio::spawn(async move {
                if let Err(err) = apply_settlement(&store, &cache, &job).await {
                    error!(
                        event = "settlement_overflow_failed",
                        user_id = job.user_id,
                        quota = job.quota,
                        error = %err
                    );
                }
            });
        }
    }
}

async fn run_job(
    store: &SharedStore,
    cache: &Arc<QuotaCache>,
    events: &EventHub,
    job: SettlementJob,
) {
    let first = apply_settlement(store, cache, &job).await;
    let Err(first_err) = first else {
        info!(
            event = "settled",
            user_id = job.user_id,
            channel_id = job.channel_id,
            model = %job.model,
            quota = job.quota,
            reserved = job.reserved
        );
        return;
    };
    warn!(
        event = "settlement_retry",
        user_id = job.user_id,
        error = %first_err
    );
    if let Err(err) = apply_settlement(store, cache, &job).await {
        error!(
            event = "settlement_dead",
            user_id = job.user_id,
            channel_id = job.channel_id,
            quota = job.quota,
            error = %err
        );
        events.emit(OpsEvent::SettlementDead {
            at: SystemTime::now(),
            user_id: job.user_id,
            channel_id: job.channel_id,
            quota: job.quota,
            error: err.to_string(),
            detail: json!({
                "token_id": job.token_id,
                "model": job.model,
                "reserved": job.reserved,
                "prompt_tokens": job.usage.prompt_tokens,
                "completion_tokens": job.usage.completion_tokens,
            }),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tollgate_store::{MemStore, Role, TokenRow, UserRow};

    use super::*;

    fn seed(store: &MemStore, quota: i64, token_quota: i64) {
        store.put_user(UserRow {
            id: 1,
            username: "alice".into(),
            role: Role::User,
            enabled: true,
            group: "default".into(),
            access_token: None,
            quota,
            used_quota: 0,
            request_count: 0,
        });
        store.put_token(TokenRow {
            id: 7,
            user_id: 1,
            name: "t".into(),
            key: "abc".into(),
            group: None,
            remaining_quota: token_quota,
            unlimited_quota: false,
            models: None,
            enabled: true,
            billing_by_request: false,
        });
    }

    fn job(quota: i64, reserved: i64) -> SettlementJob {
        SettlementJob {
            user_id: 1,
            token_id: 7,
            channel_id: 3,
            model: "gpt-4o".into(),
            usage: Usage::new(50, 40),
            quota,
            reserved,
            ratio_detail: "model ratio 0.002 × group ratio 1".into(),
            elapsed_ms: 12,
            is_stream: false,
            content: None,
        }
    }

    fn seed_channel(store: &MemStore) {
        store.put_channel(tollgate_store::ChannelRow {
            id: 3,
            name: "main".into(),
            kind: "openai".into(),
            enabled: true,
            groups: "default".into(),
            models: "gpt-4o".into(),
            base_url: None,
            api_key: "k".into(),
            weight: 0,
            model_remap: None,
            config: None,
            auto_ban: None,
            used_quota: 0,
        });
    }

    #[tokio::test]
    async fn over_reservation_is_credited_back() {
        let mem = Arc::new(MemStore::new());
        let store: SharedStore = mem.clone();
        seed(&mem, 10_000, 5_000 - 300);
        seed_channel(&mem);
        let cache = QuotaCache::new(Duration::from_secs(30));
        // A reservation of 300 was taken earlier: the cache was debited and
        // the token ledger pre-consumed. Settle at the true cost of 130.
        cache.try_debit(store.as_ref(), 1, 300).await.unwrap();

        apply_settlement(&store, &cache, &job(130, 300)).await.unwrap();

        assert_eq!(cache.balance(store.as_ref(), 1).await.unwrap(), 10_000 - 130);
        assert_eq!(mem.token(7).unwrap().remaining_quota, 5_000 - 130);
        assert_eq!(mem.user(1).unwrap().quota, 10_000 - 130);
        assert_eq!(mem.user(1).unwrap().used_quota, 130);
        assert_eq!(mem.user(1).unwrap().request_count, 1);
        assert_eq!(mem.channel(3).unwrap().used_quota, 130);
        let logs = mem.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].prompt_tokens, 50);
        assert_eq!(logs[0].completion_tokens, 40);
        assert_eq!(logs[0].quota, 130);
    }

    #[tokio::test]
    async fn under_reservation_charges_the_difference() {
        let mem = Arc::new(MemStore::new());
        let store: SharedStore = mem.clone();
        seed(&mem, 10_000, 5_000 - 100);
        seed_channel(&mem);
        let cache = QuotaCache::new(Duration::from_secs(30));
        cache.try_debit(store.as_ref(), 1, 100).await.unwrap();

        apply_settlement(&store, &cache, &job(250, 100)).await.unwrap();

        assert_eq!(cache.balance(store.as_ref(), 1).await.unwrap(), 10_000 - 250);
        assert_eq!(mem.token(7).unwrap().remaining_quota, 5_000 - 250);
        assert_eq!(mem.user(1).unwrap().quota, 10_000 - 250);
    }

    #[tokio::test]
    async fn dead_letter_event_after_retry() {
        let store: SharedStore = Arc::new(MemStore::new());
        // No user seeded: every apply fails.
        let cache = Arc::new(QuotaCache::new(Duration::from_secs(30)));
        let events = EventHub::new(8);
        let mut rx = events.subscribe();
        let queue = SettlementQueue::start(store, cache, events, 8);
        queue.submit(job(10, 10));
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, OpsEvent::SettlementDead { quota: 10, .. }));
    }
}
