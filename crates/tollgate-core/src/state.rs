use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use tollgate_adapter::UpstreamClient;
use tollgate_common::{GlobalConfig, OptionFlags, RatioTables};
use tollgate_store::cache::{QuotaCache, UserStatusCache};
use tollgate_store::{ChannelRow, SharedStore, StoreResult};

use crate::auth::EntitlementResolver;
use crate::billing::BillingEngine;
use crate::distributor::ChannelDirectory;
use crate::events::EventHub;
use crate::settlement::SettlementQueue;
use crate::token::TokenValidator;

const SETTLEMENT_QUEUE_CAPACITY: usize = 1024;
const EVENT_HUB_BUFFER: usize = 64;

/// Process-wide relay state. Read-mostly tables live behind `ArcSwap`
/// snapshots and are replaced wholesale on reload.
pub struct AppState {
    pub store: SharedStore,
    pub quota_cache: Arc<QuotaCache>,
    pub status_cache: Arc<UserStatusCache>,
    pub options: ArcSwap<OptionFlags>,
    pub ratios: ArcSwap<RatioTables>,
    pub channels: ChannelDirectory,
    pub client: Arc<dyn UpstreamClient>,
    pub events: EventHub,
    pub billing: BillingEngine,
    pub settlement: SettlementQueue,
    pub resolver: EntitlementResolver,
    pub validator: TokenValidator,
}

impl AppState {
    pub fn new(
        config: &GlobalConfig,
        store: SharedStore,
        client: Arc<dyn UpstreamClient>,
        options: OptionFlags,
        ratios: RatioTables,
        channels: Vec<ChannelRow>,
    ) -> Arc<Self> {
        let ttl = Duration::from_secs(config.cache_ttl_secs);
        let quota_cache = Arc::new(QuotaCache::new(ttl));
        let status_cache = Arc::new(UserStatusCache::new(ttl));
        let events = EventHub::new(EVENT_HUB_BUFFER);
        let billing = BillingEngine::new(store.clone(), quota_cache.clone(), events.clone());
        let settlement = SettlementQueue::start(
            store.clone(),
            quota_cache.clone(),
            events.clone(),
            SETTLEMENT_QUEUE_CAPACITY,
        );
        let resolver = EntitlementResolver::new(store.clone(), status_cache.clone());
        let validator = TokenValidator::new(store.clone(), status_cache.clone());
        Arc::new(Self {
            store,
            quota_cache,
            status_cache,
            options: ArcSwap::from_pointee(options),
            ratios: ArcSwap::from_pointee(ratios),
            channels: ChannelDirectory::new(channels),
            client,
            events,
            billing,
            settlement,
            resolver,
            validator,
        })
    }

    pub fn apply_options(&self, options: OptionFlags) {
        self.options.store(Arc::new(options));
    }

    pub fn apply_ratios(&self, ratios: RatioTables) {
        self.ratios.store(Arc::new(ratios));
    }

    /// Re-read the channel table from the store and swap the snapshot.
    pub async fn reload_channels(&self) -> StoreResult<usize> {
        let channels = self.store.load_channels().await?;
        let count = channels.len();
        self.channels.replace_snapshot(channels);
        Ok(count)
    }
}
