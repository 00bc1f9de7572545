//! Shared fixtures for handler tests: an `AppState` wired to in-memory
//! stores, a clean static prober, and a fake upstream.

use std::sync::Arc;

use reputation_core::aggregator::Aggregator;
use reputation_core::dnsbl::BlocklistProber;
use reputation_core::provisioner::Provisioner;
use reputation_core::store::{EventStore, InventoryStore, ReputationStore};
use reputation_core::testutil::{
    FakeUpstream, MemoryEventStore, MemoryInventoryStore, MemoryReputationStore, StaticProber,
};
use reputation_core::{ProvisionerConfig, ReputationConfig};

use crate::config::AppConfig;
use crate::AppState;

/// Build an `AppState` over fakes. Returns the concrete event and
/// reputation stores so tests can inspect them directly.
pub fn test_state() -> (
    Arc<AppState>,
    Arc<MemoryEventStore>,
    Arc<MemoryReputationStore>,
) {
    test_state_with_upstream(Arc::new(FakeUpstream::default())).0
}

/// Like [`test_state`], with a caller-supplied upstream fake; also returns
/// the inventory store.
pub fn test_state_with_upstream(
    upstream: Arc<FakeUpstream>,
) -> (
    (
        Arc<AppState>,
        Arc<MemoryEventStore>,
        Arc<MemoryReputationStore>,
    ),
    Arc<MemoryInventoryStore>,
) {
    let events = Arc::new(MemoryEventStore::default());
    let reputation = Arc::new(MemoryReputationStore::default());
    let inventory = Arc::new(MemoryInventoryStore::default());
    let prober = Arc::new(StaticProber::clean());

    let events_dyn = Arc::clone(&events) as Arc<dyn EventStore>;
    let reputation_dyn = Arc::clone(&reputation) as Arc<dyn ReputationStore>;
    let inventory_dyn = Arc::clone(&inventory) as Arc<dyn InventoryStore>;
    let prober_dyn = Arc::clone(&prober) as Arc<dyn BlocklistProber>;

    let aggregator = Arc::new(Aggregator::new(
        Arc::clone(&events_dyn),
        Arc::clone(&reputation_dyn),
        Arc::clone(&prober_dyn),
        ReputationConfig::default(),
    ));
    let provisioner = Arc::new(Provisioner::new(
        upstream,
        Arc::clone(&prober_dyn),
        Arc::clone(&inventory_dyn),
        ProvisionerConfig {
            inter_attempt_delay_ms: 0,
            cleanup_delete_delay_ms: 0,
            ..ProvisionerConfig::default()
        },
    ));

    let state = Arc::new(AppState {
        events: events_dyn,
        reputation: reputation_dyn,
        inventory: inventory_dyn,
        prober: prober_dyn,
        aggregator,
        provisioner,
        config: Arc::new(AppConfig::default()),
    });

    ((state, events, reputation), inventory)
}
