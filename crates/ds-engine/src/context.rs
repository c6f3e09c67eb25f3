use std::sync::Arc;

use ds_bus::EventBus;
use ds_core::EngineConfig;
use ds_fetch::FetcherRegistry;
use ds_llm::ChatProvider;
use ds_rules::RulesEngine;
use ds_store::{ArtifactStore, EventStore, JobStore};

/// Everything the engine needs, injected once at startup.
///
/// Components hold stable ids (`job_id`, `card_id`, `seq`) and look state up
/// through the stores; there are no back-pointers between domain objects.
pub struct EngineContext {
    pub jobs: JobStore,
    pub artifacts: ArtifactStore,
    pub events: EventStore,
    pub bus: EventBus,
    pub rules: RulesEngine,
    pub fetchers: FetcherRegistry,
    pub chat: Arc<dyn ChatProvider>,
    pub config: EngineConfig,
}

impl EngineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: JobStore,
        artifacts: ArtifactStore,
        events: EventStore,
        bus: EventBus,
        rules: RulesEngine,
        fetchers: FetcherRegistry,
        chat: Arc<dyn ChatProvider>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            artifacts,
            events,
            bus,
            rules,
            fetchers,
            chat,
            config,
        })
    }
}
