use std::sync::Arc;

use chrono::{DateTime, Utc};

use mb_config::Settings;
use mb_db::Store;
use mb_queue::Queues;

use crate::error::DebugMode;
use crate::export::ExportAgent;
use crate::identify::IdentityResolver;
use crate::matching::MatchingAgent;
use crate::registry::AgentRegistry;

/// Source of "now" for retry scheduling.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Everything a director needs, built once at startup and cloned into each
/// worker. All members are shared handles.
#[derive(Clone)]
pub struct PipelineContext {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn Store>,
    pub queues: Queues,
    pub matching_agents: Arc<AgentRegistry<dyn MatchingAgent>>,
    pub export_agents: Arc<AgentRegistry<dyn ExportAgent>>,
    pub identity_resolver: Arc<dyn IdentityResolver>,
    clock: Clock,
}

impl PipelineContext {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn Store>,
        queues: Queues,
        identity_resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            settings,
            store,
            queues,
            matching_agents: Arc::new(AgentRegistry::new()),
            export_agents: Arc::new(AgentRegistry::new()),
            identity_resolver,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_matching_agents(mut self, agents: AgentRegistry<dyn MatchingAgent>) -> Self {
        self.matching_agents = Arc::new(agents);
        self
    }

    pub fn with_export_agents(mut self, agents: AgentRegistry<dyn ExportAgent>) -> Self {
        self.export_agents = Arc::new(agents);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn debug(&self) -> DebugMode {
        DebugMode(self.settings.debug)
    }
}
