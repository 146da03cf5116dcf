//! Shared worker services: hooks, resources and usage accounting.

use std::sync::Arc;

use crate::hooks::Hooks;
use crate::resources::ResourceManager;
use crate::usage_metrics::UsageMetrics;

pub struct Services {
    pub hooks: Arc<Hooks>,
    pub resources: ResourceManager,
    pub usage_metrics: UsageMetrics,
}

impl Services {
    /// Builds the service set and registers the usage-metrics observer on
    /// every stage hook.
    pub fn new() -> Arc<Self> {
        let hooks = Arc::new(Hooks::new());
        let usage_metrics = UsageMetrics::new();
        usage_metrics.register(&hooks);
        Arc::new(Self {
            hooks,
            resources: ResourceManager::new(),
            usage_metrics,
        })
    }
}
