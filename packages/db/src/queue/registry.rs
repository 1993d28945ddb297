//! Queue provider registry keyed by queue name.

use std::collections::HashMap;
use std::sync::Arc;

use super::JobQueueProvider;

/// Maps queue names to the provider that serves them.
///
/// Queues without an explicit registration fall back to the default provider.
#[derive(Clone)]
pub struct QueueProviders {
    default: Arc<dyn JobQueueProvider>,
    by_queue: HashMap<String, Arc<dyn JobQueueProvider>>,
    registered: Vec<Arc<dyn JobQueueProvider>>,
}

impl QueueProviders {
    /// Create a registry with only a default provider.
    pub fn new(default: Arc<dyn JobQueueProvider>) -> Self {
        Self {
            registered: vec![default.clone()],
            default,
            by_queue: HashMap::new(),
        }
    }

    /// Route `queues` to `provider`.
    pub fn add<I, S>(&mut self, provider: Arc<dyn JobQueueProvider>, queues: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.registered.iter().any(|p| same_provider(p, &provider)) {
            self.registered.push(provider.clone());
        }
        for queue in queues {
            self.by_queue.insert(queue.into(), provider.clone());
        }
    }

    /// Provider for a queue name, or the default one.
    pub fn provider_for(&self, queue: &str) -> Arc<dyn JobQueueProvider> {
        self.by_queue
            .get(queue)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// Every distinct provider, default first.
    pub fn providers(&self) -> &[Arc<dyn JobQueueProvider>] {
        &self.registered
    }

    /// Names with an explicit registration.
    pub fn registered_queues(&self) -> Vec<&str> {
        self.by_queue.keys().map(|s| s.as_str()).collect()
    }
}

/// Identity comparison on the provider instance.
pub(crate) fn same_provider(a: &Arc<dyn JobQueueProvider>, b: &Arc<dyn JobQueueProvider>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::StoreContext;
    use crate::queue::{JobQueue, JobQueueMonitoringApi};

    struct NamedProvider(&'static str);

    impl JobQueueProvider for NamedProvider {
        fn job_queue(&self, _ctx: &StoreContext) -> Arc<dyn JobQueue> {
            unimplemented!("registry tests never build queues: {}", self.0)
        }

        fn monitoring_api(&self, _ctx: &StoreContext) -> Arc<dyn JobQueueMonitoringApi> {
            unimplemented!("registry tests never build monitoring: {}", self.0)
        }
    }

    #[test]
    fn unknown_queues_fall_back_to_default() {
        let default: Arc<dyn JobQueueProvider> = Arc::new(NamedProvider("default"));
        let special: Arc<dyn JobQueueProvider> = Arc::new(NamedProvider("special"));

        let mut providers = QueueProviders::new(default.clone());
        providers.add(special.clone(), ["critical", "reports"]);

        assert!(same_provider(&providers.provider_for("critical"), &special));
        assert!(same_provider(&providers.provider_for("reports"), &special));
        assert!(same_provider(&providers.provider_for("anything-else"), &default));
        assert_eq!(providers.providers().len(), 2);

        providers.add(special.clone(), ["more"]);
        assert_eq!(providers.providers().len(), 2);
    }
}
