//! Explicit per-client context passed into every operation

use crate::registry::HandleRegistry;
use imgplane_common::Config;
use imgplane_store::MetadataStore;
use std::sync::Arc;

/// Store connection, configuration and open handles of one client
#[derive(Clone)]
pub struct Context {
    store: Arc<dyn MetadataStore>,
    config: Arc<Config>,
    registry: Arc<HandleRegistry>,
}

impl Context {
    pub fn new(store: Arc<dyn MetadataStore>, config: Config) -> Self {
        Self {
            store,
            config: Arc::new(config),
            registry: Arc::new(HandleRegistry::default()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &dyn MetadataStore {
        self.store.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }
}
