use std::sync::Arc;

use crate::{config::AppConfig, store::ContentStore};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// The ephemeral content store
    store: Arc<ContentStore>,
    /// Application configuration
    config: Arc<AppConfig>,
}

impl AppState {
    /// Create a new AppState instance
    pub fn new(store: Arc<ContentStore>, config: AppConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    /// Get a reference to the content store
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Get a reference to the application configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}
