//! Shared application state.

use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::registry::SessionRegistry;
use std::sync::Arc;

/// Handed to every HTTP and websocket handler.
#[derive(Clone, Debug)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub frontend_url: Option<String>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            pipeline: Pipeline::new(config, SessionRegistry::new()),
            frontend_url: None,
        }
    }

    pub fn with_frontend_url(mut self, url: impl Into<String>) -> Self {
        self.frontend_url = Some(url.into());
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.pipeline.registry()
    }
}
