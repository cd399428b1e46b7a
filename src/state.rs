use std::sync::Arc;

use crate::backend::{Backend, MemoryBackend};
use crate::config::PollConfig;
use crate::session::SessionService;

#[derive(Clone)]
pub struct AppState {
    pub backend: Backend,
    pub sessions: SessionService,
    pub config: PollConfig,
}

impl AppState {
    /// State over an in-process backend sized by the config
    pub fn new(config: PollConfig) -> Self {
        let memory = Arc::new(MemoryBackend::with_settings(
            config.channel_capacity,
            config.change_delay,
        ));
        Self::with_backend(Backend::in_memory(memory), config)
    }

    pub fn with_backend(backend: Backend, config: PollConfig) -> Self {
        Self {
            sessions: SessionService::new(backend.store.clone()),
            backend,
            config,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(PollConfig::default())
    }
}
