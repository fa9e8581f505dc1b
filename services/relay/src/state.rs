//! Shared application state, created once at startup and handed to every
//! handler.

use crate::{config::Config, registry::ConnectionRegistry};
use orbi_core::settings::AgentConfiguration;
use std::sync::Arc;

#[derive(Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    /// Built from the configured defaults; applied on `Welcome` when the relay
    /// supplies settings.
    pub default_agent_config: Arc<AgentConfiguration>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let default_agent_config = AgentConfiguration::from_defaults(&config.agent_defaults);
        Arc::new(Self {
            config: Arc::new(config),
            registry: ConnectionRegistry::new(),
            default_agent_config: Arc::new(default_agent_config),
        })
    }
}
