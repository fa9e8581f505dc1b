//! Plain HTTP handlers.

use crate::state::AppState;
use axum::{Json, extract::State};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sessions: usize,
}

/// Liveness probe; also reports how many sessions are open.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.registry.is_draining() { "draining" } else { "ok" },
        sessions: state.registry.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use orbi_core::{session::SettingsSource, settings::AgentDefaults};
    use secrecy::SecretString;
    use std::time::Duration;
    use tracing::Level;
    use uuid::Uuid;

    fn state() -> Arc<AppState> {
        AppState::new(Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            api_key: SecretString::from("test-key"),
            agent_url: "ws://127.0.0.1:1".to_string(),
            settings_source: SettingsSource::Relay,
            agent_defaults: AgentDefaults::default(),
            keepalive_interval: None,
            shutdown_grace: Duration::from_secs(1),
            log_level: Level::INFO,
        })
    }

    #[tokio::test]
    async fn health_reports_open_sessions() {
        let state = state();
        let Json(body) = health(State(state.clone())).await;
        assert_eq!(body, HealthResponse { status: "ok", sessions: 0 });

        let _session = state.registry.register(Uuid::new_v4()).unwrap();
        let Json(body) = health(State(state.clone())).await;
        assert_eq!(body.sessions, 1);

        state.registry.close_all();
        let Json(body) = health(State(state)).await;
        assert_eq!(body.status, "draining");
    }
}
