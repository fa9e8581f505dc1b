//! Manages the WebSocket lifecycle of one client session.

use super::{
    downstream::{self, DOWNSTREAM_QUEUE, DownstreamSender},
    upstream::{self, UpstreamError, UpstreamHandle},
};
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use chrono::Utc;
use futures_util::StreamExt;
use orbi_core::{
    Command,
    codec::Frame,
    session::{CloseReason, SessionCoordinator, UpstreamEvent},
};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{Instant, sleep_until, timeout},
};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// How long a closing session waits for both legs to confirm.
const SESSION_CLOSE_GRACE: Duration = Duration::from_secs(2);
/// How long to wait for the leg tasks after the session loop ends. Both legs
/// are joined at once, so a session ends within the grace plus this.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    let span = info_span!("session", %session_id);
    run_session(socket, state, session_id).instrument(span).await
}

async fn run_session(mut socket: WebSocket, state: Arc<AppState>, session_id: Uuid) {
    let Some(registration) = state.registry.register(session_id) else {
        info!("Server is shutting down; refusing new session");
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    info!("Client connected");

    let (client_tx, mut client_rx) = socket.split();
    let (mut downstream, writer) = downstream::spawn_writer(client_tx, DOWNSTREAM_QUEUE);
    let (mut upstream, mut events, upstream_task) = upstream::open(state.clone(), session_id);
    let mut coordinator = SessionCoordinator::new(
        session_id,
        state.config.settings_source,
        (*state.default_agent_config).clone(),
    );

    let mut pending = VecDeque::new();
    let mut close_deadline: Option<Instant> = None;

    while !coordinator.is_closed() {
        // Evaluated even while the branch is disabled, so it needs a value.
        let deadline = close_deadline.unwrap_or_else(|| Instant::now() + SESSION_CLOSE_GRACE);

        tokio::select! {
            message = client_rx.next(), if coordinator.downstream_open() => {
                let commands = match message {
                    Some(Ok(Message::Binary(data))) => {
                        coordinator.on_downstream_frame(Frame::from_binary(data))
                    }
                    Some(Ok(Message::Text(text))) => {
                        coordinator.on_downstream_frame(Frame::from_text(text.as_str()))
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "Client closed the connection");
                        coordinator.on_downstream_closed()
                    }
                    Some(Ok(_)) => Vec::new(),
                    Some(Err(e)) => {
                        warn!(error = %e, "Client socket error");
                        coordinator.on_downstream_closed()
                    }
                    None => {
                        info!("Client disconnected");
                        coordinator.on_downstream_closed()
                    }
                };
                pending.extend(commands);
            }
            event = events.recv(), if coordinator.upstream_open() => {
                let event = event.unwrap_or(UpstreamEvent::Closed);
                pending.extend(coordinator.on_upstream_event(event));
            }
            _ = registration.close_requested(), if !coordinator.is_closing() => {
                info!("Closing session for shutdown");
                pending.extend(coordinator.shutdown());
            }
            _ = sleep_until(deadline), if close_deadline.is_some() => {
                coordinator.force_closed();
            }
        }

        execute(&mut coordinator, &mut pending, &mut upstream, &mut downstream);

        if coordinator.is_closing() && close_deadline.is_none() {
            close_deadline = Some(Instant::now() + SESSION_CLOSE_GRACE);
        }
    }

    let stats = coordinator.stats();
    let upstream_dropped = upstream.dropped_audio();
    drop(upstream);
    drop(downstream);
    drop(events);
    join_legs(upstream_task, writer, TASK_JOIN_TIMEOUT).await;

    let elapsed = Utc::now() - coordinator.created_at();
    info!(
        session_id = %coordinator.id(),
        reason = ?coordinator.close_reason(),
        duration_ms = elapsed.num_milliseconds(),
        audio_upstream = stats.audio_upstream,
        audio_downstream = stats.audio_downstream,
        dropped_audio = stats.dropped_audio + upstream_dropped,
        rejected_control = stats.rejected_control,
        "Session finished"
    );
    drop(registration);
}

/// Runs queued commands in order. Saturating either leg closes the session,
/// and the resulting teardown commands are run in the same pass.
fn execute(
    coordinator: &mut SessionCoordinator,
    pending: &mut VecDeque<Command>,
    upstream: &mut UpstreamHandle,
    downstream: &mut DownstreamSender,
) {
    while let Some(command) = pending.pop_front() {
        match command {
            Command::ForwardAudioUpstream(data) => {
                if let Err(UpstreamError::Saturated) = upstream.send_audio(data) {
                    pending.extend(coordinator.on_saturated(CloseReason::UpstreamSaturated));
                }
            }
            Command::ApplyConfiguration(config) => match upstream.apply_configuration(config) {
                Ok(()) => {}
                Err(UpstreamError::Saturated) => {
                    pending.extend(coordinator.on_saturated(CloseReason::UpstreamSaturated));
                }
                Err(UpstreamError::Closed) => {
                    debug!("Upstream already closed; configuration not sent");
                }
            },
            Command::SendDownstream(frame) => {
                if downstream.send(frame).is_err() {
                    pending.extend(coordinator.on_saturated(CloseReason::DownstreamSaturated));
                }
            }
            Command::DisconnectUpstream => upstream.disconnect(),
            Command::CloseDownstream => downstream.close(),
        }
    }
}

/// Waits for both leg tasks side by side, aborting any still running after
/// `limit`.
async fn join_legs(upstream: JoinHandle<()>, downstream: JoinHandle<()>, limit: Duration) {
    tokio::join!(
        join_leg("upstream", upstream, limit),
        join_leg("downstream", downstream, limit)
    );
}

async fn join_leg(leg: &'static str, mut task: JoinHandle<()>, limit: Duration) {
    if timeout(limit, &mut task).await.is_err() {
        warn!(leg, "Task did not finish in time; aborting");
        task.abort();
    }
}
