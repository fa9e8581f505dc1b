//! Handles the WebSocket connection to the Deepgram voice agent endpoint.

use super::{AgentCommand, LinkState, SharedLink};
use crate::{config::Config, state::AppState};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use orbi_core::{
    codec::Frame,
    envelope::ControlEnvelope,
    session::{UpstreamEvent, UpstreamFailure},
    settings::AgentConfiguration,
};
use secrecy::ExposeSecret;
use std::time::Duration;
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self, client::IntoClientRequest, handshake::client::Request, protocol::Message as WsMessage,
    },
};
use tracing::{debug, info, warn};

/// How long to wait for the agent to acknowledge our close frame.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Holds the session configuration until the agent has said `Welcome`, and
/// lets it through exactly once.
#[derive(Debug, Default)]
struct ConfigGate {
    welcomed: bool,
    applied: bool,
    pending: Option<AgentConfiguration>,
}

impl ConfigGate {
    /// Offers a configuration; returns it if it may be sent now.
    fn offer(&mut self, config: AgentConfiguration) -> Option<AgentConfiguration> {
        if self.applied || self.pending.is_some() {
            warn!("Agent already configured for this session; ignoring new settings");
            return None;
        }
        if !self.welcomed {
            info!("Holding settings until the agent is ready");
            self.pending = Some(config);
            return None;
        }
        self.applied = true;
        Some(config)
    }

    /// Records `Welcome`; returns any configuration that was waiting for it.
    fn welcome(&mut self) -> Option<AgentConfiguration> {
        self.welcomed = true;
        let config = self.pending.take()?;
        self.applied = true;
        Some(config)
    }
}

/// Builds the authenticated handshake request for the agent endpoint.
fn build_request(config: &Config) -> Result<Request> {
    let mut request = config.agent_url.as_str().into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        format!("Token {}", config.api_key.expose_secret()).parse()?,
    );
    Ok(request)
}

fn connect_failure(error: &tungstenite::Error) -> UpstreamFailure {
    match error {
        tungstenite::Error::Http(response) => UpstreamFailure::new(
            format!("Agent rejected the connection: HTTP {}", response.status()),
            format!("HTTP_{}", response.status().as_u16()),
        ),
        other => UpstreamFailure::new(
            format!("Failed to connect to agent: {}", other),
            "UPSTREAM_CONNECT_FAILED",
        ),
    }
}

fn settings_message(config: AgentConfiguration) -> Result<WsMessage> {
    let text = serde_json::to_string(&ControlEnvelope::Settings(config))
        .context("Failed to encode agent settings")?;
    Ok(WsMessage::Text(text.into()))
}

/// Passes one agent frame on to the session, whichever WebSocket frame type
/// carried it. Returns a configuration that was waiting for `Welcome`.
async fn relay_frame(
    frame: Frame,
    events: &mpsc::Sender<UpstreamEvent>,
    gate: &mut ConfigGate,
) -> Result<Option<AgentConfiguration>> {
    match frame {
        Frame::Audio(data) => {
            events.send(UpstreamEvent::Audio(data)).await?;
            Ok(None)
        }
        Frame::Control(message) => {
            let is_welcome = matches!(message.envelope(), ControlEnvelope::Welcome { .. });
            events.send(UpstreamEvent::Control(message)).await?;
            Ok(if is_welcome { gate.welcome() } else { None })
        }
    }
}

/// Runs one agent connection until either side lets go.
///
/// Connect failures are reported as [`UpstreamEvent::Failed`]; other errors
/// are returned to the caller.
pub async fn run(
    state: &AppState,
    mut commands: mpsc::Receiver<AgentCommand>,
    events: mpsc::Sender<UpstreamEvent>,
    link: &SharedLink,
) -> Result<()> {
    let request = match build_request(&state.config) {
        Ok(request) => request,
        Err(e) => {
            let failure = UpstreamFailure::new(
                format!("Invalid agent endpoint: {:#}", e),
                "UPSTREAM_CONFIG_INVALID",
            );
            events.send(UpstreamEvent::Failed(failure)).await?;
            return Ok(());
        }
    };

    let mut gate = ConfigGate::default();

    // Connect, giving up as soon as the session releases us.
    let connect = connect_async(request);
    tokio::pin!(connect);
    let ws_stream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((stream, _)) => break stream,
                Err(e) => {
                    let failure = connect_failure(&e);
                    warn!(error = %e, "Agent connection failed");
                    events.send(UpstreamEvent::Failed(failure)).await?;
                    return Ok(());
                }
            },
            command = commands.recv() => match command {
                Some(AgentCommand::Configure(config)) => {
                    gate.offer(config);
                }
                Some(AgentCommand::Audio(_)) => link.count_dropped(),
                None => {
                    info!("Session released the agent before the connection was established");
                    events
                        .send(UpstreamEvent::Failed(UpstreamFailure::closed_before_established()))
                        .await?;
                    return Ok(());
                }
            },
        }
    };

    link.set(LinkState::Open);
    info!("Agent connection established");
    events.send(UpstreamEvent::Opened).await?;
    let (mut agent_tx, mut agent_rx) = ws_stream.split();

    let keepalive_period = state.config.keepalive_interval;
    let mut keepalive =
        tokio::time::interval(keepalive_period.unwrap_or(Duration::from_secs(3600)));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.tick().await;
    let mut last_write = Instant::now();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(AgentCommand::Audio(data)) => {
                    agent_tx
                        .send(WsMessage::Binary(data))
                        .await
                        .context("Failed to send audio to agent")?;
                    last_write = Instant::now();
                }
                Some(AgentCommand::Configure(config)) => {
                    if let Some(config) = gate.offer(config) {
                        agent_tx
                            .send(settings_message(config)?)
                            .await
                            .context("Failed to send settings to agent")?;
                        last_write = Instant::now();
                    }
                }
                None => {
                    link.set(LinkState::Closing);
                    info!("Disconnecting from agent");
                    if let Err(e) = agent_tx.send(WsMessage::Close(None)).await {
                        info!(error = %e, "Agent disconnect handled (may not have been fully connected)");
                        break;
                    }
                    let _ = tokio::time::timeout(CLOSE_ACK_TIMEOUT, async {
                        while let Some(Ok(message)) = agent_rx.next().await {
                            if message.is_close() {
                                break;
                            }
                        }
                    })
                    .await;
                    break;
                }
            },
            message = agent_rx.next() => {
                let frame = match message {
                    Some(Ok(WsMessage::Text(text))) => Frame::from_text(text.as_str()),
                    Some(Ok(WsMessage::Binary(data))) => Frame::from_binary(data),
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Agent connection closed");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let failure = UpstreamFailure::new(
                            format!("Agent connection error: {}", e),
                            "UPSTREAM_PROTOCOL_ERROR",
                        );
                        warn!(error = %e, "Error reading from agent");
                        events.send(UpstreamEvent::Failed(failure)).await?;
                        break;
                    }
                    None => {
                        info!("Agent connection ended");
                        break;
                    }
                };
                if let Some(config) = relay_frame(frame, &events, &mut gate).await? {
                    agent_tx
                        .send(settings_message(config)?)
                        .await
                        .context("Failed to send settings to agent")?;
                    last_write = Instant::now();
                }
            }
            _ = keepalive.tick(), if keepalive_period.is_some() => {
                if keepalive_period.is_some_and(|period| last_write.elapsed() >= period) {
                    let text = serde_json::to_string(&ControlEnvelope::KeepAlive)?;
                    agent_tx
                        .send(WsMessage::Text(text.into()))
                        .await
                        .context("Failed to send keep-alive to agent")?;
                    last_write = Instant::now();
                    debug!("Sent keep-alive to agent");
                }
            },
        }
    }

    Ok(())
}
