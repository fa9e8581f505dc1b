//! Per-session control plane.
//!
//! `SessionCoordinator` pairs one downstream peer with one upstream agent
//! session. It holds no sockets: the runtime feeds it events from both legs
//! and executes the [`Command`]s it returns, in order.

use crate::{
    Command,
    codec::{ControlMessage, Frame},
    envelope::{CLOSED_BEFORE_ESTABLISHED, ControlEnvelope, DEFAULT_ERROR_CODE},
    settings::AgentConfiguration,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Downstream accepted, upstream not yet welcomed.
    Connecting,
    /// Upstream welcomed, configuration not applied yet.
    AwaitingConfig,
    /// Configuration applied; audio flows both ways.
    Active,
    /// Either leg began teardown.
    Closing,
    /// Both legs released.
    Closed,
}

/// Who supplies the agent configuration for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsSource {
    /// The relay applies its default on `Welcome`, unless the client already
    /// sent `Settings`.
    Relay,
    /// The relay waits for the client's `Settings`.
    Client,
}

/// Why a session started closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    DownstreamClosed,
    UpstreamClosed,
    Shutdown,
    DownstreamSaturated,
    UpstreamSaturated,
}

/// A connection-level failure on the upstream leg.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamFailure {
    pub message: String,
    pub code: Option<String>,
}

impl UpstreamFailure {
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// The failure reported when a link is torn down mid-handshake.
    pub fn closed_before_established() -> Self {
        Self {
            message: CLOSED_BEFORE_ESTABLISHED.to_string(),
            code: None,
        }
    }

    pub fn is_closed_before_established(&self) -> bool {
        self.message == CLOSED_BEFORE_ESTABLISHED
    }
}

/// Normalized events produced by the upstream adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// The upstream handshake completed.
    Opened,
    Control(ControlMessage),
    Audio(Bytes),
    Failed(UpstreamFailure),
    /// The upstream link is gone. Always the last event.
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub audio_upstream: u64,
    pub audio_downstream: u64,
    pub dropped_audio: u64,
    pub rejected_control: u64,
}

#[derive(Debug)]
pub struct SessionCoordinator {
    id: Uuid,
    created_at: DateTime<Utc>,
    phase: SessionPhase,
    source: SettingsSource,
    default_config: AgentConfiguration,
    pending_settings: Option<AgentConfiguration>,
    downstream_open: bool,
    upstream_open: bool,
    close_reason: Option<CloseReason>,
    stats: SessionStats,
}

impl SessionCoordinator {
    pub fn new(id: Uuid, source: SettingsSource, default_config: AgentConfiguration) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            phase: SessionPhase::Connecting,
            source,
            default_config,
            pending_settings: None,
            downstream_open: true,
            upstream_open: true,
            close_reason: None,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn downstream_open(&self) -> bool {
        self.downstream_open
    }

    pub fn upstream_open(&self) -> bool {
        self.upstream_open
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    /// Handles one frame read from the downstream peer.
    pub fn on_downstream_frame(&mut self, frame: Frame) -> Vec<Command> {
        if self.is_closing() {
            if frame.is_audio() {
                self.stats.dropped_audio += 1;
            }
            return Vec::new();
        }
        match frame {
            Frame::Audio(data) => {
                if self.phase == SessionPhase::Active {
                    self.stats.audio_upstream += 1;
                    vec![Command::ForwardAudioUpstream(data)]
                } else {
                    self.stats.dropped_audio += 1;
                    debug!(phase = ?self.phase, bytes = data.len(), "Dropping audio before the session is active");
                    Vec::new()
                }
            }
            Frame::Control(message) => match message.into_parts() {
                (ControlEnvelope::Settings(config), _) => self.on_client_settings(config),
                (envelope, _) => {
                    self.stats.rejected_control += 1;
                    warn!(kind = envelope.kind(), "Rejecting control message from client");
                    Vec::new()
                }
            },
        }
    }

    fn on_client_settings(&mut self, config: AgentConfiguration) -> Vec<Command> {
        match self.phase {
            SessionPhase::Connecting if self.pending_settings.is_none() => {
                info!("Client settings received before Welcome; holding them");
                self.pending_settings = Some(config);
                Vec::new()
            }
            SessionPhase::AwaitingConfig => self.apply(config),
            _ => {
                self.stats.rejected_control += 1;
                warn!(phase = ?self.phase, "Settings already supplied for this session; ignoring");
                Vec::new()
            }
        }
    }

    fn apply(&mut self, config: AgentConfiguration) -> Vec<Command> {
        info!("Applying agent configuration");
        self.phase = SessionPhase::Active;
        vec![Command::ApplyConfiguration(config)]
    }

    /// The downstream socket closed or failed.
    pub fn on_downstream_closed(&mut self) -> Vec<Command> {
        self.downstream_open = false;
        self.begin_closing(CloseReason::DownstreamClosed)
    }

    /// Handles one event from the upstream adapter.
    pub fn on_upstream_event(&mut self, event: UpstreamEvent) -> Vec<Command> {
        match event {
            UpstreamEvent::Opened => {
                info!("Upstream connection established");
                Vec::new()
            }
            UpstreamEvent::Control(message) => self.on_upstream_control(message),
            UpstreamEvent::Audio(data) => {
                if self.is_closing() || !self.downstream_open {
                    return Vec::new();
                }
                self.stats.audio_downstream += 1;
                vec![Command::SendDownstream(Frame::Audio(data))]
            }
            UpstreamEvent::Failed(failure) => self.on_upstream_failure(failure),
            UpstreamEvent::Closed => {
                self.upstream_open = false;
                self.begin_closing(CloseReason::UpstreamClosed)
            }
        }
    }

    fn on_upstream_control(&mut self, message: ControlMessage) -> Vec<Command> {
        if matches!(message.envelope(), ControlEnvelope::Error { .. }) {
            return self.on_upstream_error(message);
        }
        if self.is_closing() {
            return Vec::new();
        }

        let is_welcome = matches!(message.envelope(), ControlEnvelope::Welcome { .. });
        let is_warning = matches!(message.envelope(), ControlEnvelope::Warning { .. });
        if let ControlEnvelope::ConversationText { role, content } = message.envelope() {
            info!(%role, %content, "Conversation text");
        } else {
            debug!(kind = message.kind(), "Forwarding agent event");
        }

        let mut commands = if is_warning {
            warn!(text = message.text(), "Agent warning");
            self.relay_normalized(message)
        } else {
            vec![Command::SendDownstream(Frame::Control(message))]
        };
        if is_welcome {
            commands.extend(self.on_welcome());
        }
        commands
    }

    fn on_welcome(&mut self) -> Vec<Command> {
        if self.phase != SessionPhase::Connecting {
            warn!(phase = ?self.phase, "Duplicate Welcome from agent");
            return Vec::new();
        }
        self.phase = SessionPhase::AwaitingConfig;
        info!("Agent welcomed");

        let config = match (self.pending_settings.take(), self.source) {
            (Some(client), _) => Some(client),
            (None, SettingsSource::Relay) => Some(self.default_config.clone()),
            (None, SettingsSource::Client) => {
                info!("Waiting for Settings from client");
                None
            }
        };
        config.map(|config| self.apply(config)).unwrap_or_default()
    }

    fn on_upstream_error(&mut self, message: ControlMessage) -> Vec<Command> {
        if !self.downstream_open || self.is_closing() {
            if message.envelope().is_closed_before_established() {
                info!("Agent disconnect handled (may not have been fully connected)");
            } else {
                error!(text = message.text(), "Agent error after client left");
            }
            return Vec::new();
        }
        error!(text = message.text(), "Agent error received");
        self.relay_normalized(message)
    }

    fn on_upstream_failure(&mut self, failure: UpstreamFailure) -> Vec<Command> {
        if !self.downstream_open || self.is_closing() {
            if failure.is_closed_before_established() {
                info!("Agent disconnect handled (may not have been fully connected)");
            } else {
                warn!(message = %failure.message, "Agent failure after client left");
            }
            return Vec::new();
        }
        error!(message = %failure.message, code = ?failure.code, "Agent connection failed");
        let envelope = ControlEnvelope::error(
            failure.message,
            failure.code.unwrap_or_else(|| DEFAULT_ERROR_CODE.to_string()),
        );
        self.relay_envelope(envelope)
    }

    fn relay_normalized(&mut self, message: ControlMessage) -> Vec<Command> {
        let (envelope, _) = message.into_parts();
        self.relay_envelope(envelope.normalized())
    }

    fn relay_envelope(&mut self, envelope: ControlEnvelope) -> Vec<Command> {
        match ControlMessage::from_envelope(envelope) {
            Ok(message) => vec![Command::SendDownstream(Frame::Control(message))],
            Err(e) => {
                error!(error = %e, "Dropping envelope that failed to encode");
                Vec::new()
            }
        }
    }

    /// The process is shutting down.
    pub fn shutdown(&mut self) -> Vec<Command> {
        self.begin_closing(CloseReason::Shutdown)
    }

    /// A leg's outbound queue is full.
    pub fn on_saturated(&mut self, reason: CloseReason) -> Vec<Command> {
        warn!(?reason, "Outbound queue saturated; closing session");
        self.begin_closing(reason)
    }

    /// The closing grace period elapsed without both legs confirming.
    pub fn force_closed(&mut self) {
        if self.phase != SessionPhase::Closed {
            warn!(
                downstream_open = self.downstream_open,
                upstream_open = self.upstream_open,
                "Session close timed out; releasing remaining leg"
            );
        }
        self.downstream_open = false;
        self.upstream_open = false;
        self.phase = SessionPhase::Closed;
    }

    fn begin_closing(&mut self, reason: CloseReason) -> Vec<Command> {
        let mut commands = Vec::new();
        if !self.is_closing() {
            info!(?reason, "Session closing");
            self.phase = SessionPhase::Closing;
            self.close_reason = Some(reason);
            if self.upstream_open {
                commands.push(Command::DisconnectUpstream);
            }
            if self.downstream_open {
                commands.push(Command::CloseDownstream);
            }
        }
        if self.phase == SessionPhase::Closing && !self.upstream_open && !self.downstream_open {
            self.phase = SessionPhase::Closed;
            info!(stats = ?self.stats, "Session closed");
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::AgentDefaults;
    use serde_json::json;

    fn coordinator(source: SettingsSource) -> SessionCoordinator {
        SessionCoordinator::new(
            Uuid::new_v4(),
            source,
            AgentConfiguration::from_defaults(&AgentDefaults::default()),
        )
    }

    fn control(value: serde_json::Value) -> ControlMessage {
        match Frame::from_text(&value.to_string()) {
            Frame::Control(message) => message,
            Frame::Audio(_) => panic!("not a control message: {value}"),
        }
    }

    fn welcome() -> UpstreamEvent {
        UpstreamEvent::Control(control(json!({ "type": "Welcome", "request_id": "r-1" })))
    }

    fn client_settings() -> Frame {
        Frame::Control(control(
            json!({ "type": "Settings", "sampleRate": 24000, "encoding": "linear16" }),
        ))
    }

    fn applied(commands: &[Command]) -> Vec<&AgentConfiguration> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::ApplyConfiguration(config) => Some(config),
                _ => None,
            })
            .collect()
    }

    fn activate(session: &mut SessionCoordinator) {
        session.on_upstream_event(welcome());
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn relay_default_is_applied_after_welcome() {
        let mut session = coordinator(SettingsSource::Relay);
        let commands = session.on_upstream_event(welcome());

        assert!(matches!(&commands[0], Command::SendDownstream(Frame::Control(m)) if m.kind() == "Welcome"));
        let configs = applied(&commands);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].output_sample_rate(), Some(24_000));
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn early_client_settings_wait_for_welcome() {
        let mut session = coordinator(SettingsSource::Client);

        let commands = session.on_downstream_frame(client_settings());
        assert!(commands.is_empty());
        assert_eq!(session.phase(), SessionPhase::Connecting);

        let commands = session.on_upstream_event(welcome());
        let configs = applied(&commands);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].extra["sampleRate"], 24000);
        assert_eq!(configs[0].extra["encoding"], "linear16");
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn early_client_settings_take_precedence_over_default() {
        let mut session = coordinator(SettingsSource::Relay);
        session.on_downstream_frame(client_settings());

        let commands = session.on_upstream_event(welcome());
        let configs = applied(&commands);
        assert_eq!(configs.len(), 1);
        assert!(configs[0].audio.is_none());
    }

    #[test]
    fn client_mode_waits_in_awaiting_config() {
        let mut session = coordinator(SettingsSource::Client);
        let commands = session.on_upstream_event(welcome());
        assert!(applied(&commands).is_empty());
        assert_eq!(session.phase(), SessionPhase::AwaitingConfig);

        let commands = session.on_downstream_frame(client_settings());
        assert_eq!(applied(&commands).len(), 1);
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn configuration_is_applied_once() {
        let mut session = coordinator(SettingsSource::Relay);
        activate(&mut session);

        assert!(session.on_downstream_frame(client_settings()).is_empty());
        assert_eq!(session.stats().rejected_control, 1);
    }

    #[test]
    fn configuration_never_precedes_welcome() {
        let mut session = coordinator(SettingsSource::Relay);
        let before = session.on_downstream_frame(client_settings());
        let audio = session.on_downstream_frame(Frame::Audio(Bytes::from_static(&[1, 2])));
        assert!(applied(&before).is_empty());
        assert!(audio.is_empty());
        assert_eq!(session.stats().dropped_audio, 1);
    }

    #[test]
    fn active_audio_is_forwarded_unchanged() {
        let mut session = coordinator(SettingsSource::Relay);
        activate(&mut session);

        let pcm: Vec<u8> = (0..2048i16).flat_map(|s| s.to_le_bytes()).collect();
        let data = Bytes::from(pcm);
        let commands = session.on_downstream_frame(Frame::from_binary(data.clone()));
        assert_eq!(commands, vec![Command::ForwardAudioUpstream(data)]);
        assert_eq!(session.stats().audio_upstream, 1);
    }

    #[test]
    fn other_client_control_messages_are_rejected() {
        let mut session = coordinator(SettingsSource::Relay);
        activate(&mut session);

        let keepalive = Frame::Control(control(json!({ "type": "KeepAlive" })));
        let unknown = Frame::Control(control(json!({ "type": "InjectAgentMessage" })));
        assert!(session.on_downstream_frame(keepalive).is_empty());
        assert!(session.on_downstream_frame(unknown).is_empty());
        assert_eq!(session.stats().rejected_control, 2);
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn upstream_events_keep_their_text_and_order() {
        let mut session = coordinator(SettingsSource::Relay);
        activate(&mut session);

        let text = json!({ "type": "ConversationText", "role": "assistant", "content": "Hi" });
        let mut forwarded = Vec::new();
        forwarded.extend(session.on_upstream_event(UpstreamEvent::Control(control(text.clone()))));
        forwarded.extend(session.on_upstream_event(UpstreamEvent::Audio(Bytes::from_static(&[9, 9]))));
        forwarded.extend(session.on_upstream_event(UpstreamEvent::Control(control(
            json!({ "type": "AgentAudioDone" }),
        ))));

        assert_eq!(forwarded.len(), 3);
        assert!(matches!(&forwarded[0], Command::SendDownstream(Frame::Control(m)) if m.text() == text.to_string()));
        assert!(matches!(&forwarded[1], Command::SendDownstream(Frame::Audio(_))));
        assert!(matches!(&forwarded[2], Command::SendDownstream(Frame::Control(m)) if m.kind() == "AgentAudioDone"));
    }

    #[test]
    fn upstream_error_is_normalized() {
        let mut session = coordinator(SettingsSource::Relay);
        activate(&mut session);

        let commands = session.on_upstream_event(UpstreamEvent::Control(control(
            json!({ "type": "Error", "message": "bad settings" }),
        )));
        let [Command::SendDownstream(Frame::Control(message))] = commands.as_slice() else {
            panic!("expected a single forwarded error, got {commands:?}");
        };
        assert_eq!(
            message.envelope(),
            &ControlEnvelope::error("bad settings", "UNKNOWN_ERROR")
        );
    }

    #[test]
    fn connect_failure_is_reported_then_session_closes() {
        let mut session = coordinator(SettingsSource::Relay);
        let commands = session.on_upstream_event(UpstreamEvent::Failed(UpstreamFailure::new(
            "connection refused",
            "UPSTREAM_CONNECT_FAILED",
        )));
        let [Command::SendDownstream(Frame::Control(message))] = commands.as_slice() else {
            panic!("expected an error envelope");
        };
        assert_eq!(
            message.envelope(),
            &ControlEnvelope::error("connection refused", "UPSTREAM_CONNECT_FAILED")
        );

        let commands = session.on_upstream_event(UpstreamEvent::Closed);
        assert_eq!(commands, vec![Command::CloseDownstream]);
        assert_eq!(session.phase(), SessionPhase::Closing);

        assert!(session.on_downstream_closed().is_empty());
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[test]
    fn race_error_after_client_left_is_suppressed() {
        let mut session = coordinator(SettingsSource::Relay);

        let commands = session.on_downstream_closed();
        assert_eq!(commands, vec![Command::DisconnectUpstream]);
        assert_eq!(session.phase(), SessionPhase::Closing);

        let race = UpstreamEvent::Control(control(
            json!({ "type": "Error", "message": CLOSED_BEFORE_ESTABLISHED }),
        ));
        assert!(session.on_upstream_event(race).is_empty());
        assert!(
            session
                .on_upstream_event(UpstreamEvent::Failed(UpstreamFailure::closed_before_established()))
                .is_empty()
        );
        assert!(session.on_upstream_event(UpstreamEvent::Closed).is_empty());
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[test]
    fn nothing_reaches_the_client_once_closed() {
        let mut session = coordinator(SettingsSource::Relay);
        activate(&mut session);
        session.on_downstream_closed();
        session.on_upstream_event(UpstreamEvent::Closed);
        assert!(session.is_closed());

        assert!(session.on_upstream_event(UpstreamEvent::Audio(Bytes::from_static(&[1, 2]))).is_empty());
        assert!(session.on_upstream_event(welcome()).is_empty());
        assert!(session.on_downstream_frame(Frame::Audio(Bytes::from_static(&[1]))).is_empty());
        assert_eq!(session.stats().audio_downstream, 0);
    }

    #[test]
    fn closing_twice_has_no_effect() {
        let mut session = coordinator(SettingsSource::Relay);
        activate(&mut session);

        let first = session.shutdown();
        assert_eq!(first, vec![Command::DisconnectUpstream, Command::CloseDownstream]);
        assert_eq!(session.close_reason(), Some(CloseReason::Shutdown));

        assert!(session.shutdown().is_empty());
        assert!(session.on_saturated(CloseReason::DownstreamSaturated).is_empty());
        assert_eq!(session.close_reason(), Some(CloseReason::Shutdown));

        session.on_downstream_closed();
        session.on_upstream_event(UpstreamEvent::Closed);
        assert!(session.is_closed());
        assert!(session.on_downstream_closed().is_empty());
        assert!(session.shutdown().is_empty());
        assert!(session.is_closed());
    }

    #[test]
    fn saturated_client_queue_tears_down_both_legs() {
        let mut session = coordinator(SettingsSource::Relay);
        activate(&mut session);

        let commands = session.on_saturated(CloseReason::DownstreamSaturated);
        assert_eq!(commands, vec![Command::DisconnectUpstream, Command::CloseDownstream]);
        assert_eq!(session.phase(), SessionPhase::Closing);
        assert_eq!(session.close_reason(), Some(CloseReason::DownstreamSaturated));
        assert!(
            session
                .on_upstream_event(UpstreamEvent::Audio(Bytes::from_static(&[1, 2])))
                .is_empty()
        );
    }

    #[test]
    fn upstream_close_closes_the_client() {
        let mut session = coordinator(SettingsSource::Relay);
        activate(&mut session);
        let commands = session.on_upstream_event(UpstreamEvent::Closed);
        assert_eq!(commands, vec![Command::CloseDownstream]);
        assert_eq!(session.close_reason(), Some(CloseReason::UpstreamClosed));
    }

    #[test]
    fn forced_close_releases_both_legs() {
        let mut session = coordinator(SettingsSource::Relay);
        session.shutdown();
        session.force_closed();
        assert!(session.is_closed());
        assert!(!session.downstream_open());
        assert!(!session.upstream_open());
    }
}
