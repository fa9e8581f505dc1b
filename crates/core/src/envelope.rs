//! Control envelopes exchanged on both legs of a session.

use crate::settings::AgentConfiguration;
use serde::{Deserialize, Serialize};

/// Message text the upstream reports when its socket is torn down before the
/// handshake finished.
pub const CLOSED_BEFORE_ESTABLISHED: &str =
    "WebSocket was closed before the connection was established";

pub const DEFAULT_ERROR_DESCRIPTION: &str = "An error occurred";
pub const DEFAULT_ERROR_CODE: &str = "UNKNOWN_ERROR";
pub const DEFAULT_WARNING_DESCRIPTION: &str = "A warning occurred";
pub const DEFAULT_WARNING_CODE: &str = "UNKNOWN_WARNING";

/// A typed JSON control message, discriminated by its `type` field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ControlEnvelope {
    /// The upstream is ready to receive configuration.
    Welcome {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    SettingsApplied,
    /// Full agent configuration, sent by the downstream peer or the relay.
    Settings(AgentConfiguration),
    ConversationText {
        #[serde(default)]
        role: String,
        #[serde(default)]
        content: String,
    },
    UserStartedSpeaking,
    AgentThinking {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    AgentStartedSpeaking {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_latency: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tts_latency: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttt_latency: Option<f64>,
    },
    AgentAudioDone,
    /// Sent upstream to hold an idle session open.
    KeepAlive,
    Warning {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Any discriminator this relay does not model, or a known one whose body
    /// did not parse. Never serialized; callers forward the original text.
    #[serde(skip)]
    Other { kind: String },
}

impl ControlEnvelope {
    /// The `type` discriminator.
    pub fn kind(&self) -> &str {
        match self {
            Self::Welcome { .. } => "Welcome",
            Self::SettingsApplied => "SettingsApplied",
            Self::Settings(_) => "Settings",
            Self::ConversationText { .. } => "ConversationText",
            Self::UserStartedSpeaking => "UserStartedSpeaking",
            Self::AgentThinking { .. } => "AgentThinking",
            Self::AgentStartedSpeaking { .. } => "AgentStartedSpeaking",
            Self::AgentAudioDone => "AgentAudioDone",
            Self::KeepAlive => "KeepAlive",
            Self::Warning { .. } => "Warning",
            Self::Error { .. } => "Error",
            Self::Other { kind } => kind,
        }
    }

    /// An `Error` in the shape delivered to the downstream peer.
    pub fn error(description: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Error {
            description: Some(description.into()),
            message: None,
            code: Some(code.into()),
        }
    }

    /// Rewrites `Error` and `Warning` into `{type, description, code}` with
    /// best-effort defaults. Other envelopes are returned unchanged.
    pub fn normalized(self) -> Self {
        match self {
            Self::Error {
                description,
                message,
                code,
            } => Self::Error {
                description: Some(
                    description
                        .or(message)
                        .unwrap_or_else(|| DEFAULT_ERROR_DESCRIPTION.to_string()),
                ),
                message: None,
                code: Some(code.unwrap_or_else(|| DEFAULT_ERROR_CODE.to_string())),
            },
            Self::Warning {
                description,
                message,
                code,
            } => Self::Warning {
                description: Some(
                    description
                        .or(message)
                        .unwrap_or_else(|| DEFAULT_WARNING_DESCRIPTION.to_string()),
                ),
                message: None,
                code: Some(code.unwrap_or_else(|| DEFAULT_WARNING_CODE.to_string())),
            },
            other => other,
        }
    }

    /// True for an `Error` reporting that the upstream closed before it was
    /// fully established.
    pub fn is_closed_before_established(&self) -> bool {
        match self {
            Self::Error {
                description,
                message,
                ..
            } => [description, message]
                .into_iter()
                .flatten()
                .any(|text| text == CLOSED_BEFORE_ESTABLISHED),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unit_variants_ignore_extra_fields() {
        let envelope: ControlEnvelope =
            serde_json::from_value(json!({ "type": "SettingsApplied", "extra": 1 })).unwrap();
        assert_eq!(envelope, ControlEnvelope::SettingsApplied);
        assert_eq!(envelope.kind(), "SettingsApplied");
    }

    #[test]
    fn conversation_text_parses() {
        let envelope: ControlEnvelope = serde_json::from_str(
            r#"{"type":"ConversationText","role":"assistant","content":"Hi there"}"#,
        )
        .unwrap();
        assert_eq!(
            envelope,
            ControlEnvelope::ConversationText {
                role: "assistant".into(),
                content: "Hi there".into(),
            }
        );
    }

    #[test]
    fn settings_serializes_with_discriminator() {
        let envelope = ControlEnvelope::Settings(AgentConfiguration::default());
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value, json!({ "type": "Settings" }));
    }

    #[test]
    fn error_normalization_prefers_description_then_message() {
        let from_message = ControlEnvelope::Error {
            description: None,
            message: Some("boom".into()),
            code: None,
        }
        .normalized();
        assert_eq!(from_message, ControlEnvelope::error("boom", "UNKNOWN_ERROR"));

        let bare = ControlEnvelope::Error {
            description: None,
            message: None,
            code: Some("E42".into()),
        }
        .normalized();
        assert_eq!(bare, ControlEnvelope::error("An error occurred", "E42"));

        let value = serde_json::to_value(&bare).unwrap();
        assert_eq!(
            value,
            json!({ "type": "Error", "description": "An error occurred", "code": "E42" })
        );
    }

    #[test]
    fn error_code_never_falls_back_to_the_discriminator() {
        let envelope: ControlEnvelope = serde_json::from_str(r#"{"type":"Error"}"#).unwrap();
        let value = serde_json::to_value(envelope.normalized()).unwrap();
        assert_eq!(
            value,
            json!({ "type": "Error", "description": "An error occurred", "code": "UNKNOWN_ERROR" })
        );
    }

    #[test]
    fn warning_normalization_fills_defaults() {
        let warning = ControlEnvelope::Warning {
            description: None,
            message: Some("slow down".into()),
            code: None,
        }
        .normalized();
        let value = serde_json::to_value(&warning).unwrap();
        assert_eq!(
            value,
            json!({ "type": "Warning", "description": "slow down", "code": "UNKNOWN_WARNING" })
        );
    }

    #[test]
    fn detects_closed_before_established() {
        let race = ControlEnvelope::Error {
            description: None,
            message: Some(CLOSED_BEFORE_ESTABLISHED.into()),
            code: None,
        };
        assert!(race.is_closed_before_established());
        assert!(!ControlEnvelope::error("other", "X").is_closed_before_established());
        assert!(!ControlEnvelope::AgentAudioDone.is_closed_before_established());
    }
}
