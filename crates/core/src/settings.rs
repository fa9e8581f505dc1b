//! Agent configuration payload.
//!
//! The relay treats the configuration as mostly opaque: only the fields it
//! needs to build a default are modelled, and everything else a client sends
//! is carried through the `extra` maps so a forwarded `Settings` message loses
//! nothing on the way upstream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// System prompt of the default assistant persona.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Orbi, a helpful voice assistant with a calm and friendly personality. Your responses should be conversational, concise (1-2 sentences max, under 120 characters), and natural. You can listen and speak, and all your responses will be spoken aloud.

Guidelines:
- Keep responses brief and to the point
- Ask one follow-up question at a time if needed
- If a question is unclear, ask for clarification
- Maintain a warm, supportive tone
- Avoid repetition and stay engaging";

pub const DEFAULT_ENCODING: &str = "linear16";
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;
pub const DEFAULT_STT_MODEL: &str = "nova-3";
pub const DEFAULT_AGENT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TTS_MODEL: &str = "aura-2-thalia-en";
pub const DEFAULT_GREETING: &str = "Hello! How can I help you today?";

/// The negotiated settings for one upstream agent session.
///
/// Applied once per session; the session never changes it afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AgentConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSettings>,
    /// Fields the relay does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AudioSettings {
    pub input: AudioFormat,
    pub output: AudioFormat,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AgentSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<StageSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think: Option<StageSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speak: Option<StageSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One pipeline stage: listen (speech-to-text), think (language model) or
/// speak (text-to-speech). Only `think` normally carries a prompt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StageSettings {
    pub provider: ProviderSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProviderSettings {
    fn new(kind: &str, model: &str) -> Self {
        Self {
            kind: kind.to_string(),
            model: Some(model.to_string()),
            extra: Map::new(),
        }
    }
}

/// Inputs for the relay-driven default configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentDefaults {
    pub encoding: String,
    pub sample_rate: u32,
    pub stt_model: String,
    pub agent_model: String,
    pub tts_model: String,
    pub greeting: String,
    pub prompt: String,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            encoding: DEFAULT_ENCODING.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            stt_model: DEFAULT_STT_MODEL.to_string(),
            agent_model: DEFAULT_AGENT_MODEL.to_string(),
            tts_model: DEFAULT_TTS_MODEL.to_string(),
            greeting: DEFAULT_GREETING.to_string(),
            prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl AgentConfiguration {
    /// Builds the full configuration the relay applies when the client does
    /// not supply its own.
    pub fn from_defaults(defaults: &AgentDefaults) -> Self {
        let stage = |provider: ProviderSettings, prompt: Option<String>| StageSettings {
            provider,
            prompt,
            extra: Map::new(),
        };
        Self {
            audio: Some(AudioSettings {
                input: AudioFormat {
                    encoding: defaults.encoding.clone(),
                    sample_rate: defaults.sample_rate,
                    container: None,
                },
                output: AudioFormat {
                    encoding: defaults.encoding.clone(),
                    sample_rate: defaults.sample_rate,
                    container: Some("none".to_string()),
                },
            }),
            agent: Some(AgentSettings {
                listen: Some(stage(
                    ProviderSettings::new("deepgram", &defaults.stt_model),
                    None,
                )),
                think: Some(stage(
                    ProviderSettings::new("open_ai", &defaults.agent_model),
                    Some(defaults.prompt.clone()),
                )),
                speak: Some(stage(
                    ProviderSettings::new("deepgram", &defaults.tts_model),
                    None,
                )),
                greeting: Some(defaults.greeting.clone()),
                extra: Map::new(),
            }),
            extra: Map::new(),
        }
    }

    /// Output sample rate, if the configuration states one.
    pub fn output_sample_rate(&self) -> Option<u32> {
        self.audio.as_ref().map(|audio| audio.output.sample_rate)
    }
}
