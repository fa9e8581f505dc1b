use orbi_core::{
    session::SettingsSource,
    settings::{
        AgentDefaults, DEFAULT_AGENT_MODEL, DEFAULT_ENCODING, DEFAULT_GREETING,
        DEFAULT_SAMPLE_RATE, DEFAULT_STT_MODEL, DEFAULT_SYSTEM_PROMPT, DEFAULT_TTS_MODEL,
    },
};
use secrecy::SecretString;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_AGENT_URL: &str = "wss://agent.deepgram.com/v1/agent/converse";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_KEEPALIVE_SECS: u64 = 8;
pub(crate) const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub api_key: SecretString,
    pub agent_url: String,
    pub settings_source: SettingsSource,
    pub agent_defaults: AgentDefaults,
    /// `None` disables keep-alive messages.
    pub keepalive_interval: Option<Duration>,
    pub shutdown_grace: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_key = std::env::var("DEEPGRAM_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("DEEPGRAM_API_KEY".to_string()))?;

        let bind_address = match std::env::var("BIND_ADDRESS") {
            Ok(address) => address
                .parse::<SocketAddr>()
                .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?,
            Err(_) => {
                let port = parse_var("PORT", DEFAULT_PORT)?;
                SocketAddr::from(([0, 0, 0, 0], port))
            }
        };

        let agent_url =
            std::env::var("AGENT_URL").unwrap_or_else(|_| DEFAULT_AGENT_URL.to_string());

        let source_str =
            std::env::var("AGENT_SETTINGS_SOURCE").unwrap_or_else(|_| "relay".to_string());
        let settings_source = match source_str.to_lowercase().as_str() {
            "relay" => SettingsSource::Relay,
            "client" => SettingsSource::Client,
            other => {
                return Err(ConfigError::InvalidValue(
                    "AGENT_SETTINGS_SOURCE".to_string(),
                    format!("'{}' is not one of 'relay' or 'client'", other),
                ));
            }
        };

        let agent_defaults = AgentDefaults {
            encoding: var_or("ENCODING", DEFAULT_ENCODING),
            sample_rate: parse_var("SAMPLE_RATE", DEFAULT_SAMPLE_RATE)?,
            stt_model: var_or("STT_MODEL", DEFAULT_STT_MODEL),
            agent_model: var_or("AGENT_MODEL", DEFAULT_AGENT_MODEL),
            tts_model: var_or("TTS_MODEL", DEFAULT_TTS_MODEL),
            greeting: var_or("AGENT_GREETING", DEFAULT_GREETING),
            prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        };

        let keepalive_secs = parse_var("KEEPALIVE_SECS", DEFAULT_KEEPALIVE_SECS)?;
        let keepalive_interval = (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs));

        let shutdown_grace =
            Duration::from_secs(parse_var("SHUTDOWN_GRACE_SECS", DEFAULT_SHUTDOWN_GRACE_SECS)?);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            api_key,
            agent_url,
            settings_source,
            agent_defaults,
            keepalive_interval,
            shutdown_grace,
            log_level,
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
