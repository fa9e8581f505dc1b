//! Headless client for end-to-end checks against a running relay.
//!
//! Streams a raw PCM16 file at capture pace, plays the agent's audio on a
//! simulated clock, and writes what was played to an output file.

mod player;

use anyhow::{Context, bail};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use orbi_core::{
    capture::{CAPTURE_FRAME_SAMPLES, CaptureStreamer},
    codec::Frame,
    envelope::ControlEnvelope,
    pcm,
    playback::PLAYBACK_SAMPLE_RATE,
};
use player::Player;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::time::{Instant, interval, sleep_until};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Orbi probe - scripted voice session against the relay
#[derive(Parser, Debug)]
#[command(name = "orbi-probe")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Relay WebSocket URL
    #[arg(short = 'u', long = "url", default_value = "ws://127.0.0.1:3000/agent/converse")]
    url: String,

    /// Raw PCM16 little-endian mono audio to send
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    input: PathBuf,

    /// Where to write the played agent audio (raw PCM16, 24 kHz)
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: PathBuf,

    /// JSON `Settings` message to send before any audio
    #[arg(short = 's', long = "settings", value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Sample rate of the input file
    #[arg(long = "capture-rate", default_value_t = 24_000)]
    capture_rate: u32,

    /// Seconds to keep listening once the input is exhausted
    #[arg(long = "linger", default_value_t = 5)]
    linger: u64,

    /// Maximum log level
    #[arg(long = "log-level", default_value = "info")]
    log_level: tracing::Level,
}

/// Reads and checks the optional `Settings` file.
async fn load_settings(path: &Path) -> anyhow::Result<String> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    match Frame::from_text(&text) {
        Frame::Control(message) if matches!(message.envelope(), ControlEnvelope::Settings(_)) => {
            Ok(text)
        }
        _ => bail!("{} is not a Settings message", path.display()),
    }
}

fn log_event(text: &str) {
    let Frame::Control(message) = Frame::from_text(text) else {
        warn!(bytes = text.len(), "Relay sent a text frame that is not a control message");
        return;
    };
    match message.envelope() {
        ControlEnvelope::ConversationText { role, content } => info!(%role, %content, "Conversation"),
        ControlEnvelope::Error { description, code, .. } => {
            error!(?description, ?code, "Relay reported an error")
        }
        ControlEnvelope::Warning { description, code, .. } => {
            warn!(?description, ?code, "Relay reported a warning")
        }
        other => info!(kind = other.kind(), "Agent event"),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let input = tokio::fs::read(&cli.input)
        .await
        .with_context(|| format!("Failed to read input from {}", cli.input.display()))?;
    let samples = pcm::decode_le(&input);
    let settings = match &cli.settings {
        Some(path) => Some(load_settings(path).await?),
        None => None,
    };

    let (socket, _) = connect_async(cli.url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", cli.url))?;
    info!(url = %cli.url, "Connected to relay");
    let (mut relay_tx, mut relay_rx) = socket.split();

    if let Some(text) = settings {
        relay_tx.send(Message::text(text)).await?;
    }

    let mut streamer = CaptureStreamer::default();
    let mut player = Player::new(PLAYBACK_SAMPLE_RATE);
    let mut blocks = samples.chunks(CAPTURE_FRAME_SAMPLES);
    let mut capture_tick = interval(pcm::duration_of(CAPTURE_FRAME_SAMPLES, cli.capture_rate));
    let mut playback_tick = interval(Duration::from_millis(10));
    let mut linger_until: Option<Instant> = None;

    loop {
        let deadline = linger_until.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            _ = capture_tick.tick(), if linger_until.is_none() => match blocks.next() {
                Some(block) => {
                    if let Some(frame) = streamer.push(block, std::time::Instant::now()) {
                        relay_tx.send(Message::binary(frame)).await?;
                    }
                }
                None => {
                    info!(
                        sent = streamer.emitted(),
                        discarded = streamer.discarded(),
                        "Input exhausted"
                    );
                    linger_until = Some(Instant::now() + Duration::from_secs(cli.linger));
                }
            },
            _ = playback_tick.tick() => player.advance(std::time::Instant::now()),
            message = relay_rx.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    debug!(bytes = data.len(), "Agent audio");
                    player.receive(data, std::time::Instant::now());
                }
                Some(Ok(Message::Text(text))) => log_event(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Relay closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("Relay connection failed"),
                None => break,
            },
            _ = sleep_until(deadline), if linger_until.is_some() => {
                info!("Done listening; disconnecting");
                let _ = relay_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    player.advance(std::time::Instant::now());
    player.stop();
    tokio::fs::write(&cli.output, pcm::encode_le(player.played()))
        .await
        .with_context(|| format!("Failed to write output to {}", cli.output.display()))?;
    info!(
        chunks = player.chunks_played(),
        samples = player.played().len(),
        output = %cli.output.display(),
        "Wrote played audio"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    // Needed before any wss:// connection.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["orbi-probe", "-i", "in.pcm", "-o", "out.pcm"]);
        assert_eq!(cli.url, "ws://127.0.0.1:3000/agent/converse");
        assert_eq!(cli.capture_rate, 24_000);
        assert_eq!(cli.linger, 5);
        assert_eq!(cli.log_level, tracing::Level::INFO);
        assert!(cli.settings.is_none());
    }

    #[tokio::test]
    async fn settings_file_must_hold_a_settings_message() {
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("settings.json");
        tokio::fs::write(&good, r#"{"type":"Settings","agent":{"greeting":"Hi"}}"#)
            .await
            .unwrap();
        assert!(load_settings(&good).await.is_ok());

        let bad = dir.path().join("keepalive.json");
        tokio::fs::write(&bad, r#"{"type":"KeepAlive"}"#).await.unwrap();
        assert!(load_settings(&bad).await.is_err());
    }
}
