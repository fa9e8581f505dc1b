//! Transport-free core of the voice-agent relay.
//!
//! Nothing in this crate touches a socket. The relay service owns the
//! connections and drives the [`session::SessionCoordinator`]; the probe
//! client uses the capture and playback halves.

pub mod capture;
pub mod codec;
pub mod envelope;
pub mod pcm;
pub mod playback;
pub mod session;
pub mod settings;

use bytes::Bytes;
use codec::Frame;
use settings::AgentConfiguration;

/// Side effects the session coordinator asks the runtime to perform.
///
/// The coordinator decides; the runtime executes, in the order given.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Send client audio to the agent, byte for byte.
    ForwardAudioUpstream(Bytes),
    /// Configure the upstream agent session.
    ApplyConfiguration(AgentConfiguration),
    /// Deliver a frame to the client.
    SendDownstream(Frame),
    /// Best-effort teardown of the upstream link.
    DisconnectUpstream,
    /// Close the client socket after flushing queued frames.
    CloseDownstream,
}
