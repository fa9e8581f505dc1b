//! WebSocket session handling.
//!
//! - `session`: drives one client connection and its coordinator.
//! - `downstream`: the client-facing writer task.
//! - `upstream`: the connection to the voice agent.

mod downstream;
pub mod session;
pub mod upstream;

pub use session::ws_handler;
