//! Orbi Relay Library Crate
//!
//! Bridges browser WebSocket sessions to the Deepgram voice agent. The
//! `relay` binary is a thin wrapper around [`server::start`].

pub mod config;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;
