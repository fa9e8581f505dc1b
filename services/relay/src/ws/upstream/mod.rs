//! Upstream session adapter: one agent connection per client session.
//!
//! [`open`] returns immediately with a handle and an event receiver; the
//! connection itself is made by a spawned task. Commands flow to that task
//! over a bounded channel, and every upstream message comes back as a
//! normalized [`UpstreamEvent`]. The event stream always ends with
//! [`UpstreamEvent::Closed`].

pub mod deepgram;

use crate::state::AppState;
use bytes::Bytes;
use orbi_core::{
    session::{UpstreamEvent, UpstreamFailure},
    settings::AgentConfiguration,
};
use std::sync::{
    Arc,
    atomic::{AtomicU8, AtomicU64, Ordering},
};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info_span};
use uuid::Uuid;

/// Commands buffered towards one upstream connection.
pub const COMMAND_QUEUE: usize = 64;
/// Events buffered from one upstream connection.
pub const EVENT_QUEUE: usize = 64;

/// An internal command passed to the upstream connection task.
#[derive(Debug)]
pub enum AgentCommand {
    /// Raw client audio.
    Audio(Bytes),
    /// Configuration to send once the agent is ready.
    Configure(AgentConfiguration),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream link is closed")]
    Closed,
    #[error("upstream command queue is full")]
    Saturated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

/// Link state shared between the handle and the connection task.
#[derive(Debug)]
pub struct SharedLink {
    state: AtomicU8,
    dropped_audio: AtomicU64,
}

impl SharedLink {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(LinkState::Connecting as u8),
            dropped_audio: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> LinkState {
        match self.state.load(Ordering::SeqCst) {
            0 => LinkState::Connecting,
            1 => LinkState::Open,
            2 => LinkState::Closing,
            _ => LinkState::Closed,
        }
    }

    pub(crate) fn set(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn count_dropped(&self) {
        self.dropped_audio.fetch_add(1, Ordering::Relaxed);
    }
}

/// The session's handle on its upstream connection.
///
/// Dropping the command sender is the disconnect signal: the connection task
/// flushes whatever was queued, closes the socket and emits `Closed`.
#[derive(Debug)]
pub struct UpstreamHandle {
    tx: Option<mpsc::Sender<AgentCommand>>,
    link: Arc<SharedLink>,
}

impl UpstreamHandle {
    /// Forwards raw audio. Audio is dropped and counted while the link is not
    /// open; a full queue is reported so the caller can close the session.
    pub fn send_audio(&self, data: Bytes) -> Result<(), UpstreamError> {
        let Some(tx) = self.tx.as_ref().filter(|_| self.link.state() == LinkState::Open) else {
            self.link.count_dropped();
            debug!(state = ?self.link.state(), "Upstream not open; dropping audio");
            return Ok(());
        };
        match tx.try_send(AgentCommand::Audio(data)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.link.count_dropped();
                Err(UpstreamError::Saturated)
            }
            Err(TrySendError::Closed(_)) => {
                self.link.count_dropped();
                Ok(())
            }
        }
    }

    /// Queues the session configuration. The connection task holds it until
    /// the agent's `Welcome` and rejects any second configuration.
    pub fn apply_configuration(&self, config: AgentConfiguration) -> Result<(), UpstreamError> {
        let tx = self.tx.as_ref().ok_or(UpstreamError::Closed)?;
        tx.try_send(AgentCommand::Configure(config))
            .map_err(|e| match e {
                TrySendError::Full(_) => UpstreamError::Saturated,
                TrySendError::Closed(_) => UpstreamError::Closed,
            })
    }

    /// Best-effort teardown. Calling it again does nothing.
    pub fn disconnect(&mut self) {
        if self.tx.take().is_some() && self.link.state() != LinkState::Closed {
            self.link.set(LinkState::Closing);
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn dropped_audio(&self) -> u64 {
        self.link.dropped_audio.load(Ordering::Relaxed)
    }

    /// A handle with no connection task behind it; commands land on the
    /// returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(
        capacity: usize,
        state: LinkState,
    ) -> (Self, mpsc::Receiver<AgentCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        let link = Arc::new(SharedLink::new());
        link.set(state);
        (Self { tx: Some(tx), link }, rx)
    }
}

/// Starts the upstream connection for a session without waiting for it.
pub fn open(
    state: Arc<AppState>,
    session_id: Uuid,
) -> (UpstreamHandle, mpsc::Receiver<UpstreamEvent>, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let link = Arc::new(SharedLink::new());

    let task_link = link.clone();
    let span = info_span!("upstream", %session_id);
    let handle = tokio::spawn(
        async move {
            if let Err(e) = deepgram::run(&state, command_rx, event_tx.clone(), &task_link).await {
                if event_tx.is_closed() {
                    debug!(error = %e, "Session went away before the upstream task finished");
                } else {
                    error!(error = ?e, "Upstream task failed");
                    let failure = UpstreamFailure::new(format!("{:#}", e), "UPSTREAM_ERROR");
                    let _ = event_tx.send(UpstreamEvent::Failed(failure)).await;
                }
            }
            task_link.set(LinkState::Closed);
            let _ = event_tx.send(UpstreamEvent::Closed).await;
        }
        .instrument(span),
    );

    (
        UpstreamHandle {
            tx: Some(command_tx),
            link,
        },
        event_rx,
        handle,
    )
}
