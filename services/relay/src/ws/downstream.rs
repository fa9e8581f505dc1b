//! The client-facing half of a session.
//!
//! Frames are queued on a bounded channel and written by a dedicated task, so
//! the session loop never waits on a slow client.

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use orbi_core::codec::Frame;
use std::fmt::Display;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::debug;

/// Frames buffered towards one client.
pub const DOWNSTREAM_QUEUE: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DownstreamError {
    #[error("downstream send queue is full")]
    Saturated,
}

#[derive(Debug)]
pub struct DownstreamSender {
    tx: Option<mpsc::Sender<Message>>,
}

impl DownstreamSender {
    /// Queues a frame. Frames sent after [`close`](Self::close), or after the
    /// writer has stopped, are discarded.
    pub fn send(&self, frame: Frame) -> Result<(), DownstreamError> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        match tx.try_send(into_message(frame)) {
            Ok(()) | Err(TrySendError::Closed(_)) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DownstreamError::Saturated),
        }
    }

    /// Lets the writer flush what is queued, then close the socket.
    pub fn close(&mut self) {
        self.tx = None;
    }

    #[cfg(test)]
    pub(crate) fn with_channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Audio(data) => Message::Binary(data),
        Frame::Control(message) => {
            let (_, text) = message.into_parts();
            Message::Text(text.into())
        }
    }
}

/// Spawns the writer task for a client socket.
pub fn spawn_writer<S>(mut sink: S, capacity: usize) -> (DownstreamSender, JoinHandle<()>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
{
    let (tx, mut rx) = mpsc::channel::<Message>(capacity);
    let handle = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = sink.send(message).await {
                debug!(error = %e, "Client socket closed while writing");
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    });
    (DownstreamSender { tx: Some(tx) }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use orbi_core::{codec::ControlMessage, envelope::ControlEnvelope};
    use std::convert::Infallible;

    fn collecting_sink() -> (
        impl Sink<Message, Error = Infallible> + Unpin + Send + 'static,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Box::pin(futures_util::sink::unfold(tx, |tx, message: Message| async move {
            let _ = tx.send(message);
            Ok::<_, Infallible>(tx)
        }));
        (sink, rx)
    }

    #[tokio::test]
    async fn frames_are_written_in_order_then_closed() {
        let (sink, mut written) = collecting_sink();
        let (mut sender, writer) = spawn_writer(sink, 8);

        let welcome =
            ControlMessage::from_envelope(ControlEnvelope::Welcome { request_id: None }).unwrap();
        sender.send(Frame::Control(welcome)).unwrap();
        sender.send(Frame::Audio(Bytes::from_static(&[1, 2, 3]))).unwrap();
        sender.close();
        writer.await.unwrap();

        assert!(matches!(written.recv().await, Some(Message::Text(text)) if text.as_str() == r#"{"type":"Welcome"}"#));
        assert!(matches!(written.recv().await, Some(Message::Binary(data)) if data.as_ref() == [1u8, 2, 3]));
        assert!(matches!(written.recv().await, Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let (sender, _rx) = DownstreamSender::with_channel(1);
        sender.send(Frame::Audio(Bytes::from_static(&[1]))).unwrap();
        assert_eq!(
            sender.send(Frame::Audio(Bytes::from_static(&[2]))),
            Err(DownstreamError::Saturated)
        );
    }

    #[test]
    fn sending_after_close_is_a_no_op() {
        let (mut sender, mut rx) = DownstreamSender::with_channel(1);
        sender.close();
        assert_eq!(sender.send(Frame::Audio(Bytes::from_static(&[1]))), Ok(()));
        assert!(rx.try_recv().is_err());
    }
}
