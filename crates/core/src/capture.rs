//! Microphone capture framing.
//!
//! Samples are batched into fixed-size frames. A completed frame is emitted
//! only if the previous emission is at least `min_interval` old; otherwise it
//! is discarded, so a fast capture device can never build up a backlog.

use crate::pcm;
use bytes::Bytes;
use std::time::{Duration, Instant};

pub const CAPTURE_FRAME_SAMPLES: usize = 2048;
pub const MIN_SEND_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct CaptureStreamer {
    frame_samples: usize,
    min_interval: Duration,
    buffer: Vec<f32>,
    last_sent: Option<Instant>,
    emitted: u64,
    discarded: u64,
}

impl Default for CaptureStreamer {
    fn default() -> Self {
        Self::new(CAPTURE_FRAME_SAMPLES, MIN_SEND_INTERVAL)
    }
}

impl CaptureStreamer {
    pub fn new(frame_samples: usize, min_interval: Duration) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            min_interval,
            buffer: Vec::with_capacity(frame_samples),
            last_sent: None,
            emitted: 0,
            discarded: 0,
        }
    }

    /// Feeds captured samples observed at `now`.
    ///
    /// Returns at most one PCM16 frame. Any other frame completed by this
    /// call is dropped.
    pub fn push(&mut self, samples: &[f32], now: Instant) -> Option<Bytes> {
        let mut out = None;
        for &sample in samples {
            self.buffer.push(sample);
            if self.buffer.len() < self.frame_samples {
                continue;
            }
            let due = self
                .last_sent
                .is_none_or(|last| now.duration_since(last) >= self.min_interval);
            if due && out.is_none() {
                out = Some(Bytes::from(pcm::encode_le(&self.buffer)));
                self.last_sent = Some(now);
                self.emitted += 1;
            } else {
                self.discarded += 1;
            }
            self.buffer.clear();
        }
        out
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}
