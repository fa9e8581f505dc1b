//! Sequential playback of audio chunks received from the relay.
//!
//! Chunks are played strictly in arrival order with at most one chunk playing
//! at a time. The queue is driven by two events: a chunk arriving and the
//! current chunk finishing. Arrival timing never reorders or overlaps output.

use crate::pcm;
use bytes::Bytes;
use std::{collections::VecDeque, time::Duration};

/// Output rate assumed for every chunk in a session.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
}

/// A decoded chunk ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    /// Position of the chunk in arrival order, starting at zero.
    pub sequence: u64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackChunk {
    pub fn duration(&self) -> Duration {
        pcm::duration_of(self.samples.len(), self.sample_rate)
    }
}

#[derive(Debug)]
pub struct PlaybackQueue {
    pending: VecDeque<(u64, Bytes)>,
    current: Option<u64>,
    sample_rate: u32,
    next_sequence: u64,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new(PLAYBACK_SAMPLE_RATE)
    }
}

impl PlaybackQueue {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            sample_rate,
            next_sequence: 0,
        }
    }

    /// Appends a chunk to the tail. If nothing is playing, the head starts
    /// immediately and is returned for output.
    pub fn enqueue(&mut self, chunk: Bytes) -> Option<PlaybackChunk> {
        self.pending.push_back((self.next_sequence, chunk));
        self.next_sequence += 1;
        match self.current {
            Some(_) => None,
            None => self.start_next(),
        }
    }

    /// Marks the current chunk finished and starts the next one, if any.
    /// With an empty queue the state returns to idle.
    pub fn complete(&mut self) -> Option<PlaybackChunk> {
        self.current = None;
        self.start_next()
    }

    /// Drops everything, including the chunk currently playing.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.current = None;
    }

    pub fn state(&self) -> PlaybackState {
        if self.current.is_some() {
            PlaybackState::Playing
        } else {
            PlaybackState::Idle
        }
    }

    /// Sequence number of the chunk currently playing.
    pub fn current(&self) -> Option<u64> {
        self.current
    }

    /// Chunks waiting behind the current one.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn start_next(&mut self) -> Option<PlaybackChunk> {
        let (sequence, data) = self.pending.pop_front()?;
        self.current = Some(sequence);
        Some(PlaybackChunk {
            sequence,
            samples: pcm::decode_le(&data),
            sample_rate: self.sample_rate,
        })
    }
}
