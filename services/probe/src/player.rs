//! Plays received agent audio against a clock instead of a sound card.

use bytes::Bytes;
use orbi_core::playback::{PlaybackChunk, PlaybackQueue, PlaybackState};
use std::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct Player {
    queue: PlaybackQueue,
    playing_until: Option<Instant>,
    played: Vec<f32>,
    chunks_played: u64,
}

impl Player {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            queue: PlaybackQueue::new(sample_rate),
            playing_until: None,
            played: Vec::new(),
            chunks_played: 0,
        }
    }

    /// A chunk arrived from the relay at `now`.
    pub fn receive(&mut self, data: Bytes, now: Instant) {
        if let Some(chunk) = self.queue.enqueue(data) {
            self.start(chunk, now);
        }
    }

    /// Finishes every chunk whose playback has ended by `now`, starting the
    /// next one back to back.
    pub fn advance(&mut self, now: Instant) {
        while let Some(end) = self.playing_until {
            if now < end {
                break;
            }
            self.playing_until = None;
            if let Some(chunk) = self.queue.complete() {
                self.start(chunk, end);
            }
        }
    }

    /// Drops the current chunk and everything queued behind it.
    pub fn stop(&mut self) {
        self.queue.clear();
        self.playing_until = None;
    }

    fn start(&mut self, chunk: PlaybackChunk, at: Instant) {
        debug!(
            sequence = chunk.sequence,
            samples = chunk.samples.len(),
            "Playing chunk"
        );
        self.playing_until = Some(at + chunk.duration());
        self.played.extend_from_slice(&chunk.samples);
        self.chunks_played += 1;
    }

    pub fn state(&self) -> PlaybackState {
        self.queue.state()
    }

    /// Every sample that has started playing, in output order.
    pub fn played(&self) -> &[f32] {
        &self.played
    }

    pub fn chunks_played(&self) -> u64 {
        self.chunks_played
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbi_core::pcm;
    use std::time::Duration;

    fn chunk(value: i16, samples: usize) -> Bytes {
        Bytes::from(
            std::iter::repeat_n(value.to_le_bytes(), samples)
                .flatten()
                .collect::<Vec<u8>>(),
        )
    }

    #[test]
    fn chunks_play_back_to_back_in_arrival_order() {
        let start = Instant::now();
        let mut player = Player::new(1_000);

        // 100 ms each at 1 kHz.
        player.receive(chunk(1000, 100), start);
        player.receive(chunk(2000, 100), start + Duration::from_millis(10));
        player.receive(chunk(3000, 100), start + Duration::from_millis(20));
        assert_eq!(player.chunks_played(), 1);

        player.advance(start + Duration::from_millis(150));
        assert_eq!(player.chunks_played(), 2);
        assert_eq!(player.state(), PlaybackState::Playing);

        player.advance(start + Duration::from_millis(300));
        assert_eq!(player.chunks_played(), 3);
        assert_eq!(player.state(), PlaybackState::Idle);

        let played = player.played();
        assert_eq!(played.len(), 300);
        assert_eq!(played[0], pcm::sample_to_f32(1000));
        assert_eq!(played[100], pcm::sample_to_f32(2000));
        assert_eq!(played[299], pcm::sample_to_f32(3000));
    }

    #[test]
    fn late_chunk_starts_immediately_when_idle() {
        let start = Instant::now();
        let mut player = Player::new(1_000);
        player.receive(chunk(1, 10), start);
        player.advance(start + Duration::from_secs(1));
        assert_eq!(player.state(), PlaybackState::Idle);

        player.receive(chunk(2, 10), start + Duration::from_secs(2));
        assert_eq!(player.state(), PlaybackState::Playing);
        assert_eq!(player.chunks_played(), 2);
    }

    #[test]
    fn stop_discards_queued_audio() {
        let start = Instant::now();
        let mut player = Player::new(1_000);
        player.receive(chunk(1, 100), start);
        player.receive(chunk(2, 100), start);
        player.stop();
        player.advance(start + Duration::from_secs(1));

        assert_eq!(player.state(), PlaybackState::Idle);
        assert_eq!(player.played().len(), 100);
    }
}
