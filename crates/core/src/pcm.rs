//! PCM16 sample conversion shared by the capture and playback sides.
//!
//! Positive and negative ranges are scaled separately (32767 and 32768) so
//! that -1.0 and 1.0 both map to the ends of the i16 range.

use std::time::Duration;

const POSITIVE_SCALE: f32 = 0x7FFF as f32;
const NEGATIVE_SCALE: f32 = 0x8000 as f32;

/// Converts one signed 16-bit sample to the normalized float range.
pub fn sample_to_f32(sample: i16) -> f32 {
    if sample >= 0 {
        sample as f32 / POSITIVE_SCALE
    } else {
        sample as f32 / NEGATIVE_SCALE
    }
}

/// Clamps a float sample to [-1, 1] and quantizes it to i16.
pub fn sample_from_f32(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * NEGATIVE_SCALE) as i16
    } else {
        (s * POSITIVE_SCALE) as i16
    }
}

/// Decodes little-endian PCM16 bytes. A trailing odd byte is ignored.
pub fn decode_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| sample_to_f32(i16::from_le_bytes([chunk[0], chunk[1]])))
        .collect()
}

/// Encodes float samples as little-endian PCM16 bytes.
pub fn encode_le(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| sample_from_f32(sample).to_le_bytes())
        .collect()
}

/// Playback time of `samples` mono samples at `sample_rate`.
pub fn duration_of(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(samples as f64 / sample_rate as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn asymmetric_scaling_reaches_both_ends() {
        assert_abs_diff_eq!(sample_to_f32(i16::MAX), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sample_to_f32(i16::MIN), -1.0, epsilon = 1e-6);
        assert_eq!(sample_to_f32(0), 0.0);
        assert_abs_diff_eq!(sample_to_f32(16384), 16384.0 / 32767.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sample_to_f32(-16384), -0.5, epsilon = 1e-6);
    }

    #[test]
    fn quantization_clamps_before_scaling() {
        assert_eq!(sample_from_f32(1.0), i16::MAX);
        assert_eq!(sample_from_f32(-1.0), i16::MIN);
        assert_eq!(sample_from_f32(2.5), i16::MAX);
        assert_eq!(sample_from_f32(-7.0), i16::MIN);
        assert_eq!(sample_from_f32(0.0), 0);
        assert_eq!(sample_from_f32(-0.5), -16384);
        assert_eq!(sample_from_f32(f32::NAN), 0);
    }

    #[test]
    fn decode_reads_little_endian_and_skips_odd_byte() {
        // 0x4000 = 16384, 0x8000 = -32768, then a dangling byte.
        let decoded = decode_le(&[0x00, 0x40, 0x00, 0x80, 0x01]);
        assert_eq!(decoded.len(), 2);
        assert_abs_diff_eq!(decoded[0], 16384.0 / 32767.0, epsilon = 1e-6);
        assert_abs_diff_eq!(decoded[1], -1.0, epsilon = 1e-6);
        assert!(decode_le(&[]).is_empty());
    }

    #[test]
    fn encode_writes_little_endian() {
        assert_eq!(encode_le(&[1.0, -1.0, 0.0]), vec![0xff, 0x7f, 0x00, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn duration_matches_sample_rate() {
        assert_eq!(duration_of(24_000, 24_000), Duration::from_secs(1));
        assert_eq!(duration_of(2_400, 24_000), Duration::from_millis(100));
        assert_eq!(duration_of(10, 0), Duration::ZERO);
    }
}
