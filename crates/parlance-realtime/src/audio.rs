//! PCM16 codec helpers shared by the capture and playback paths.
//!
//! Samples cross the wire as base64 little-endian 16-bit PCM and live in
//! memory as `f32` in the range `[-1.0, 1.0]`.

use base64::{Engine, engine::general_purpose::STANDARD};
use std::time::Duration;

use crate::error::ClientError;

/// Encodes float samples to base64 PCM16 for an outbound audio frame.
pub fn encode_pcm16(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let value = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    STANDARD.encode(&bytes)
}

/// Decodes an inbound base64 PCM16 payload to float samples.
pub fn decode_pcm16(data: &str) -> Result<Vec<f32>, ClientError> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| ClientError::Protocol(format!("invalid base64 audio payload: {e}")))?;
    if bytes.len() % 2 != 0 {
        return Err(ClientError::Protocol(format!(
            "PCM16 payload has odd byte length {}",
            bytes.len()
        )));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();
    Ok(samples)
}

/// Wall-clock running time of `sample_count` mono samples at `sample_rate_hz`.
pub fn duration_of(sample_count: usize, sample_rate_hz: u32) -> Duration {
    if sample_rate_hz == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(sample_count as u64 * 1_000_000_000 / sample_rate_hz as u64)
}

/// Largest absolute sample value in the slice, for input level metering.
pub fn peak_level(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
}
