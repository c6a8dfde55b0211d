//! AudioConfig: wire format and derived quantities

use serde::{Deserialize, Serialize};

use crate::constants::AUDIO_DTYPE;

/// Signed 16-bit little-endian, the only sample format this crate's `cpal`
/// adapter actually wires up to a stream. Other tag values round-trip
/// through the codec and device-config exchange, but opening a stream with
/// one is a `CoreError::UnsupportedDtype`.
pub const DTYPE_I16_LE: u32 = 8;

/// Immutable, value-type description of one direction's audio format.
///
/// `sample_rate`, `channels`, `audio_dtype` and `frames_per_chunk` are the
/// wire-visible fields (see [`AudioConfigWire`]); `chunk_size` and
/// `chunk_duration` are derived on demand rather than cached, since both are
/// cheap integer/float computations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u32,
    pub audio_dtype: u32,
    pub frames_per_chunk: u32,
}

/// Exact wire shape: an object with exactly these four integer-valued keys.
/// `deny_unknown_fields` rejects an object carrying any extra key, and a
/// missing key fails to deserialize at all, giving an exact-arity check for
/// free.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AudioConfigWire {
    sample_rate: u32,
    channels: u32,
    audio_dtype: u32,
    frames_per_chunk: u32,
}

impl AudioConfig {
    pub fn new(sample_rate: u32, channels: u32, audio_dtype: u32, frames_per_chunk: u32) -> Self {
        Self {
            sample_rate,
            channels,
            audio_dtype,
            frames_per_chunk,
        }
    }

    /// Bytes per sample for `audio_dtype`. Only `DTYPE_I16_LE` is known to
    /// this crate; any other tag is treated as 2 bytes as well, since the
    /// spec defines `audio_dtype` as an opaque value both endpoints must
    /// independently agree on (see DESIGN.md).
    pub fn sample_bytes(&self) -> u32 {
        match self.audio_dtype {
            DTYPE_I16_LE => 2,
            _ => 2,
        }
    }

    /// Bytes per chunk: `frames_per_chunk * channels * sample_bytes`.
    pub fn chunk_size(&self) -> usize {
        (self.frames_per_chunk * self.channels * self.sample_bytes()) as usize
    }

    /// Chunk duration in seconds: `frames_per_chunk / sample_rate`.
    pub fn chunk_duration(&self) -> f64 {
        self.frames_per_chunk as f64 / self.sample_rate as f64
    }

    /// `true` if every field is strictly positive, `chunk_size` fits in one
    /// datagram, and `chunk_duration` is positive.
    pub fn validate(&self, max_packet_size: usize) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("sample_rate must be positive".into());
        }
        if self.channels == 0 {
            return Err("channels must be positive".into());
        }
        if self.frames_per_chunk == 0 {
            return Err("frames_per_chunk must be positive".into());
        }
        if self.chunk_size() > max_packet_size {
            return Err(format!(
                "chunk_size {} exceeds MAX_PACKET_SIZE {}",
                self.chunk_size(),
                max_packet_size
            ));
        }
        if self.chunk_duration() <= 0.0 {
            return Err("chunk_duration must be positive".into());
        }
        Ok(())
    }

    /// Serialize to UTF-8 JSON bytes: `{"sample_rate":...,"channels":...,"audio_dtype":...,"frames_per_chunk":...}`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let wire = AudioConfigWire {
            sample_rate: self.sample_rate,
            channels: self.channels,
            audio_dtype: self.audio_dtype,
            frames_per_chunk: self.frames_per_chunk,
        };
        // Construction from validated fields never fails to serialize.
        serde_json::to_vec(&wire).expect("AudioConfig always serializes")
    }

    /// Parse JSON bytes into an `AudioConfig`. Returns `None` on malformed
    /// input, an object with missing/extra/non-integer keys, or any other
    /// parse failure — this function never panics.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let wire: AudioConfigWire = serde_json::from_slice(data).ok()?;
        Some(Self {
            sample_rate: wire.sample_rate,
            channels: wire.channels,
            audio_dtype: wire.audio_dtype,
            frames_per_chunk: wire.frames_per_chunk,
        })
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            audio_dtype: AUDIO_DTYPE,
            frames_per_chunk: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_quantities() {
        let cfg = AudioConfig::new(48_000, 2, DTYPE_I16_LE, 32);
        assert_eq!(cfg.sample_bytes(), 2);
        assert_eq!(cfg.chunk_size(), 32 * 2 * 2);
        assert!((cfg.chunk_duration() - (32.0 / 48_000.0)).abs() < 1e-12);
    }

    #[test]
    fn test_codec_round_trip() {
        let cfg = AudioConfig::new(48_000, 2, 8, 32);
        let bytes = cfg.to_bytes();
        let parsed = AudioConfig::from_bytes(&bytes).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn test_codec_exact_wire_shape() {
        let cfg = AudioConfig::new(48_000, 2, 8, 32);
        let bytes = cfg.to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 4);
        assert!(obj.contains_key("sample_rate"));
        assert!(obj.contains_key("channels"));
        assert!(obj.contains_key("audio_dtype"));
        assert!(obj.contains_key("frames_per_chunk"));
    }

    #[test]
    fn test_from_bytes_malformed_returns_none() {
        assert!(AudioConfig::from_bytes(b"not json").is_none());
        assert!(AudioConfig::from_bytes(b"\"just a string\"").is_none());
        assert!(AudioConfig::from_bytes(b"42").is_none());
    }

    #[test]
    fn test_from_bytes_extra_key_returns_none() {
        let with_extra = br#"{"sample_rate":48000,"channels":2,"audio_dtype":8,"frames_per_chunk":32,"extra":1}"#;
        assert!(AudioConfig::from_bytes(with_extra).is_none());
    }

    #[test]
    fn test_from_bytes_missing_key_returns_none() {
        let missing = br#"{"sample_rate":48000,"channels":2,"audio_dtype":8}"#;
        assert!(AudioConfig::from_bytes(missing).is_none());
    }

    #[test]
    fn test_from_bytes_non_integer_value_returns_none() {
        let bad_type = br#"{"sample_rate":"48000","channels":2,"audio_dtype":8,"frames_per_chunk":32}"#;
        assert!(AudioConfig::from_bytes(bad_type).is_none());
    }

    #[test]
    fn test_validate_rejects_oversized_chunk() {
        let cfg = AudioConfig::new(48_000, 2, DTYPE_I16_LE, 4096);
        assert!(cfg.validate(1024).is_err());
    }

    #[test]
    fn test_validate_accepts_default() {
        let cfg = AudioConfig::default();
        assert!(cfg.validate(1024).is_ok());
    }

    #[test]
    fn test_scenario_a_handshake_wire_bytes() {
        // The server's speaker-config reply is byte 'S' followed by this
        // exact JSON payload.
        let cfg = AudioConfig::new(48_000, 2, 8, 32);
        let json = String::from_utf8(cfg.to_bytes()).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed["sample_rate"], 48_000);
        assert_eq!(reparsed["channels"], 2);
        assert_eq!(reparsed["audio_dtype"], 8);
        assert_eq!(reparsed["frames_per_chunk"], 32);
    }
}
