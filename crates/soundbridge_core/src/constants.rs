//! Deploy-time constants and environment overrides.
//!
//! A handful of module-level constants, each overridable at process start
//! through an environment variable, read once and cached — `std::env::var`
//! plus `.parse()`, falling back to the compiled-in default on absence or
//! parse failure.

use std::sync::OnceLock;
use std::time::Duration;

/// Default host the client connects to when not overridden.
pub const SERVER_HOST: &str = "192.168.0.120";

/// UDP data-channel port.
pub const DATA_PORT: u16 = 2025;

/// UDP control-channel port.
pub const CONTROL_PORT: u16 = 2026;

/// Largest UDP payload this crate will send or expects to receive, chosen
/// below typical network path MTU to avoid IP fragmentation.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Socket receive timeout used on both the data and control channels so
/// blocking reads periodically wake up and observe run flags.
pub const SOCKET_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default sample-format tag: signed 16-bit little-endian.
pub const AUDIO_DTYPE: u32 = 8;

/// Default frames captured/played per audio chunk.
pub const FRAMES_PER_CHUNK: u32 = 32;

/// Target playout buffering window, in seconds; also the queue-sizing budget.
pub const BUFFER_TIME: f64 = 0.2;

/// Minimum speaker sample rate on the server side, required by the client's
/// loopback capture API.
pub const MIN_SERVER_SPEAKER_SAMPLE_RATE: u32 = 48_000;

/// Substring identifying the client-side virtual cable's playback sink.
pub const VIRTUAL_CABLE_NAME_SUBSTR: &str = "CABLE Input";

/// Number of times STOP/START control pushes are retried.
pub const RELOAD_PUSH_ATTEMPTS: usize = 3;

/// Interval between STOP/START retry pushes.
pub const RELOAD_PUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Heartbeat interval on the client's control channel.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Device-change monitor poll tick.
pub const DEVICE_MONITOR_TICK: Duration = Duration::from_secs(1);

fn env_override<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Effective server host, honoring `SOUNDBRIDGE_SERVER_HOST`.
pub fn server_host() -> &'static str {
    static VALUE: OnceLock<String> = OnceLock::new();
    VALUE
        .get_or_init(|| std::env::var("SOUNDBRIDGE_SERVER_HOST").unwrap_or_else(|_| SERVER_HOST.to_string()))
        .as_str()
}

/// Effective data-channel port, honoring `SOUNDBRIDGE_DATA_PORT`.
pub fn data_port() -> u16 {
    env_override("SOUNDBRIDGE_DATA_PORT", DATA_PORT)
}

/// Effective control-channel port, honoring `SOUNDBRIDGE_CONTROL_PORT`.
pub fn control_port() -> u16 {
    env_override("SOUNDBRIDGE_CONTROL_PORT", CONTROL_PORT)
}

/// Effective buffer time in seconds, honoring `SOUNDBRIDGE_BUFFER_TIME_MS`.
pub fn buffer_time() -> f64 {
    let ms: u64 = env_override("SOUNDBRIDGE_BUFFER_TIME_MS", (BUFFER_TIME * 1000.0) as u64);
    ms as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(DATA_PORT, 2025);
        assert_eq!(CONTROL_PORT, 2026);
        assert_eq!(MAX_PACKET_SIZE, 1024);
        assert_eq!(FRAMES_PER_CHUNK, 32);
    }

    #[test]
    fn test_env_override_fallback() {
        // No environment variable set for this key: falls back cleanly.
        let v: u32 = env_override("SOUNDBRIDGE_TEST_DOES_NOT_EXIST", 42);
        assert_eq!(v, 42);
    }
}
