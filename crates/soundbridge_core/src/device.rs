//! Audio device enumeration and lookup, backed by `cpal`.

use cpal::traits::{DeviceTrait, HostTrait};

use crate::config::AudioConfig;
use crate::constants::{FRAMES_PER_CHUNK, MIN_SERVER_SPEAKER_SAMPLE_RATE, VIRTUAL_CABLE_NAME_SUBSTR};
use crate::error::{CoreError, CoreResult};

/// Which direction a device can be used in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Trimmed-down device descriptor: just enough to pick a device and report
/// its name and default sample rate. Unlike a full audio-graph backend this
/// crate doesn't need a device's full supported-rate list or per-device
/// default flag as standalone fields — the default lookup functions below
/// answer "is this the default" by construction.
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub host_tag: String,
    pub index: usize,
    pub default_sample_rate: u32,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
}

fn describe(device: &cpal::Device, host_tag: &str, index: usize) -> Option<AudioDeviceInfo> {
    let name = device.name().ok()?;
    let input_cfg = device.default_input_config().ok();
    let output_cfg = device.default_output_config().ok();
    let default_sample_rate = output_cfg
        .as_ref()
        .or(input_cfg.as_ref())
        .map(|c| c.sample_rate().0)
        .unwrap_or(0);
    let max_input_channels = input_cfg.as_ref().map(|c| c.channels()).unwrap_or(0);
    let max_output_channels = output_cfg.as_ref().map(|c| c.channels()).unwrap_or(0);
    Some(AudioDeviceInfo {
        name,
        host_tag: host_tag.to_string(),
        index,
        default_sample_rate,
        max_input_channels,
        max_output_channels,
    })
}

/// All input devices across the default host.
pub fn enumerate_inputs() -> CoreResult<Vec<AudioDeviceInfo>> {
    let host = cpal::default_host();
    let host_tag = format!("{:?}", host.id());
    let devices = host
        .input_devices()
        .map_err(|e| CoreError::StreamBuildError(e.to_string()))?;
    Ok(devices
        .enumerate()
        .filter_map(|(i, d)| describe(&d, &host_tag, i))
        .collect())
}

/// All output devices across the default host.
pub fn enumerate_outputs() -> CoreResult<Vec<AudioDeviceInfo>> {
    let host = cpal::default_host();
    let host_tag = format!("{:?}", host.id());
    let devices = host
        .output_devices()
        .map_err(|e| CoreError::StreamBuildError(e.to_string()))?;
    Ok(devices
        .enumerate()
        .filter_map(|(i, d)| describe(&d, &host_tag, i))
        .collect())
}

/// The host's default input device.
pub fn default_input() -> CoreResult<cpal::Device> {
    cpal::default_host()
        .default_input_device()
        .ok_or(CoreError::NoDevicesFound)
}

/// The host's default output device.
pub fn default_output() -> CoreResult<cpal::Device> {
    cpal::default_host()
        .default_output_device()
        .ok_or(CoreError::NoDevicesFound)
}

/// The client's loopback source: a capture device fed by the default
/// output's own mix, rather than a separate microphone. `cpal`'s portable
/// host abstraction has no dedicated loopback API (WASAPI loopback is a
/// host-specific extension); this returns the default output device itself
/// and relies on the host backend opening it in capture mode, which holds
/// for hosts that support it and fails fast with `StreamBuildError`
/// otherwise.
pub fn loopback_capture_device() -> CoreResult<cpal::Device> {
    default_output()
}

/// Find an input device whose name contains `needle` (case-sensitive
/// substring match), used for loopback-style capture device selection.
pub fn find_input_by_name_substr(needle: &str) -> CoreResult<cpal::Device> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| CoreError::StreamBuildError(e.to_string()))?;
    for device in devices {
        if let Ok(name) = device.name() {
            if name.contains(needle) {
                return Ok(device);
            }
        }
    }
    Err(CoreError::DeviceNotFound(needle.to_string()))
}

/// Find an output device whose name contains `needle`.
pub fn find_output_by_name_substr(needle: &str) -> CoreResult<cpal::Device> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| CoreError::StreamBuildError(e.to_string()))?;
    for device in devices {
        if let Ok(name) = device.name() {
            if name.contains(needle) {
                return Ok(device);
            }
        }
    }
    Err(CoreError::DeviceNotFound(needle.to_string()))
}

/// The client's virtual-cable playback sink, looked up by the configured
/// name substring (`VIRTUAL_CABLE_NAME_SUBSTR`). A WASAPI-style exact
/// host-API tag match is deliberately left out: cpal's single default-host
/// model already limits the search to one default host, so a host-API tag
/// check would only narrow the search on Windows and has no portable
/// counterpart elsewhere.
pub fn virtual_cable_output() -> CoreResult<cpal::Device> {
    find_output_by_name_substr(VIRTUAL_CABLE_NAME_SUBSTR)
}

/// Server-side Speaker config: the default output device's own sample rate
/// and channel count, clamped to a minimum of `MIN_SERVER_SPEAKER_SAMPLE_RATE`
/// since the client's loopback capture API requires it.
pub fn server_speaker_config(device: &cpal::Device) -> CoreResult<AudioConfig> {
    let output_cfg = device
        .default_output_config()
        .map_err(|e| CoreError::StreamBuildError(e.to_string()))?;
    let sample_rate = output_cfg.sample_rate().0.max(MIN_SERVER_SPEAKER_SAMPLE_RATE);
    Ok(AudioConfig::new(
        sample_rate,
        output_cfg.channels() as u32,
        crate::config::DTYPE_I16_LE,
        FRAMES_PER_CHUNK,
    ))
}

/// Server-side Microphone config: the default input device's own sample
/// rate and channel count, unclamped.
pub fn server_microphone_config(device: &cpal::Device) -> CoreResult<AudioConfig> {
    let input_cfg = device
        .default_input_config()
        .map_err(|e| CoreError::StreamBuildError(e.to_string()))?;
    Ok(AudioConfig::new(
        input_cfg.sample_rate().0,
        input_cfg.channels() as u32,
        crate::config::DTYPE_I16_LE,
        FRAMES_PER_CHUNK,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_by_name_substr_not_found() {
        // No device on any test host will ever be named this.
        let result = find_input_by_name_substr("___definitely_not_a_real_device___");
        assert!(matches!(result, Err(CoreError::DeviceNotFound(_))));
    }

    #[test]
    fn test_virtual_cable_lookup_uses_configured_substring() {
        let result = virtual_cable_output();
        if let Err(CoreError::DeviceNotFound(needle)) = result {
            assert_eq!(needle, VIRTUAL_CABLE_NAME_SUBSTR);
        }
    }
}
