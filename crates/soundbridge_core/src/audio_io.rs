//! Blocking capture/playback facade over `cpal`'s callback-based streams.
//!
//! `cpal` only hands out audio through realtime callbacks; the worker
//! threads in [`crate::worker`] want a blocking `read`/`write` call per
//! chunk instead. This module bridges the two with an `rtrb` SPSC ring
//! buffer passed between the cpal callback and the worker thread.

use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::config::AudioConfig;
use crate::error::{CoreError, CoreResult};

/// Ring buffer capacity, in bytes, backing one capture or playback stream.
/// Sized generously relative to one chunk so the audio callback thread never
/// blocks on the worker thread keeping up.
const RING_CAPACITY_CHUNKS: usize = 8;

/// A capture stream: a live `cpal::Stream` feeding raw interleaved PCM bytes
/// into an `rtrb` consumer that [`CaptureStream::read_chunk`] drains.
pub struct CaptureStream {
    _stream: cpal::Stream,
    consumer: Consumer<u8>,
}

/// A playback stream: an `rtrb` producer that [`PlaybackStream::write_chunk`]
/// fills, drained by a live `cpal::Stream`'s output callback.
pub struct PlaybackStream {
    _stream: cpal::Stream,
    producer: Producer<u8>,
}

fn stream_config(config: &AudioConfig) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: config.channels as u16,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

impl CaptureStream {
    /// Build and start a capture stream on `device` using `config`. Only
    /// `DTYPE_I16_LE` is wired to a real `cpal` callback; any other
    /// `audio_dtype` is rejected before a stream is ever built.
    pub fn new(device: &cpal::Device, config: &AudioConfig) -> CoreResult<Self> {
        if config.audio_dtype != crate::config::DTYPE_I16_LE {
            return Err(CoreError::UnsupportedDtype(config.audio_dtype));
        }
        let cpal_config = stream_config(config);
        let ring_capacity = config.chunk_size() * RING_CAPACITY_CHUNKS;
        let (mut producer, consumer) = RingBuffer::<u8>::new(ring_capacity.max(1));

        let err_fn = |err| tracing::error!(%err, "capture stream error");
        let stream = device
            .build_input_stream(
                &cpal_config,
                move |data: &[i16], _| {
                    let bytes: &[u8] = bytemuck_cast_slice(data);
                    let chunk = producer.slots();
                    let to_write = bytes.len().min(chunk);
                    if let Ok(mut writer) = producer.write_chunk(to_write) {
                        let (a, b) = writer.as_mut_slices();
                        let split = a.len();
                        a.copy_from_slice(&bytes[..split]);
                        b.copy_from_slice(&bytes[split..to_write]);
                        writer.commit_all();
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| CoreError::StreamBuildError(e.to_string()))?;
        stream
            .play()
            .map_err(|e| CoreError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            consumer,
        })
    }

    /// Block (via short polling sleeps) until `chunk_size` bytes are
    /// available, then return exactly that many.
    pub fn read_chunk(&mut self, chunk_size: usize) -> Vec<u8> {
        let mut out = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            let available = self.consumer.slots();
            if available == 0 {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            let take = available.min(chunk_size - filled);
            if let Ok(reader) = self.consumer.read_chunk(take) {
                let (a, b) = reader.as_slices();
                out[filled..filled + a.len()].copy_from_slice(a);
                out[filled + a.len()..filled + a.len() + b.len()].copy_from_slice(b);
                filled += a.len() + b.len();
                reader.commit_all();
            }
        }
        out
    }
}

impl PlaybackStream {
    pub fn new(device: &cpal::Device, config: &AudioConfig) -> CoreResult<Self> {
        if config.audio_dtype != crate::config::DTYPE_I16_LE {
            return Err(CoreError::UnsupportedDtype(config.audio_dtype));
        }
        let cpal_config = stream_config(config);
        let ring_capacity = config.chunk_size() * RING_CAPACITY_CHUNKS;
        let (producer, mut consumer) = RingBuffer::<u8>::new(ring_capacity.max(1));

        let err_fn = |err| tracing::error!(%err, "playback stream error");
        let stream = device
            .build_output_stream(
                &cpal_config,
                move |data: &mut [i16], _| {
                    let bytes_needed = data.len() * 2;
                    let available = consumer.slots().min(bytes_needed);
                    let mut scratch = vec![0u8; bytes_needed];
                    if available > 0 {
                        if let Ok(reader) = consumer.read_chunk(available) {
                            let (a, b) = reader.as_slices();
                            scratch[..a.len()].copy_from_slice(a);
                            scratch[a.len()..a.len() + b.len()].copy_from_slice(b);
                            reader.commit_all();
                        }
                    }
                    for (i, sample) in data.iter_mut().enumerate() {
                        *sample = i16::from_le_bytes([scratch[i * 2], scratch[i * 2 + 1]]);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| CoreError::StreamBuildError(e.to_string()))?;
        stream
            .play()
            .map_err(|e| CoreError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            producer,
        })
    }

    /// Push one chunk of raw bytes into the ring, blocking (via short
    /// polling sleeps) until it fits.
    pub fn write_chunk(&mut self, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() {
            let free = self.producer.slots();
            if free == 0 {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            let take = free.min(data.len() - offset);
            if let Ok(mut writer) = self.producer.write_chunk(take) {
                let (a, b) = writer.as_mut_slices();
                let split = a.len();
                a.copy_from_slice(&data[offset..offset + split]);
                b.copy_from_slice(&data[offset + split..offset + take]);
                writer.commit_all();
                offset += take;
            }
        }
    }
}

fn bytemuck_cast_slice(data: &[i16]) -> &[u8] {
    // Safe: i16 has no padding/alignment hazards when reinterpreted as
    // bytes of half the stride, and the resulting slice never outlives
    // `data`.
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * 2) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_dtype_rejected_before_stream_build() {
        let config = AudioConfig::new(48_000, 2, 999, 32);
        // No real device needed: the dtype check runs before any cpal call.
        let host = cpal::default_host();
        if let Some(device) = cpal::traits::HostTrait::default_output_device(&host) {
            let result = PlaybackStream::new(&device, &config);
            assert!(matches!(result, Err(CoreError::UnsupportedDtype(999))));
        }
    }
}
