//! Sender / Receiver worker threads bridging an audio stream to a queue.
//!
//! Each worker owns a `run_flag`, opens exactly one audio stream for its
//! lifetime, and loops pushing/popping chunks until told to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::audio_io::{CaptureStream, PlaybackStream};
use crate::config::AudioConfig;
use crate::error::CoreResult;
use crate::queue::RingQueue;

/// A running worker thread plus the flag that stops it.
pub struct Worker {
    run_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl Worker {
    /// Spawn a capture worker: reads chunks from `stream` and pushes them
    /// onto `queue` until stopped.
    pub fn spawn_sender(
        name: impl Into<String>,
        device: cpal::Device,
        config: AudioConfig,
        queue: Arc<RingQueue<Vec<u8>>>,
    ) -> CoreResult<Self> {
        let name = name.into();
        let run_flag = Arc::new(AtomicBool::new(true));
        let thread_flag = run_flag.clone();
        let thread_name = name.clone();
        let chunk_size = config.chunk_size();

        let mut stream = CaptureStream::new(&device, &config)?;
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                info!(worker = %thread_name, "sender started");
                while thread_flag.load(Ordering::Relaxed) {
                    let chunk = stream.read_chunk(chunk_size);
                    queue.push(chunk);
                }
                info!(worker = %thread_name, "sender stopped");
            })
            .expect("failed to spawn worker thread");

        Ok(Self {
            run_flag,
            handle: Some(handle),
            name,
        })
    }

    /// Spawn a playback worker: pops chunks off `queue` and writes them to
    /// `stream` until stopped. When the queue is momentarily empty the
    /// worker idles for half a buffering window to let it refill, rather
    /// than writing silence.
    pub fn spawn_receiver(
        name: impl Into<String>,
        device: cpal::Device,
        config: AudioConfig,
        queue: Arc<RingQueue<Vec<u8>>>,
    ) -> CoreResult<Self> {
        let name = name.into();
        let run_flag = Arc::new(AtomicBool::new(true));
        let thread_flag = run_flag.clone();
        let thread_name = name.clone();

        let mut stream = PlaybackStream::new(&device, &config)?;
        let underrun_idle = std::time::Duration::from_secs_f64(crate::constants::buffer_time() / 2.0);
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                info!(worker = %thread_name, "receiver started");
                while thread_flag.load(Ordering::Relaxed) {
                    match queue.pop() {
                        Some(chunk) => stream.write_chunk(&chunk),
                        None => std::thread::sleep(underrun_idle),
                    }
                }
                info!(worker = %thread_name, "receiver stopped");
            })
            .expect("failed to spawn worker thread");

        Ok(Self {
            run_flag,
            handle: Some(handle),
            name,
        })
    }

    /// Clear the run flag and join the underlying thread.
    pub fn stop(&mut self) {
        self.run_flag.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            debug!(worker = %self.name, "joining worker thread");
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A second output stream continuously fed silence, kept alive alongside a
/// loopback capture. A loopback capture stream only delivers frames while
/// something is actually playing through the mixed output; writing silence
/// to the same output device guarantees the capture side never blocks.
struct KeepAliveHandle {
    run_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAliveHandle {
    fn spawn(device: cpal::Device, config: AudioConfig) -> CoreResult<Self> {
        let run_flag = Arc::new(AtomicBool::new(true));
        let thread_flag = run_flag.clone();
        let chunk_size = config.chunk_size();
        let mut stream = PlaybackStream::new(&device, &config)?;

        let handle = std::thread::Builder::new()
            .name("client-speaker-keepalive".into())
            .spawn(move || {
                let silence = vec![0u8; chunk_size];
                while thread_flag.load(Ordering::Relaxed) {
                    stream.write_chunk(&silence);
                }
            })
            .expect("failed to spawn keep-alive thread");

        Ok(Self {
            run_flag,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.run_flag.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for KeepAliveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Client-side Speaker direction: captures the loopback of the client's
/// default output and pushes chunks onto the outgoing queue, backed by a
/// keep-alive helper so the loopback capture never stalls waiting for real
/// audio to play. The helper is started first and stopped last.
pub struct ClientSpeakerSender {
    keep_alive: KeepAliveHandle,
    sender: Worker,
}

impl ClientSpeakerSender {
    pub fn spawn(
        loopback_device: cpal::Device,
        keep_alive_device: cpal::Device,
        config: AudioConfig,
        queue: Arc<RingQueue<Vec<u8>>>,
    ) -> CoreResult<Self> {
        let keep_alive = KeepAliveHandle::spawn(keep_alive_device, config)?;
        let sender = Worker::spawn_sender("client-speaker-sender", loopback_device, config, queue)?;
        Ok(Self { keep_alive, sender })
    }

    pub fn stop(&mut self) {
        self.sender.stop();
        self.keep_alive.stop();
    }
}

/// Server-side Microphone direction: captures the default input device and
/// pushes chunks onto the outgoing queue. Unlike the other three directions
/// this one can be toggled on and off at runtime via `TOGGLE_MICROPHONE`,
/// so the underlying stream is torn down and rebuilt rather than kept
/// running continuously.
pub struct ToggleableSender {
    device_fn: Box<dyn Fn() -> CoreResult<cpal::Device> + Send + Sync>,
    config: Mutex<AudioConfig>,
    queue: Mutex<Arc<RingQueue<Vec<u8>>>>,
    worker: Mutex<Option<Worker>>,
}

impl ToggleableSender {
    /// `device_fn` is re-invoked on every toggle-on, so it should resolve
    /// to "the current default input device" rather than capturing one
    /// `cpal::Device` up front.
    pub fn new(
        device_fn: impl Fn() -> CoreResult<cpal::Device> + Send + Sync + 'static,
        config: AudioConfig,
        queue: Arc<RingQueue<Vec<u8>>>,
    ) -> Self {
        Self {
            device_fn: Box::new(device_fn),
            config: Mutex::new(config),
            queue: Mutex::new(queue),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }

    /// Flip running state. Returns the new state; a toggle-on that fails to
    /// open a device leaves the worker stopped and logs the failure.
    pub fn toggle(&self) -> bool {
        let mut guard = self.worker.lock().unwrap();
        if let Some(mut worker) = guard.take() {
            worker.stop();
            false
        } else {
            let config = *self.config.lock().unwrap();
            let queue = self.queue.lock().unwrap().clone();
            match (self.device_fn)() {
                Ok(device) => match Worker::spawn_sender("server-microphone-sender", device, config, queue) {
                    Ok(worker) => {
                        *guard = Some(worker);
                        true
                    }
                    Err(err) => {
                        warn!(%err, "failed to start microphone worker");
                        false
                    }
                },
                Err(err) => {
                    warn!(%err, "failed to resolve default input device");
                    false
                }
            }
        }
    }

    /// Swap in a new config and queue for subsequent toggle-ons, used after
    /// a device-reload rebuilds the microphone data channel. Has no effect
    /// on an already-running worker; the caller is expected to toggle off
    /// before rebinding and on again after, if a restart is needed.
    pub fn rebind(&self, config: AudioConfig, queue: Arc<RingQueue<Vec<u8>>>) {
        *self.config.lock().unwrap() = config;
        *self.queue.lock().unwrap() = queue;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_idempotent() {
        let run_flag = Arc::new(AtomicBool::new(true));
        run_flag.store(false, Ordering::Relaxed);
        run_flag.store(false, Ordering::Relaxed);
        assert!(!run_flag.load(Ordering::Relaxed));
    }
}
