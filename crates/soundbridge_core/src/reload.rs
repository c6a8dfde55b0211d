//! Device-change monitor and STOP/START reload coordination.
//!
//! The server watches for default-device changes in a dedicated child
//! process so a misbehaving audio backend can't wedge the main process;
//! each reload is reported back over the child's stdout as one newline,
//! including one at startup (the "warm-up" line) so the coordinator thread
//! has a uniform signal to wait on from the first tick.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::constants::DEVICE_MONITOR_TICK;
use crate::control_channel::ControlChannelServer;
use crate::device::{default_input, default_output};

/// Marker environment variable that tells a re-exec'd process to run as the
/// device-change monitor child instead of the normal binary entry point.
pub const MONITOR_MARKER_VAR: &str = "SOUNDBRIDGE_DEVICE_MONITOR";

/// Entry point for the monitor child process. Call this at the very top of
/// `main()`, before any other setup, and exit immediately if it returns
/// `true`.
///
/// ```ignore
/// if soundbridge_core::reload::run_if_monitor_child() {
///     return;
/// }
/// ```
pub fn run_if_monitor_child() -> bool {
    if std::env::var(MONITOR_MARKER_VAR).is_err() {
        return false;
    }
    monitor_loop();
    true
}

fn monitor_loop() {
    use std::io::Write;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();

    // Warm-up line: the coordinator thread can start waiting on the first
    // tick without a special-cased "no change yet" branch.
    let _ = writeln!(handle);
    let _ = handle.flush();

    let mut last_input = default_input().ok().and_then(|d| d.name().ok());
    let mut last_output = default_output().ok().and_then(|d| d.name().ok());

    loop {
        std::thread::sleep(DEVICE_MONITOR_TICK);
        let input = default_input().ok().and_then(|d| d.name().ok());
        let output = default_output().ok().and_then(|d| d.name().ok());
        if input != last_input || output != last_output {
            last_input = input;
            last_output = output;
            let _ = writeln!(handle);
            let _ = handle.flush();
        }
    }
}

use cpal::traits::DeviceTrait;

/// Spawns and owns the device-monitor child process, delivering one event
/// per reload via a background thread draining its stdout.
pub struct DeviceMonitor {
    child: Child,
    run_flag: Arc<AtomicBool>,
    reader_handle: Option<JoinHandle<()>>,
}

impl DeviceMonitor {
    /// Re-exec the current binary with [`MONITOR_MARKER_VAR`] set, and
    /// invoke `on_reload` once per line the child writes to stdout.
    pub fn spawn<F>(on_reload: F) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .env(MONITOR_MARKER_VAR, "1")
            .stdout(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("piped stdout");
        let run_flag = Arc::new(AtomicBool::new(true));
        let thread_flag = run_flag.clone();
        let reader_handle = std::thread::Builder::new()
            .name("device-monitor-reader".into())
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                let mut line = String::new();
                let mut first_line = true;
                while thread_flag.load(Ordering::Relaxed) {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            if first_line {
                                first_line = false;
                                debug!("device monitor warm-up line received");
                                continue;
                            }
                            debug!("device change event received");
                            on_reload();
                        }
                        Err(err) => {
                            warn!(%err, "device monitor read failed");
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn device monitor reader thread");

        Ok(Self {
            child,
            run_flag,
            reader_handle: Some(reader_handle),
        })
    }

    pub fn stop(&mut self) {
        self.run_flag.store(false, Ordering::Relaxed);
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(h) = self.reader_handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Server-side reload coordinator: on a device-change event, pushes STOP to
/// the client, lets the caller rebuild its audio workers against the new
/// default devices, then pushes START.
pub struct ReloadCoordinator {
    control: Arc<ControlChannelServer>,
}

impl ReloadCoordinator {
    pub fn new(control: Arc<ControlChannelServer>) -> Self {
        Self { control }
    }

    /// Run one reload cycle: STOP, invoke `rebuild`, START. `rebuild`'s
    /// failure is logged but does not stop START from being pushed, since
    /// the client must not be left waiting forever on a stalled stream.
    pub fn reload<F: FnOnce()>(&self, rebuild: F) {
        info!("device change detected, starting reload cycle");
        self.control.push_stop();
        rebuild();
        self.control.push_start();
        info!("reload cycle complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_var_absent_returns_false() {
        std::env::remove_var(MONITOR_MARKER_VAR);
        assert!(!run_if_monitor_child());
    }
}
