//! SoundBridge server binary: hosts the speaker (playback) and microphone
//! (capture, toggleable) endpoints and answers the client's control-channel
//! requests.

use std::io::BufRead;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use soundbridge_core::config::AudioConfig;
use soundbridge_core::constants::{control_port, data_port};
use soundbridge_core::control_channel::ControlHandlers;
use soundbridge_core::device::{default_input, default_output, server_microphone_config, server_speaker_config};
use soundbridge_core::endpoint::ServerEndpoint;
use soundbridge_core::reload::{run_if_monitor_child, DeviceMonitor, ReloadCoordinator};
use soundbridge_core::worker::ToggleableSender;

struct ServerHandlers {
    speaker_config: Mutex<AudioConfig>,
    microphone_config: Mutex<AudioConfig>,
    microphone: Arc<ToggleableSender>,
}

impl ControlHandlers for ServerHandlers {
    fn speaker_config(&self) -> AudioConfig {
        *self.speaker_config.lock().unwrap()
    }

    fn microphone_config(&self) -> AudioConfig {
        *self.microphone_config.lock().unwrap()
    }

    fn toggle_microphone(&self) -> bool {
        self.microphone.toggle()
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Re-resolve the default output/input devices and their configs, retrying
/// indefinitely on enumeration failure as the reload protocol requires.
fn resolve_devices() -> (cpal::Device, AudioConfig, cpal::Device, AudioConfig) {
    let speaker = loop {
        match default_output().and_then(|d| server_speaker_config(&d).map(|c| (d, c))) {
            Ok(pair) => break pair,
            Err(err) => {
                warn!(%err, "reload: speaker device re-init failed, retrying");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    };
    let microphone = loop {
        match default_input().and_then(|d| server_microphone_config(&d).map(|c| (d, c))) {
            Ok(pair) => break pair,
            Err(err) => {
                warn!(%err, "reload: microphone device re-init failed, retrying");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    };
    (speaker.0, speaker.1, microphone.0, microphone.1)
}

/// Runs the server-side half of one reload cycle (steps 2-6 of the reload
/// protocol; STOP/START pushes are the caller's responsibility): stop the
/// speaker playback worker and the data channel, re-resolve the default
/// devices, restart both against the new configs, and bring the microphone
/// worker back up only if it was running before the reload.
fn rebuild_server_audio(endpoint: &Mutex<ServerEndpoint>, handlers: &ServerHandlers) {
    let mic_was_running = handlers.microphone.is_running();
    if mic_was_running {
        handlers.microphone.toggle();
    }

    let mut endpoint = endpoint.lock().unwrap();
    endpoint.stop_speaker();
    endpoint.data_channel.stop();

    let (speaker_device, speaker_config, _mic_device, mic_config) = resolve_devices();

    if let Err(err) = endpoint.data_channel.restart(&mic_config, &speaker_config) {
        error!(%err, "failed to restart data channel after reload");
    }
    if let Err(err) = endpoint.start_speaker(speaker_device, speaker_config) {
        error!(%err, "failed to restart speaker playback after reload");
    }
    *handlers.speaker_config.lock().unwrap() = speaker_config;
    *handlers.microphone_config.lock().unwrap() = mic_config;
    handlers.microphone.rebind(mic_config, endpoint.data_channel.tx_queue());

    if mic_was_running {
        handlers.microphone.toggle();
    }
    info!(?speaker_config, ?mic_config, "server audio workers rebuilt after device change");
}

fn main() -> Result<()> {
    if run_if_monitor_child() {
        return Ok(());
    }

    init_logging();
    info!("soundbridge server starting");

    let speaker_config = server_speaker_config(&default_output()?)?;
    let microphone_config = server_microphone_config(&default_input()?)?;
    info!(?speaker_config, ?microphone_config, "resolved device configs");

    let control_addr: SocketAddr = format!("0.0.0.0:{}", control_port()).parse()?;
    let data_socket = UdpSocket::bind(("0.0.0.0", data_port())).context("binding data socket")?;

    let handlers_slot: Arc<Mutex<Option<Arc<ServerHandlers>>>> = Arc::new(Mutex::new(None));
    let handlers_slot_for_build = handlers_slot.clone();

    let endpoint = ServerEndpoint::bind(
        control_addr,
        data_socket,
        microphone_config,
        speaker_config,
        move |mic_queue| {
            let microphone = Arc::new(ToggleableSender::new(default_input, microphone_config, mic_queue));
            let handlers = Arc::new(ServerHandlers {
                speaker_config: Mutex::new(speaker_config),
                microphone_config: Mutex::new(microphone_config),
                microphone,
            });
            *handlers_slot_for_build.lock().unwrap() = Some(handlers.clone());
            handlers
        },
    )?;

    let handlers = handlers_slot.lock().unwrap().clone().expect("handlers set during bind");
    let endpoint = Arc::new(Mutex::new(endpoint));

    {
        let mut guard = endpoint.lock().unwrap();
        guard.data_channel.start();
        guard
            .start_speaker(default_output()?, speaker_config)
            .context("starting speaker playback worker")?;
    }

    let control = endpoint.lock().unwrap().control.clone();
    let coordinator = ReloadCoordinator::new(control);
    let endpoint_for_reload = endpoint.clone();
    let handlers_for_reload = handlers.clone();
    // Kept alive for the rest of main: dropping it tears down the monitor
    // child process and its reader thread.
    let monitor = DeviceMonitor::spawn(move || {
        coordinator.reload(|| {
            rebuild_server_audio(&endpoint_for_reload, &handlers_for_reload);
        });
    });
    if let Err(err) = &monitor {
        error!(%err, "failed to start device-change monitor, continuing without it");
    }

    info!("soundbridge server ready, press enter or send EOF to exit");
    let stdin = std::io::stdin();
    let mut line = String::new();
    let _ = stdin.lock().read_line(&mut line);

    drop(monitor);
    if handlers.microphone.is_running() {
        handlers.microphone.toggle();
    }
    info!("soundbridge server shutting down");
    Ok(())
}
