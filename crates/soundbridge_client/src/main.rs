//! SoundBridge client binary: captures the loopback of its own default
//! output for the server to play, and plays the server's microphone feed
//! into the client's virtual audio cable.
//!
//! A single UDP socket (cloned with `try_clone` for each thread that needs
//! its own handle) backs every control-channel exchange, so the server's
//! last-known client address stays valid no matter which thread sent most
//! recently.
//!
//! The client's audio session is rebuilt from scratch on every reload cycle:
//! fetch the server's current configs, run until a `STOP` push arrives, tear
//! the session down, and wait for `START` before looping back to fetch
//! configs again.

use std::io::BufRead;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use soundbridge_core::config::AudioConfig;
use soundbridge_core::constants::{control_port, data_port, server_host};
use soundbridge_core::control_channel::ControlChannelClient;
use soundbridge_core::data_channel::{DataChannel, Role};
use soundbridge_core::device::{default_output, loopback_capture_device, virtual_cable_output};
use soundbridge_core::error::CoreResult;
use soundbridge_core::worker::{ClientSpeakerSender, Worker};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// One live audio session: a single bidirectional data channel (sender side
/// keyed to `speaker_config`, receiver side to `microphone_config`) plus the
/// loopback-capture-to-server worker and the server-microphone-to-virtual-cable
/// worker it feeds. Dropped and rebuilt fresh on every reload cycle.
struct ClientSession {
    data_channel: DataChannel,
    speaker_sender: ClientSpeakerSender,
    mic_receiver: Worker,
}

impl ClientSession {
    fn start(server_addr: SocketAddr, speaker_config: AudioConfig, microphone_config: AudioConfig) -> CoreResult<Self> {
        let virtual_cable = virtual_cable_output()?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let mut data_channel = DataChannel::new(
            socket,
            Role::Client,
            &speaker_config,
            &microphone_config,
            Some(server_addr),
        )?;
        data_channel.start();

        let speaker_sender = ClientSpeakerSender::spawn(
            loopback_capture_device()?,
            default_output()?,
            speaker_config,
            data_channel.tx_queue(),
        )?;
        let mic_receiver = Worker::spawn_receiver(
            "client-microphone-receiver",
            virtual_cable,
            microphone_config,
            data_channel.rx_queue(),
        )?;

        Ok(Self {
            data_channel,
            speaker_sender,
            mic_receiver,
        })
    }

    fn stop(mut self) {
        self.speaker_sender.stop();
        self.mic_receiver.stop();
        self.data_channel.stop();
    }
}

/// The client's reload-driven session loop: fetch the server's current
/// configs, run a session until `STOP`, tear it down, wait for `START`, and
/// loop. Runs until `run_flag` clears.
fn run_client_sessions(control: &ControlChannelClient, run_flag: &AtomicBool, server_addr: SocketAddr) {
    while run_flag.load(Ordering::Relaxed) {
        let speaker_config = match control.speaker_config() {
            Ok(c) => c,
            Err(err) => {
                warn!(%err, "failed to fetch speaker config, retrying");
                continue;
            }
        };
        let microphone_config = match control.microphone_config() {
            Ok(c) => c,
            Err(err) => {
                warn!(%err, "failed to fetch microphone config, retrying");
                continue;
            }
        };
        info!(?speaker_config, ?microphone_config, "building client audio session");

        let session = match ClientSession::start(server_addr, speaker_config, microphone_config) {
            Ok(s) => s,
            Err(err) => {
                error!(%err, "failed to build client audio session, retrying shortly");
                std::thread::sleep(std::time::Duration::from_secs(1));
                continue;
            }
        };

        control.wait_for_stop(run_flag);
        info!("STOP received, tearing down client audio session");
        session.stop();

        if !run_flag.load(Ordering::Relaxed) {
            break;
        }
        control.wait_for_start(run_flag);
        info!("START received, rebuilding client audio session");
    }
}

fn main() -> Result<()> {
    init_logging();
    info!("soundbridge client starting");

    // Fatal if missing: without the virtual cable there is nowhere to play
    // the server's microphone feed.
    virtual_cable_output().context("virtual cable not found on this host")?;

    let server_addr: SocketAddr = format!("{}:{}", server_host(), data_port()).parse()?;
    let control_addr: SocketAddr = format!("{}:{}", server_host(), control_port()).parse()?;

    let shared_control_socket = UdpSocket::bind("0.0.0.0:0").context("binding control socket")?;

    let heartbeat_run_flag = Arc::new(AtomicBool::new(true));
    let heartbeat_handle =
        ControlChannelClient::spawn_heartbeat(shared_control_socket.try_clone()?, control_addr, heartbeat_run_flag.clone());

    let toggle_control = ControlChannelClient::connect(shared_control_socket.try_clone()?, control_addr)?;

    let session_run_flag = Arc::new(AtomicBool::new(true));
    let session_flag_for_thread = session_run_flag.clone();
    let session_handle = std::thread::Builder::new()
        .name("client-session-loop".into())
        .spawn(move || {
            let control = match ControlChannelClient::connect(shared_control_socket, control_addr) {
                Ok(c) => c,
                Err(err) => {
                    error!(%err, "failed to set up session control socket");
                    return;
                }
            };
            run_client_sessions(&control, &session_flag_for_thread, server_addr);
        })
        .expect("failed to spawn client session loop thread");

    info!("soundbridge client ready; type 'm' + enter to toggle the microphone, anything else exits");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.unwrap_or_default();
        if line.trim() == "m" {
            match toggle_control.toggle_microphone() {
                Ok(enabled) => info!(enabled, "microphone toggled"),
                Err(err) => warn!(%err, "toggle microphone failed"),
            }
        } else {
            break;
        }
    }

    heartbeat_run_flag.store(false, Ordering::Relaxed);
    session_run_flag.store(false, Ordering::Relaxed);
    let _ = heartbeat_handle.join();
    let _ = session_handle.join();
    info!("soundbridge client shutting down");
    Ok(())
}
