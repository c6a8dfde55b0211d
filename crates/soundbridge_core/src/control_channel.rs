//! The UDP control channel: a small ASCII command protocol for exchanging
//! `AudioConfig`s, toggling the microphone, and coordinating STOP/START
//! reloads.
//!
//! Requests are plain ASCII verbs (`SPEAKER_CONFIG`, `MICROPHONE_CONFIG`,
//! `TOGGLE_MICROPHONE`), config replies are `<prefix-byte><config-json>`
//! where the prefix is the first byte of the request, and a background
//! heartbeat keeps the client's address fresh on the server.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::AudioConfig;
use crate::constants::{HEARTBEAT_INTERVAL, RELOAD_PUSH_ATTEMPTS, RELOAD_PUSH_INTERVAL, SOCKET_TIMEOUT};
use crate::error::{CoreError, CoreResult};

const CMD_SPEAKER_CONFIG: &[u8] = b"SPEAKER_CONFIG";
const CMD_MICROPHONE_CONFIG: &[u8] = b"MICROPHONE_CONFIG";
const CMD_TOGGLE_MICROPHONE: &[u8] = b"TOGGLE_MICROPHONE";
const CMD_HEARTBEAT: &[u8] = b"HEARTBEAT";

const REPLY_MIC_ON: &[u8] = b"MIC ON";
const REPLY_MIC_OFF: &[u8] = b"MIC OFF";
const REPLY_ACK: &[u8] = b"ACK";
const REPLY_STOP: &[u8] = b"STOP";
const REPLY_START: &[u8] = b"START";

/// Callbacks the server consults to answer requests; kept as trait methods
/// rather than bare closures so `ControlChannelServer` can be constructed
/// once and wired to whatever owns the live `AudioConfig`s and mic state.
pub trait ControlHandlers: Send + Sync + 'static {
    fn speaker_config(&self) -> AudioConfig;
    fn microphone_config(&self) -> AudioConfig;
    /// Flip the microphone worker's running state and return the new state
    /// (`true` = running).
    fn toggle_microphone(&self) -> bool;
}

/// Server half of the control channel: answers config requests and pushes
/// STOP/START notifications to the last-known client address.
pub struct ControlChannelServer {
    socket: Arc<UdpSocket>,
    handlers: Arc<dyn ControlHandlers>,
    client_address: Arc<Mutex<Option<SocketAddr>>>,
    run_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlChannelServer {
    pub fn new(socket: UdpSocket, handlers: Arc<dyn ControlHandlers>) -> CoreResult<Self> {
        socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        Ok(Self {
            socket: Arc::new(socket),
            handlers,
            client_address: Arc::new(Mutex::new(None)),
            run_flag: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }

    pub fn client_address(&self) -> Option<SocketAddr> {
        *self.client_address.lock().unwrap()
    }

    /// Start the request-handling thread.
    pub fn start(&mut self) {
        self.run_flag.store(true, Ordering::Relaxed);
        let socket = self.socket.clone();
        let handlers = self.handlers.clone();
        let client_address = self.client_address.clone();
        let run_flag = self.run_flag.clone();
        self.handle = Some(
            std::thread::Builder::new()
                .name("control-channel-server".into())
                .spawn(move || request_handler(socket, handlers, client_address, run_flag))
                .expect("failed to spawn control channel thread"),
        );
    }

    pub fn stop(&mut self) {
        self.run_flag.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    /// Best-effort push of a STOP or START notification to the current
    /// client, retried `RELOAD_PUSH_ATTEMPTS` times since the control
    /// channel has no acknowledgement for these pushes.
    fn push_with_retries(&self, payload: &[u8]) {
        let Some(addr) = self.client_address() else {
            warn!("no known client address, skipping reload push");
            return;
        };
        for attempt in 0..RELOAD_PUSH_ATTEMPTS {
            if let Err(err) = self.socket.send_to(payload, addr) {
                warn!(%err, attempt, "reload push failed");
            }
            std::thread::sleep(RELOAD_PUSH_INTERVAL);
        }
    }

    pub fn push_stop(&self) {
        info!("pushing STOP to client");
        self.push_with_retries(REPLY_STOP);
    }

    pub fn push_start(&self) {
        info!("pushing START to client");
        self.push_with_retries(REPLY_START);
    }
}

impl Drop for ControlChannelServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn request_handler(
    socket: Arc<UdpSocket>,
    handlers: Arc<dyn ControlHandlers>,
    client_address: Arc<Mutex<Option<SocketAddr>>>,
    run_flag: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 256];
    while run_flag.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let cmd = &buf[..len];
                // A stray datagram from an unrecognized command must not
                // capture the channel away from the legitimate client, so
                // `client_address` only advances on a recognized command.
                if is_recognized(cmd) {
                    *client_address.lock().unwrap() = Some(from);
                }
                let reply = dispatch(cmd, handlers.as_ref());
                if let Err(err) = socket.send_to(&reply, from) {
                    warn!(%err, "control channel reply failed");
                }
            }
            Err(err) if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => warn!(%err, "control channel receive failed"),
        }
    }
}

fn is_recognized(cmd: &[u8]) -> bool {
    cmd == CMD_SPEAKER_CONFIG || cmd == CMD_MICROPHONE_CONFIG || cmd == CMD_TOGGLE_MICROPHONE || cmd == CMD_HEARTBEAT
}

fn dispatch(cmd: &[u8], handlers: &dyn ControlHandlers) -> Vec<u8> {
    if cmd == CMD_SPEAKER_CONFIG {
        config_reply(cmd[0], &handlers.speaker_config())
    } else if cmd == CMD_MICROPHONE_CONFIG {
        config_reply(cmd[0], &handlers.microphone_config())
    } else if cmd == CMD_TOGGLE_MICROPHONE {
        let enabled = handlers.toggle_microphone();
        debug!(enabled, "microphone toggled");
        if enabled {
            REPLY_MIC_ON.to_vec()
        } else {
            REPLY_MIC_OFF.to_vec()
        }
    } else if cmd == CMD_HEARTBEAT {
        REPLY_ACK.to_vec()
    } else {
        warn!(command = ?String::from_utf8_lossy(cmd), "unrecognized control command");
        Vec::new()
    }
}

/// `prefix` is the first byte of the request the client sent, so the
/// client can tell a `SPEAKER_CONFIG` reply apart from a `MICROPHONE_CONFIG`
/// reply arriving out of order.
fn config_reply(prefix: u8, config: &AudioConfig) -> Vec<u8> {
    let mut out = vec![prefix];
    out.extend_from_slice(&config.to_bytes());
    out
}

/// Client half of the control channel: requests configs from the server,
/// sends periodic heartbeats, and waits on STOP/START pushes.
pub struct ControlChannelClient {
    socket: UdpSocket,
    server_addr: SocketAddr,
}

impl ControlChannelClient {
    pub fn connect(local: UdpSocket, server_addr: SocketAddr) -> CoreResult<Self> {
        local.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        Ok(Self {
            socket: local,
            server_addr,
        })
    }

    fn request(&self, cmd: &[u8]) -> CoreResult<Vec<u8>> {
        self.socket.send_to(cmd, self.server_addr)?;
        let mut buf = [0u8; 512];
        let len = self.socket.recv(&mut buf)?;
        Ok(buf[..len].to_vec())
    }

    /// Request the server's speaker `AudioConfig`, retrying until a reply
    /// tagged with the request's own prefix byte and a valid JSON body
    /// arrives.
    pub fn speaker_config(&self) -> CoreResult<AudioConfig> {
        self.request_config(CMD_SPEAKER_CONFIG)
    }

    pub fn microphone_config(&self) -> CoreResult<AudioConfig> {
        self.request_config(CMD_MICROPHONE_CONFIG)
    }

    fn request_config(&self, cmd: &[u8]) -> CoreResult<AudioConfig> {
        let prefix = cmd[0];
        loop {
            match self.request(cmd) {
                Ok(reply) if reply.first() == Some(&prefix) => {
                    if let Some(config) = AudioConfig::from_bytes(&reply[1..]) {
                        return Ok(config);
                    }
                    warn!("malformed config reply, retrying");
                }
                Ok(_) => warn!("config reply prefix mismatch, retrying"),
                Err(err) => {
                    debug!(%err, "config request timed out, retrying");
                }
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    /// Ask the server to toggle microphone capture. Returns the new running
    /// state (`true` = running) on `MIC ON`/`MIC OFF`.
    pub fn toggle_microphone(&self) -> CoreResult<bool> {
        let reply = self.request(CMD_TOGGLE_MICROPHONE)?;
        if reply == REPLY_MIC_ON {
            Ok(true)
        } else if reply == REPLY_MIC_OFF {
            Ok(false)
        } else {
            Err(CoreError::ConfigError("unexpected toggle-microphone reply".into()))
        }
    }

    pub fn send_heartbeat(&self) -> CoreResult<()> {
        self.request(CMD_HEARTBEAT)?;
        Ok(())
    }

    /// Spawn a background thread sending a heartbeat every
    /// `HEARTBEAT_INTERVAL` until `run_flag` clears.
    pub fn spawn_heartbeat(socket: UdpSocket, server_addr: SocketAddr, run_flag: Arc<AtomicBool>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("control-channel-heartbeat".into())
            .spawn(move || {
                let client = match ControlChannelClient::connect(socket, server_addr) {
                    Ok(c) => c,
                    Err(err) => {
                        warn!(%err, "heartbeat client setup failed");
                        return;
                    }
                };
                while run_flag.load(Ordering::Relaxed) {
                    if let Err(err) = client.send_heartbeat() {
                        debug!(%err, "heartbeat failed");
                    }
                    std::thread::sleep(HEARTBEAT_INTERVAL);
                }
            })
            .expect("failed to spawn heartbeat thread")
    }

    /// Block until a `STOP` push arrives on `self.socket`, or `run_flag`
    /// clears.
    pub fn wait_for_stop(&self, run_flag: &AtomicBool) -> bool {
        self.wait_for_tag(REPLY_STOP, run_flag)
    }

    /// Block until a `START` push arrives, or `run_flag` clears.
    pub fn wait_for_start(&self, run_flag: &AtomicBool) -> bool {
        self.wait_for_tag(REPLY_START, run_flag)
    }

    fn wait_for_tag(&self, tag: &[u8], run_flag: &AtomicBool) -> bool {
        let mut buf = [0u8; 64];
        while run_flag.load(Ordering::Relaxed) {
            match self.socket.recv(&mut buf) {
                Ok(len) if &buf[..len] == tag => return true,
                Ok(_) => continue,
                Err(err) if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(_) => continue,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeHandlers {
        speaker: AudioConfig,
        mic: AudioConfig,
        mic_enabled: StdMutex<bool>,
    }

    impl ControlHandlers for FakeHandlers {
        fn speaker_config(&self) -> AudioConfig {
            self.speaker
        }
        fn microphone_config(&self) -> AudioConfig {
            self.mic
        }
        fn toggle_microphone(&self) -> bool {
            let mut guard = self.mic_enabled.lock().unwrap();
            *guard = !*guard;
            *guard
        }
    }

    fn fake_handlers() -> Arc<FakeHandlers> {
        Arc::new(FakeHandlers {
            speaker: AudioConfig::new(48_000, 2, 8, 32),
            mic: AudioConfig::new(44_100, 1, 8, 32),
            mic_enabled: StdMutex::new(false),
        })
    }

    #[test]
    fn test_dispatch_speaker_config_uses_request_prefix() {
        let handlers = fake_handlers();
        let reply = dispatch(CMD_SPEAKER_CONFIG, handlers.as_ref());
        assert_eq!(reply[0], b'S');
        let config = AudioConfig::from_bytes(&reply[1..]).unwrap();
        assert_eq!(config, handlers.speaker);
    }

    #[test]
    fn test_dispatch_microphone_config_uses_request_prefix() {
        let handlers = fake_handlers();
        let reply = dispatch(CMD_MICROPHONE_CONFIG, handlers.as_ref());
        assert_eq!(reply[0], b'M');
        let config = AudioConfig::from_bytes(&reply[1..]).unwrap();
        assert_eq!(config, handlers.mic);
    }

    #[test]
    fn test_dispatch_toggle_microphone_on_then_off() {
        let handlers = fake_handlers();
        let first = dispatch(CMD_TOGGLE_MICROPHONE, handlers.as_ref());
        assert_eq!(first, REPLY_MIC_ON);
        let second = dispatch(CMD_TOGGLE_MICROPHONE, handlers.as_ref());
        assert_eq!(second, REPLY_MIC_OFF);
    }

    #[test]
    fn test_dispatch_unrecognized_command_empty_reply() {
        let handlers = fake_handlers();
        let reply = dispatch(b"NOT_A_REAL_COMMAND", handlers.as_ref());
        assert!(reply.is_empty());
    }

    #[test]
    fn test_scenario_a_end_to_end_config_request() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let handlers = fake_handlers();
        let mut server = ControlChannelServer::new(server_socket, handlers.clone()).unwrap();
        server.start();

        let client_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = ControlChannelClient::connect(client_socket, server_addr).unwrap();
        let config = client.speaker_config().unwrap();
        assert_eq!(config, handlers.speaker);

        server.stop();
    }

    #[test]
    fn test_scenario_b_toggle_microphone_round_trip() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let handlers = fake_handlers();
        let mut server = ControlChannelServer::new(server_socket, handlers).unwrap();
        server.start();

        let client_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = ControlChannelClient::connect(client_socket, server_addr).unwrap();
        assert_eq!(client.toggle_microphone().unwrap(), true);
        assert_eq!(client.toggle_microphone().unwrap(), false);

        server.stop();
    }

    #[test]
    fn test_scenario_f_unrecognized_command_does_not_capture_client_address() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let handlers = fake_handlers();
        let mut server = ControlChannelServer::new(server_socket, handlers).unwrap();
        server.start();

        let legit_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let legit = ControlChannelClient::connect(legit_socket, server_addr).unwrap();
        legit.speaker_config().unwrap();
        let legit_addr = legit.socket.local_addr().unwrap();
        assert_eq!(server.client_address(), Some(legit_addr));

        let stranger_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        stranger_socket.send_to(b"HELLO", server_addr).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(server.client_address(), Some(legit_addr));
        server.stop();
    }
}
