//! Ties workers, data channel and control channel together into the
//! server's top-level object.
//! The client side rebuilds its audio session from scratch on every reload
//! cycle rather than holding one long-lived endpoint, so it assembles a
//! `DataChannel` and workers directly (see `soundbridge_client`).

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use tracing::info;

use crate::config::AudioConfig;
use crate::control_channel::{ControlChannelServer, ControlHandlers};
use crate::data_channel::{DataChannel, Role};
use crate::error::CoreResult;
use crate::worker::Worker;

/// Server endpoint: one bidirectional data channel carrying the microphone
/// direction (sender) and the speaker direction (receiver), plus the
/// control-channel handlers (the live `AudioConfig`s and mic-enabled flag).
/// The microphone capture worker is owned by the caller's [`ControlHandlers`]
/// impl (a `ToggleableSender`, since it can be started and stopped at
/// runtime); this struct owns only the speaker playback worker, which runs
/// continuously.
pub struct ServerEndpoint {
    pub control: Arc<ControlChannelServer>,
    pub data_channel: DataChannel,
    speaker_worker: Option<Worker>,
}

impl ServerEndpoint {
    /// Binds one data socket to the single bidirectional data channel —
    /// sender side keyed to `microphone_config`, receiver side to
    /// `speaker_config` — then calls `build_handlers` with the channel's
    /// outgoing queue so the caller's [`ControlHandlers`] impl (which owns
    /// the toggleable microphone worker) can be wired to it before the
    /// control channel starts answering requests.
    pub fn bind<H: ControlHandlers>(
        control_addr: SocketAddr,
        data_socket: UdpSocket,
        microphone_config: AudioConfig,
        speaker_config: AudioConfig,
        build_handlers: impl FnOnce(Arc<crate::queue::RingQueue<Vec<u8>>>) -> Arc<H>,
    ) -> CoreResult<Self> {
        let data_channel = DataChannel::new(data_socket, Role::Server, &microphone_config, &speaker_config, None)?;

        let handlers = build_handlers(data_channel.tx_queue());

        let control_socket = UdpSocket::bind(control_addr)?;
        let mut control = ControlChannelServer::new(control_socket, handlers)?;
        control.start();

        info!("server endpoint bound");
        Ok(Self {
            control: Arc::new(control),
            data_channel,
            speaker_worker: None,
        })
    }

    /// Start the speaker playback worker against `device`, popping chunks
    /// off the data channel's rx queue.
    pub fn start_speaker(&mut self, device: cpal::Device, config: AudioConfig) -> CoreResult<()> {
        let worker = Worker::spawn_receiver("server-speaker-receiver", device, config, self.data_channel.rx_queue())?;
        self.speaker_worker = Some(worker);
        Ok(())
    }

    /// Tear down the speaker playback worker, if running.
    pub fn stop_speaker(&mut self) {
        if let Some(mut worker) = self.speaker_worker.take() {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StaticHandlers {
        speaker: AudioConfig,
        mic: AudioConfig,
        mic_enabled: Mutex<bool>,
    }

    impl ControlHandlers for StaticHandlers {
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

    #[test]
    fn test_server_endpoint_binds_single_data_socket() {
        let data_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let control_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = ServerEndpoint::bind(
            control_addr,
            data_socket,
            AudioConfig::default(),
            AudioConfig::default(),
            |_mic_queue| {
                Arc::new(StaticHandlers {
                    speaker: AudioConfig::default(),
                    mic: AudioConfig::default(),
                    mic_enabled: Mutex::new(false),
                })
            },
        );
        assert!(server.is_ok());
    }
}
