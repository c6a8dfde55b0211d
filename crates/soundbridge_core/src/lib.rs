//! SoundBridge transport core.
//!
//! Provides the data/control channel protocols, playout buffering, worker
//! threads bridging `cpal` streams to the network, and device-reload
//! coordination that both the server and client binaries build on.

pub mod audio_io;
pub mod config;
pub mod constants;
pub mod control_channel;
pub mod data_channel;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod queue;
pub mod reload;
pub mod worker;

pub use config::AudioConfig;
pub use error::{CoreError, CoreResult};
