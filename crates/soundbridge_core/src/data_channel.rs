//! The UDP data channel: aggregates outgoing chunks into packets up to
//! `MAX_PACKET_SIZE`, and splits incoming packets back into chunks.
//!
//! A sender loop sleeps for one chunk-duration when too few chunks are
//! queued, otherwise drains as many whole chunks as fit in one packet and
//! sends them; a receiver loop receives, remembers the peer's address, and
//! splits the payload back into fixed-size chunks pushed onto the rx queue.

use std::io::Read;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::AudioConfig;
use crate::constants::{BUFFER_TIME, MAX_PACKET_SIZE, SOCKET_TIMEOUT};
use crate::error::{CoreError, CoreResult};
use crate::queue::RingQueue;

/// Whether this endpoint is the bridge's server or client half. Only the
/// server side remembers the peer address it last heard from, since the
/// client already knows the server's fixed address up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

struct Shared {
    dst_address: Mutex<Option<SocketAddr>>,
}

/// Packet-aggregation and queue-sizing quantities derived from a pair of
/// `AudioConfig`s, shared between construction and `restart`.
struct Derived {
    tx_chunk_size: usize,
    rx_chunk_size: usize,
    tx_chunks_per_pkt: usize,
    tx_pkt_duration: Duration,
    tx_capacity: usize,
    rx_capacity: usize,
    recv_buffer_hint: usize,
}

impl Derived {
    fn compute(tx_config: &AudioConfig, rx_config: &AudioConfig) -> CoreResult<Self> {
        let tx_chunk_size = tx_config.chunk_size();
        let rx_chunk_size = rx_config.chunk_size();
        if tx_chunk_size == 0 || rx_chunk_size == 0 {
            return Err(CoreError::ConfigError("chunk_size must be non-zero".into()));
        }
        let tx_chunks_per_pkt = (MAX_PACKET_SIZE / tx_chunk_size).max(1);
        let tx_pkt_duration = Duration::from_secs_f64(tx_config.chunk_duration() * tx_chunks_per_pkt as f64);
        let tx_capacity = ((BUFFER_TIME / tx_config.chunk_duration()).ceil() as usize).max(1);
        let rx_capacity = ((BUFFER_TIME / rx_config.chunk_duration()).ceil() as usize).max(1);
        // Shrink the OS receive buffer towards roughly one buffering window
        // of the inbound stream so a transient stall can't leave stale
        // audio queued up behind it, manifesting as growing delay.
        let recv_buffer_hint =
            (BUFFER_TIME * rx_config.sample_rate as f64 * rx_config.channels as f64 * rx_config.sample_bytes() as f64)
                as usize;
        Ok(Self {
            tx_chunk_size,
            rx_chunk_size,
            tx_chunks_per_pkt,
            tx_pkt_duration,
            tx_capacity,
            rx_capacity,
            recv_buffer_hint: recv_buffer_hint.max(rx_chunk_size),
        })
    }
}

/// A bidirectional UDP data channel for one audio direction (speaker or
/// microphone). Owns a socket and the tx/rx chunk queues that the audio
/// worker threads push to and pull from.
pub struct DataChannel {
    socket: Arc<UdpSocket>,
    role: Role,
    tx_queue: Arc<RingQueue<Vec<u8>>>,
    rx_queue: Arc<RingQueue<Vec<u8>>>,
    tx_chunk_size: usize,
    rx_chunk_size: usize,
    tx_chunks_per_pkt: usize,
    tx_pkt_duration: Duration,
    run_flag: Arc<AtomicBool>,
    shared: Arc<Shared>,
    sender_handle: Option<JoinHandle<()>>,
    receiver_handle: Option<JoinHandle<()>>,
}

impl DataChannel {
    /// Bind `socket` and compute queue capacities and packet-aggregation
    /// factors from `tx_config`/`rx_config`. `peer`, when `Some`, is the
    /// fixed destination used by the client; the server instead tracks the
    /// peer it last heard from.
    pub fn new(
        socket: UdpSocket,
        role: Role,
        tx_config: &AudioConfig,
        rx_config: &AudioConfig,
        peer: Option<SocketAddr>,
    ) -> CoreResult<Self> {
        socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        tune_tos(&socket);
        let socket = Arc::new(socket);
        let derived = Derived::compute(tx_config, rx_config)?;
        tune_recv_buffer(&socket, derived.recv_buffer_hint);

        Ok(Self {
            socket,
            role,
            tx_queue: Arc::new(RingQueue::new(derived.tx_capacity)),
            rx_queue: Arc::new(RingQueue::new(derived.rx_capacity)),
            tx_chunk_size: derived.tx_chunk_size,
            rx_chunk_size: derived.rx_chunk_size,
            tx_chunks_per_pkt: derived.tx_chunks_per_pkt,
            tx_pkt_duration: derived.tx_pkt_duration,
            run_flag: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(Shared {
                dst_address: Mutex::new(peer),
            }),
            sender_handle: None,
            receiver_handle: None,
        })
    }

    pub fn tx_queue(&self) -> Arc<RingQueue<Vec<u8>>> {
        self.tx_queue.clone()
    }

    pub fn rx_queue(&self) -> Arc<RingQueue<Vec<u8>>> {
        self.rx_queue.clone()
    }

    /// Push one outgoing chunk. Called by a capture worker thread.
    pub fn put_chunk(&self, chunk: Vec<u8>) {
        self.tx_queue.push(chunk);
    }

    /// Pop one incoming chunk, if any. Called by a playback worker thread.
    pub fn get_chunk(&self) -> Option<Vec<u8>> {
        self.rx_queue.pop()
    }

    /// Start the sender and receiver loop threads.
    pub fn start(&mut self) {
        self.run_flag.store(true, Ordering::Relaxed);

        let socket = self.socket.clone();
        let queue = self.tx_queue.clone();
        let shared = self.shared.clone();
        let run_flag = self.run_flag.clone();
        let chunks_per_pkt = self.tx_chunks_per_pkt;
        let pkt_duration = self.tx_pkt_duration;
        let role = self.role;
        self.sender_handle = Some(
            std::thread::Builder::new()
                .name("data-channel-sender".into())
                .spawn(move || sender_loop(socket, queue, shared, run_flag, chunks_per_pkt, pkt_duration, role))
                .expect("failed to spawn sender thread"),
        );

        let socket = self.socket.clone();
        let queue = self.rx_queue.clone();
        let shared = self.shared.clone();
        let run_flag = self.run_flag.clone();
        let rx_chunk_size = self.rx_chunk_size;
        let role = self.role;
        self.receiver_handle = Some(
            std::thread::Builder::new()
                .name("data-channel-receiver".into())
                .spawn(move || receiver_loop(socket, queue, shared, run_flag, rx_chunk_size, role))
                .expect("failed to spawn receiver thread"),
        );
    }

    /// Stop both loop threads, clearing `run_flag` and joining.
    pub fn stop(&mut self) {
        self.run_flag.store(false, Ordering::Relaxed);
        if let Some(h) = self.sender_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.receiver_handle.take() {
            let _ = h.join();
        }
    }

    /// Stop the loop threads, recompute packet-aggregation and queue-sizing
    /// quantities from `tx_config`/`rx_config`, replace the queues (any
    /// chunks still sitting in the old ones are dropped), then restart. The
    /// socket itself is retained.
    pub fn restart(&mut self, tx_config: &AudioConfig, rx_config: &AudioConfig) -> CoreResult<()> {
        self.stop();
        let derived = Derived::compute(tx_config, rx_config)?;
        tune_recv_buffer(&self.socket, derived.recv_buffer_hint);
        self.tx_chunk_size = derived.tx_chunk_size;
        self.rx_chunk_size = derived.rx_chunk_size;
        self.tx_chunks_per_pkt = derived.tx_chunks_per_pkt;
        self.tx_pkt_duration = derived.tx_pkt_duration;
        self.tx_queue = Arc::new(RingQueue::new(derived.tx_capacity));
        self.rx_queue = Arc::new(RingQueue::new(derived.rx_capacity));
        self.start();
        Ok(())
    }

    /// The peer last heard from (server role) or the fixed configured peer
    /// (client role).
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.shared.dst_address.lock().unwrap()
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sender_loop(
    socket: Arc<UdpSocket>,
    queue: Arc<RingQueue<Vec<u8>>>,
    shared: Arc<Shared>,
    run_flag: Arc<AtomicBool>,
    chunks_per_pkt: usize,
    pkt_duration: Duration,
    role: Role,
) {
    while run_flag.load(Ordering::Relaxed) {
        if queue.len() < chunks_per_pkt {
            std::thread::sleep(pkt_duration);
            continue;
        }
        let chunks = queue.pop_up_to(chunks_per_pkt);
        if chunks.is_empty() {
            continue;
        }
        let mut payload = Vec::with_capacity(chunks.iter().map(|c| c.len()).sum());
        for chunk in chunks {
            payload.extend_from_slice(&chunk);
        }
        let dst = *shared.dst_address.lock().unwrap();
        match (role, dst) {
            (_, Some(addr)) => {
                if let Err(err) = socket.send_to(&payload, addr) {
                    warn!(%err, "data channel send failed");
                }
            }
            (Role::Client, None) => {
                warn!("client data channel has no destination configured yet");
            }
            (Role::Server, None) => {
                trace!("server data channel has no peer yet, dropping outgoing packet");
            }
        }
    }
}

fn receiver_loop(
    socket: Arc<UdpSocket>,
    queue: Arc<RingQueue<Vec<u8>>>,
    shared: Arc<Shared>,
    run_flag: Arc<AtomicBool>,
    rx_chunk_size: usize,
    role: Role,
) {
    let mut buf = vec![0u8; crate::constants::MAX_PACKET_SIZE * 4];
    while run_flag.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if role == Role::Server {
                    let mut dst = shared.dst_address.lock().unwrap();
                    if *dst != Some(from) {
                        debug!(peer = %from, "data channel peer updated");
                    }
                    *dst = Some(from);
                }
                split_into_chunks(&buf[..len], rx_chunk_size, &queue);
            }
            Err(err) if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => {
                warn!(%err, "data channel receive failed");
            }
        }
    }
}

fn split_into_chunks(payload: &[u8], chunk_size: usize, queue: &RingQueue<Vec<u8>>) {
    if chunk_size == 0 {
        return;
    }
    let mut cursor = std::io::Cursor::new(payload);
    loop {
        let mut chunk = vec![0u8; chunk_size];
        match cursor.read_exact(&mut chunk) {
            Ok(()) => queue.push(chunk),
            Err(_) => break,
        }
    }
}

/// Best-effort `SO_RCVBUF` shrink to `size` bytes so the kernel socket
/// buffer can't accumulate more than about one buffering window of stale
/// datagrams; failure is logged and otherwise ignored.
#[cfg(unix)]
fn tune_recv_buffer(socket: &UdpSocket, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = socket.as_raw_fd();
    let size = size as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        trace!("SO_RCVBUF tuning failed, continuing with default size");
    }
}

#[cfg(not(unix))]
fn tune_recv_buffer(_socket: &UdpSocket, _size: usize) {}

/// Set `IP_TOS` to the low-delay class (`0x10`), requesting that routers
/// along the path prioritize latency over throughput for this socket's
/// datagrams; best-effort, ignored on failure.
#[cfg(unix)]
fn tune_tos(socket: &UdpSocket) {
    use std::os::fd::AsRawFd;
    const IPTOS_LOWDELAY: libc::c_int = 0x10;
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_TOS,
            &IPTOS_LOWDELAY as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        trace!("IP_TOS tuning failed, continuing with default traffic class");
    }
}

#[cfg(not(unix))]
fn tune_tos(_socket: &UdpSocket) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").unwrap()
    }

    #[test]
    fn test_tx_chunks_per_pkt_computed_from_max_packet_size() {
        let config = AudioConfig::new(48_000, 2, 8, 32); // chunk_size = 128 bytes
        let socket = local_socket();
        let dc = DataChannel::new(socket, Role::Client, &config, &config, None).unwrap();
        assert_eq!(dc.tx_chunk_size, 128);
        assert_eq!(dc.tx_chunks_per_pkt, MAX_PACKET_SIZE / 128);
    }

    #[test]
    fn test_split_into_chunks_exact_multiple() {
        let q: RingQueue<Vec<u8>> = RingQueue::new(8);
        let payload = vec![0u8; 256];
        split_into_chunks(&payload, 128, &q);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_split_into_chunks_drops_short_remainder() {
        let q: RingQueue<Vec<u8>> = RingQueue::new(8);
        let payload = vec![0u8; 200]; // one full 128-byte chunk, 72 bytes left over
        split_into_chunks(&payload, 128, &q);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_queue_bound_respects_buffer_time() {
        let config = AudioConfig::new(48_000, 2, 8, 32);
        let socket = local_socket();
        let dc = DataChannel::new(socket, Role::Client, &config, &config, None).unwrap();
        let expected = ((BUFFER_TIME / config.chunk_duration()).ceil() as usize).max(1);
        assert_eq!(dc.tx_queue.capacity(), expected);
        assert_eq!(dc.rx_queue.capacity(), expected);
    }

    #[test]
    fn test_put_and_get_chunk_round_trip() {
        let config = AudioConfig::new(48_000, 2, 8, 32);
        let socket = local_socket();
        let dc = DataChannel::new(socket, Role::Client, &config, &config, None).unwrap();
        dc.put_chunk(vec![1, 2, 3]);
        assert_eq!(dc.tx_queue().pop(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_scenario_c_end_to_end_aggregation_and_split() {
        // Two real sockets, one packet round trip: the receiver should see
        // exactly the chunks the sender aggregated.
        let config = AudioConfig::new(8_000, 1, 8, 32); // chunk_size = 64 bytes
        let server_socket = local_socket();
        let server_addr = server_socket.local_addr().unwrap();
        let client_socket = local_socket();

        let mut server_dc = DataChannel::new(server_socket, Role::Server, &config, &config, None).unwrap();
        let mut client_dc =
            DataChannel::new(client_socket, Role::Client, &config, &config, Some(server_addr)).unwrap();

        server_dc.start();
        client_dc.start();

        client_dc.put_chunk(vec![7u8; 64]);
        client_dc.put_chunk(vec![9u8; 64]);

        let mut received = None;
        for _ in 0..200 {
            if let Some(chunk) = server_dc.get_chunk() {
                received = Some(chunk);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        server_dc.stop();
        client_dc.stop();

        assert!(received.is_some());
    }
}
