//! Data ingest worker.
//!
//! One dedicated thread reads datagrams off the data-port socket and
//! dispatches each, by source address, to the originating device's
//! reorder engine or to the session controller's trigger handling. The
//! socket carries a short read timeout so shutdown is observed within
//! about 300 ms even with no traffic.
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::device::DeviceRegistry;
use crate::frame::{self, PacketType};
use crate::session::SessionController;

/// How long each blocking read on the data socket waits before checking
/// the shutdown flag.
pub const INGEST_READ_TIMEOUT: Duration = Duration::from_millis(300);

/// Counters the ingest worker maintains across every device.
#[derive(Default)]
pub struct IngestStats {
    /// Datagrams from a source address with no registered device.
    pub stray: AtomicU64,
    /// Datagrams whose CRC failed to verify.
    pub crc_errors: AtomicU64,
    /// Packet types other than DATA/TRIGGER seen on the data port.
    pub unclassified: AtomicU64,
}

/// Handle to the running ingest worker thread.
pub struct DataIngest {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    stats: Arc<IngestStats>,
    handle: Option<JoinHandle<()>>,
}

impl DataIngest {
    /// Binds the data-port socket and spawns the ingest thread. Datagrams
    /// are demultiplexed against `registry`; TRIGGER packets are handed to
    /// `session` for the trigger sub-protocol.
    pub fn spawn(
        data_port: u16,
        registry: Arc<DeviceRegistry>,
        session: Arc<SessionController>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, data_port))?;
        socket.set_read_timeout(Some(INGEST_READ_TIMEOUT))?;
        let local_addr = socket.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(IngestStats::default());

        let worker_shutdown = Arc::clone(&shutdown);
        let worker_stats = Arc::clone(&stats);
        let handle = std::thread::Builder::new()
            .name("daqnet-ingest".into())
            .spawn(move || run(socket, registry, session, worker_shutdown, worker_stats))?;

        Ok(Self {
            local_addr,
            shutdown,
            stats,
            handle: Some(handle),
        })
    }

    /// The data-port address this worker actually bound to (useful when
    /// `data_port == 0` was requested for an ephemeral port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Signals the worker to stop; it observes the flag at the next socket
    /// read timeout.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DataIngest {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    socket: UdpSocket,
    registry: Arc<DeviceRegistry>,
    session: Arc<SessionController>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<IngestStats>,
) {
    let mut buf = [0u8; 4096];
    while !shutdown.load(Ordering::SeqCst) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                warn!("data ingest socket error: {e}");
                continue;
            }
        };
        dispatch(&buf[..n], from, &registry, &session, &stats);
    }
}

fn dispatch(
    datagram: &[u8],
    from: SocketAddr,
    registry: &DeviceRegistry,
    session: &SessionController,
    stats: &IngestStats,
) {
    let ip = match from {
        SocketAddr::V4(v4) => *v4.ip(),
        SocketAddr::V6(_) => {
            stats.stray.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let device = match registry.get(ip) {
        Some(device) => device,
        None => {
            debug!("stray datagram from unregistered address {from}");
            stats.stray.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let body = match frame::verify_and_strip(datagram) {
        Ok(body) => body,
        Err(e) => {
            stats.crc_errors.fetch_add(1, Ordering::Relaxed);
            let mut agg = device.aggregate.lock().unwrap();
            agg.stats.crc_error_count += 1;
            trace!("{ip}: CRC failure on data-port packet: {e}");
            return;
        }
    };

    if body.len() < 2 {
        stats.unclassified.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let packet_type = u16::from_le_bytes([body[0], body[1]]);
    match PacketType::from_u16(packet_type) {
        Some(PacketType::Data) => {
            let seq = match frame::decode_data_header(body) {
                Ok(seq) => seq,
                Err(e) => {
                    trace!("{ip}: malformed DATA header: {e}");
                    return;
                }
            };
            let mut agg = device.aggregate.lock().unwrap();
            agg.reorder.insert(seq, body.to_vec());
            agg.stats.packets_received += 1;
            agg.maybe_flush();
        }
        Some(PacketType::Trigger) => match frame::decode_trigger(body) {
            Ok(trigger) => {
                if let Err(e) = session.handle_trigger(&device, trigger) {
                    warn!("{ip}: trigger handling failed: {e}");
                }
            }
            Err(e) => trace!("{ip}: malformed TRIGGER body: {e}"),
        },
        _ => {
            debug!("{ip}: unexpected packet type {packet_type} on data port");
            stats.unclassified.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::CommandEndpoint;

    fn make_session() -> SessionController {
        let endpoint = CommandEndpoint::bind(0, Duration::from_millis(50), 1).unwrap();
        SessionController::new(endpoint, 10578)
    }

    #[test]
    fn stray_datagram_is_counted_and_dropped() {
        let registry = DeviceRegistry::new(90, 30, 1000);
        let session = make_session();
        let stats = IngestStats::default();
        let datagram = [0x02, 0x00, 0x05, 0x00, 0x5F, 0xBE];
        let from = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 10577));
        dispatch(&datagram, from, &registry, &session, &stats);
        assert_eq!(stats.stray.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn crc_failure_is_counted_on_known_device() {
        let registry = DeviceRegistry::new(90, 30, 1000);
        let addr = Ipv4Addr::new(10, 0, 0, 9);
        let device = registry.get_or_insert(addr);
        let session = make_session();
        let stats = IngestStats::default();
        let bad_datagram = [0x02, 0x00, 0x05, 0x00, 0x00, 0x00];
        let from = SocketAddr::V4(SocketAddrV4::new(addr, 10577));
        dispatch(&bad_datagram, from, &registry, &session, &stats);
        assert_eq!(stats.crc_errors.load(Ordering::Relaxed), 1);
        assert_eq!(device.aggregate.lock().unwrap().stats.crc_error_count, 1);
    }

    #[test]
    fn valid_data_packet_is_inserted_into_reorder_buffer() {
        let registry = DeviceRegistry::new(90, 30, 1000);
        let addr = Ipv4Addr::new(10, 0, 0, 9);
        let device = registry.get_or_insert(addr);
        let session = make_session();
        let stats = IngestStats::default();
        let datagram = [0x02, 0x00, 0x05, 0x00, 0x5F, 0xBE];
        let from = SocketAddr::V4(SocketAddrV4::new(addr, 10577));
        dispatch(&datagram, from, &registry, &session, &stats);
        let agg = device.aggregate.lock().unwrap();
        assert_eq!(agg.reorder.pending_len(), 1);
        assert_eq!(agg.stats.packets_received, 1);
    }
}
