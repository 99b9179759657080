//! Per-device aggregate: the owned structure that holds everything the
//! ingest worker and the UI/main activity share for one device.
//!
//! The reorder map, ring buffers, counters, receiver list and session state
//! all live behind one [`std::sync::Mutex`] per device: one lock, held only
//! for the duration of a single insert-plus-flush or a single UI snapshot.
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{SessionError, SessionResult};
use crate::reorder::ReorderBuffer;
use crate::ring::DeviceRings;

/// Minimum number of receiver slots every device in this deployment accepts.
pub const MIN_RECEIVER_SLOTS: usize = 4;

/// Device session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ArmedForTrigger,
    Sampling,
    Stopping,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::ArmedForTrigger => "ARMED_FOR_TRIGGER",
            Self::Sampling => "SAMPLING",
            Self::Stopping => "STOPPING",
        }
    }
}

/// The ordered set of (IPv4, port) pairs a device pushes data to.
/// Registration is idempotent and keeps the existing index for a
/// duplicate entry.
#[derive(Clone, Debug, Default)]
pub struct ReceiverRegistry {
    entries: Vec<(Ipv4Addr, u16)>,
}

impl ReceiverRegistry {
    /// Registers `(ip, port)`, returning its zero-based index. A duplicate
    /// registration returns the index it already holds.
    pub fn register(&mut self, ip: Ipv4Addr, port: u16) -> u8 {
        if let Some(idx) = self.entries.iter().position(|&(i, p)| i == ip && p == port) {
            return idx as u8;
        }
        self.entries.push((ip, port));
        (self.entries.len() - 1) as u8
    }

    /// Removes `(ip, port)` if present.
    pub fn remove(&mut self, ip: Ipv4Addr, port: u16) {
        self.entries.retain(|&(i, p)| !(i == ip && p == port));
    }

    pub fn list(&self) -> &[(Ipv4Addr, u16)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Running counters surfaced to the UI collaborator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// CRC failures on data-port packets attributed to this device.
    pub crc_error_count: u64,
    /// DATA packets accepted into the reorder buffer (pre-flush).
    pub packets_received: u64,
}

/// Everything one device needs, guarded by one lock.
pub struct DeviceAggregate {
    pub channel_count: usize,
    pub reorder: ReorderBuffer,
    pub rings: DeviceRings,
    pub receivers: ReceiverRegistry,
    pub session: SessionState,
    pub packets_sent: u64,
    pub stats: DeviceStats,
    /// The TRIGGER `packet_id` most recently acknowledged, so a retransmit
    /// of the same trigger is not double-acked (`spec.md` §4.5).
    pub last_trigger_ack: Option<u16>,
    min_buffer_size: usize,
    chunk_size: usize,
    ring_capacity: usize,
}

impl DeviceAggregate {
    fn new(min_buffer_size: usize, chunk_size: usize, ring_capacity: usize) -> Self {
        Self {
            channel_count: 0,
            reorder: ReorderBuffer::new(min_buffer_size, chunk_size),
            rings: DeviceRings::new(0, ring_capacity),
            receivers: ReceiverRegistry::default(),
            session: SessionState::Idle,
            packets_sent: 0,
            stats: DeviceStats::default(),
            last_trigger_ack: None,
            min_buffer_size,
            chunk_size,
            ring_capacity,
        }
    }

    /// Creates or resizes the reorder/ring buffers for `channel_count`
    /// channels, called on first GET_ID or when the count changes
    /// (`spec.md` §3 Lifecycles). Only valid at IDLE.
    pub fn set_channel_count(&mut self, channel_count: usize) -> SessionResult<()> {
        if self.session != SessionState::Idle {
            return Err(SessionError::WrongState {
                wanted: "IDLE",
                found: self.session.name(),
            });
        }
        if channel_count != self.channel_count {
            self.rings.resize(channel_count);
            self.reorder = ReorderBuffer::new(self.min_buffer_size, self.chunk_size);
            self.channel_count = channel_count;
        }
        Ok(())
    }

    /// Flushes one chunk if the reorder buffer has reached threshold,
    /// appending the drained packets to the ring buffers in ascending
    /// sequence order (`spec.md` §4.4 Flushing).
    pub fn maybe_flush(&mut self) {
        if !self.reorder.ready_to_flush() {
            return;
        }
        for flushed in self.reorder.take_flush_chunk() {
            self.apply_flushed(&flushed);
        }
    }

    /// Drains every pending packet, counting gaps across the whole run
    /// (`spec.md` §4.4 Drain on stop).
    pub fn flush_all(&mut self) {
        for flushed in self.reorder.flush_all() {
            self.apply_flushed(&flushed);
        }
    }

    fn apply_flushed(&mut self, flushed: &crate::reorder::FlushedPacket) {
        match crate::frame::decode_data_samples(&flushed.body, self.channel_count) {
            Ok((channels, errors)) => self.rings.extend_from_packet(flushed.seq, &channels, &errors),
            Err(e) => log::warn!("dropping flushed packet seq={}: {e}", flushed.seq),
        }
    }
}

/// One device: its address plus its lock-guarded aggregate.
pub struct Device {
    pub addr: Ipv4Addr,
    pub aggregate: Mutex<DeviceAggregate>,
}

impl Device {
    fn new(addr: Ipv4Addr, min_buffer_size: usize, chunk_size: usize, ring_capacity: usize) -> Self {
        Self {
            addr,
            aggregate: Mutex::new(DeviceAggregate::new(min_buffer_size, chunk_size, ring_capacity)),
        }
    }
}

/// Registry of known devices, keyed by source IPv4 address
/// (`spec.md` §4.3 Dispatch: "the source IPv4 selects the device
/// instance"). Shared between the ingest worker and the main/UI activity
/// via `Arc`.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<std::collections::HashMap<Ipv4Addr, Arc<Device>>>,
    min_buffer_size: usize,
    chunk_size: usize,
    ring_capacity: usize,
}

impl DeviceRegistry {
    pub fn new(min_buffer_size: usize, chunk_size: usize, ring_capacity: usize) -> Self {
        Self {
            devices: RwLock::new(std::collections::HashMap::new()),
            min_buffer_size,
            chunk_size,
            ring_capacity,
        }
    }

    /// Returns the device for `addr`, creating it (in IDLE, channel count
    /// unknown) if this is the first time it's been seen.
    pub fn get_or_insert(&self, addr: Ipv4Addr) -> Arc<Device> {
        if let Some(dev) = self.devices.read().unwrap().get(&addr) {
            return Arc::clone(dev);
        }
        let mut devices = self.devices.write().unwrap();
        Arc::clone(
            devices
                .entry(addr)
                .or_insert_with(|| Arc::new(Device::new(addr, self.min_buffer_size, self.chunk_size, self.ring_capacity))),
        )
    }

    /// Returns the device for `addr` if it's already known, without
    /// creating one (`spec.md` §4.3: unknown addresses are "stray").
    pub fn get(&self, addr: Ipv4Addr) -> Option<Arc<Device>> {
        self.devices.read().unwrap().get(&addr).map(Arc::clone)
    }

    pub fn addrs(&self) -> Vec<Ipv4Addr> {
        self.devices.read().unwrap().keys().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn receiver_registration_is_idempotent() {
        let mut registry = ReceiverRegistry::default();
        let first = registry.register(Ipv4Addr::new(192, 168, 2, 5), 10577);
        let second = registry.register(Ipv4Addr::new(192, 168, 2, 5), 10577);
        assert_eq!(first, 0);
        assert_eq!(second, 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn set_channel_count_rejects_outside_idle() {
        let mut agg = DeviceAggregate::new(90, 30, 1000);
        agg.session = SessionState::Sampling;
        assert!(matches!(
            agg.set_channel_count(4),
            Err(SessionError::WrongState { .. })
        ));
    }

    #[test]
    fn registry_reuses_existing_device() {
        let registry = DeviceRegistry::new(90, 30, 1000);
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        let a = registry.get_or_insert(addr);
        let b = registry.get_or_insert(addr);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get(Ipv4Addr::new(10, 0, 0, 2)).is_none());
    }
}
