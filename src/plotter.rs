//! The plotter-facing runtime surface (`spec.md` §6.3, `SPEC_FULL.md` §6.3).
//!
//! Bundles the command endpoint, the data-ingest worker and the device
//! registry into one handle and exposes every operation the out-of-scope
//! visualization surface is expected to drive: connect/disconnect, ping,
//! get_id, register/remove/list receivers, start/stop sampling, force
//! trigger, save-buffer-to-CSV, and clear.
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;

use log::info;

use crate::command::{CommandEndpoint, ReceiverAddr, RegisteredReceiver};
use crate::config::Config;
use crate::csv::{CsvSink, DeviceSnapshot};
use crate::device::{Device, DeviceRegistry};
use crate::error::SessionResult;
use crate::frame::IdentificationRecord;
use crate::ingest::{DataIngest, IngestStats};
use crate::session::SessionController;

/// Opens a transient connected UDP socket to `device` to learn which local
/// address the OS would route through to reach it (`spec.md` §6.1:
/// "plotters auto-detect their local source IP by opening a transient
/// connected socket to the device"). No packet is actually sent.
pub fn local_source_ip(device: Ipv4Addr, command_port: u16) -> std::io::Result<Ipv4Addr> {
    let probe = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect(SocketAddrV4::new(device, command_port))?;
    match probe.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) => Ok(ip),
        std::net::IpAddr::V6(_) => Ok(Ipv4Addr::UNSPECIFIED),
    }
}

/// One running plotter process: re-bound sockets plus every known device's
/// aggregate state (`spec.md` §3 Lifecycles: "Sockets are created at
/// plotter startup and re-created on address/port change").
pub struct Plotter {
    config: Config,
    registry: Arc<DeviceRegistry>,
    session: Arc<SessionController>,
    ingest: Option<DataIngest>,
}

impl Plotter {
    /// Binds the reply-port and data-port sockets and starts the ingest
    /// worker (`spec.md` §6.3 "connect").
    pub fn connect(config: Config) -> std::io::Result<Self> {
        let endpoint = CommandEndpoint::bind(config.reply_port, config.reply_timeout, config.reply_attempts)?;
        let session = Arc::new(SessionController::new(endpoint, config.command_port));
        let registry = Arc::new(DeviceRegistry::new(config.min_buffer_size, config.chunk_size, config.ring_capacity));
        let ingest = DataIngest::spawn(config.data_port, Arc::clone(&registry), Arc::clone(&session))?;

        info!(
            "connected: command_port={} reply_port={} data_port={}",
            config.command_port, config.reply_port, config.data_port
        );

        Ok(Self {
            config,
            registry,
            session,
            ingest: Some(ingest),
        })
    }

    /// Tears down the ingest worker and drops all sockets
    /// (`spec.md` §6.3 "disconnect"). Device state is retained so a
    /// subsequent `connect` can resume inspecting already-captured buffers.
    pub fn disconnect(&mut self) {
        if let Some(ingest) = self.ingest.take() {
            ingest.stop();
        }
        info!("disconnected");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ingest_stats(&self) -> Option<&IngestStats> {
        self.ingest.as_ref().map(DataIngest::stats)
    }

    /// The data-port address actually bound (useful when `Config::data_port
    /// == 0` was requested for an ephemeral port, e.g. in tests).
    pub fn data_addr(&self) -> Option<std::net::SocketAddr> {
        self.ingest.as_ref().map(DataIngest::local_addr)
    }

    /// Returns the device for `addr`, registering it on first use.
    pub fn device(&self, addr: Ipv4Addr) -> Arc<Device> {
        self.registry.get_or_insert(addr)
    }

    pub fn known_devices(&self) -> Vec<Ipv4Addr> {
        self.registry.addrs()
    }

    pub fn ping(&self, addr: Ipv4Addr) -> SessionResult<()> {
        self.session.ping(&self.device(addr))
    }

    pub fn get_id(&self, addr: Ipv4Addr) -> SessionResult<IdentificationRecord> {
        self.session.get_id(&self.device(addr))
    }

    pub fn register_receiver(&self, addr: Ipv4Addr, ip: Ipv4Addr, port: u16) -> SessionResult<RegisteredReceiver> {
        self.session.register_receiver(&self.device(addr), ip, port)
    }

    pub fn remove_receiver(&self, addr: Ipv4Addr, ip: Ipv4Addr, port: u16) -> SessionResult<ReceiverAddr> {
        self.session.remove_receiver(&self.device(addr), ip, port)
    }

    pub fn list_receivers(&self, addr: Ipv4Addr) -> SessionResult<Vec<ReceiverAddr>> {
        self.session.get_receivers(&self.device(addr))
    }

    pub fn start_sampling(&self, addr: Ipv4Addr, num_packets: u32) -> SessionResult<u64> {
        self.session.start_sampling(&self.device(addr), num_packets)
    }

    pub fn start_on_trigger(&self, addr: Ipv4Addr, num_packets: u32) -> SessionResult<u64> {
        self.session.start_on_trigger(&self.device(addr), num_packets)
    }

    pub fn stop_sampling(&self, addr: Ipv4Addr) -> SessionResult<u64> {
        self.session.stop_sampling(&self.device(addr))
    }

    pub fn force_trigger(&self, addr: Ipv4Addr) -> SessionResult<()> {
        self.session.force_trigger(&self.device(addr))
    }

    /// Starts a leader/follower group: every follower is armed with
    /// START_ON_TRIGGER before the leader is given START_SAMPLING
    /// (`spec.md` §4.5).
    pub fn start_group(&self, leader: Ipv4Addr, followers: &[Ipv4Addr], num_packets: u32) -> SessionResult<()> {
        let leader_dev = self.device(leader);
        let follower_devs: Vec<Arc<Device>> = followers.iter().map(|&addr| self.device(addr)).collect();
        let follower_refs: Vec<&Device> = follower_devs.iter().map(Arc::as_ref).collect();
        crate::session::start_leader_follower_group(&self.session, &leader_dev, &follower_refs, num_packets)
    }

    /// `save-buffer-to-CSV`: snapshots the device's ring buffers under its
    /// lock and hands the copy to `sink` (`spec.md` §6.3, §5 "The UI
    /// snapshot copies or views the ring buffers under the lock;
    /// rendering runs lock-free on the copy").
    pub fn save_buffer_to_csv(&self, addr: Ipv4Addr, sink: &dyn CsvSink) -> std::io::Result<()> {
        let device = self.device(addr);
        let agg = device.aggregate.lock().unwrap();
        let absolute_index: Vec<u64> = agg.rings.index.iter().copied().collect();
        let channel_samples: Vec<Vec<i16>> = agg.rings.channels.iter().map(|c| c.samples.iter().copied().collect()).collect();
        let channel_errors: Vec<Vec<u8>> = agg.rings.channels.iter().map(|c| c.errors.iter().copied().collect()).collect();
        let sample_period_secs = 1.0 / crate::ring::NOMINAL_SAMPLE_RATE_HZ as f64;
        drop(agg);

        sink.write_device(&DeviceSnapshot {
            device: addr,
            absolute_index: &absolute_index,
            channel_samples: &channel_samples,
            channel_errors: &channel_errors,
            sample_period_secs,
        })
    }

    /// `clear`: empties a device's ring/reorder buffers and counters
    /// without forgetting its receiver registrations or channel count.
    pub fn clear(&self, addr: Ipv4Addr) {
        let device = self.device(addr);
        let mut agg = device.aggregate.lock().unwrap();
        agg.rings.clear();
        agg.reorder.reset();
        agg.stats = Default::default();
    }
}

impl Drop for Plotter {
    fn drop(&mut self) {
        self.disconnect();
    }
}
