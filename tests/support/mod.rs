//! A minimal in-process UDP device stub, test scaffolding only
//! (`SPEC_FULL.md` §8). Speaks just enough of the wire protocol to drive
//! the scenarios in `spec.md` §8 end to end over real loopback sockets:
//! PING, GET_ID, REGISTER_RECEIVER, START/STOP_SAMPLING, TRIGGER/TRIGGER_ACK
//! with its bounded retry budget, and raw DATA injection.
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use daqnet::config::Config;
use daqnet::frame;

const CMD_PING: u32 = 0;
const CMD_GET_ID: u32 = 1;
const CMD_REGISTER_RECEIVER: u32 = 2;
const CMD_REMOVE_RECEIVER: u32 = 3;
const CMD_GET_RECEIVERS: u32 = 4;
const CMD_START_SAMPLING: u32 = 5;
const CMD_START_ON_TRIGGER: u32 = 6;
const CMD_STOP_SAMPLING: u32 = 7;
const CMD_TRIGGER_ACK: u32 = 8;
const CMD_FORCE_TRIGGER: u32 = 9;

/// Interval between TRIGGER retransmissions in this stub's retry loop
/// (`spec.md` §4.5: "at intervals equal to the command-socket timeout").
/// Kept short here so tests run quickly.
const TRIGGER_RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Default)]
struct StubState {
    receivers: Vec<SocketAddr>,
    packets_sent: u64,
    armed: bool,
    trigger_acked: bool,
    /// TRIGGER packets sent in the current trigger cycle, reset on each
    /// FORCE_TRIGGER (or external trigger fire).
    retransmits: u32,
}

/// A single-channel device stub bound to an ephemeral command port.
pub struct DeviceStub {
    pub command_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    next_trigger_id: Arc<AtomicU16>,
    state: Arc<Mutex<StubState>>,
}

impl DeviceStub {
    pub fn spawn() -> Self {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let command_addr = socket.local_addr().unwrap();
        let socket = Arc::new(socket);

        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(StubState::default()));
        let next_trigger_id = Arc::new(AtomicU16::new(1));

        let worker_shutdown = Arc::clone(&shutdown);
        let worker_state = Arc::clone(&state);
        let worker_trigger_id = Arc::clone(&next_trigger_id);
        let handle = std::thread::spawn(move || run(socket, worker_shutdown, worker_state, worker_trigger_id));

        Self {
            command_addr,
            shutdown,
            handle: Some(handle),
            next_trigger_id,
            state,
        }
    }

    pub fn packets_sent(&self) -> u64 {
        self.state.lock().unwrap().packets_sent
    }

    /// TRIGGER packets sent in the current (or most recently completed)
    /// trigger cycle — exercises the `spec.md` §4.5 bounded retry budget.
    pub fn retransmit_count(&self) -> u32 {
        self.state.lock().unwrap().retransmits
    }
}

impl Drop for DeviceStub {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(socket: Arc<UdpSocket>, shutdown: Arc<AtomicBool>, state: Arc<Mutex<StubState>>, next_trigger_id: Arc<AtomicU16>) {
    let mut buf = [0u8; 2048];
    while !shutdown.load(Ordering::SeqCst) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(_) => continue,
        };
        if n < 4 {
            continue;
        }
        let code = LittleEndian::read_u32(&buf[0..4]);
        let payload = &buf[4..n];
        handle_command(&socket, from, code, payload, &state, &next_trigger_id);
    }
}

fn send_ack(socket: &UdpSocket, to: SocketAddr, cmd_echo: u32, tail: &[u8]) {
    let mut out = vec![0u8; 8];
    LittleEndian::write_u16(&mut out[0..2], 0); // type=ACK
    LittleEndian::write_u16(&mut out[2..4], 0); // error=0
    LittleEndian::write_u32(&mut out[4..8], cmd_echo);
    out.extend_from_slice(tail);
    let _ = socket.send_to(&out, to);
}

fn handle_command(
    socket: &Arc<UdpSocket>,
    from: SocketAddr,
    code: u32,
    payload: &[u8],
    state: &Arc<Mutex<StubState>>,
    next_trigger_id: &Arc<AtomicU16>,
) {
    match code {
        CMD_PING => send_ack(socket, from, CMD_PING, &[]),
        CMD_GET_ID => {
            let body = build_identification();
            let _ = socket.send_to(&body, from);
        }
        CMD_REGISTER_RECEIVER => {
            let (ip, port) = decode_receiver_payload(payload, from);
            let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
            let mut st = state.lock().unwrap();
            let index = match st.receivers.iter().position(|&r| r == addr) {
                Some(i) => i,
                None => {
                    st.receivers.push(addr);
                    st.receivers.len() - 1
                }
            };
            let mut tail = vec![0u8; 7];
            tail[0..4].copy_from_slice(&ip.octets());
            LittleEndian::write_u16(&mut tail[4..6], port);
            tail[6] = index as u8;
            send_ack(socket, from, CMD_REGISTER_RECEIVER, &tail);
        }
        CMD_REMOVE_RECEIVER => {
            let (ip, port) = decode_receiver_payload(payload, from);
            let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
            state.lock().unwrap().receivers.retain(|&r| r != addr);
            let mut tail = vec![0u8; 6];
            tail[0..4].copy_from_slice(&ip.octets());
            LittleEndian::write_u16(&mut tail[4..6], port);
            send_ack(socket, from, CMD_REMOVE_RECEIVER, &tail);
        }
        CMD_GET_RECEIVERS => {
            let st = state.lock().unwrap();
            let mut tail = Vec::with_capacity(st.receivers.len() * 6);
            for r in &st.receivers {
                if let SocketAddr::V4(v4) = r {
                    tail.extend_from_slice(&v4.ip().octets());
                    let mut port_buf = [0u8; 2];
                    LittleEndian::write_u16(&mut port_buf, v4.port());
                    tail.extend_from_slice(&port_buf);
                }
            }
            send_ack(socket, from, CMD_GET_RECEIVERS, &tail);
        }
        CMD_START_SAMPLING => {
            let num_packets = LittleEndian::read_u32(&payload[0..4]);
            {
                let mut st = state.lock().unwrap();
                st.packets_sent = 0;
            }
            send_sampling_run(socket, state, num_packets.max(1).min(5));
            send_ack(socket, from, CMD_START_SAMPLING, &(num_packets as u64).to_le_bytes());
        }
        CMD_START_ON_TRIGGER => {
            let num_packets = LittleEndian::read_u32(&payload[0..4]);
            state.lock().unwrap().armed = true;
            send_ack(socket, from, CMD_START_ON_TRIGGER, &(num_packets as u64).to_le_bytes());
        }
        CMD_STOP_SAMPLING => {
            let packets_sent = state.lock().unwrap().packets_sent;
            send_ack(socket, from, CMD_STOP_SAMPLING, &packets_sent.to_le_bytes());
        }
        CMD_TRIGGER_ACK => {
            state.lock().unwrap().trigger_acked = true;
        }
        CMD_FORCE_TRIGGER => {
            let packet_id = next_trigger_id.fetch_add(1, Ordering::SeqCst);
            {
                let mut st = state.lock().unwrap();
                st.trigger_acked = false;
                st.retransmits = 0;
            }
            let worker_socket = Arc::clone(socket);
            let worker_state = Arc::clone(state);
            std::thread::spawn(move || run_trigger_retry_cycle(worker_socket, worker_state, packet_id));
        }
        _ => {}
    }
}

/// Sends TRIGGER to every registered receiver, retrying at
/// [`TRIGGER_RETRY_INTERVAL`] until a TRIGGER_ACK lands or the configured
/// retry budget (`Config::trigger_retries`, `spec.md` §4.5: 10
/// retransmissions) is exhausted. Stops as soon as an ACK is observed,
/// before sending the next retransmission.
fn run_trigger_retry_cycle(socket: Arc<UdpSocket>, state: Arc<Mutex<StubState>>, packet_id: u16) {
    let max_retries = Config::default().trigger_retries;
    for _ in 0..max_retries {
        {
            let mut st = state.lock().unwrap();
            if st.trigger_acked {
                return;
            }
            st.retransmits += 1;
        }
        let receivers = state.lock().unwrap().receivers.clone();
        let body = build_trigger(packet_id, 0);
        for r in &receivers {
            let _ = socket.send_to(&body, r);
        }
        std::thread::sleep(TRIGGER_RETRY_INTERVAL);
    }
}

fn decode_receiver_payload(payload: &[u8], from: SocketAddr) -> (Ipv4Addr, u16) {
    let ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
    let port = LittleEndian::read_u16(&payload[4..6]);
    if port == 0 {
        match from {
            SocketAddr::V4(v4) => (*v4.ip(), v4.port()),
            SocketAddr::V6(_) => (ip, port),
        }
    } else {
        (ip, port)
    }
}

fn send_sampling_run(socket: &UdpSocket, state: &Arc<Mutex<StubState>>, count: u32) {
    let receivers = state.lock().unwrap().receivers.clone();
    for seq in 0..count as u16 {
        let body = build_data_packet(seq);
        for r in &receivers {
            let _ = socket.send_to(&body, r);
        }
        state.lock().unwrap().packets_sent += 1;
    }
}

fn build_data_packet(seq: u16) -> Vec<u8> {
    let mut body = vec![0u8; 4];
    LittleEndian::write_u16(&mut body[0..2], frame::PacketType::Data as u16);
    LittleEndian::write_u16(&mut body[2..4], seq);
    for k in 0..frame::SAMPLES_PER_PACKET {
        let mut buf = [0u8; 2];
        LittleEndian::write_i16(&mut buf, (seq as i16).wrapping_add(k as i16));
        body.extend_from_slice(&buf);
    }
    body.push(0); // one channel's error count
    body.push(0); // pad byte: channels_count is odd
    let crc = daqnet::crc::checksum(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

fn build_trigger(packet_id: u16, sample_offset: u8) -> Vec<u8> {
    let mut body = vec![0u8; 5];
    LittleEndian::write_u16(&mut body[0..2], frame::PacketType::Trigger as u16);
    LittleEndian::write_u16(&mut body[2..4], packet_id);
    body[4] = sample_offset;
    let crc = daqnet::crc::checksum(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

fn build_identification() -> Vec<u8> {
    let mut body = vec![0u8; frame::ID_HEADER_LEN];
    LittleEndian::write_u16(&mut body[0..2], frame::PacketType::Identification as u16);
    LittleEndian::write_u16(&mut body[74..76], 1); // channels_count = 1
    body.extend_from_slice(b"mV\0\0"); // unit
    body.extend_from_slice(&0f32.to_le_bytes()); // offset
    body.extend_from_slice(&1f32.to_le_bytes()); // gain
    let crc = daqnet::crc::checksum(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}
