//! Command/ACK request-reply endpoint.
//!
//! One UDP socket per plotter process, bound to the reply port and used to
//! send commands to any device's command port and wait for that device's
//! single reply. Carries no reorder or ring state of its own — the endpoint
//! never mutates reorder or ring state.
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::error::{CommandError, CommandResult};
use crate::frame::{self, AckBody, IdentificationRecord};

/// The ten command codes a plotter may send.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandCode {
    Ping = 0,
    GetId = 1,
    RegisterReceiver = 2,
    RemoveReceiver = 3,
    GetReceivers = 4,
    StartSampling = 5,
    StartOnTrigger = 6,
    StopSampling = 7,
    TriggerAck = 8,
    ForceTrigger = 9,
}

/// One entry in a GET_RECEIVERS reply or a REGISTER/REMOVE_RECEIVER echo.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiverAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Outcome of a REGISTER_RECEIVER exchange: the echoed address plus the
/// zero-based index the device assigned (or already held, if idempotent).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisteredReceiver {
    pub addr: ReceiverAddr,
    pub index: u8,
}

fn encode_receiver_payload(ip: Ipv4Addr, port: u16) -> [u8; 6] {
    let mut payload = [0u8; 6];
    payload[0..4].copy_from_slice(&ip.octets());
    LittleEndian::write_u16(&mut payload[4..6], port);
    payload
}

fn decode_receiver_tail(tail: &[u8]) -> CommandResult<ReceiverAddr> {
    if tail.len() < 6 {
        return Err(CommandError::CorruptReply(crate::error::FrameError::TooShort {
            need: 6,
            got: tail.len(),
        }));
    }
    let ip = Ipv4Addr::new(tail[0], tail[1], tail[2], tail[3]);
    let port = LittleEndian::read_u16(&tail[4..6]);
    Ok(ReceiverAddr { ip, port })
}

/// The command/ACK request-reply endpoint. One instance per plotter
/// process; talks to every device over the same socket.
pub struct CommandEndpoint {
    socket: UdpSocket,
    attempt_timeout: Duration,
    attempts: u32,
}

impl CommandEndpoint {
    /// Binds the reply-port socket with the per-attempt read timeout set.
    pub fn bind(reply_port: u16, attempt_timeout: Duration, attempts: u32) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, reply_port))?;
        socket.set_read_timeout(Some(attempt_timeout))?;
        Ok(Self {
            socket,
            attempt_timeout,
            attempts,
        })
    }

    /// Sends `code`/`payload` to `device` and returns the single raw reply
    /// datagram, retrying up to the configured attempt budget (300 ms × 3,
    /// 1 s total by default).
    fn exchange(&self, device: SocketAddr, code: CommandCode, payload: &[u8]) -> CommandResult<Vec<u8>> {
        let datagram = frame::encode_command(code as u32, payload);
        let mut buf = [0u8; 2048];

        for attempt in 1..=self.attempts {
            self.socket.send_to(&datagram, device)?;
            match self.socket.recv_from(&mut buf) {
                Ok((n, _from)) => return Ok(buf[..n].to_vec()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                    debug!("command {code:?} to {device}: attempt {attempt}/{} timed out", self.attempts);
                    continue;
                }
                Err(e) => return Err(CommandError::Io(e)),
            }
        }
        warn!("command {code:?} to {device}: no reply after {} attempts", self.attempts);
        Err(CommandError::NoReply)
    }

    /// Sends `code`/`payload` without waiting for a reply. TRIGGER_ACK and
    /// FORCE_TRIGGER are fire-and-forget from the plotter.
    fn send_only(&self, device: SocketAddr, code: CommandCode, payload: &[u8]) -> CommandResult<()> {
        let datagram = frame::encode_command(code as u32, payload);
        self.socket.send_to(&datagram, device)?;
        Ok(())
    }

    fn exchange_ack(&self, device: SocketAddr, code: CommandCode, payload: &[u8]) -> CommandResult<AckBody> {
        let raw = self.exchange(device, code, payload)?;
        let ack = frame::decode_ack(&raw)?;
        if ack.cmd_echo != code as u32 {
            return Err(CommandError::CommandMismatch {
                expected: code as u32,
                got: ack.cmd_echo,
            });
        }
        Ok(ack)
    }

    /// PING — expects a bare ACK echoing `cmd=0`.
    pub fn ping(&self, device: SocketAddr) -> CommandResult<()> {
        self.exchange_ack(device, CommandCode::Ping, &[]).map(|_| ())
    }

    /// GET_ID — expects an IDENTIFICATION packet, CRC-checked.
    pub fn get_id(&self, device: SocketAddr) -> CommandResult<IdentificationRecord> {
        let raw = self.exchange(device, CommandCode::GetId, &[])?;
        let body = frame::verify_and_strip(&raw)?;
        Ok(frame::decode_id(body)?)
    }

    /// REGISTER_RECEIVER — `port == 0` asks the device to use the sender's
    /// own address/port. Idempotent: re-registering an existing entry
    /// returns the same index.
    pub fn register_receiver(&self, device: SocketAddr, ip: Ipv4Addr, port: u16) -> CommandResult<RegisteredReceiver> {
        let payload = encode_receiver_payload(ip, port);
        let ack = self.exchange_ack(device, CommandCode::RegisterReceiver, &payload)?;
        let addr = decode_receiver_tail(&ack.tail)?;
        let index = *ack.tail.get(6).ok_or(CommandError::CorruptReply(crate::error::FrameError::TooShort {
            need: 7,
            got: ack.tail.len(),
        }))?;
        Ok(RegisteredReceiver { addr, index })
    }

    /// REMOVE_RECEIVER — echoes the removed (or absent) address.
    pub fn remove_receiver(&self, device: SocketAddr, ip: Ipv4Addr, port: u16) -> CommandResult<ReceiverAddr> {
        let payload = encode_receiver_payload(ip, port);
        let ack = self.exchange_ack(device, CommandCode::RemoveReceiver, &payload)?;
        decode_receiver_tail(&ack.tail)
    }

    /// GET_RECEIVERS — an ACK header followed by repeating (IPv4, port) pairs.
    pub fn get_receivers(&self, device: SocketAddr) -> CommandResult<Vec<ReceiverAddr>> {
        let ack = self.exchange_ack(device, CommandCode::GetReceivers, &[])?;
        let mut out = Vec::with_capacity(ack.tail.len() / 6);
        for chunk in ack.tail.chunks_exact(6) {
            out.push(decode_receiver_tail(chunk)?);
        }
        Ok(out)
    }

    /// START_SAMPLING — `num_packets == 0` means continuous.
    pub fn start_sampling(&self, device: SocketAddr, num_packets: u32) -> CommandResult<u64> {
        let ack = self.exchange_ack(device, CommandCode::StartSampling, &num_packets.to_le_bytes())?;
        Ok(decode_u64_echo(&ack.tail)?)
    }

    /// START_ON_TRIGGER — same payload/reply shape as START_SAMPLING.
    pub fn start_on_trigger(&self, device: SocketAddr, num_packets: u32) -> CommandResult<u64> {
        let ack = self.exchange_ack(device, CommandCode::StartOnTrigger, &num_packets.to_le_bytes())?;
        Ok(decode_u64_echo(&ack.tail)?)
    }

    /// STOP_SAMPLING — the ACK's tail carries the device's lifetime
    /// `packets_sent` counter for this session (S4).
    pub fn stop_sampling(&self, device: SocketAddr) -> CommandResult<u64> {
        let ack = self.exchange_ack(device, CommandCode::StopSampling, &[])?;
        Ok(decode_u64_echo(&ack.tail)?)
    }

    /// TRIGGER_ACK — fire-and-forget, sent once per fresh TRIGGER received.
    pub fn trigger_ack(&self, device: SocketAddr) -> CommandResult<()> {
        self.send_only(device, CommandCode::TriggerAck, &[])
    }

    /// FORCE_TRIGGER — fire-and-forget.
    pub fn force_trigger(&self, device: SocketAddr) -> CommandResult<()> {
        self.send_only(device, CommandCode::ForceTrigger, &[])
    }

    /// The attempt timeout this endpoint was configured with, exposed so
    /// callers (e.g. the trigger watchdog) can size their own waits
    /// relative to it.
    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }
}

fn decode_u64_echo(tail: &[u8]) -> CommandResult<u64> {
    if tail.len() < 8 {
        return Err(CommandError::CorruptReply(crate::error::FrameError::TooShort {
            need: 8,
            got: tail.len(),
        }));
    }
    Ok(LittleEndian::read_u64(&tail[0..8]))
}
