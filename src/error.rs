use std::io::Error as IoError;
use std::net::SocketAddr;

use thiserror::Error;

/// A framing [Result], conveniently wrapping the [FrameError].
pub type FrameResult<T> = std::result::Result<T, FrameError>;

#[derive(Error, Debug)]
/// Errors produced while encoding or decoding a packet on the wire.
pub enum FrameError {
    #[error("packet too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("CRC mismatch: expected {expected:#06X}, computed {computed:#06X}")]
    Crc { expected: u16, computed: u16 },
    #[error("unexpected packet type {got}, wanted {wanted}")]
    BadType { wanted: u16, got: u16 },
    #[error("channel count {0} is inconsistent with body length")]
    BadChannelLayout(usize),
}

/// A command [Result], conveniently wrapping the [CommandError].
pub type CommandResult<T> = std::result::Result<T, CommandError>;

#[derive(Error, Debug)]
/// Errors produced by the command/ACK request-reply endpoint.
pub enum CommandError {
    #[error("I/O error on command socket")]
    Io(#[from] IoError),
    #[error("no reply from device within the retry budget")]
    NoReply,
    #[error("reply failed CRC verification")]
    CorruptReply(#[from] FrameError),
    #[error("reply echoed command {got}, expected {expected}")]
    CommandMismatch { expected: u32, got: u32 },
}

/// A session [Result], conveniently wrapping the [SessionError].
pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
/// Errors produced by the per-device session controller.
pub enum SessionError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("channel count unknown for this device; call GET_ID first")]
    ChannelCountUnknown,
    #[error("no device registered for source address {0}")]
    UnknownDevice(SocketAddr),
    #[error("operation requires session state {wanted:?}, found {found:?}")]
    WrongState {
        wanted: &'static str,
        found: &'static str,
    },
}
