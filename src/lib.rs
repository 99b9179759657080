#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]
//! `daqnet` implements the LAN-local telemetry wire protocol engine for
//! multi-channel sampling devices described in this crate's design
//! documents: command/ACK transport, data ingest, reorder & gap detection,
//! CRC-16/CCITT framing, and trigger-based session orchestration across one
//! or more devices.
//!
//! The visualization surface, CSV file format beyond the declared
//! [`csv::CsvSink`] interface, and device-side waveform generation are
//! explicitly out of scope; this crate is the wire protocol core that an
//! operator-facing application drives, as the `cli` feature's
//! `daqnet-plotter` binary demonstrates.

pub mod command;
pub mod config;
pub mod crc;
pub mod csv;
pub mod device;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod plotter;
pub mod reorder;
pub mod ring;
pub mod session;

pub use config::Config;
pub use device::{Device, DeviceRegistry};
pub use error::{CommandError, FrameError, SessionError};
pub use plotter::Plotter;
pub use session::SessionController;
