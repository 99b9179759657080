//! CSV export collaborator.
//!
//! The CSV writer is treated as an external collaborator with file layout
//! left to the implementer. This module defines that interface as a trait
//! plus one in-tree file-backed implementation, so `save-buffer-to-CSV` is
//! callable end to end without a UI.
use std::fs::File;
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// A per-device snapshot ready to write out: the absolute-index axis and
/// one sample/error-flag column per channel, all of equal length.
pub struct DeviceSnapshot<'a> {
    pub device: Ipv4Addr,
    pub absolute_index: &'a [u64],
    pub channel_samples: &'a [Vec<i16>],
    pub channel_errors: &'a [Vec<u8>],
    /// Nominal seconds between samples, for collaborators that want a time
    /// axis instead of (or alongside) the absolute-index column.
    pub sample_period_secs: f64,
}

/// External collaborator that persists a device's buffered samples. The
/// visualization surface and the CSV writer proper are both out of scope
/// for this crate; this trait is the declared interface between them and
/// the reorder/ring engine.
pub trait CsvSink {
    fn write_device(&self, snapshot: &DeviceSnapshot<'_>) -> io::Result<()>;
}

/// Writes one CSV file per device, named by its IPv4 address, into a
/// configured output directory. Columns: `absolute_index`, then
/// `ch{N}_sample` and `ch{N}_error` per channel.
pub struct FileCsvSink {
    out_dir: PathBuf,
}

impl FileCsvSink {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self { out_dir: out_dir.into() }
    }

    fn path_for(&self, device: Ipv4Addr) -> PathBuf {
        self.out_dir.join(format!("{device}.csv"))
    }
}

impl CsvSink for FileCsvSink {
    fn write_device(&self, snapshot: &DeviceSnapshot<'_>) -> io::Result<()> {
        let path: &Path = &self.path_for(snapshot.device);
        let mut file = File::create(path)?;

        let channels_count = snapshot.channel_samples.len();
        write!(file, "absolute_index")?;
        for ch in 0..channels_count {
            write!(file, ",ch{ch}_sample,ch{ch}_error")?;
        }
        writeln!(file)?;

        for (row, &index) in snapshot.absolute_index.iter().enumerate() {
            write!(file, "{index}")?;
            for ch in 0..channels_count {
                let sample = snapshot.channel_samples[ch].get(row).copied().unwrap_or_default();
                let error = snapshot.channel_errors[ch].get(row).copied().unwrap_or_default();
                write!(file, ",{sample},{error}")?;
            }
            writeln!(file)?;
        }
        Ok(())
    }
}
