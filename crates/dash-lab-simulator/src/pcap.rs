use dash_lab_abstract::{Packet, SetupError, SimTime};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Link type for frames that start with a PPP protocol field.
pub const LINKTYPE_PPP: u32 = 9;
const SNAPLEN: u32 = 65_535;
const MAGIC: u32 = 0xa1b2_c3d4;

/// Classic libpcap writer with microsecond timestamps.
///
/// Opening the file is a setup error. Later write failures are logged once and
/// stop the capture; the simulation itself continues.
#[derive(Debug)]
pub struct PcapWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    frames: u64,
}

impl PcapWriter {
    pub fn create(path: &Path) -> Result<Self, SetupError> {
        let capture_error = |source| SetupError::Capture {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(capture_error)?;
        let mut writer = BufWriter::new(file);

        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&MAGIC.to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes());
        header.extend_from_slice(&4u16.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&SNAPLEN.to_le_bytes());
        header.extend_from_slice(&LINKTYPE_PPP.to_le_bytes());
        writer.write_all(&header).map_err(capture_error)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn write(&mut self, time: SimTime, packet: &Packet) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let frame = packet.encode_frame();
        let micros = time.as_micros();
        let captured = frame.len().min(SNAPLEN as usize);

        let mut record = Vec::with_capacity(16 + captured);
        record.extend_from_slice(&((micros / 1_000_000) as u32).to_le_bytes());
        record.extend_from_slice(&((micros % 1_000_000) as u32).to_le_bytes());
        record.extend_from_slice(&(captured as u32).to_le_bytes());
        record.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        record.extend_from_slice(&frame[..captured]);

        if let Err(err) = writer.write_all(&record) {
            warn!("Packet capture {} stopped: {}", self.path.display(), err);
            self.writer = None;
            return;
        }
        self.frames += 1;
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut()
            && let Err(err) = writer.flush()
        {
            warn!("Failed to flush packet capture {}: {}", self.path.display(), err);
            self.writer = None;
        }
    }
}
