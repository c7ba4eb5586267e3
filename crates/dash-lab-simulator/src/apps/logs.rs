use dash_lab_abstract::SetupError;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A tab-separated log file. Creation failures are setup errors; write
/// failures during the run are reported once and end the file.
pub(crate) struct LogFile {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl LogFile {
    pub fn create(path: PathBuf, header: &str) -> Result<Self, SetupError> {
        let write_error = |source| SetupError::Write {
            path: path.clone(),
            source,
        };
        let file = File::create(&path).map_err(write_error)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{header}").map_err(write_error)?;
        Ok(Self {
            path,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&mut self, args: fmt::Arguments<'_>) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(err) = writer.write_fmt(args).and_then(|()| writer.write_all(b"\n")) {
            warn!("Log file {} stopped: {}", self.path.display(), err);
            self.writer = None;
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut()
            && let Err(err) = writer.flush()
        {
            warn!("Failed to flush {}: {}", self.path.display(), err);
            self.writer = None;
        }
    }
}

/// The four per-client logs written into the artifact directory.
pub(crate) struct ClientLogs {
    pub download: LogFile,
    pub playback: LogFile,
    pub adaptation: LogFile,
    pub buffer: LogFile,
}

impl ClientLogs {
    pub fn create(dir: &Path, client_id: usize) -> Result<Self, SetupError> {
        let file = |name: &str| dir.join(format!("cl{client_id}_{name}.txt"));
        Ok(Self {
            download: LogFile::create(
                file("downloadLog"),
                "Segment_Index\tRepresentation\tRequested_At\tFirst_Byte_At\tCompleted_At\tBytes\tThroughput_bps",
            )?,
            playback: LogFile::create(
                file("playbackLog"),
                "Segment_Index\tRepresentation\tPlayback_Start",
            )?,
            adaptation: LogFile::create(
                file("adaptationLog"),
                "Segment_Index\tDecision_Time\tRepresentation\tBitrate_bps\tDelay_s\tReason",
            )?,
            buffer: LogFile::create(file("bufferLog"), "Time\tBuffer_Level_s")?,
        })
    }

    pub fn paths(&self) -> [&Path; 4] {
        [
            self.download.path(),
            self.playback.path(),
            self.adaptation.path(),
            self.buffer.path(),
        ]
    }

    pub fn flush(&mut self) {
        self.download.flush();
        self.playback.flush();
        self.adaptation.flush();
        self.buffer.flush();
    }
}
