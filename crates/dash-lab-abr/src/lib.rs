//! Adaptive-bitrate decision logic used by the streaming client.
//!
//! The client asks its [`AdaptationAlgorithm`] which representation to fetch next
//! and how long to wait before requesting it. Algorithms only see the download
//! history, the buffer level and the bitrate ladder.

mod festive;
mod ladder;
mod panda;
mod tobasco;

use dash_lab_abstract::{SetupError, SimTime};
use serde::Serialize;
use tracing::warn;

pub use festive::Festive;
pub use ladder::SegmentTable;
pub use panda::Panda;
pub use tobasco::Tobasco;

/// One finished segment download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadRecord {
    pub segment: usize,
    pub representation: usize,
    pub requested_at: SimTime,
    pub first_byte_at: SimTime,
    pub completed_at: SimTime,
    pub bytes: u64,
}

impl DownloadRecord {
    /// Time from request to last byte, never zero.
    pub fn download_time(&self) -> SimTime {
        (self.completed_at - self.requested_at).max(SimTime::from_nanos(1))
    }

    pub fn throughput_bps(&self) -> f64 {
        self.bytes as f64 * 8.0 / self.download_time().as_secs_f64()
    }
}

/// Everything an algorithm may look at when choosing the next segment.
#[derive(Debug, Clone, Copy)]
pub struct AdaptationInput<'a> {
    pub segment: usize,
    pub now: SimTime,
    pub downloads: &'a [DownloadRecord],
    pub buffer_level: SimTime,
    pub table: &'a SegmentTable,
    /// Representation of the previous segment (0 before the first download).
    pub current: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub representation: usize,
    /// Wait this long before issuing the request.
    pub delay: SimTime,
    /// Short label for the adaptation log.
    pub reason: &'static str,
}

impl Decision {
    fn now(representation: usize, reason: &'static str) -> Self {
        Self {
            representation,
            delay: SimTime::ZERO,
            reason,
        }
    }
}

pub trait AdaptationAlgorithm {
    fn name(&self) -> &'static str;

    fn next(&mut self, input: &AdaptationInput<'_>) -> Decision;
}

/// Map a user-visible algorithm name to a fresh instance.
pub fn algorithm_by_name(name: &str) -> Result<Box<dyn AdaptationAlgorithm>, SetupError> {
    match name {
        "festive" => Ok(Box::new(Festive::default())),
        "panda" => Ok(Box::new(Panda::default())),
        "tobasco" => Ok(Box::new(Tobasco::default())),
        other => {
            warn!("No adaptation algorithm named '{}'", other);
            Err(SetupError::UnknownAlgorithm(other.to_string()))
        }
    }
}

/// Harmonic mean of the throughput of the last `window` downloads.
pub(crate) fn harmonic_mean_throughput(downloads: &[DownloadRecord], window: usize) -> Option<f64> {
    let recent = &downloads[downloads.len().saturating_sub(window)..];
    if recent.is_empty() {
        return None;
    }
    let inverse_sum: f64 = recent.iter().map(|d| 1.0 / d.throughput_bps()).sum();
    Some(recent.len() as f64 / inverse_sum)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn table() -> SegmentTable {
        // 4 representations at 0.4, 0.8, 1.6 and 3.2 Mbps for 2 s segments
        let rows = [100_000u64, 200_000, 400_000, 800_000]
            .iter()
            .map(|size| vec![*size; 10])
            .collect();
        SegmentTable::from_sizes(rows, SimTime::from_secs(2)).unwrap()
    }

    /// A download of `rep` that achieved `throughput_bps`.
    pub fn download(segment: usize, rep: usize, throughput_bps: f64, at: SimTime) -> DownloadRecord {
        let bytes = table().size(rep, segment);
        let secs = bytes as f64 * 8.0 / throughput_bps;
        DownloadRecord {
            segment,
            representation: rep,
            requested_at: at,
            first_byte_at: at,
            completed_at: at + SimTime::from_secs_f64(secs),
            bytes,
        }
    }

    pub fn input<'a>(
        table: &'a SegmentTable,
        downloads: &'a [DownloadRecord],
        buffer: SimTime,
        current: usize,
    ) -> AdaptationInput<'a> {
        AdaptationInput {
            segment: downloads.len(),
            now: downloads.last().map(|d| d.completed_at).unwrap_or_default(),
            downloads,
            buffer_level: buffer,
            table,
            current,
        }
    }
}
