use dash_lab_abstract::{SetupError, SimTime};
use std::fs;
use std::path::{Path, PathBuf};

/// Segment sizes per representation, read from a whitespace-separated text file.
///
/// Each non-empty line is one representation; its columns are the byte sizes of
/// consecutive segments. Lines starting with `#` are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTable {
    sizes: Vec<Vec<u64>>,
    bitrates: Vec<f64>,
    segment_duration: SimTime,
}

impl SegmentTable {
    pub fn load(path: &Path, segment_duration: SimTime) -> Result<Self, SetupError> {
        let text = fs::read_to_string(path).map_err(|source| SetupError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, segment_duration)
            .map_err(|reason| SetupError::SegmentTable {
                path: path.to_path_buf(),
                reason,
            })
    }

    pub fn from_sizes(sizes: Vec<Vec<u64>>, segment_duration: SimTime) -> Result<Self, SetupError> {
        Self::build(sizes, segment_duration).map_err(|reason| SetupError::SegmentTable {
            path: PathBuf::from("<memory>"),
            reason,
        })
    }

    fn parse(text: &str, segment_duration: SimTime) -> Result<Self, String> {
        let mut sizes = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let row = line
                .split_whitespace()
                .map(|field| {
                    field
                        .parse::<u64>()
                        .map_err(|_| format!("line {}: '{field}' is not a byte count", line_no + 1))
                })
                .collect::<Result<Vec<_>, _>>()?;
            sizes.push(row);
        }
        Self::build(sizes, segment_duration)
    }

    fn build(sizes: Vec<Vec<u64>>, segment_duration: SimTime) -> Result<Self, String> {
        if segment_duration.is_zero() {
            return Err("segment duration must be positive".to_string());
        }
        let Some(first) = sizes.first() else {
            return Err("no representations".to_string());
        };
        let segments = first.len();
        if segments == 0 {
            return Err("representation 0 has no segments".to_string());
        }
        for (rep, row) in sizes.iter().enumerate() {
            if row.len() != segments {
                return Err(format!(
                    "representation {rep} has {} segments, expected {segments}",
                    row.len()
                ));
            }
            if row.contains(&0) {
                return Err(format!("representation {rep} contains an empty segment"));
            }
        }

        let secs = segment_duration.as_secs_f64();
        let bitrates = sizes
            .iter()
            .map(|row| {
                let mean = row.iter().map(|&size| size as f64).sum::<f64>() / row.len() as f64;
                mean * 8.0 / secs
            })
            .collect();

        Ok(Self {
            sizes,
            bitrates,
            segment_duration,
        })
    }

    pub fn representations(&self) -> usize {
        self.sizes.len()
    }

    pub fn segments(&self) -> usize {
        self.sizes[0].len()
    }

    pub fn segment_duration(&self) -> SimTime {
        self.segment_duration
    }

    /// Byte size of `segment` at representation `rep`. Both indices are clamped.
    pub fn size(&self, rep: usize, segment: usize) -> u64 {
        let row = &self.sizes[rep.min(self.sizes.len() - 1)];
        row[segment.min(row.len() - 1)]
    }

    /// Average bitrate of representation `rep` in bits per second.
    pub fn bitrate(&self, rep: usize) -> f64 {
        self.bitrates[rep.min(self.bitrates.len() - 1)]
    }

    pub fn highest(&self) -> usize {
        self.sizes.len() - 1
    }

    /// Highest representation whose bitrate does not exceed `rate`, or 0.
    pub fn highest_below(&self, rate: f64) -> usize {
        self.bitrates
            .iter()
            .rposition(|&bitrate| bitrate <= rate)
            .unwrap_or(0)
    }
}
