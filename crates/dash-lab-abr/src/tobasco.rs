use dash_lab_abstract::SimTime;

use crate::{AdaptationAlgorithm, AdaptationInput, Decision};

/// TOBASCO: throughput rules that tighten or relax with the buffer zone the
/// client is in, plus a fast-start phase while the buffer keeps growing.
#[derive(Debug, Clone)]
pub struct Tobasco {
    min_buffer: SimTime,
    low_buffer: SimTime,
    high_buffer: SimTime,
    /// Fast start: next level must fit in this share of the average throughput.
    fast_start_share: f64,
    /// Below the minimum buffer: pick a level within this share of the last sample.
    panic_share: f64,
    /// Between low and high buffer: step up within this share of the average.
    step_up_share: f64,
    /// Samples averaged for the throughput estimate.
    window: usize,
    fast_start: bool,
    last_buffer: SimTime,
}

impl Default for Tobasco {
    fn default() -> Self {
        Self {
            min_buffer: SimTime::from_secs(10),
            low_buffer: SimTime::from_secs(20),
            high_buffer: SimTime::from_secs(50),
            fast_start_share: 0.75,
            panic_share: 0.33,
            step_up_share: 0.9,
            window: 3,
            fast_start: true,
            last_buffer: SimTime::ZERO,
        }
    }
}

impl AdaptationAlgorithm for Tobasco {
    fn name(&self) -> &'static str {
        "tobasco"
    }

    fn next(&mut self, input: &AdaptationInput<'_>) -> Decision {
        let Some(last) = input.downloads.last() else {
            return Decision::now(0, "initial");
        };
        let table = input.table;
        let recent = &input.downloads[input.downloads.len().saturating_sub(self.window)..];
        let average = recent.iter().map(|d| d.throughput_bps()).sum::<f64>() / recent.len() as f64;
        let latest = last.throughput_bps();
        let current = input.current.min(table.highest());
        let buffer = input.buffer_level;
        let growing = buffer > self.last_buffer;
        self.last_buffer = buffer;

        if self.fast_start {
            let fits = current < table.highest()
                && table.bitrate(current + 1) <= self.fast_start_share * average;
            if growing && buffer < self.high_buffer && fits {
                return Decision::now(current + 1, "fast-start");
            }
            if !growing || current == table.highest() || buffer >= self.high_buffer {
                self.fast_start = false;
            }
        }

        let (representation, reason) = if buffer < self.min_buffer {
            (table.highest_below(self.panic_share * latest).min(current), "buffer-min")
        } else if buffer < self.low_buffer {
            if current > 0 && table.bitrate(current) >= latest {
                (current - 1, "buffer-low")
            } else {
                (current, "hold")
            }
        } else if buffer < self.high_buffer {
            if current < table.highest() && table.bitrate(current + 1) <= self.step_up_share * average {
                (current + 1, "buffer-mid")
            } else {
                (current, "hold")
            }
        } else {
            (current, "buffer-high")
        };

        Decision {
            representation,
            delay: buffer.saturating_sub(self.high_buffer),
            reason,
        }
    }
}
