use dash_lab_abstract::SimTime;

use crate::{AdaptationAlgorithm, AdaptationInput, Decision, harmonic_mean_throughput};

/// FESTIVE: harmonic-mean bandwidth estimate, gradual up-switching and a
/// stability/efficiency trade-off before every switch.
#[derive(Debug, Clone)]
pub struct Festive {
    window: usize,
    /// Fraction of the estimated bandwidth the chosen bitrate may use.
    target_share: f64,
    /// Weight of efficiency relative to stability.
    alpha: f64,
    target_buffer: SimTime,
}

impl Default for Festive {
    fn default() -> Self {
        Self {
            window: 20,
            target_share: 0.85,
            alpha: 12.0,
            target_buffer: SimTime::from_secs(60),
        }
    }
}

impl Festive {
    fn switches(input: &AdaptationInput<'_>, window: usize) -> u32 {
        let recent = &input.downloads[input.downloads.len().saturating_sub(window)..];
        recent
            .windows(2)
            .filter(|pair| pair[0].representation != pair[1].representation)
            .count() as u32
    }

    fn segments_at(input: &AdaptationInput<'_>, rep: usize) -> usize {
        input
            .downloads
            .iter()
            .rev()
            .take_while(|d| d.representation == rep)
            .count()
    }

    fn score(&self, input: &AdaptationInput<'_>, rep: usize, reference: usize, target: f64) -> f64 {
        let switches = Self::switches(input, self.window) + u32::from(rep != input.current);
        let stability = 2f64.powi(switches as i32);
        let denominator = target.min(input.table.bitrate(reference)).max(1.0);
        let efficiency = (input.table.bitrate(rep) / denominator - 1.0).abs();
        stability + self.alpha * efficiency
    }

    fn delay(&self, buffer: SimTime) -> SimTime {
        buffer.saturating_sub(self.target_buffer)
    }
}

impl AdaptationAlgorithm for Festive {
    fn name(&self) -> &'static str {
        "festive"
    }

    fn next(&mut self, input: &AdaptationInput<'_>) -> Decision {
        let Some(bandwidth) = harmonic_mean_throughput(input.downloads, self.window) else {
            return Decision::now(0, "initial");
        };
        let target = bandwidth * self.target_share;
        let table = input.table;
        let current = input.current.min(table.highest());
        let current_rate = table.bitrate(current);

        // Step up one level at a time, and only after `current + 1` segments at this level.
        let reference = if current_rate < target && current < table.highest() {
            if Self::segments_at(input, current) > current {
                current + 1
            } else {
                current
            }
        } else if current_rate > target && current > 0 {
            current - 1
        } else {
            current
        };

        let (representation, reason) = if reference == current {
            (current, "hold")
        } else if self.score(input, reference, reference, target)
            < self.score(input, current, reference, target)
        {
            (reference, if reference > current { "up" } else { "down" })
        } else {
            (current, "stable")
        };

        Decision {
            representation,
            delay: self.delay(input.buffer_level),
            reason,
        }
    }
}
