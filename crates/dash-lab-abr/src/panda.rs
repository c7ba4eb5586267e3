use dash_lab_abstract::SimTime;

use crate::{AdaptationAlgorithm, AdaptationInput, Decision};

/// PANDA (probe and adapt): additive-increase probing of a target rate,
/// exponential smoothing, a dead-zone quantizer and buffer-driven request
/// scheduling.
#[derive(Debug, Clone)]
pub struct Panda {
    /// Probing convergence rate.
    k: f64,
    /// Additive increase in bits per second.
    w: f64,
    /// Smoothing convergence rate.
    alpha: f64,
    /// Buffer convergence rate for the request schedule.
    beta: f64,
    /// Dead-zone width for up-switches.
    epsilon: f64,
    min_buffer: SimTime,
    target_rate: Option<f64>,
    smoothed_rate: f64,
}

impl Default for Panda {
    fn default() -> Self {
        Self {
            k: 0.14,
            w: 300_000.0,
            alpha: 0.2,
            beta: 0.2,
            epsilon: 0.15,
            min_buffer: SimTime::from_secs(26),
            target_rate: None,
            smoothed_rate: 0.0,
        }
    }
}

impl AdaptationAlgorithm for Panda {
    fn name(&self) -> &'static str {
        "panda"
    }

    fn next(&mut self, input: &AdaptationInput<'_>) -> Decision {
        let Some(last) = input.downloads.last() else {
            return Decision::now(0, "initial");
        };
        let table = input.table;
        let measured = last.throughput_bps();
        let interval = last.download_time().as_secs_f64();

        let target = match self.target_rate {
            None => {
                self.smoothed_rate = measured;
                measured
            }
            Some(previous) => {
                let overshoot = (previous - measured + self.w).max(0.0);
                let probed = previous + self.k * interval * (self.w - overshoot);
                let probed = probed.max(table.bitrate(0));
                let gain = (self.alpha * interval).min(1.0);
                self.smoothed_rate -= gain * (self.smoothed_rate - probed);
                probed
            }
        };
        self.target_rate = Some(target);

        let current = input.current.min(table.highest());
        let up = table.highest_below(self.smoothed_rate * (1.0 - self.epsilon));
        let down = table.highest_below(self.smoothed_rate);
        let (representation, reason) = if current < up {
            (up, "up")
        } else if current <= down {
            (current, "hold")
        } else {
            (down, "down")
        };

        // Target inter-request time, corrected towards the minimum buffer.
        let smoothed = self.smoothed_rate.max(1.0);
        let fetch_secs = table.bitrate(representation) * table.segment_duration().as_secs_f64() / smoothed;
        let buffer_error = input.buffer_level.as_secs_f64() - self.min_buffer.as_secs_f64();
        let target_interval = fetch_secs + self.beta * buffer_error;
        let delay = SimTime::from_secs_f64(target_interval - interval);

        Decision {
            representation,
            delay,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{download, input, table};

    #[test]
    fn first_estimate_follows_measurement() {
        let table = table();
        let mut panda = Panda::default();
        let downloads = vec![download(0, 0, 2_000_000.0, SimTime::ZERO)];
        let decision = panda.next(&input(&table, &downloads, SimTime::from_secs(2), 0));
        // 0.85 * 2 Mbps = 1.7 Mbps admits 1.6 Mbps
        assert_eq!(decision.representation, 2);
        assert_eq!(decision.reason, "up");
    }

    #[test]
    fn dead_zone_holds_the_current_level() {
        let table = table();
        let mut panda = Panda::default();
        // 1.7 Mbps measured: 1.6 Mbps is reachable only without the dead zone
        let downloads = vec![download(0, 2, 1_700_000.0, SimTime::ZERO)];
        let decision = panda.next(&input(&table, &downloads, SimTime::from_secs(2), 2));
        assert_eq!(decision.representation, 2);
        assert_eq!(decision.reason, "hold");
    }

    #[test]
    fn no_delay_while_buffer_is_short() {
        let table = table();
        let mut panda = Panda::default();
        let downloads = vec![download(0, 0, 1_000_000.0, SimTime::ZERO)];
        let decision = panda.next(&input(&table, &downloads, SimTime::from_secs(2), 0));
        assert_eq!(decision.delay, SimTime::ZERO);
    }

    #[test]
    fn long_buffer_spaces_out_requests() {
        let table = table();
        let mut panda = Panda::default();
        let downloads = vec![download(0, 0, 1_000_000.0, SimTime::ZERO)];
        let decision = panda.next(&input(&table, &downloads, SimTime::from_secs(60), 0));
        assert!(decision.delay > SimTime::from_secs(5), "{}", decision.delay);
    }
}
