//! ---
//! mes_section: "03-persistence-logging"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Durable event sink and read model."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::time::Duration;

/// Exponentially weighted moving average of append latency.
#[derive(Debug, Clone)]
pub struct WriteLatencyTracker {
    alpha: f64,
    average: Option<f64>,
    samples: u64,
}

impl Default for WriteLatencyTracker {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl WriteLatencyTracker {
    /// Tracker with smoothing factor `alpha` in `(0, 1]`.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            average: None,
            samples: 0,
        }
    }

    /// Fold one observed append latency into the average.
    pub fn observe(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64();
        self.average = Some(match self.average {
            Some(current) => current + self.alpha * (sample - current),
            None => sample,
        });
        self.samples += 1;
    }

    /// Current smoothed latency.
    pub fn current(&self) -> Duration {
        Duration::from_secs_f64(self.average.unwrap_or(0.0))
    }

    /// Number of observations folded in.
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_follows_sustained_latency() {
        let mut tracker = WriteLatencyTracker::new(0.5);
        tracker.observe(Duration::from_millis(100));
        assert_eq!(tracker.current(), Duration::from_millis(100));
        for _ in 0..20 {
            tracker.observe(Duration::from_millis(10));
        }
        assert!(tracker.current() < Duration::from_millis(11));
        assert_eq!(tracker.samples(), 21);
    }
}
