//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Quality sampling and verdict rules."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::collections::HashMap;

use indexmap::IndexMap;
use r_mes_common::{AppConfig, LineId, OrderState, QualityConfig, ToleranceBand, Verdict};

/// Decides which units are sampled, evaluates measurements against tolerance
/// bands, and resolves failed samples into rework or scrap.
///
/// Evaluation is pure: the same measurements always yield the same verdict.
#[derive(Debug, Clone)]
pub struct QualityEvaluator {
    sample_every: u32,
    line_intervals: HashMap<LineId, u32>,
    max_rework: u32,
    tolerances: IndexMap<String, ToleranceBand>,
}

impl QualityEvaluator {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            sample_every: config.sample_every.max(1),
            line_intervals: HashMap::new(),
            max_rework: config.max_rework,
            tolerances: config.tolerances.clone(),
        }
    }

    /// Evaluator with every per-line sampling override from `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut evaluator = Self::new(&config.quality);
        for line in config.line_ids() {
            let interval = config.sample_every(&line);
            evaluator = evaluator.with_line_interval(line, interval);
        }
        evaluator
    }

    pub fn with_line_interval(mut self, line: LineId, every: u32) -> Self {
        self.line_intervals.insert(line, every.max(1));
        self
    }

    pub fn sample_interval(&self, line: &LineId) -> u32 {
        self.line_intervals
            .get(line)
            .copied()
            .unwrap_or(self.sample_every)
    }

    pub fn max_rework(&self) -> u32 {
        self.max_rework
    }

    pub fn band(&self, signal: &str) -> Option<ToleranceBand> {
        self.tolerances.get(signal).copied()
    }

    /// Every Nth unit is sampled, and so is the final unit of an order.
    pub fn is_checkpoint(&self, line: &LineId, unit_sequence: u32, target_quantity: u32) -> bool {
        unit_sequence > 0
            && (unit_sequence % self.sample_interval(line) == 0
                || unit_sequence == target_quantity)
    }

    /// Verdict for one sampled unit.
    ///
    /// `measurements` maps each measurement signal of the line to a `GOOD`
    /// value taken for the sampled unit. A missing value keeps the test
    /// `PENDING`; a signal without a tolerance band cannot fail the unit, and
    /// a line without measurement signals always passes.
    pub fn evaluate(&self, measurements: &IndexMap<String, Option<f64>>) -> Verdict {
        let mut verdict = Verdict::Pass;
        for (signal, value) in measurements {
            let Some(value) = value else {
                return Verdict::Pending;
            };
            if let Some(band) = self.tolerances.get(signal) {
                if !band.contains(*value) {
                    verdict = Verdict::Fail;
                }
            }
        }
        verdict
    }

    /// Where a failed sample goes: `REWORK` while the order still has rework
    /// budget, `SCRAPPED` once it is spent.
    pub fn resolve_fail(&self, rework_count: u32) -> OrderState {
        if rework_count < self.max_rework {
            OrderState::Rework
        } else {
            OrderState::Scrapped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> QualityEvaluator {
        let mut config = QualityConfig::default();
        config.sample_every = 5;
        config.max_rework = 2;
        config
            .tolerances
            .insert("c1.diameter".into(), ToleranceBand::new(9.9, 10.1));
        QualityEvaluator::new(&config)
    }

    fn readings(values: &[(&str, Option<f64>)]) -> IndexMap<String, Option<f64>> {
        values
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    #[test]
    fn samples_every_nth_and_final_unit() {
        let evaluator = evaluator().with_line_interval(LineId::from("C2"), 3);
        let c1 = LineId::from("C1");
        let sampled: Vec<u32> = (1..=12)
            .filter(|unit| evaluator.is_checkpoint(&c1, *unit, 12))
            .collect();
        assert_eq!(sampled, vec![5, 10, 12]);
        assert!(evaluator.is_checkpoint(&LineId::from("C2"), 3, 12));
        assert!(!evaluator.is_checkpoint(&c1, 0, 12));
    }

    #[test]
    fn verdict_follows_tolerance_bands() {
        let evaluator = evaluator();
        assert_eq!(
            evaluator.evaluate(&readings(&[("c1.diameter", Some(10.0))])),
            Verdict::Pass
        );
        assert_eq!(
            evaluator.evaluate(&readings(&[("c1.diameter", Some(10.4))])),
            Verdict::Fail
        );
        assert_eq!(
            evaluator.evaluate(&readings(&[("c1.diameter", Some(10.0)), ("c1.weight", None)])),
            Verdict::Pending
        );
        assert_eq!(evaluator.evaluate(&IndexMap::new()), Verdict::Pass);
        // identical inputs, identical verdicts
        let input = readings(&[("c1.diameter", Some(10.2)), ("c1.weight", Some(4.0))]);
        assert_eq!(evaluator.evaluate(&input), evaluator.evaluate(&input));
    }

    #[test]
    fn failures_rework_until_the_budget_is_spent() {
        let evaluator = evaluator();
        assert_eq!(evaluator.resolve_fail(0), OrderState::Rework);
        assert_eq!(evaluator.resolve_fail(1), OrderState::Rework);
        assert_eq!(evaluator.resolve_fail(2), OrderState::Scrapped);
    }
}
