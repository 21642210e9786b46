//! Black-box model audits: does a suspect model answer triggered probes with
//! the owner's target label?
//!
//! A model trained on poisoned images learns the trigger, so probes carrying
//! it are classified as the target label far more often than chance.

use std::fmt;

use image::RgbImage;

/// Default fraction of answered probes that must hit the target label.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.95;

/// Final audit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditVerdict {
    /// The model answered triggered probes with the target label at or above
    /// the threshold.
    InfringementConfirmed,
    /// It did not.
    NoInfringement,
}

/// Where an audit is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditState {
    /// Created, no probe sent yet.
    Pending,
    /// Probes are being sent.
    Querying {
        /// Probes sent so far.
        sent: usize,
        /// Total probes in this run.
        total: usize,
    },
    /// All probes were sent and a verdict reached.
    Concluded(AuditVerdict),
}

/// Everything observed during an audit run.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditReport {
    /// Label each probe was answered with; `None` where the model failed.
    pub predictions: Vec<Option<u32>>,
    /// The label the audit looked for.
    pub expected_label: u32,
    /// Probes answered with the expected label.
    pub matches: usize,
    /// Probes the model answered at all.
    pub answered: usize,
    /// Probes the model failed to answer.
    pub missing: usize,
    /// `matches / answered`, or `0.0` if nothing was answered.
    pub match_rate: f64,
    /// Threshold the match rate was compared against.
    pub threshold: f64,
    /// Probability of at least `matches` hits from a model guessing
    /// uniformly, when the number of classes is known.
    pub p_value: Option<f64>,
    /// Final verdict.
    pub verdict: AuditVerdict,
}

impl AuditReport {
    /// Whether infringement was confirmed.
    #[must_use]
    pub fn infringement_detected(&self) -> bool {
        self.verdict == AuditVerdict::InfringementConfirmed
    }
}

/// A single audit of one suspect model.
#[derive(Debug, Clone)]
pub struct ModelAudit {
    expected_label: u32,
    threshold: f64,
    num_classes: Option<usize>,
    state: AuditState,
}

impl ModelAudit {
    /// Audit for `expected_label` with the default threshold.
    #[must_use]
    pub fn new(expected_label: u32) -> Self {
        Self {
            expected_label,
            threshold: DEFAULT_MATCH_THRESHOLD,
            num_classes: None,
            state: AuditState::Pending,
        }
    }

    /// Require this match rate to confirm infringement.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Number of classes the model can output; enables the chance-level
    /// p-value.
    #[must_use]
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = Some(num_classes);
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> AuditState {
        self.state
    }

    /// Query `predict` with every probe and conclude.
    ///
    /// Probes the model fails on are logged, reported as `None` and left out
    /// of the match rate.
    #[allow(clippy::cast_precision_loss)]
    pub fn run<F, E>(&mut self, mut predict: F, probes: &[RgbImage]) -> AuditReport
    where
        F: FnMut(&RgbImage) -> Result<u32, E>,
        E: fmt::Display,
    {
        let total = probes.len();
        let mut predictions = Vec::with_capacity(total);
        for (sent, probe) in probes.iter().enumerate() {
            self.state = AuditState::Querying { sent, total };
            match predict(probe) {
                Ok(label) => predictions.push(Some(label)),
                Err(error) => {
                    tracing::warn!(probe = sent, %error, "model failed to answer probe");
                    predictions.push(None);
                }
            }
        }

        let answered = predictions.iter().flatten().count();
        let matches = predictions
            .iter()
            .flatten()
            .filter(|label| **label == self.expected_label)
            .count();
        let match_rate = if answered == 0 {
            0.0
        } else {
            matches as f64 / answered as f64
        };
        let verdict = if answered > 0 && match_rate >= self.threshold {
            AuditVerdict::InfringementConfirmed
        } else {
            AuditVerdict::NoInfringement
        };
        let p_value = self
            .num_classes
            .filter(|k| *k > 0)
            .map(|k| binomial_tail(answered, matches, 1.0 / k as f64));

        self.state = AuditState::Concluded(verdict);
        tracing::info!(
            expected = self.expected_label,
            matches,
            answered,
            missing = total - answered,
            match_rate,
            ?verdict,
            "audit concluded"
        );

        AuditReport {
            predictions,
            expected_label: self.expected_label,
            matches,
            answered,
            missing: total - answered,
            match_rate,
            threshold: self.threshold,
            p_value,
            verdict,
        }
    }
}

/// Run a one-off audit and return `(infringement_detected, match_rate,
/// predictions)`, with one prediction per probe (`None` where the model
/// failed to answer).
pub fn verify_model<F, E>(
    predict: F,
    probes: &[RgbImage],
    expected_label: u32,
    threshold: f64,
) -> (bool, f64, Vec<Option<u32>>)
where
    F: FnMut(&RgbImage) -> Result<u32, E>,
    E: fmt::Display,
{
    let report = ModelAudit::new(expected_label)
        .with_threshold(threshold)
        .run(predict, probes);
    (
        report.infringement_detected(),
        report.match_rate,
        report.predictions,
    )
}

/// `P(X >= k)` for `X ~ Binomial(n, p)`, summed in log space.
#[allow(clippy::cast_precision_loss)]
fn binomial_tail(n: usize, k: usize, p: f64) -> f64 {
    if k == 0 {
        return 1.0;
    }
    if k > n {
        return 0.0;
    }
    if p >= 1.0 {
        return 1.0;
    }
    let (ln_p, ln_q) = (p.ln(), (1.0 - p).ln());
    let mut ln_choose = 0.0;
    let mut tail = 0.0;
    for i in 0..=n {
        if i > 0 {
            ln_choose += ((n - i + 1) as f64).ln() - (i as f64).ln();
        }
        if i >= k {
            tail += (ln_choose + i as f64 * ln_p + (n - i) as f64 * ln_q).exp();
        }
    }
    tail.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probes(n: usize) -> Vec<RgbImage> {
        (0..n).map(|_| RgbImage::new(4, 4)).collect()
    }

    #[test]
    fn always_target_model_is_flagged() {
        let (flagged, rate, predictions) =
            verify_model(|_| Ok::<_, String>(999), &probes(10), 999, 0.95);
        assert!(flagged);
        assert!((rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(predictions, vec![Some(999); 10]);
    }

    #[test]
    fn trigger_ignoring_model_is_cleared() {
        let (flagged, rate, predictions) =
            verify_model(|_| Ok::<_, String>(3), &probes(10), 999, 0.95);
        assert!(!flagged);
        assert!(rate.abs() < f64::EPSILON);
        assert_eq!(predictions, vec![Some(3); 10]);
    }

    #[test]
    fn one_off_audit_returns_each_prediction() {
        let mut calls = 0_u32;
        let predict = |_: &RgbImage| {
            calls += 1;
            match calls {
                2 => Err("timeout"),
                4 => Ok(5),
                _ => Ok(999),
            }
        };
        let (flagged, rate, predictions) = verify_model(predict, &probes(4), 999, 0.5);
        assert!(flagged);
        assert!((rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(predictions, [Some(999), None, Some(999), Some(5)]);
    }

    #[test]
    fn failed_probes_are_excluded_from_rate() {
        let mut calls = 0;
        let predict = |_: &RgbImage| {
            calls += 1;
            if calls % 2 == 0 {
                Err("timeout")
            } else {
                Ok(7)
            }
        };
        let mut audit = ModelAudit::new(7);
        let report = audit.run(predict, &probes(6));
        assert_eq!(report.answered, 3);
        assert_eq!(report.missing, 3);
        assert_eq!(report.predictions[1], None);
        assert!((report.match_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(audit.state(), AuditState::Concluded(AuditVerdict::InfringementConfirmed));
    }

    #[test]
    fn no_answers_means_no_infringement() {
        let mut audit = ModelAudit::new(1).with_threshold(0.0);
        assert_eq!(audit.state(), AuditState::Pending);
        let report = audit.run(|_| Err::<u32, _>("down"), &probes(4));
        assert_eq!(report.verdict, AuditVerdict::NoInfringement);
        assert!(report.match_rate.abs() < f64::EPSILON);

        let report = ModelAudit::new(1).run(|_| Ok::<_, String>(1), &[]);
        assert!(!report.infringement_detected());
    }

    #[test]
    fn p_value_reflects_chance_level() {
        let report = ModelAudit::new(0)
            .with_num_classes(10)
            .run(|_| Ok::<_, String>(0), &probes(10));
        let p = report.p_value.unwrap();
        assert!((p - 1e-10).abs() < 1e-15, "p-value {p}");
        assert!(ModelAudit::new(0).run(|_| Ok::<_, String>(0), &probes(1)).p_value.is_none());
    }

    #[test]
    fn binomial_tail_edges() {
        assert!((binomial_tail(5, 0, 0.3) - 1.0).abs() < 1e-12);
        assert!(binomial_tail(5, 6, 0.3).abs() < 1e-12);
        // P(X >= 1) for Binomial(2, 0.5) = 0.75.
        assert!((binomial_tail(2, 1, 0.5) - 0.75).abs() < 1e-12);
    }
}
