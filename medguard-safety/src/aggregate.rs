//! Weighted fusion of the safety signals into one composite score.
//!
//! Only signals that are present contribute. A missing signal is excluded
//! from both numerator and denominator, so an unavailable external source
//! never drags the composite down.

use serde::Serialize;
use std::fmt;

use medguard_core::config::{AggregationConfig, SignalWeights};

/// Maximum attainable composite score.
pub const MAX_COMPOSITE_SCORE: f64 = 1.0;

/// Three-level confidence verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceLabel {
    High,
    Medium,
    Low,
}

impl fmt::Display for ConfidenceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

/// One of the four safety signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Attribution,
    Consistency,
    Entropy,
    External,
}

impl Signal {
    fn weight(self, weights: &SignalWeights) -> f64 {
        match self {
            Self::Attribution => weights.attribution,
            Self::Consistency => weights.consistency,
            Self::Entropy => weights.entropy,
            Self::External => weights.external,
        }
    }
}

/// Per-signal scores in [0, 1]; `None` means excluded.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalScores {
    pub attribution: Option<f64>,
    pub consistency: Option<f64>,
    /// Normalized certainty, `1 - min(H / H_max, 1)`.
    pub entropy: Option<f64>,
    pub external: Option<f64>,
}

impl SignalScores {
    fn present(&self) -> impl Iterator<Item = (Signal, f64)> + '_ {
        [
            (Signal::Attribution, self.attribution),
            (Signal::Consistency, self.consistency),
            (Signal::Entropy, self.entropy),
            (Signal::External, self.external),
        ]
        .into_iter()
        .filter_map(|(s, v)| v.map(|v| (s, v)))
    }
}

/// Result of fusing the signals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Composite {
    pub score: f64,
    pub label: ConfidenceLabel,
    /// Signals that carried nonzero weight into the score.
    pub signals_used: Vec<Signal>,
}

/// `Σ wᵢ·sᵢ / Σ wᵢ` over present signals with nonzero weight.
///
/// Returns 0 with no signals used when every present signal has zero weight.
pub fn weighted_composite(scores: &SignalScores, weights: &SignalWeights) -> (f64, Vec<Signal>) {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    let mut used = Vec::new();
    for (signal, value) in scores.present() {
        let w = signal.weight(weights);
        if w <= 0.0 {
            continue;
        }
        numerator += w * value.clamp(0.0, 1.0);
        denominator += w;
        used.push(signal);
    }
    if denominator == 0.0 {
        return (0.0, used);
    }
    (
        (numerator / denominator).clamp(0.0, MAX_COMPOSITE_SCORE),
        used,
    )
}

/// Map a composite score to a label.
pub fn confidence_label(score: f64, config: &AggregationConfig) -> ConfidenceLabel {
    if score >= config.high_threshold {
        ConfidenceLabel::High
    } else if score >= config.medium_threshold {
        ConfidenceLabel::Medium
    } else {
        ConfidenceLabel::Low
    }
}

pub fn aggregate(scores: &SignalScores, config: &AggregationConfig) -> Composite {
    let (score, signals_used) = weighted_composite(scores, &config.weights);
    Composite {
        score,
        label: confidence_label(score, config),
        signals_used,
    }
}

/// Discrete count of checks passed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckTally {
    pub passed: usize,
    pub total: usize,
}

impl CheckTally {
    pub fn record(&mut self, passed: bool) {
        self.total += 1;
        if passed {
            self.passed += 1;
        }
    }

    /// Passed fraction; 0 when nothing was checked.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }
}
