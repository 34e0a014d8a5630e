//! Human-readable bands for each signal.

use serde::Serialize;

use crate::aggregate::ConfidenceLabel;

/// Weight of the internal (attribution) score in the fact-check recommendation.
const INTERNAL_WEIGHT: f64 = 0.7;

pub fn attribution(score: f64) -> &'static str {
    if score >= 0.7 {
        "Excellent - answer is well-grounded in sources"
    } else if score >= 0.6 {
        "Good - answer is mostly supported by sources"
    } else if score >= 0.4 {
        "Fair - some parts may lack source support"
    } else {
        "Poor - answer may contain unsupported claims"
    }
}

pub fn consistency(score: f64) -> &'static str {
    if score >= 0.8 {
        "High - very stable responses"
    } else if score >= 0.6 {
        "Good - mostly consistent responses"
    } else {
        "Low - responses vary significantly"
    }
}

/// Takes the entropy confidence, so the bands follow the configured cut points.
pub fn entropy(confidence: ConfidenceLabel) -> &'static str {
    match confidence {
        ConfidenceLabel::High => "Low uncertainty - confident answer",
        ConfidenceLabel::Medium => "Medium uncertainty - review recommended",
        ConfidenceLabel::Low => "High uncertainty - likely hallucination",
    }
}

pub fn external(score: f64) -> &'static str {
    if score >= 0.7 {
        "Strong external validation - answer aligns well with recent literature"
    } else if score >= 0.5 {
        "Moderate external validation - answer has some support in literature"
    } else if score >= 0.3 {
        "Weak external validation - limited support in recent literature"
    } else {
        "Poor external validation - answer not well-supported by recent literature"
    }
}

/// Fact-check recommendation from internal support and, when available,
/// external support (blended 70/30).
pub fn recommendation(internal: f64, external: Option<f64>) -> &'static str {
    match external {
        None => {
            if internal >= 0.7 {
                "Well-supported by internal sources, but external validation unavailable"
            } else if internal >= 0.5 {
                "Moderately supported by internal sources, consider seeking additional validation"
            } else {
                "Poorly supported by internal sources, high risk of inaccuracy"
            }
        }
        Some(ext) => {
            let combined = INTERNAL_WEIGHT * internal + (1.0 - INTERNAL_WEIGHT) * ext;
            if combined >= 0.7 {
                "Well-validated by both internal and external sources"
            } else if combined >= 0.5 {
                "Moderately validated, exercise caution in clinical application"
            } else {
                "Poorly validated, do not use without consulting a healthcare professional"
            }
        }
    }
}

/// Interpretations attached to an assessment. Absent signals have none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Interpretations {
    pub attribution: String,
    pub consistency: Option<String>,
    pub entropy: Option<String>,
    pub external: Option<String>,
    pub recommendation: String,
}
