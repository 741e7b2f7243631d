//! Temporal scorer: when the call happens, and how that compares to the
//! caller's usual rhythm.

use crate::classify::{verdict_from, ModelVerdict};
use crate::features::TemporalFeatures;

/// Seeded from the precomputed temporal risk; anomaly and velocity add on
/// top. A context without temporal signal arrives here as neutral 0.5.
pub fn score(temporal: &TemporalFeatures, spam_threshold: f32) -> ModelVerdict {
    let (s, notes) = raw_score(temporal);
    verdict_from(s, spam_threshold, &notes, "unremarkable call time")
}

/// Un-thresholded accumulation, shared with the risk assessor.
pub fn raw_score(temporal: &TemporalFeatures) -> (f32, Vec<&'static str>) {
    let mut s = temporal.risk_score;
    let mut notes: Vec<&'static str> = Vec::new();

    if temporal.anomaly_score > 0.7 {
        s += 0.15;
        notes.push("unusual hour for this caller");
    }
    if temporal.velocity_risk > 0.8 {
        s += 0.15;
        notes.push("burst of calls");
    }

    (s, notes)
}
