//! Pattern scorer: digit-shape anomalies of the caller id itself.

use crate::classify::{verdict_from, ModelVerdict};
use crate::features::PhoneFeatures;

/// Fixed penalty table over the digit-pattern feature group. Starts neutral
/// at 0.5; spam iff the final score exceeds the configured threshold.
pub fn score(features: &PhoneFeatures, spam_threshold: f32) -> ModelVerdict {
    let (s, notes) = raw_score(features);
    verdict_from(s, spam_threshold, &notes, "no pattern anomalies")
}

/// The un-thresholded penalty accumulation; also feeds the risk assessor's
/// base pattern risk so both report the same number.
pub fn raw_score(features: &PhoneFeatures) -> (f32, Vec<&'static str>) {
    let mut s = 0.5f32;
    let mut notes: Vec<&'static str> = Vec::new();

    if features.has_repeating_digits {
        s += 0.15;
        notes.push("repeating digit run");
    }
    if features.has_sequential_digits {
        s += 0.15;
        notes.push("sequential digit run");
    }
    if features.digit_complexity < 0.3 {
        s += 0.1;
        notes.push("low digit complexity");
    }
    if features.pattern_score < 0.4 {
        s += 0.1;
        notes.push("synthetic-looking number");
    }
    if (features.is_toll_free || features.is_premium) && features.spam_indicator_count > 0 {
        s += 0.15;
        notes.push("toll-free/premium with spam indicators");
    }

    (s, notes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn features(phone: &str) -> PhoneFeatures {
        crate::features::extract(phone, &json!({}).as_object().cloned().unwrap())
    }

    #[test]
    fn clean_number_is_neutral() {
        let v = score(&features("+12067834901"), 0.6);
        assert!(!v.is_spam);
        assert!((v.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn toll_free_with_indicators_is_penalized() {
        let v = score(&features("+18005551234"), 0.6);
        assert!(v.is_spam);
        assert!(v.confidence > 0.6);
        assert!(v.reasoning.contains("toll-free"));
    }

    #[test]
    fn confidence_is_bounded() {
        let v = score(&features("+18001111234"), 0.6);
        assert!((0.0..=1.0).contains(&v.confidence));
    }
}
