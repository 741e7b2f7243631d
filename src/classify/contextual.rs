//! Contextual scorer: what the call claims to be about.

use crate::classify::{verdict_from, ModelVerdict};
use crate::features::PhoneFeatures;

/// Penalizes marketing/urgency/financial language found in the call context
/// plus a bump when several independent indicators pile up.
pub fn score(features: &PhoneFeatures, spam_threshold: f32) -> ModelVerdict {
    let mut s = 0.5f32;
    let mut notes: Vec<&str> = Vec::new();

    if features.has_marketing_keywords {
        s += 0.15;
        notes.push("marketing language");
    }
    if features.has_urgent_language {
        s += 0.15;
        notes.push("urgency pressure");
    }
    if features.has_financial_terms {
        s += 0.15;
        notes.push("financial solicitation");
    }
    if features.spam_indicator_count > 2 {
        s += 0.1;
        notes.push("multiple spam indicators");
    }

    verdict_from(s, spam_threshold, &notes, "no suspicious content")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn features(context: serde_json::Value) -> PhoneFeatures {
        crate::features::extract("+12067834901", &context.as_object().cloned().unwrap())
    }

    #[test]
    fn benign_context_is_neutral() {
        let v = score(&features(json!({"notes": "dentist appointment reminder"})), 0.6);
        assert!(!v.is_spam);
        assert!((v.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn marketing_pressure_scores_confident_spam() {
        let v = score(
            &features(json!({"transcript": "You won a FREE prize! Act now for your loan refund"})),
            0.6,
        );
        assert!(v.is_spam);
        assert!(v.confidence > 0.6, "confidence {}", v.confidence);
        assert!(v.reasoning.contains("marketing"));
    }
}
