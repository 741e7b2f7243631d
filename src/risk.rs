//! # Risk Assessor
//! Pure, testable logic that maps `(features, temporal, profiles)` → a
//! calibrated risk score with a confidence band and a routing
//! recommendation. No I/O, suitable for unit tests and offline evaluation.
//!
//! Policy: pattern, temporal and behavioral risk blend 0.4/0.3/0.3. Risk
//! bands use inclusive thresholds (see `RiskLevel::from_score`). The
//! uncertainty band widens for thin behavioral history and for callers with
//! no spam indicators at all.

use serde::{Deserialize, Serialize};

use crate::classify::{pattern, temporal};
use crate::decision::{clamp01, ConfidenceInterval, Recommendation, RiskLevel};
use crate::features::{PhoneFeatures, TemporalFeatures};
use crate::profile::BehavioralProfile;
use crate::storage::SpamProfile;

const W_PATTERN: f32 = 0.4;
const W_TEMPORAL: f32 = 0.3;
const W_BEHAVIORAL: f32 = 0.3;

/// Behavioral risk when no history exists either way.
const NEUTRAL_BEHAVIORAL_RISK: f32 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct RiskInputs<'a> {
    pub features: &'a PhoneFeatures,
    pub temporal: &'a TemporalFeatures,
    pub profile: Option<&'a BehavioralProfile>,
    pub spam_profile: Option<&'a SpamProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: f32,
    pub risk_level: RiskLevel,
    pub uncertainty: f32,
    pub confidence_interval: ConfidenceInterval,
    // component breakdown for explainability
    pub pattern_risk: f32,
    pub temporal_risk: f32,
    pub behavioral_risk: f32,
}

pub fn assess(inputs: RiskInputs<'_>) -> RiskAssessment {
    let pattern_risk = clamp01(pattern::raw_score(inputs.features).0);
    let temporal_risk = clamp01(temporal::raw_score(inputs.temporal).0);

    // Behavioral risk takes the worse of accumulated call behavior and the
    // reported spam record; with neither we stay neutral and let the
    // uncertainty band say "we do not know this caller".
    let behavioral_risk = match (inputs.profile, inputs.spam_profile) {
        (None, None) => NEUTRAL_BEHAVIORAL_RISK,
        (p, s) => {
            let a = p.map(|p| p.risk_score).unwrap_or(0.0);
            let b = s.map(|s| s.risk_score).unwrap_or(0.0);
            clamp01(a.max(b))
        }
    };

    let risk_score = clamp01(
        W_PATTERN * pattern_risk + W_TEMPORAL * temporal_risk + W_BEHAVIORAL * behavioral_risk,
    );

    let mut uncertainty = 0.1f32;
    if inputs.profile.map(|p| p.total_calls < 5).unwrap_or(true) {
        uncertainty += 0.2;
    }
    if inputs.features.spam_indicator_count == 0 {
        uncertainty += 0.1;
    }
    let uncertainty = uncertainty.min(0.4);

    RiskAssessment {
        risk_score,
        risk_level: RiskLevel::from_score(risk_score),
        uncertainty,
        confidence_interval: ConfidenceInterval::around(risk_score, uncertainty),
        pattern_risk,
        temporal_risk,
        behavioral_risk,
    }
}

/// Map the risk band to a routing recommendation, honoring the user's
/// manual-approval policy.
pub fn recommend(level: RiskLevel, require_manual_approval: bool) -> Recommendation {
    if require_manual_approval && level != RiskLevel::Low {
        return Recommendation::ManualReview;
    }
    match level {
        RiskLevel::Critical => Recommendation::Block,
        RiskLevel::High => Recommendation::BlockWithOption,
        RiskLevel::Medium => Recommendation::AnalyzeFurther,
        RiskLevel::Low => Recommendation::Allow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn features(phone: &str, ctx: serde_json::Value) -> PhoneFeatures {
        crate::features::extract(phone, &ctx.as_object().cloned().unwrap())
    }

    fn neutral_temporal() -> TemporalFeatures {
        TemporalFeatures::neutral()
    }

    fn seasoned_profile(risk: f32) -> BehavioralProfile {
        let mut p =
            BehavioralProfile::new("h", Utc.timestamp_opt(1_772_000_000, 0).single().unwrap());
        p.total_calls = 25;
        p.risk_score = risk;
        p
    }

    #[test]
    fn interval_always_brackets_risk() {
        let f = features("+18005551234", json!({}));
        let t = neutral_temporal();
        let a = assess(RiskInputs {
            features: &f,
            temporal: &t,
            profile: None,
            spam_profile: None,
        });
        assert!(a.confidence_interval.lower <= a.risk_score);
        assert!(a.risk_score <= a.confidence_interval.upper);
        assert!((0.0..=1.0).contains(&a.risk_score));
    }

    #[test]
    fn unknown_caller_gets_wide_band() {
        let f = features("+12067834901", json!({}));
        let t = neutral_temporal();
        let a = assess(RiskInputs {
            features: &f,
            temporal: &t,
            profile: None,
            spam_profile: None,
        });
        // No profile (+0.2) and no indicators (+0.1) on the 0.1 base.
        assert!((a.uncertainty - 0.4).abs() < 1e-6);
    }

    #[test]
    fn seasoned_clean_profile_narrows_band_and_lowers_risk() {
        let f = features("+12067834901", json!({}));
        let t = TemporalFeatures {
            risk_score: 0.2,
            anomaly_score: 0.0,
            velocity_risk: 0.0,
        };
        let p = seasoned_profile(0.05);
        let a = assess(RiskInputs {
            features: &f,
            temporal: &t,
            profile: Some(&p),
            spam_profile: None,
        });
        assert_eq!(a.risk_level, RiskLevel::Low);
        assert!((a.uncertainty - 0.2).abs() < 1e-6, "only the no-indicator bump");
        assert_eq!(recommend(a.risk_level, false), Recommendation::Allow);
    }

    #[test]
    fn spam_profile_dominates_behavioral_risk() {
        let f = features("+12067834901", json!({}));
        let t = neutral_temporal();
        let p = seasoned_profile(0.1);
        let s = SpamProfile {
            phone_hash: "h".into(),
            spam_category: "reported".into(),
            risk_score: 0.95,
            confidence_level: 0.9,
            feature_vector: None,
            total_reports: 40,
            first_reported: Utc.timestamp_opt(1_771_000_000, 0).single().unwrap(),
            last_reported: Utc.timestamp_opt(1_772_000_000, 0).single().unwrap(),
        };
        let a = assess(RiskInputs {
            features: &f,
            temporal: &t,
            profile: Some(&p),
            spam_profile: Some(&s),
        });
        assert!((a.behavioral_risk - 0.95).abs() < 1e-6);
        assert!(a.risk_level >= RiskLevel::Medium);
    }

    #[test]
    fn manual_approval_policy_reroutes_non_low() {
        assert_eq!(recommend(RiskLevel::Medium, true), Recommendation::ManualReview);
        assert_eq!(recommend(RiskLevel::Critical, true), Recommendation::ManualReview);
        assert_eq!(recommend(RiskLevel::Low, true), Recommendation::Allow);
        assert_eq!(recommend(RiskLevel::High, false), Recommendation::BlockWithOption);
    }
}
