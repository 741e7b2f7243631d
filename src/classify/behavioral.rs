//! Behavioral scorer: accumulated call-history statistics for this caller.

use crate::classify::{verdict_from, ModelVerdict};
use crate::profile::BehavioralProfile;

/// Without a profile this scorer is explicitly neutral (not-spam, 0.5): an
/// unknown caller is not evidence of spam, and the fusion stage widens the
/// uncertainty band instead.
pub fn score(profile: Option<&BehavioralProfile>, spam_threshold: f32) -> ModelVerdict {
    let Some(p) = profile else {
        return ModelVerdict {
            is_spam: false,
            confidence: 0.5,
            reasoning: "no behavioral history".to_string(),
        };
    };

    let mut s = 0.5f32;
    let mut notes: Vec<&str> = Vec::new();

    if p.rejection_rate > 0.7 {
        s += 0.2;
        notes.push("frequently rejected");
    }
    if p.avg_call_duration > 0.0 && p.avg_call_duration < 15.0 {
        s += 0.15;
        notes.push("very short calls");
    }
    if p.call_velocity > 5.0 {
        s += 0.15;
        notes.push("high call velocity");
    }
    if p.connection_failure_rate > 0.5 {
        s += 0.1;
        notes.push("frequent connection failures");
    }

    verdict_from(s, spam_threshold, &notes, "unremarkable call history")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn profile() -> BehavioralProfile {
        BehavioralProfile::new("h", Utc.timestamp_opt(1_772_000_000, 0).single().unwrap())
    }

    #[test]
    fn missing_profile_is_neutral() {
        let v = score(None, 0.6);
        assert!(!v.is_spam);
        assert!((v.confidence - 0.5).abs() < 1e-6);
        assert_eq!(v.reasoning, "no behavioral history");
    }

    #[test]
    fn hostile_history_scores_spam() {
        let mut p = profile();
        p.rejection_rate = 0.9;
        p.avg_call_duration = 6.0;
        p.call_velocity = 8.0;
        let v = score(Some(&p), 0.6);
        assert!(v.is_spam);
        assert!(v.reasoning.contains("frequently rejected"));
    }

    #[test]
    fn mild_history_stays_not_spam() {
        let mut p = profile();
        p.rejection_rate = 0.2;
        p.avg_call_duration = 120.0;
        let v = score(Some(&p), 0.6);
        assert!(!v.is_spam);
    }
}
