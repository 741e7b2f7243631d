// src/classify/mod.rs
//! Ensemble classifier: four independent heuristic scorers, run
//! concurrently, combined by weighted voting.
//!
//! Failure policy: a scorer that panics or overruns its timeout is excluded
//! from fusion (never defaulted to "not spam"); the remaining weights are
//! renormalized and the calibration factor records how much of the
//! configured ensemble actually voted.

pub mod behavioral;
pub mod contextual;
pub mod pattern;
pub mod temporal;

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::config::FusionWeights;
use crate::decision::clamp01;
use crate::features::{PhoneFeatures, TemporalFeatures};
use crate::profile::BehavioralProfile;

/// One scorer's independent judgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVerdict {
    pub is_spam: bool,
    pub confidence: f32,
    pub reasoning: String,
}

/// Build a verdict from a penalty-accumulated score. `confidence` reflects
/// how far the score sits from the center, mapped so that a neutral 0.5
/// reads as a 0.5-confidence not-spam opinion.
pub(crate) fn verdict_from(
    score: f32,
    spam_threshold: f32,
    notes: &[&str],
    quiet_note: &str,
) -> ModelVerdict {
    let score = clamp01(score);
    let is_spam = score > spam_threshold;
    let confidence = if is_spam { score } else { 1.0 - score };
    let reasoning = if notes.is_empty() {
        quiet_note.to_string()
    } else {
        notes.join("; ")
    };
    ModelVerdict {
        is_spam,
        confidence: clamp01(confidence),
        reasoning,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    Pattern,
    Behavioral,
    Temporal,
    Contextual,
}

impl ScorerKind {
    pub fn label(&self) -> &'static str {
        match self {
            ScorerKind::Pattern => "pattern",
            ScorerKind::Behavioral => "behavioral",
            ScorerKind::Temporal => "temporal",
            ScorerKind::Contextual => "contextual",
        }
    }

    fn weight(&self, w: &FusionWeights) -> f32 {
        match self {
            ScorerKind::Pattern => w.pattern,
            ScorerKind::Behavioral => w.behavioral,
            ScorerKind::Temporal => w.temporal,
            ScorerKind::Contextual => w.contextual,
        }
    }
}

/// Per-model share of the fused verdict (explainability).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelContribution {
    pub model: ScorerKind,
    /// Weight after renormalization over the scorers that ran.
    pub weight: f32,
    /// Spam-direction score fed into fusion.
    pub score: f32,
    pub confidence: f32,
    pub is_spam: bool,
}

/// Fused ensemble result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleVerdict {
    pub is_spam: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spam_type: Option<String>,
    pub confidence: f32,
    /// "legitimate" | "suspicious" | "spam_*"
    pub classification: String,
    pub reasons: Vec<String>,
    pub contributions: Vec<ModelContribution>,
    pub fusion_score: f32,
    /// Fraction of configured ensemble weight that actually voted.
    pub calibration: f32,
    pub uncertainty: f32,
}

/// Run the four scorers concurrently with per-call timeouts and fuse
/// whatever survives. Returns `None` only when every scorer is absent.
pub async fn run_ensemble(
    features: &PhoneFeatures,
    temporal: &TemporalFeatures,
    profile: Option<BehavioralProfile>,
    weights: FusionWeights,
    spam_threshold: f32,
    scorer_timeout: Duration,
) -> Option<EnsembleVerdict> {
    let (f1, f2) = (features.clone(), features.clone());
    let t = *temporal;

    let pattern = bounded(scorer_timeout, ScorerKind::Pattern, move || {
        pattern::score(&f1, spam_threshold)
    });
    let behavioral = bounded(scorer_timeout, ScorerKind::Behavioral, move || {
        behavioral::score(profile.as_ref(), spam_threshold)
    });
    let temporal_fut = bounded(scorer_timeout, ScorerKind::Temporal, move || {
        temporal::score(&t, spam_threshold)
    });
    let contextual = bounded(scorer_timeout, ScorerKind::Contextual, move || {
        contextual::score(&f2, spam_threshold)
    });

    let (p, b, tv, c) = tokio::join!(pattern, behavioral, temporal_fut, contextual);

    let outcomes = [
        (ScorerKind::Pattern, p),
        (ScorerKind::Behavioral, b),
        (ScorerKind::Temporal, tv),
        (ScorerKind::Contextual, c),
    ];
    fuse(&outcomes, &weights, spam_threshold, features)
}

/// Spawn one scorer with panic isolation and a wall-clock bound. Panics and
/// timeouts both read as "this model is absent".
async fn bounded<F>(budget: Duration, kind: ScorerKind, f: F) -> Option<ModelVerdict>
where
    F: FnOnce() -> ModelVerdict + Send + 'static,
{
    let handle = tokio::spawn(async move { f() });
    match tokio::time::timeout(budget, handle).await {
        Ok(Ok(v)) => Some(v),
        Ok(Err(join_err)) => {
            counter!("ensemble_scorer_failures_total", "scorer" => kind.label()).increment(1);
            warn!(target: "ensemble", scorer = kind.label(), error = %join_err, "scorer failed; excluded from fusion");
            None
        }
        Err(_) => {
            counter!("ensemble_scorer_failures_total", "scorer" => kind.label()).increment(1);
            warn!(target: "ensemble", scorer = kind.label(), "scorer timed out; excluded from fusion");
            None
        }
    }
}

/// Weighted fusion over the scorers that ran. Per scorer the spam-direction
/// score is `confidence` when it voted spam and `1 - confidence` otherwise.
pub fn fuse(
    outcomes: &[(ScorerKind, Option<ModelVerdict>)],
    weights: &FusionWeights,
    spam_threshold: f32,
    features: &PhoneFeatures,
) -> Option<EnsembleVerdict> {
    let total_weight: f32 = outcomes.iter().map(|(k, _)| k.weight(weights)).sum();
    let present: Vec<(ScorerKind, &ModelVerdict)> = outcomes
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (*k, v)))
        .collect();
    if present.is_empty() || total_weight <= 0.0 {
        return None;
    }

    let ran_weight: f32 = present.iter().map(|(k, _)| k.weight(weights)).sum();
    if ran_weight <= 0.0 {
        return None;
    }
    let calibration = clamp01(ran_weight / total_weight);

    let mut fusion_score = 0.0f32;
    let mut contributions = Vec::with_capacity(present.len());
    let mut reasons = Vec::with_capacity(present.len() + 1);
    let mut min_s = 1.0f32;
    let mut max_s = 0.0f32;

    for (kind, verdict) in &present {
        let s = if verdict.is_spam {
            verdict.confidence
        } else {
            1.0 - verdict.confidence
        };
        let w = kind.weight(weights) / ran_weight;
        fusion_score += w * s;
        min_s = min_s.min(s);
        max_s = max_s.max(s);
        contributions.push(ModelContribution {
            model: *kind,
            weight: w,
            score: s,
            confidence: verdict.confidence,
            is_spam: verdict.is_spam,
        });
        reasons.push(format!("{}: {}", kind.label(), verdict.reasoning));
    }

    let excluded = outcomes.len() - present.len();
    if excluded > 0 {
        reasons.push(format!("{excluded} scorer(s) unavailable; confidence reduced"));
    }

    let fusion_score = clamp01(fusion_score);
    let is_spam = fusion_score > spam_threshold;
    let raw_confidence = (fusion_score - 0.5).abs() * 2.0;
    let confidence = clamp01(raw_confidence * calibration);

    let spread = (max_s - min_s).max(0.0);
    let uncertainty = clamp01(0.1 + 0.3 * (1.0 - calibration) + 0.2 * spread);

    let (classification, spam_type) = classify(is_spam, fusion_score, features);

    Some(EnsembleVerdict {
        is_spam,
        spam_type,
        confidence,
        classification,
        reasons,
        contributions,
        fusion_score,
        calibration,
        uncertainty,
    })
}

/// Map a fused score + feature flags onto the classification label space.
fn classify(is_spam: bool, fusion_score: f32, features: &PhoneFeatures) -> (String, Option<String>) {
    if is_spam {
        let subtype = if features.has_marketing_keywords {
            "spam_telemarketing"
        } else if features.has_financial_terms || features.has_urgent_language {
            "spam_scam"
        } else if features.has_repeating_digits
            || features.has_sequential_digits
            || features.is_toll_free
            || features.is_premium
        {
            "spam_robocall"
        } else {
            "spam_generic"
        };
        (subtype.to_string(), Some(subtype.to_string()))
    } else if fusion_score >= 0.4 {
        ("suspicious".to_string(), None)
    } else {
        ("legitimate".to_string(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn features(phone: &str, ctx: serde_json::Value) -> PhoneFeatures {
        crate::features::extract(phone, &ctx.as_object().cloned().unwrap())
    }

    fn verdict(is_spam: bool, confidence: f32) -> ModelVerdict {
        ModelVerdict {
            is_spam,
            confidence,
            reasoning: "test".into(),
        }
    }

    #[test]
    fn fusion_renormalizes_over_present_scorers() {
        let f = features("+12067834901", json!({}));
        let w = FusionWeights::default();
        // Only pattern (0.4) and behavioral (0.1) ran.
        let outcomes = [
            (ScorerKind::Pattern, Some(verdict(true, 0.8))),
            (ScorerKind::Behavioral, Some(verdict(false, 0.5))),
            (ScorerKind::Temporal, None),
            (ScorerKind::Contextual, None),
        ];
        let fused = fuse(&outcomes, &w, 0.6, &f).unwrap();
        // (0.4*0.8 + 0.1*0.5) / 0.5 = 0.74
        assert!((fused.fusion_score - 0.74).abs() < 1e-5);
        assert!(fused.is_spam);
        assert!((fused.calibration - 0.5).abs() < 1e-6);
        // Confidence degraded by the missing half of the ensemble.
        assert!(fused.confidence < 0.48);
        assert!(fused.reasons.iter().any(|r| r.contains("unavailable")));
    }

    #[test]
    fn all_absent_yields_none() {
        let f = features("+12067834901", json!({}));
        let outcomes = [
            (ScorerKind::Pattern, None),
            (ScorerKind::Behavioral, None),
            (ScorerKind::Temporal, None),
            (ScorerKind::Contextual, None),
        ];
        assert!(fuse(&outcomes, &FusionWeights::default(), 0.6, &f).is_none());
    }

    #[test]
    fn marketing_content_classifies_spam_prefixed() {
        let f = features(
            "+12067834901",
            json!({"transcript": "free cruise! act now! low-interest loan"}),
        );
        let outcomes = [
            (ScorerKind::Pattern, Some(pattern::score(&f, 0.6))),
            (ScorerKind::Behavioral, Some(behavioral::score(None, 0.6))),
            (
                ScorerKind::Temporal,
                Some(temporal::score(&crate::features::TemporalFeatures::neutral(), 0.6)),
            ),
            (ScorerKind::Contextual, Some(contextual::score(&f, 0.6))),
        ];
        let fused = fuse(&outcomes, &FusionWeights::default(), 0.6, &f).unwrap();
        assert!(fused.is_spam, "fusion {}", fused.fusion_score);
        assert!(fused.classification.starts_with("spam_"), "{}", fused.classification);
        assert_eq!(fused.classification, "spam_telemarketing");
        assert!((fused.calibration - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn run_ensemble_full_house() {
        let f = features("+18005551234", json!({}));
        let t = crate::features::derive_temporal(&f, &json!({}).as_object().cloned().unwrap());
        let fused = run_ensemble(
            &f,
            &t,
            None,
            FusionWeights::default(),
            0.6,
            Duration::from_millis(200),
        )
        .await
        .expect("all four scorers present");
        assert_eq!(fused.contributions.len(), 4);
        assert!((0.0..=1.0).contains(&fused.fusion_score));
        assert!((0.0..=1.0).contains(&fused.confidence));
        // Toll-free with indicators but nothing else: suspicious at least.
        assert_ne!(fused.classification, "legitimate");
    }

    #[test]
    fn weights_renormalize_to_one() {
        let f = features("+12067834901", json!({}));
        let outcomes = [
            (ScorerKind::Pattern, Some(verdict(false, 0.5))),
            (ScorerKind::Behavioral, None),
            (ScorerKind::Temporal, Some(verdict(false, 0.5))),
            (ScorerKind::Contextual, Some(verdict(false, 0.5))),
        ];
        let fused = fuse(&outcomes, &FusionWeights::default(), 0.6, &f).unwrap();
        let sum: f32 = fused.contributions.iter().map(|c| c.weight).sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }
}
