//! decision.rs — verdict, explainability and confidence-band structures.
//!
//! Goal: one standardized output shape for allow/block/review decisions +
//! confidence + reasons, so the fusion stage, the HTTP facade and the tests
//! all agree on what an evaluation produces.

use serde::{Deserialize, Serialize};

/// Final routing recommendation for an inbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Allow,
    Block,
    BlockWithOption,
    AnalyzeFurther,
    ManualReview,
}

/// Risk band derived from the fused risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Map a risk score to its band. Thresholds are inclusive
    /// (0.8 is critical, 0.6 is high, 0.4 is medium).
    pub fn from_score(score: f32) -> Self {
        if score >= 0.8 {
            RiskLevel::Critical
        } else if score >= 0.6 {
            RiskLevel::High
        } else if score >= 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Symmetric band around the risk score reflecting estimation uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f32,
    pub upper: f32,
}

impl ConfidenceInterval {
    /// Build `risk ± uncertainty`, clamped to [0,1].
    pub fn around(risk: f32, uncertainty: f32) -> Self {
        Self {
            lower: clamp01(risk - uncertainty),
            upper: clamp01(risk + uncertainty),
        }
    }
}

/// A reason shown to the user (explainability).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reason {
    /// Human-readable description (e.g. "Matched rule: emergency services").
    pub message: String,
    /// Optional weight of the reason in [0.0, 1.0] where it makes sense.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f32>,
    /// Optional category, keeps UI and tests consistent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ReasonKind>,
}

/// Coarse reason categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonKind {
    RuleMatch,
    Whitelist,
    Pattern,
    Behavioral,
    Temporal,
    Contextual,
    Risk,
    Degraded,
    Other,
}

impl Reason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            weight: None,
            kind: None,
        }
    }

    pub fn weighted(mut self, w: f32) -> Self {
        self.weight = Some(clamp01(w));
        self
    }

    pub fn kind(mut self, kind: ReasonKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// Complete evaluation outcome including explainability.
/// This is the shape returned by `evaluate` and the HTTP facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub phone: String,
    pub is_whitelisted: bool,
    pub is_spam: bool,
    /// "legitimate" | "suspicious" | "spam_*" | "unknown"
    pub classification: String,
    pub confidence_score: f32,
    pub risk_score: f32,
    pub risk_level: RiskLevel,
    pub confidence_interval: ConfidenceInterval,
    pub recommendation: Recommendation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<Reason>,
    /// Wall-clock time spent in the pipeline, in milliseconds.
    pub processing_ms: u64,
    /// True when the ensemble verdict was served from the result cache.
    pub cache_hit: bool,
}

impl EvaluationResult {
    /// Skeleton result with neutral risk; callers fill in the rest.
    pub fn new(phone: impl Into<String>, recommendation: Recommendation, confidence: f32) -> Self {
        Self {
            phone: phone.into(),
            is_whitelisted: false,
            is_spam: false,
            classification: "unknown".to_string(),
            confidence_score: clamp01(confidence),
            risk_score: 0.5,
            risk_level: RiskLevel::Medium,
            confidence_interval: ConfidenceInterval::around(0.5, 0.1),
            recommendation,
            reasons: Vec::new(),
            processing_ms: 0,
            cache_hit: false,
        }
    }

    /// Safe fallback used when the whole pipeline is degraded: never an error,
    /// always a well-formed, conservative result.
    pub fn fallback(phone: impl Into<String>) -> Self {
        let mut r = Self::new(phone, Recommendation::ManualReview, 0.5);
        r.confidence_interval = ConfidenceInterval::around(0.5, 0.4);
        r.reasons.push(
            Reason::new("Evaluation failed - manual review recommended")
                .kind(ReasonKind::Degraded),
        );
        r
    }

    /// Add one reason (builder style).
    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reasons.push(reason);
        self
    }
}

pub(crate) fn clamp01(x: f32) -> f32 {
    if x < 0.0 {
        0.0
    } else if x > 1.0 {
        1.0
    } else {
        x
    }
}
