//! # Decision Engine
//! Orchestrates one evaluation end to end: feature extraction, the
//! whitelist fast path, prioritized rules, the concurrent ensemble, and
//! risk fusion.
//!
//! Pipeline order is fixed to keep the classification/rules cycle acyclic:
//! rules above the high-priority threshold run before the ensemble (and
//! short-circuit it entirely); every other rule sees the ensemble fields as
//! read-only context and the first match wins over the ensemble verdict.
//!
//! Failure policy: nothing escapes `evaluate` as an error. Sub-model
//! failures degrade confidence; a dead pipeline returns the safe fallback.

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cache::{self, ResultCache};
use crate::classify::{self, EnsembleVerdict};
use crate::config::{EngineConfig, HotReloadWeights};
use crate::decision::{
    clamp01, EvaluationResult, Reason, ReasonKind, Recommendation,
};
use crate::features::{self, PhoneFeatures, TemporalFeatures};
use crate::history::History;
use crate::learning::{FeedbackKind, LearningAcceptance, LearningEvent, LearningLoop};
use crate::profile::{phone_hash, BehavioralProfile, InMemoryProfileStore, ProfileStore};
use crate::risk::{self, RiskAssessment, RiskInputs};
use crate::rules::store::candidate_rules;
use crate::rules::{
    ActionKind, CandidateRule, InMemoryRuleStore, RuleEvaluationResult, RuleStore,
};
use crate::storage::{
    InMemorySpamProfileStore, InMemoryWhitelistStore, NewWhitelistEntry, SpamProfile,
    SpamProfileStore, WhitelistEntry, WhitelistStore,
};

/// One inbound call to judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub context: serde_json::Map<String, Value>,
}

/// Feedback submission for a prior decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSubmission {
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub kind: FeedbackKind,
    #[serde(default)]
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub context: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_result: Option<EvaluationResult>,
}

/// Injectable collaborators; see DESIGN.md for the seam rationale.
pub struct EngineDeps {
    pub rules: Arc<dyn RuleStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub spam_profiles: Arc<dyn SpamProfileStore>,
    pub whitelist: Arc<dyn WhitelistStore>,
    pub cache: Arc<dyn ResultCache>,
}

pub struct DecisionEngine {
    config: EngineConfig,
    weights: HotReloadWeights,
    rules: Arc<dyn RuleStore>,
    profiles: Arc<dyn ProfileStore>,
    spam_profiles: Arc<dyn SpamProfileStore>,
    whitelist: Arc<dyn WhitelistStore>,
    cache: Arc<dyn ResultCache>,
    learning: Arc<LearningLoop>,
    history: Arc<History>,
}

impl DecisionEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let learning = Arc::new(LearningLoop::new(
            config.max_queue_size,
            deps.profiles.clone(),
            deps.spam_profiles.clone(),
            deps.whitelist.clone(),
            deps.cache.clone(),
        ));
        Self {
            config,
            weights: HotReloadWeights::new(None),
            rules: deps.rules,
            profiles: deps.profiles,
            spam_profiles: deps.spam_profiles,
            whitelist: deps.whitelist,
            cache: deps.cache,
            learning,
            history: Arc::new(History::with_capacity(2000)),
        }
    }

    /// Convenience wiring with the in-memory reference collaborators.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            config,
            EngineDeps {
                rules: Arc::new(InMemoryRuleStore::new()),
                profiles: Arc::new(InMemoryProfileStore::new()),
                spam_profiles: Arc::new(InMemorySpamProfileStore::new()),
                whitelist: Arc::new(InMemoryWhitelistStore::new()),
                cache: Arc::new(cache::InMemoryTtlCache::new()),
            },
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rules(&self) -> &Arc<dyn RuleStore> {
        &self.rules
    }

    pub fn learning(&self) -> &Arc<LearningLoop> {
        &self.learning
    }

    pub fn whitelist(&self) -> &Arc<dyn WhitelistStore> {
        &self.whitelist
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileStore> {
        &self.profiles
    }

    pub fn spam_profiles(&self) -> &Arc<dyn SpamProfileStore> {
        &self.spam_profiles
    }

    pub fn history(&self) -> &Arc<History> {
        &self.history
    }

    /// Evaluate one request. Infallible across this boundary: any internal
    /// error degrades to the safe fallback result.
    pub async fn evaluate(&self, request: EvaluationRequest) -> EvaluationResult {
        let started = Instant::now();
        let mut result = match self.evaluate_inner(&request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "engine", error = %e, "evaluation degraded to fallback");
                counter!("evaluation_fallbacks_total").increment(1);
                EvaluationResult::fallback(&request.phone)
            }
        };
        result.processing_ms = started.elapsed().as_millis() as u64;

        histogram!("evaluation_duration_ms").record(result.processing_ms as f64);
        counter!("evaluation_requests_total", "recommendation" => recommendation_label(result.recommendation))
            .increment(1);
        self.history.push(&result);
        result
    }

    /// Order-preserving batch evaluation: one result per input, per-item
    /// degradation instead of batch abort.
    pub async fn batch_evaluate(&self, requests: Vec<EvaluationRequest>) -> Vec<EvaluationResult> {
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            out.push(self.evaluate(request).await);
        }
        out
    }

    /// Accept outcome feedback and hand it to the learning loop. Invalid
    /// submissions are rejected synchronously, never queued half-parsed.
    pub fn record_feedback(&self, submission: FeedbackSubmission) -> LearningAcceptance {
        if submission.phone.trim().is_empty() {
            return LearningAcceptance {
                accepted: false,
                queue_depth: self.learning.queue_depth(),
                note: Some("phone must not be empty".into()),
            };
        }

        let confidence = submission
            .confidence
            .or_else(|| submission.original_result.as_ref().map(|r| r.confidence_score))
            .unwrap_or(0.5);

        let features = features::extract(&submission.phone, &submission.context);
        let ts = submission
            .context
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
            .unwrap_or_else(chrono::Utc::now);

        self.learning.enqueue(LearningEvent {
            user_id: submission.user_id,
            phone: submission.phone,
            kind: submission.kind,
            feedback: submission.feedback,
            confidence: clamp01(confidence),
            features: Some(features),
            context: Value::Object(submission.context),
            ts,
        })
    }

    // --- pipeline internals ---

    async fn evaluate_inner(&self, request: &EvaluationRequest) -> anyhow::Result<EvaluationResult> {
        let hash = phone_hash(&request.phone);
        let features = self.features_for(&request.phone, &hash, &request.context).await;
        let temporal = features::derive_temporal(&features, &request.context);

        // 1) Whitelist fast path (user-scoped).
        if let Some(user) = &request.user_id {
            if let Some(entry) = self.whitelist_lookup(user, &request.phone).await {
                return Ok(self.whitelist_result(request, &features, &temporal, entry));
            }
        }

        // 2) Rules above the short-circuit threshold run before (and
        //    instead of) the ensemble.
        let candidates = candidate_rules(self.rules.as_ref(), request.user_id.as_deref());
        let (high, low): (Vec<CandidateRule>, Vec<CandidateRule>) = candidates
            .into_iter()
            .partition(|c| c.rule.priority > self.config.high_priority_threshold);

        let base_ctx = flatten_context(request, &features, &temporal, None);
        if let Some(hit) = crate::rules::evaluate(&high, &base_ctx) {
            counter!("rule_short_circuits_total").increment(1);
            debug!(target: "engine", rule = %hit.rule_id, "high-priority rule short-circuited evaluation");
            return Ok(self.rule_result(request, &features, &temporal, hit, None).await);
        }

        // 3) Profiles (bounded reads) + ensemble (read-through cache).
        let profile = self.profiles.get(&hash);
        let spam_profile = self.spam_profile_lookup(&hash).await;
        let (verdict, cache_hit) = self
            .ensemble_for(&hash, &features, &temporal, profile.clone())
            .await;

        // 4) Remaining rules see the ensemble fields; first match beats the
        //    ensemble verdict.
        let full_ctx = flatten_context(request, &features, &temporal, verdict.as_ref());
        if let Some(hit) = crate::rules::evaluate(&low, &full_ctx) {
            let mut result = self
                .rule_result(request, &features, &temporal, hit, verdict.as_ref())
                .await;
            result.cache_hit = cache_hit;
            return Ok(result);
        }

        // 5) No rule matched: fuse ensemble + risk, or give up safely.
        let Some(verdict) = verdict else {
            counter!("evaluation_fallbacks_total").increment(1);
            warn!(target: "engine", phone = %hash, "all ensemble scorers unavailable");
            return Ok(EvaluationResult::fallback(&request.phone));
        };

        let assessment = risk::assess(RiskInputs {
            features: &features,
            temporal: &temporal,
            profile: profile.as_ref(),
            spam_profile: spam_profile.as_ref(),
        });
        Ok(self.fused_result(request, verdict, assessment, cache_hit))
    }

    /// Read-through feature extraction: the phone-only slice is memoized
    /// under `features:<hash>`, context enrichment always runs fresh.
    async fn features_for(
        &self,
        phone: &str,
        hash: &str,
        context: &serde_json::Map<String, Value>,
    ) -> PhoneFeatures {
        let key = cache::features_key(hash);
        let mut base = match self.cache_get(&key).await {
            Some(raw) => match serde_json::from_str::<PhoneFeatures>(&raw) {
                Ok(f) => f,
                Err(e) => {
                    debug!(target: "engine", error = %e, "stale feature cache entry; re-extracting");
                    self.memoize_features(phone, &key).await
                }
            },
            None => self.memoize_features(phone, &key).await,
        };
        features::enrich(&mut base, context);
        base
    }

    async fn memoize_features(&self, phone: &str, key: &str) -> PhoneFeatures {
        let f = features::extract_phone(phone);
        if let Ok(raw) = serde_json::to_string(&f) {
            let cache = self.cache.clone();
            let key = key.to_string();
            let ttl = Duration::from_secs(self.config.features_ttl_secs);
            tokio::spawn(async move { cache.set(&key, raw, ttl).await });
        }
        f
    }

    /// Ensemble with read-through result cache. Returns `(verdict,
    /// cache_hit)`; `None` verdict means every scorer was unavailable.
    async fn ensemble_for(
        &self,
        hash: &str,
        features: &PhoneFeatures,
        temporal: &TemporalFeatures,
        profile: Option<BehavioralProfile>,
    ) -> (Option<EnsembleVerdict>, bool) {
        let key = cache::ml_result_key(hash);
        if let Some(raw) = self.cache_get(&key).await {
            if let Ok(verdict) = serde_json::from_str::<EnsembleVerdict>(&raw) {
                counter!("ensemble_cache_hits_total").increment(1);
                return (Some(verdict), true);
            }
        }

        let verdict = classify::run_ensemble(
            features,
            temporal,
            profile,
            self.weights.current(),
            self.config.spam_threshold,
            Duration::from_millis(self.config.scorer_timeout_ms),
        )
        .await;

        if let Some(v) = &verdict {
            if let Ok(raw) = serde_json::to_string(v) {
                let cache = self.cache.clone();
                let ttl = Duration::from_secs(self.config.ml_result_ttl_secs);
                tokio::spawn(async move { cache.set(&key, raw, ttl).await });
            }
        }
        (verdict, false)
    }

    /// Cache read with a hard budget; timeout reads as a miss.
    async fn cache_get(&self, key: &str) -> Option<String> {
        let budget = Duration::from_millis(self.config.cache_read_timeout_ms);
        match tokio::time::timeout(budget, self.cache.get(key)).await {
            Ok(v) => v,
            Err(_) => {
                debug!(target: "engine", key, "cache read timed out; treating as miss");
                None
            }
        }
    }

    /// Whitelist lookup: cache first, then the store, both bounded. Any
    /// failure or timeout means "not whitelisted" — never a blocked call.
    async fn whitelist_lookup(&self, user: &str, phone: &str) -> Option<WhitelistEntry> {
        let now = chrono::Utc::now();
        let key = cache::whitelist_key(user, phone);
        if let Some(raw) = self.cache_get(&key).await {
            if let Ok(entry) = serde_json::from_str::<WhitelistEntry>(&raw) {
                if entry.is_live(now) {
                    return Some(entry);
                }
            }
        }

        let budget = Duration::from_millis(self.config.store_read_timeout_ms);
        let entry = match tokio::time::timeout(budget, self.whitelist.find(user, phone)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(target: "engine", error = %e, "whitelist lookup failed; treating as miss");
                None
            }
            Err(_) => {
                debug!(target: "engine", "whitelist lookup timed out; treating as miss");
                None
            }
        }?;
        if !entry.is_live(now) {
            return None;
        }

        if let Ok(raw) = serde_json::to_string(&entry) {
            let cache = self.cache.clone();
            let ttl = Duration::from_secs(self.config.features_ttl_secs);
            tokio::spawn(async move { cache.set(&key, raw, ttl).await });
        }
        Some(entry)
    }

    async fn spam_profile_lookup(&self, hash: &str) -> Option<SpamProfile> {
        let budget = Duration::from_millis(self.config.store_read_timeout_ms);
        match tokio::time::timeout(budget, self.spam_profiles.get(hash)).await {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => {
                warn!(target: "engine", error = %e, "spam profile lookup failed");
                None
            }
            Err(_) => None,
        }
    }

    fn whitelist_result(
        &self,
        request: &EvaluationRequest,
        features: &PhoneFeatures,
        temporal: &TemporalFeatures,
        entry: WhitelistEntry,
    ) -> EvaluationResult {
        counter!("whitelist_hits_total").increment(1);
        // Hit-count bookkeeping is best-effort and off the hot path.
        {
            let store = self.whitelist.clone();
            let (user, phone) = (entry.user_id.clone(), entry.contact_phone.clone());
            tokio::spawn(async move {
                let _ = store.record_hit(&user, &phone).await;
            });
        }

        let assessment = risk::assess(RiskInputs {
            features,
            temporal,
            profile: None,
            spam_profile: None,
        });
        let name = entry.contact_name.as_deref().unwrap_or("known contact");
        let mut result =
            EvaluationResult::new(&request.phone, Recommendation::Allow, entry.confidence_score);
        result.is_whitelisted = true;
        result.classification = "legitimate".into();
        result.risk_score = assessment.risk_score;
        result.risk_level = assessment.risk_level;
        result.confidence_interval = assessment.confidence_interval;
        result.reasons.push(
            Reason::new(format!("Whitelisted contact: {name}"))
                .kind(ReasonKind::Whitelist)
                .weighted(entry.confidence_score),
        );
        result
    }

    async fn rule_result(
        &self,
        request: &EvaluationRequest,
        features: &PhoneFeatures,
        temporal: &TemporalFeatures,
        hit: RuleEvaluationResult,
        verdict: Option<&EnsembleVerdict>,
    ) -> EvaluationResult {
        counter!("rule_hits_total", "rule" => hit.rule_id.clone()).increment(1);

        let recommendation = match hit.action.kind {
            ActionKind::Allow => Recommendation::Allow,
            ActionKind::Block => Recommendation::Block,
            ActionKind::Analyze => Recommendation::AnalyzeFurther,
            ActionKind::Flag => Recommendation::ManualReview,
        };

        // A temporary allow materializes as an auto-learned whitelist entry.
        if hit.action.temporary && hit.action.kind == ActionKind::Allow {
            if let (Some(user), Some(secs)) = (&request.user_id, hit.action.duration_secs) {
                let store = self.whitelist.clone();
                let entry = NewWhitelistEntry {
                    user_id: user.clone(),
                    contact_phone: request.phone.clone(),
                    contact_name: None,
                    entry_type: "auto_learned".into(),
                    confidence_score: hit.action.confidence,
                    expires_at: Some(chrono::Utc::now() + chrono::Duration::seconds(secs as i64)),
                    now: chrono::Utc::now(),
                };
                tokio::spawn(async move {
                    if let Err(e) = store.upsert(entry).await {
                        warn!(target: "engine", error = %e, "temporary allow write-through failed");
                    }
                });
            }
        }

        let assessment = risk::assess(RiskInputs {
            features,
            temporal,
            profile: None,
            spam_profile: None,
        });

        let mut result = EvaluationResult::new(&request.phone, recommendation, hit.action.confidence);
        result.risk_score = assessment.risk_score;
        result.risk_level = assessment.risk_level;
        result.confidence_interval = assessment.confidence_interval;
        match verdict {
            Some(v) => {
                result.is_spam = v.is_spam;
                result.classification = v.classification.clone();
            }
            None => {
                // Pre-ensemble short-circuit: derive the label from the action.
                result.is_spam = hit.action.kind == ActionKind::Block;
                result.classification = match hit.action.kind {
                    ActionKind::Allow => "legitimate".into(),
                    _ => "unknown".into(),
                };
            }
        }
        result.reasons.push(
            Reason::new(format!("Matched rule: {} - {}", hit.rule_name, hit.action.reason))
                .kind(ReasonKind::RuleMatch)
                .weighted(hit.action.confidence),
        );
        result
    }

    fn fused_result(
        &self,
        request: &EvaluationRequest,
        verdict: EnsembleVerdict,
        assessment: RiskAssessment,
        cache_hit: bool,
    ) -> EvaluationResult {
        let manual = self.config.require_manual_approval
            || request
                .user_id
                .as_deref()
                .and_then(|u| self.rules.preferences(u))
                .map(|p| p.require_manual_approval)
                .unwrap_or(false);
        let recommendation = risk::recommend(assessment.risk_level, manual);

        let mut result = EvaluationResult::new(&request.phone, recommendation, verdict.confidence);
        result.is_spam = verdict.is_spam;
        result.classification = verdict.classification.clone();
        result.risk_score = assessment.risk_score;
        result.risk_level = assessment.risk_level;
        result.confidence_interval = assessment.confidence_interval;
        result.cache_hit = cache_hit;

        for (i, c) in verdict.contributions.iter().enumerate() {
            let kind = match c.model {
                classify::ScorerKind::Pattern => ReasonKind::Pattern,
                classify::ScorerKind::Behavioral => ReasonKind::Behavioral,
                classify::ScorerKind::Temporal => ReasonKind::Temporal,
                classify::ScorerKind::Contextual => ReasonKind::Contextual,
            };
            if let Some(msg) = verdict.reasons.get(i) {
                result
                    .reasons
                    .push(Reason::new(msg.clone()).kind(kind).weighted(c.weight));
            }
        }
        // Tail reasons (e.g. degraded-scorer note) carry no model kind.
        for msg in verdict.reasons.iter().skip(verdict.contributions.len()) {
            result
                .reasons
                .push(Reason::new(msg.clone()).kind(ReasonKind::Degraded));
        }
        result.reasons.push(
            Reason::new(format!(
                "Risk {:?}: pattern {:.2}, temporal {:.2}, behavioral {:.2}",
                assessment.risk_level,
                assessment.pattern_risk,
                assessment.temporal_risk,
                assessment.behavioral_risk
            ))
            .kind(ReasonKind::Risk)
            .weighted(assessment.risk_score),
        );
        result
    }
}

/// Flatten the request into the rule-evaluation context. Raw request fields
/// at the top, features/temporal as nested objects, the eager ensemble
/// fields (when available) as read-only inputs.
fn flatten_context(
    request: &EvaluationRequest,
    features: &PhoneFeatures,
    temporal: &TemporalFeatures,
    verdict: Option<&EnsembleVerdict>,
) -> Value {
    let mut ctx = json!({
        "phone": request.phone,
        "user_id": request.user_id,
        "context": Value::Object(request.context.clone()),
        "features": serde_json::to_value(features).unwrap_or(Value::Null),
        "temporal": serde_json::to_value(temporal).unwrap_or(Value::Null),
    });
    if let Some(v) = verdict {
        ctx["classification"] = json!(v.classification);
        ctx["classification_confidence"] = json!(v.confidence);
        ctx["spam_type"] = json!(v.spam_type);
        ctx["fusion_score"] = json!(v.fusion_score);
    }
    ctx
}

fn recommendation_label(r: Recommendation) -> &'static str {
    match r {
        Recommendation::Allow => "allow",
        Recommendation::Block => "block",
        Recommendation::BlockWithOption => "block_with_option",
        Recommendation::AnalyzeFurther => "analyze_further",
        Recommendation::ManualReview => "manual_review",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> DecisionEngine {
        DecisionEngine::in_memory(EngineConfig::default())
    }

    fn request(phone: &str, ctx: Value) -> EvaluationRequest {
        EvaluationRequest {
            phone: phone.into(),
            user_id: None,
            context: ctx.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn emergency_number_short_circuits_with_full_confidence() {
        let e = engine();
        // Even a spam-soaked context cannot override the emergency rule,
        // because the ensemble never runs for it.
        let r = e
            .evaluate(request(
                "911",
                json!({"transcript": "free loan act now winner prize"}),
            ))
            .await;
        assert_eq!(r.recommendation, Recommendation::Allow);
        assert!((r.confidence_score - 1.0).abs() < f32::EPSILON);
        assert!(r.reasons.iter().any(|x| x.message.contains("Emergency")));
        assert!(!r.is_spam);
    }

    #[tokio::test]
    async fn toll_free_number_is_never_confidently_allowed() {
        let e = engine();
        let r = e.evaluate(request("+18005551234", json!({}))).await;
        assert_ne!(r.classification, "legitimate");
        assert!(
            r.recommendation != Recommendation::Allow || r.confidence_score < 0.7,
            "got {:?} at {}",
            r.recommendation,
            r.confidence_score
        );
    }

    #[tokio::test]
    async fn marketing_context_classifies_spam() {
        let e = engine();
        let r = e
            .evaluate(request(
                "+12067834901",
                json!({"transcript": "Totally free! Act now to refinance your loan."}),
            ))
            .await;
        assert!(r.classification.starts_with("spam_"), "{}", r.classification);
        assert!(r.is_spam);
    }

    #[tokio::test]
    async fn results_are_deterministic_for_fixed_input() {
        let e = engine();
        let req = request("+12065550123", json!({"notes": "callback about order"}));
        let a = e.evaluate(req.clone()).await;
        let b = e.evaluate(req).await;
        assert_eq!(a.recommendation, b.recommendation);
        assert_eq!(a.classification, b.classification);
        assert!((a.confidence_score - b.confidence_score).abs() < 1e-6);
        assert!((a.risk_score - b.risk_score).abs() < 1e-6);
    }

    #[tokio::test]
    async fn bounds_hold_across_inputs() {
        let e = engine();
        for phone in ["911", "+18005551234", "+12065550123", "garbage", "0000000000"] {
            let r = e.evaluate(request(phone, json!({}))).await;
            assert!((0.0..=1.0).contains(&r.confidence_score), "{phone}");
            assert!((0.0..=1.0).contains(&r.risk_score), "{phone}");
            assert!(
                r.confidence_interval.lower <= r.risk_score
                    && r.risk_score <= r.confidence_interval.upper,
                "{phone}"
            );
        }
    }

    #[tokio::test]
    async fn user_rule_below_threshold_beats_ensemble() {
        let e = engine();
        e.rules()
            .add_user_rule(
                "u1",
                crate::rules::Rule {
                    id: "trust-atlanta".into(),
                    name: "Trust the Atlanta office".into(),
                    enabled: true,
                    priority: 450,
                    conditions: vec![crate::rules::RuleCondition {
                        field: "phone".into(),
                        op: crate::rules::Operator::StartsWith,
                        value: json!("+1404"),
                        case_sensitive: false,
                    }],
                    action: crate::rules::RuleAction {
                        kind: ActionKind::Allow,
                        confidence: 0.97,
                        reason: "office line".into(),
                        temporary: false,
                        duration_secs: None,
                    },
                },
            )
            .unwrap();

        // Spam-looking content, but the user rule wins over the ensemble.
        let mut req = request(
            "+14045551234",
            json!({"transcript": "free prize act now loan"}),
        );
        req.user_id = Some("u1".into());
        let r = e.evaluate(req).await;
        assert_eq!(r.recommendation, Recommendation::Allow);
        assert!(r.reasons.iter().any(|x| x.message.contains("Atlanta")));
    }

    #[tokio::test]
    async fn batch_preserves_order_and_length() {
        let e = engine();
        let reqs = vec![
            request("911", json!({})),
            request("+18005551234", json!({})),
            request("+12065550123", json!({})),
        ];
        let out = e.batch_evaluate(reqs).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].phone, "911");
        assert_eq!(out[1].phone, "+18005551234");
        assert_eq!(out[2].phone, "+12065550123");
    }

    #[tokio::test]
    async fn whitelisted_contact_fast_paths_to_allow() {
        let e = engine();
        e.whitelist()
            .upsert(NewWhitelistEntry {
                user_id: "u1".into(),
                contact_phone: "+18005551234".into(),
                contact_name: Some("Bank hotline".into()),
                entry_type: "manual".into(),
                confidence_score: 0.98,
                expires_at: None,
                now: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let mut req = request("+18005551234", json!({}));
        req.user_id = Some("u1".into());
        let r = e.evaluate(req).await;
        assert!(r.is_whitelisted);
        assert_eq!(r.recommendation, Recommendation::Allow);
        assert!((r.confidence_score - 0.98).abs() < 1e-6);
    }

    #[tokio::test]
    async fn feedback_rejected_for_empty_phone() {
        let e = engine();
        let ack = e.record_feedback(FeedbackSubmission {
            phone: "  ".into(),
            user_id: None,
            kind: FeedbackKind::Reject,
            feedback: String::new(),
            confidence: None,
            context: serde_json::Map::new(),
            original_result: None,
        });
        assert!(!ack.accepted);
    }

    #[tokio::test]
    async fn second_evaluation_hits_the_result_cache() {
        let e = engine();
        let req = request("+12065550123", json!({}));
        let first = e.evaluate(req.clone()).await;
        assert!(!first.cache_hit);
        // The cache write happens off the hot path; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let second = e.evaluate(req).await;
        assert!(second.cache_hit);
        assert_eq!(first.classification, second.classification);
    }
}
