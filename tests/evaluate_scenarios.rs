// tests/evaluate_scenarios.rs
//
// Engine-level scenario tests: the named end-to-end behaviors the pipeline
// must exhibit regardless of how the internals are wired.

use serde_json::{json, Value};

use caller_admission_engine::engine::{DecisionEngine, EvaluationRequest, FeedbackSubmission};
use caller_admission_engine::rules::{ActionKind, Operator, Rule, RuleAction, RuleCondition};
use caller_admission_engine::{EngineConfig, FeedbackKind, Recommendation};

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

fn block_rule(id: &str, priority: i32, conditions: Vec<RuleCondition>) -> Rule {
    Rule {
        id: id.into(),
        name: id.into(),
        enabled: true,
        priority,
        conditions,
        action: RuleAction {
            kind: ActionKind::Block,
            confidence: 0.99,
            reason: "test block".into(),
            temporary: false,
            duration_secs: None,
        },
    }
}

fn cond(field: &str, op: Operator, value: Value) -> RuleCondition {
    RuleCondition {
        field: field.into(),
        op,
        value,
        case_sensitive: false,
    }
}

#[tokio::test]
async fn emergency_allow_short_circuits_the_pipeline() {
    let e = engine();
    let r = e.evaluate(request("911", json!({}))).await;
    assert_eq!(r.recommendation, Recommendation::Allow);
    assert!((r.confidence_score - 1.0).abs() < f32::EPSILON);
    assert!(r.reasons.iter().any(|x| x.message.contains("Emergency")));
}

#[tokio::test]
async fn emergency_allow_wins_even_against_spam_soaked_context() {
    // The ensemble never runs for a high-priority match, so even maximal
    // spam signals in the context cannot flip the emergency verdict.
    let e = engine();
    let r = e
        .evaluate(request(
            "911",
            json!({"transcript": "free prize! act now! wire transfer your loan refund"}),
        ))
        .await;
    assert_eq!(r.recommendation, Recommendation::Allow);
    assert!((r.confidence_score - 1.0).abs() < f32::EPSILON);
    assert!(!r.is_spam);
}

#[tokio::test]
async fn user_rule_priority_1000_beats_priority_50() {
    let e = engine();
    // Low-priority block that would match the same phone.
    e.rules()
        .add_user_rule(
            "u1",
            block_rule("low", 50, vec![cond("phone", Operator::Equals, json!("911"))]),
        )
        .unwrap();

    let mut req = request("911", json!({}));
    req.user_id = Some("u1".into());
    let r = e.evaluate(req).await;
    // The global emergency rule at priority 1000 must win.
    assert_eq!(r.recommendation, Recommendation::Allow);
}

#[tokio::test]
async fn toll_free_pattern_is_flagged_not_cleanly_allowed() {
    let e = engine();
    let r = e.evaluate(request("+18005551234", json!({}))).await;
    assert_ne!(r.classification, "legitimate");
    assert!(
        r.classification == "suspicious" || r.classification.starts_with("spam_"),
        "classification {}",
        r.classification
    );
    if r.recommendation == Recommendation::Allow {
        assert!(r.confidence_score < 0.7, "no confident allow for toll-free patterns");
    }
}

#[tokio::test]
async fn marketing_content_classifies_spam_prefixed() {
    let e = engine();
    let r = e
        .evaluate(request(
            "+12067834901",
            json!({"transcript": "You are a winner! Totally free. Act now to claim your loan."}),
        ))
        .await;
    assert!(r.is_spam);
    assert!(r.classification.starts_with("spam_"), "{}", r.classification);
}

#[tokio::test]
async fn half_matching_conjunction_rule_never_fires() {
    let e = engine();
    e.rules()
        .add_user_rule(
            "u1",
            block_rule(
                "half",
                450,
                vec![
                    // True for this request...
                    cond("phone", Operator::StartsWith, json!("+1206")),
                    // ...but this context key is absent, so the rule must not match.
                    cond("context.campaign", Operator::Equals, json!("robo")),
                ],
            ),
        )
        .unwrap();

    let mut req = request("+12067834901", json!({"notes": "callback"}));
    req.user_id = Some("u1".into());
    let r = e.evaluate(req).await;
    assert_ne!(r.recommendation, Recommendation::Block);
    assert!(!r.reasons.iter().any(|x| x.message.contains("test block")));
}

#[tokio::test]
async fn all_scorers_failing_degrades_to_fallback_not_error() {
    // A zero scorer budget on a current-thread runtime guarantees every
    // scorer task times out before it is ever polled.
    let cfg = EngineConfig {
        scorer_timeout_ms: 0,
        ..EngineConfig::default()
    };
    let e = DecisionEngine::in_memory(cfg);

    let r = e.evaluate(request("+12067834901", json!({}))).await;
    assert_eq!(r.recommendation, Recommendation::ManualReview);
    assert!((r.confidence_score - 0.5).abs() < f32::EPSILON);
    assert!(r
        .reasons
        .iter()
        .any(|x| x.message.contains("manual review recommended")));

    // High-priority rules still work without the ensemble.
    let r = e.evaluate(request("911", json!({}))).await;
    assert_eq!(r.recommendation, Recommendation::Allow);
}

#[tokio::test]
async fn evaluation_is_deterministic() {
    let e = engine();
    let req = request(
        "+14155550166",
        json!({"notes": "delivery confirmation", "call_frequency": 2.0}),
    );
    let a = e.evaluate(req.clone()).await;
    let b = e.evaluate(req.clone()).await;
    let c = e.evaluate(req).await;
    for other in [&b, &c] {
        assert_eq!(a.recommendation, other.recommendation);
        assert_eq!(a.classification, other.classification);
        assert!((a.confidence_score - other.confidence_score).abs() < 1e-6);
        assert!((a.risk_score - other.risk_score).abs() < 1e-6);
    }
}

#[tokio::test]
async fn bounds_hold_for_random_inputs() {
    use rand::Rng;
    let e = engine();
    let mut rng = rand::rng();

    for _ in 0..50 {
        let len = rng.random_range(0..15);
        let phone: String = (0..len)
            .map(|_| char::from_digit(rng.random_range(0..10), 10).unwrap())
            .collect();
        let r = e.evaluate(request(&phone, json!({}))).await;

        assert!((0.0..=1.0).contains(&r.confidence_score), "phone {phone:?}");
        assert!((0.0..=1.0).contains(&r.risk_score), "phone {phone:?}");
        assert!(r.confidence_interval.lower <= r.risk_score, "phone {phone:?}");
        assert!(r.risk_score <= r.confidence_interval.upper, "phone {phone:?}");
    }
}

#[tokio::test]
async fn repeated_reject_feedback_monotonically_raises_spam_risk() {
    let e = engine();
    let phone = "+15095550142";
    let hash = caller_admission_engine::profile::phone_hash(phone);

    let mut last_risk = 0.0f32;
    for i in 0..10 {
        let ack = e.record_feedback(FeedbackSubmission {
            phone: phone.into(),
            user_id: Some("u1".into()),
            kind: FeedbackKind::Reject,
            feedback: "user_rejected".into(),
            confidence: Some(0.9),
            context: json!({"timestamp": 1_772_000_000i64 + i * 60})
                .as_object()
                .cloned()
                .unwrap(),
            original_result: None,
        });
        assert!(ack.accepted);
        e.learning().drain().await;

        let p = e
            .spam_profiles()
            .get(&hash)
            .await
            .unwrap()
            .expect("spam profile exists after reject");
        assert!(
            p.risk_score >= last_risk,
            "risk decreased: {} -> {}",
            last_risk,
            p.risk_score
        );
        assert!(p.risk_score <= 1.0);
        last_risk = p.risk_score;
    }
    assert!(last_risk > 0.8, "risk climbed past the fresh-profile cap");

    // And the next evaluation sees the accumulated risk.
    let r = e.evaluate(request(phone, json!({}))).await;
    assert!(r.risk_score >= 0.5, "risk {}", r.risk_score);
}

#[tokio::test]
async fn blocked_prefix_preference_blocks_before_the_ensemble() {
    let e = engine();
    e.rules().set_preferences(
        "u1",
        caller_admission_engine::rules::UserPreferences {
            blocked_prefixes: vec!["+1900".into()],
            ..Default::default()
        },
    );

    let mut req = request("+19005550123", json!({}));
    req.user_id = Some("u1".into());
    let r = e.evaluate(req).await;
    assert_eq!(r.recommendation, Recommendation::Block);
    assert!(r.reasons.iter().any(|x| x.message.contains("blocked by user preference")));
}
