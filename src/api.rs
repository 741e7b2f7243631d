//! api.rs — thin HTTP facade over the evaluation API.
//!
//! Routing and wire shapes only; all behavior lives in `engine`. Auth is a
//! deployment concern and stays outside this crate.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::decision::EvaluationResult;
use crate::engine::{DecisionEngine, EvaluationRequest, FeedbackSubmission};
use crate::learning::LearningAcceptance;
use crate::rules::{Rule, RuleExport, UserPreferences};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DecisionEngine>,
}

pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/evaluate", post(evaluate))
        .route("/evaluate/batch", post(evaluate_batch))
        .route("/feedback", post(feedback))
        .route("/rules/export", get(export_rules))
        .route("/rules/import", post(import_rules))
        .route("/rules/{user_id}", get(get_user_rules).post(add_user_rule))
        .route("/rules/{user_id}/preferences", put(set_preferences))
        .route("/rules/{user_id}/{rule_id}", delete(remove_user_rule));

    if debug_routes_enabled() {
        router = router
            .route("/debug/history", get(debug_history))
            .route("/debug/queue", get(debug_queue));
    }

    router.layer(CorsLayer::very_permissive()).with_state(state)
}

fn debug_routes_enabled() -> bool {
    std::env::var("DEBUG_ROUTES").ok().as_deref() == Some("1")
}

async fn evaluate(
    State(state): State<AppState>,
    Json(request): Json<EvaluationRequest>,
) -> Json<EvaluationResult> {
    Json(state.engine.evaluate(request).await)
}

async fn evaluate_batch(
    State(state): State<AppState>,
    Json(requests): Json<Vec<EvaluationRequest>>,
) -> Json<Vec<EvaluationResult>> {
    Json(state.engine.batch_evaluate(requests).await)
}

async fn feedback(
    State(state): State<AppState>,
    Json(submission): Json<FeedbackSubmission>,
) -> (StatusCode, Json<LearningAcceptance>) {
    let ack = state.engine.record_feedback(submission);
    let status = if ack.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(ack))
}

async fn get_user_rules(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<Vec<Rule>> {
    Json(state.engine.rules().user_rules(&user_id))
}

async fn add_user_rule(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(rule): Json<Rule>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .engine
        .rules()
        .add_user_rule(&user_id, rule)
        .map(|_| StatusCode::CREATED)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

async fn remove_user_rule(
    State(state): State<AppState>,
    Path((user_id, rule_id)): Path<(String, String)>,
) -> Result<StatusCode, (StatusCode, String)> {
    match state.engine.rules().remove_user_rule(&user_id, &rule_id) {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err((StatusCode::NOT_FOUND, format!("no rule '{rule_id}'"))),
        Err(e) => Err((StatusCode::BAD_REQUEST, e.to_string())),
    }
}

async fn set_preferences(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(prefs): Json<UserPreferences>,
) -> StatusCode {
    state.engine.rules().set_preferences(&user_id, prefs);
    StatusCode::NO_CONTENT
}

async fn export_rules(State(state): State<AppState>) -> Json<RuleExport> {
    Json(state.engine.rules().export())
}

async fn import_rules(
    State(state): State<AppState>,
    Json(export): Json<RuleExport>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .engine
        .rules()
        .import(export)
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

#[derive(serde::Serialize)]
struct HistoryOut {
    ts_unix: u64,
    phone_hash: String,
    recommendation: String,
    classification: String,
    confidence: f32,
    risk_score: f32,
    cache_hit: bool,
}

async fn debug_history(State(state): State<AppState>) -> Json<Vec<HistoryOut>> {
    let rows = state.engine.history().snapshot_last_n(10);
    let out = rows
        .into_iter()
        .map(|h| HistoryOut {
            ts_unix: h.ts_unix,
            phone_hash: h.phone_hash,
            recommendation: format!("{:?}", h.recommendation).to_lowercase(),
            classification: h.classification,
            confidence: h.confidence,
            risk_score: h.risk_score,
            cache_hit: h.cache_hit,
        })
        .collect::<Vec<_>>();
    Json(out)
}

#[derive(serde::Serialize)]
struct QueueInfo {
    depth: usize,
}

async fn debug_queue(State(state): State<AppState>) -> Json<QueueInfo> {
    Json(QueueInfo {
        depth: state.engine.learning().queue_depth(),
    })
}
