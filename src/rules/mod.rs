//! Prioritized rule matching over a flattened request context.
//!
//! A rule is a conjunction of field conditions plus one action. Candidates
//! (global + user + preference-synthesized, see [`store`]) are sorted by
//! priority descending, ties broken global-before-user then insertion order,
//! and the first match wins.
//!
//! Conditions address the context by dot-path (`"features.is_toll_free"`,
//! `"context.caller_name"`); an unresolved path evaluates to "condition
//! false", never an error. A rule with zero conditions never matches.

pub mod store;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use store::{InMemoryRuleStore, RuleExport, RuleStore, UserPreferences};

/// Closed operator set, dispatched through a single match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    Matches,
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Dot-path into the flattened evaluation context.
    pub field: String,
    pub op: Operator,
    pub value: Value,
    #[serde(default)]
    pub case_sensitive: bool,
}

/// What happens when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Allow,
    Block,
    Analyze,
    Flag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    pub kind: ActionKind,
    pub confidence: f32,
    pub reason: String,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher priority is evaluated first.
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub action: RuleAction,
}

fn default_enabled() -> bool {
    true
}

/// Where a candidate rule came from; breaks priority ties
/// (global before user before preference-synthesized).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuleOrigin {
    Global,
    User,
    Preference,
}

/// A rule staged for evaluation, with ordering metadata attached.
#[derive(Debug, Clone)]
pub struct CandidateRule {
    pub rule: Rule,
    pub origin: RuleOrigin,
    pub insert_idx: usize,
}

/// Outcome of a successful rule match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluationResult {
    pub rule_id: String,
    pub rule_name: String,
    pub priority: i32,
    pub action: RuleAction,
}

/// Sort candidates into evaluation order.
pub fn sort_candidates(candidates: &mut [CandidateRule]) {
    candidates.sort_by(|a, b| {
        b.rule
            .priority
            .cmp(&a.rule.priority)
            .then(a.origin.cmp(&b.origin))
            .then(a.insert_idx.cmp(&b.insert_idx))
    });
}

/// Evaluate pre-sorted candidates against the flattened context; first match
/// wins. Disabled rules and zero-condition rules never match.
pub fn evaluate(candidates: &[CandidateRule], ctx: &Value) -> Option<RuleEvaluationResult> {
    for c in candidates {
        if rule_matches(&c.rule, ctx) {
            return Some(RuleEvaluationResult {
                rule_id: c.rule.id.clone(),
                rule_name: c.rule.name.clone(),
                priority: c.rule.priority,
                action: c.rule.action.clone(),
            });
        }
    }
    None
}

/// A rule matches iff it is enabled, has at least one condition, and ALL
/// conditions hold (conjunction only).
pub fn rule_matches(rule: &Rule, ctx: &Value) -> bool {
    rule.enabled
        && !rule.conditions.is_empty()
        && rule.conditions.iter().all(|c| condition_holds(c, ctx))
}

fn condition_holds(cond: &RuleCondition, ctx: &Value) -> bool {
    let Some(actual) = lookup(ctx, &cond.field) else {
        return false;
    };
    match cond.op {
        Operator::Equals => values_equal(actual, &cond.value, cond.case_sensitive),
        Operator::Contains => match (actual, &cond.value) {
            (Value::String(hay), needle) => str_of(needle)
                .map(|n| contains_str(hay, &n, cond.case_sensitive))
                .unwrap_or(false),
            (Value::Array(items), needle) => items
                .iter()
                .any(|it| values_equal(it, needle, cond.case_sensitive)),
            _ => false,
        },
        Operator::StartsWith => str_pair(actual, &cond.value, cond.case_sensitive)
            .map(|(a, b)| a.starts_with(&b))
            .unwrap_or(false),
        Operator::EndsWith => str_pair(actual, &cond.value, cond.case_sensitive)
            .map(|(a, b)| a.ends_with(&b))
            .unwrap_or(false),
        Operator::GreaterThan => match (num_of(actual), num_of(&cond.value)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        Operator::LessThan => match (num_of(actual), num_of(&cond.value)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        Operator::Matches => match (actual.as_str(), cond.value.as_str()) {
            // An invalid pattern fails the condition rather than erroring.
            (Some(hay), Some(pat)) => Regex::new(pat).map(|re| re.is_match(hay)).unwrap_or(false),
            _ => false,
        },
        Operator::In => match &cond.value {
            Value::Array(options) => options
                .iter()
                .any(|opt| values_equal(actual, opt, cond.case_sensitive)),
            _ => false,
        },
    }
}

/// Dot-path lookup into nested JSON.
pub fn lookup<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = ctx;
    for seg in path.split('.') {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

// --- value coercion helpers ---

fn values_equal(a: &Value, b: &Value, case_sensitive: bool) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => {
            if case_sensitive {
                x == y
            } else {
                x.eq_ignore_ascii_case(y)
            }
        }
        (Value::Number(_), Value::Number(_)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => false,
        },
        _ => a == b,
    }
}

fn str_of(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn str_pair(a: &Value, b: &Value, case_sensitive: bool) -> Option<(String, String)> {
    let (mut x, mut y) = (str_of(a)?, str_of(b)?);
    if !case_sensitive {
        x = x.to_ascii_lowercase();
        y = y.to_ascii_lowercase();
    }
    Some((x, y))
}

fn contains_str(hay: &str, needle: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        hay.contains(needle)
    } else {
        hay.to_ascii_lowercase()
            .contains(&needle.to_ascii_lowercase())
    }
}

fn num_of(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
