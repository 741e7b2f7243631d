//! features.rs — phone/context feature extraction.
//!
//! `extract` is pure and total: it never fails. Malformed input collapses to
//! a documented neutral feature vector instead of an error, so downstream
//! scorers always receive something well-formed.
//!
//! Three ingredient groups:
//! - digit-pattern analysis of the phone string (repeats, sequences,
//!   complexity, toll-free/premium prefixes, area-code lookup),
//! - context aggregates (call frequency, average duration, histograms),
//! - content flags from a fixed keyword scan over string context values.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::decision::clamp01;

/// Embedded area-code table: code -> (region, carrier class).
static AREA_CODES: Lazy<HashMap<String, AreaInfo>> = Lazy::new(|| {
    let raw = include_str!("../area_codes.json");
    serde_json::from_str::<HashMap<String, AreaInfo>>(raw).expect("valid area code table")
});

#[derive(Debug, Clone, Deserialize)]
struct AreaInfo {
    region: String,
    carrier: String,
}

/// NANP toll-free prefixes.
const TOLL_FREE_CODES: [&str; 7] = ["800", "888", "877", "866", "855", "844", "833"];
/// Premium-rate prefix.
const PREMIUM_CODES: [&str; 1] = ["900"];

/// Fixed list of 4-digit ascending/descending runs.
static SEQUENTIAL_RUNS: Lazy<Vec<String>> = Lazy::new(|| {
    let asc = "0123456789";
    let desc = "9876543210";
    let mut out = Vec::with_capacity(14);
    for w in asc.as_bytes().windows(4) {
        out.push(String::from_utf8_lossy(w).to_string());
    }
    for w in desc.as_bytes().windows(4) {
        out.push(String::from_utf8_lossy(w).to_string());
    }
    out
});

/// Suffixes frequently seen on boiler-room caller IDs.
const SPAM_SUFFIXES: [&str; 4] = ["0000", "1111", "9999", "1234"];

const MARKETING_KEYWORDS: [&str; 10] = [
    "free",
    "offer",
    "limited time",
    "act now",
    "winner",
    "prize",
    "discount",
    "promotion",
    "congratulations",
    "special deal",
];

const URGENT_KEYWORDS: [&str; 8] = [
    "act now",
    "urgent",
    "immediately",
    "final notice",
    "last chance",
    "expires today",
    "warrant",
    "suspended",
];

const FINANCIAL_KEYWORDS: [&str; 10] = [
    "loan",
    "credit",
    "debt",
    "insurance",
    "investment",
    "cash",
    "refund",
    "irs",
    "bank account",
    "wire transfer",
];

/// Fixed-size feature vector derived from a phone string plus call context.
/// All scores live in [0,1]; histograms are fixed length (24 and 7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneFeatures {
    // digit-pattern group
    pub has_repeating_digits: bool,
    pub has_sequential_digits: bool,
    pub digit_complexity: f32,
    pub pattern_score: f32,
    // geography / carrier group
    pub area_code: String,
    pub region: String,
    pub carrier: String,
    pub is_voip: bool,
    pub is_mobile: bool,
    pub is_toll_free: bool,
    pub is_premium: bool,
    // behavioral context aggregates
    pub call_frequency: f32,
    pub avg_call_duration: f32,
    pub hour_histogram: [f32; 24],
    pub day_histogram: [f32; 7],
    // content flags
    pub has_marketing_keywords: bool,
    pub has_urgent_language: bool,
    pub has_financial_terms: bool,
    pub spam_indicator_count: u32,
}

impl PhoneFeatures {
    /// Neutral default vector used for malformed input. Risk-neutral on
    /// purpose: unknown callers must not be punished for bad formatting.
    pub fn neutral() -> Self {
        Self {
            has_repeating_digits: false,
            has_sequential_digits: false,
            digit_complexity: 0.5,
            pattern_score: 0.5,
            area_code: String::new(),
            region: "Unknown".to_string(),
            carrier: "Unknown".to_string(),
            is_voip: false,
            is_mobile: true,
            is_toll_free: false,
            is_premium: false,
            call_frequency: 0.0,
            avg_call_duration: 0.0,
            hour_histogram: [0.0; 24],
            day_histogram: [0.0; 7],
            has_marketing_keywords: false,
            has_urgent_language: false,
            has_financial_terms: false,
            spam_indicator_count: 0,
        }
    }
}

/// Time-of-day/velocity signals derived alongside the main vector.
/// Neutral (0.5 / 0.0) when the context carries no temporal information,
/// which keeps extraction deterministic for a fixed input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemporalFeatures {
    pub risk_score: f32,
    pub anomaly_score: f32,
    pub velocity_risk: f32,
}

impl TemporalFeatures {
    pub fn neutral() -> Self {
        Self {
            risk_score: 0.5,
            anomaly_score: 0.0,
            velocity_risk: 0.0,
        }
    }
}

/// Extract the full feature vector. Pure, total, idempotent.
pub fn extract(phone: &str, context: &serde_json::Map<String, Value>) -> PhoneFeatures {
    let mut f = extract_phone(phone);
    enrich(&mut f, context);
    f
}

/// The context-independent part of extraction: digit patterns and
/// geography only. This is the slice that is safe to memoize under
/// `features:<phoneHash>`; context enrichment always runs fresh.
pub fn extract_phone(phone: &str) -> PhoneFeatures {
    let digits = digits_of(phone);

    // Fewer than three digits cannot be analyzed meaningfully.
    let mut f = if digits.len() < 3 {
        PhoneFeatures::neutral()
    } else {
        digit_features(&digits)
    };
    f.spam_indicator_count = count_indicators(&f);
    f
}

/// Fold the per-call context into an already-extracted vector and recount
/// the spam indicators.
pub fn enrich(f: &mut PhoneFeatures, context: &serde_json::Map<String, Value>) {
    apply_context(f, context);
    f.spam_indicator_count = count_indicators(f);
}

/// Derive the temporal signal group from an already-extracted vector plus
/// the raw context. Split out so the engine can cache `PhoneFeatures`
/// without caching temporal state.
pub fn derive_temporal(features: &PhoneFeatures, context: &serde_json::Map<String, Value>) -> TemporalFeatures {
    let velocity_risk = clamp01(features.call_frequency / 10.0);

    let ts = context
        .get("timestamp")
        .or_else(|| context.get("call_time"))
        .and_then(Value::as_i64);

    let Some(ts) = ts else {
        // No temporal signal: stay neutral rather than guessing from the
        // wall clock (evaluation must be deterministic for a fixed input).
        return TemporalFeatures {
            velocity_risk,
            ..TemporalFeatures::neutral()
        };
    };

    use chrono::{Datelike, TimeZone, Timelike, Utc};
    let Some(dt) = Utc.timestamp_opt(ts, 0).single() else {
        return TemporalFeatures {
            velocity_risk,
            ..TemporalFeatures::neutral()
        };
    };

    let hour = dt.hour() as usize;
    let mut risk = match hour {
        9..=17 => 0.2,
        6..=8 | 18..=21 => 0.35,
        _ => 0.7, // night calls
    };
    let weekday = dt.weekday().num_days_from_monday();
    if weekday >= 5 {
        risk += 0.1;
    }

    // Anomaly: how unusual is this hour compared to the caller's histogram.
    let hist = &features.hour_histogram;
    let max = hist.iter().cloned().fold(0.0f32, f32::max);
    let anomaly = if max > 0.0 { 1.0 - hist[hour] / max } else { 0.0 };

    TemporalFeatures {
        risk_score: clamp01(risk),
        anomaly_score: clamp01(anomaly),
        velocity_risk,
    }
}

// --- internals ---

fn digits_of(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Strip the NANP country prefix when present.
fn national_digits(digits: &str) -> &str {
    if digits.len() == 11 && digits.starts_with('1') {
        &digits[1..]
    } else {
        digits
    }
}

fn digit_features(digits: &str) -> PhoneFeatures {
    let national = national_digits(digits);

    let has_repeating = has_repeating_run(national, 3);
    let has_sequential = SEQUENTIAL_RUNS.iter().any(|run| national.contains(run.as_str()));
    let spam_suffix = SPAM_SUFFIXES.iter().any(|s| national.ends_with(s));
    let all_same = national.len() >= 4 && national.chars().all(|c| c == national.chars().next().unwrap());

    let mut pattern_score = 1.0f32;
    if has_repeating {
        pattern_score -= 0.25;
    }
    if has_sequential {
        pattern_score -= 0.25;
    }
    if spam_suffix {
        pattern_score -= 0.2;
    }
    if all_same {
        pattern_score -= 0.3;
    }
    let pattern_score = clamp01(pattern_score);

    let digit_complexity = complexity(national);

    let (area_code, region, carrier, is_toll_free, is_premium) = geography(national);
    let is_voip = carrier == "VoIP";
    let is_mobile = !is_toll_free && !is_premium && !is_voip;

    PhoneFeatures {
        has_repeating_digits: has_repeating,
        has_sequential_digits: has_sequential,
        digit_complexity,
        pattern_score,
        area_code,
        region,
        carrier,
        is_voip,
        is_mobile,
        is_toll_free,
        is_premium,
        ..PhoneFeatures::neutral()
    }
}

/// True when the string contains a run of `min_run` identical digits.
fn has_repeating_run(digits: &str, min_run: usize) -> bool {
    let mut run = 1usize;
    let mut prev: Option<char> = None;
    for c in digits.chars() {
        if Some(c) == prev {
            run += 1;
            if run >= min_run {
                return true;
            }
        } else {
            run = 1;
            prev = Some(c);
        }
    }
    false
}

/// Blend of unique-digit ratio and normalized Shannon entropy, both in [0,1].
fn complexity(digits: &str) -> f32 {
    if digits.is_empty() {
        return 0.5;
    }
    let mut counts = [0usize; 10];
    for c in digits.chars() {
        if let Some(d) = c.to_digit(10) {
            counts[d as usize] += 1;
        }
    }
    let len = digits.len() as f32;
    let unique = counts.iter().filter(|&&n| n > 0).count() as f32;
    let unique_ratio = (unique / 10.0).min(1.0);

    let mut entropy = 0.0f32;
    for &n in counts.iter() {
        if n > 0 {
            let p = n as f32 / len;
            entropy -= p * p.log2();
        }
    }
    // log2(10) is the maximum achievable entropy over a decimal alphabet.
    let entropy_norm = clamp01(entropy / 10f32.log2());

    clamp01(0.5 * unique_ratio + 0.5 * entropy_norm)
}

fn geography(national: &str) -> (String, String, String, bool, bool) {
    if national.len() < 10 {
        return (
            String::new(),
            "Unknown".to_string(),
            "Unknown".to_string(),
            false,
            false,
        );
    }
    let code = &national[..3];
    if TOLL_FREE_CODES.contains(&code) {
        return (
            code.to_string(),
            "Toll-Free".to_string(),
            "Toll-Free".to_string(),
            true,
            false,
        );
    }
    if PREMIUM_CODES.contains(&code) {
        return (
            code.to_string(),
            "Premium".to_string(),
            "Premium".to_string(),
            false,
            true,
        );
    }
    match AREA_CODES.get(code) {
        Some(info) => (
            code.to_string(),
            info.region.clone(),
            info.carrier.clone(),
            false,
            false,
        ),
        None => (
            code.to_string(),
            "Unknown".to_string(),
            "Unknown".to_string(),
            false,
            false,
        ),
    }
}

fn apply_context(f: &mut PhoneFeatures, context: &serde_json::Map<String, Value>) {
    if let Some(v) = context.get("call_frequency").and_then(Value::as_f64) {
        f.call_frequency = clamp_nonneg(v as f32);
    }
    if let Some(v) = context.get("avg_call_duration").and_then(Value::as_f64) {
        f.avg_call_duration = clamp_nonneg(v as f32);
    }
    if let Some(arr) = context.get("hour_histogram").and_then(Value::as_array) {
        for (i, v) in arr.iter().take(24).enumerate() {
            f.hour_histogram[i] = v.as_f64().unwrap_or(0.0) as f32;
        }
    }
    if let Some(arr) = context.get("day_histogram").and_then(Value::as_array) {
        for (i, v) in arr.iter().take(7).enumerate() {
            f.day_histogram[i] = v.as_f64().unwrap_or(0.0) as f32;
        }
    }
    if let Some(line) = context.get("line_type").and_then(Value::as_str) {
        match line.to_ascii_lowercase().as_str() {
            "voip" => {
                f.is_voip = true;
                f.is_mobile = false;
            }
            "landline" => f.is_mobile = false,
            "mobile" => f.is_mobile = true,
            _ => {}
        }
    }

    let haystack = text_of(context);
    f.has_marketing_keywords = MARKETING_KEYWORDS.iter().any(|k| haystack.contains(k));
    f.has_urgent_language = URGENT_KEYWORDS.iter().any(|k| haystack.contains(k));
    f.has_financial_terms = FINANCIAL_KEYWORDS.iter().any(|k| haystack.contains(k));
}

/// Lowercased concatenation of every string value in the context map
/// (one level of arrays included). Keyword scans run against this.
fn text_of(context: &serde_json::Map<String, Value>) -> String {
    let mut out = String::new();
    for v in context.values() {
        match v {
            Value::String(s) => {
                out.push(' ');
                out.push_str(&s.to_ascii_lowercase());
            }
            Value::Array(items) => {
                for item in items {
                    if let Some(s) = item.as_str() {
                        out.push(' ');
                        out.push_str(&s.to_ascii_lowercase());
                    }
                }
            }
            _ => {}
        }
    }
    out
}

fn count_indicators(f: &PhoneFeatures) -> u32 {
    let mut n = 0u32;
    if f.has_repeating_digits {
        n += 1;
    }
    if f.has_sequential_digits {
        n += 1;
    }
    if f.digit_complexity < 0.3 {
        n += 1;
    }
    if f.pattern_score < 0.4 {
        n += 1;
    }
    if f.is_toll_free {
        n += 1;
    }
    if f.is_premium {
        n += 1;
    }
    if f.has_marketing_keywords {
        n += 1;
    }
    if f.has_urgent_language {
        n += 1;
    }
    if f.has_financial_terms {
        n += 1;
    }
    if f.call_frequency > 10.0 {
        n += 1;
    }
    if f.avg_call_duration > 0.0 && f.avg_call_duration < 15.0 {
        n += 1;
    }
    n
}

fn clamp_nonneg(x: f32) -> f32 {
    if x.is_finite() && x > 0.0 {
        x
    } else {
        0.0
    }
}
