//! history.rs — bounded in-memory log of recent decisions for diagnostics.
//! Keys are hashed; raw phone numbers never land here.

use std::sync::Mutex;

use crate::decision::{EvaluationResult, Recommendation};
use crate::profile::phone_hash;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub ts_unix: u64,
    pub phone_hash: String,
    pub recommendation: Recommendation,
    pub classification: String,
    pub confidence: f32,
    pub risk_score: f32,
    pub cache_hit: bool,
}

#[derive(Debug)]
pub struct History {
    inner: Mutex<Vec<HistoryEntry>>,
    cap: usize,
}

impl History {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Vec::with_capacity(cap.min(10_000))),
            cap: cap.min(10_000),
        }
    }

    pub fn push(&self, result: &EvaluationResult) {
        let entry = HistoryEntry {
            ts_unix: now_unix(),
            phone_hash: phone_hash(&result.phone),
            recommendation: result.recommendation,
            classification: result.classification.clone(),
            confidence: result.confidence_score,
            risk_score: result.risk_score,
            cache_hit: result.cache_hit,
        };

        let mut v = self.inner.lock().expect("history mutex poisoned");
        v.push(entry);
        if v.len() > self.cap {
            let excess = v.len() - self.cap;
            v.drain(0..excess);
        }
    }

    pub fn snapshot_last_n(&self, n: usize) -> Vec<HistoryEntry> {
        let v = self.inner.lock().expect("history mutex poisoned");
        let len = v.len();
        let start = len.saturating_sub(n);
        v[start..].to_vec()
    }
}

fn now_unix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
