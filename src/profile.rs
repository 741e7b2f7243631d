//! profile.rs — per-caller behavioral profiles keyed by a salted phone hash.
//!
//! Profiles aggregate call statistics as running means over `total_calls`.
//! The raw phone number is never stored or logged; every key is
//! `phone_hash(..)` output. The learning worker is the only writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::decision::clamp01;

pub const ENV_PHONE_HASH_SALT: &str = "PHONE_HASH_SALT";
const DEV_SALT: &str = "caller-admission-dev-salt";

/// Salted SHA-256 of a phone number, shortened to 16 hex chars.
/// Short enough for log lines, long enough to avoid accidental collisions.
pub fn phone_hash(phone: &str) -> String {
    use sha2::{Digest, Sha256};
    let salt = std::env::var(ENV_PHONE_HASH_SALT).unwrap_or_else(|_| DEV_SALT.to_string());
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(phone.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Aggregate call statistics for one (hashed) phone number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralProfile {
    pub phone_hash: String,
    pub total_calls: u64,
    pub avg_call_duration: f32,
    pub rejection_rate: f32,
    pub connection_failure_rate: f32,
    /// Calls per hour, exponentially smoothed.
    pub call_velocity: f32,
    pub risk_score: f32,
    pub last_updated: DateTime<Utc>,
}

/// One observed call outcome folded into a profile.
#[derive(Debug, Clone, Copy)]
pub struct CallObservation {
    pub rejected: bool,
    pub connection_failed: bool,
    pub duration_secs: Option<f32>,
    pub ts: DateTime<Utc>,
}

impl BehavioralProfile {
    pub fn new(phone_hash: impl Into<String>, ts: DateTime<Utc>) -> Self {
        Self {
            phone_hash: phone_hash.into(),
            total_calls: 0,
            avg_call_duration: 0.0,
            rejection_rate: 0.0,
            connection_failure_rate: 0.0,
            call_velocity: 0.0,
            risk_score: 0.0,
            last_updated: ts,
        }
    }

    /// Fold one observation in as an incremental running mean.
    pub fn observe(&mut self, obs: CallObservation) {
        let n = self.total_calls as f32;
        let m = n + 1.0;

        self.rejection_rate = (self.rejection_rate * n + bool_f(obs.rejected)) / m;
        self.connection_failure_rate =
            (self.connection_failure_rate * n + bool_f(obs.connection_failed)) / m;
        if let Some(d) = obs.duration_secs {
            self.avg_call_duration = (self.avg_call_duration * n + d.max(0.0)) / m;
        }

        // Velocity: smoothed instantaneous call rate (per hour), capped.
        if self.total_calls > 0 {
            let gap = (obs.ts - self.last_updated).num_seconds().max(1) as f32;
            let instantaneous = (3600.0 / gap).min(100.0);
            self.call_velocity = (0.7 * self.call_velocity + 0.3 * instantaneous).min(100.0);
        }

        self.total_calls += 1;
        self.last_updated = obs.ts;
        self.risk_score = self.derived_risk();
    }

    fn derived_risk(&self) -> f32 {
        let short_calls = if self.avg_call_duration > 0.0 && self.avg_call_duration < 15.0 {
            1.0
        } else {
            0.0
        };
        clamp01(
            0.4 * self.rejection_rate
                + 0.3 * clamp01(self.call_velocity / 10.0)
                + 0.2 * self.connection_failure_rate
                + 0.1 * short_calls,
        )
    }
}

fn bool_f(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Injectable profile storage seam (kept in-process; durable persistence
/// belongs to the external storage collaborator).
pub trait ProfileStore: Send + Sync {
    fn get(&self, phone_hash: &str) -> Option<BehavioralProfile>;
    /// Fold an observation into the profile, creating it on first sight.
    /// Returns the post-update snapshot.
    fn observe(&self, phone_hash: &str, obs: CallObservation) -> BehavioralProfile;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reference in-memory store.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    inner: RwLock<HashMap<String, BehavioralProfile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn get(&self, phone_hash: &str) -> Option<BehavioralProfile> {
        self.inner
            .read()
            .expect("profile store lock poisoned")
            .get(phone_hash)
            .cloned()
    }

    fn observe(&self, phone_hash: &str, obs: CallObservation) -> BehavioralProfile {
        let mut map = self.inner.write().expect("profile store lock poisoned");
        let profile = map
            .entry(phone_hash.to_string())
            .or_insert_with(|| BehavioralProfile::new(phone_hash, obs.ts));
        profile.observe(obs);
        profile.clone()
    }

    fn len(&self) -> usize {
        self.inner.read().expect("profile store lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_772_000_000 + secs, 0).single().unwrap()
    }

    #[test]
    fn hash_is_stable_and_not_the_raw_number() {
        let a = phone_hash("+15551234567");
        let b = phone_hash("+15551234567");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, phone_hash("+15551234568"));
    }

    #[test]
    fn running_means_track_rejections() {
        let store = InMemoryProfileStore::new();
        let obs = |rejected, secs| CallObservation {
            rejected,
            connection_failed: false,
            duration_secs: Some(30.0),
            ts: at(secs),
        };

        store.observe("h1", obs(true, 0));
        store.observe("h1", obs(true, 600));
        let p = store.observe("h1", obs(false, 1200));

        assert_eq!(p.total_calls, 3);
        assert!((p.rejection_rate - 2.0 / 3.0).abs() < 1e-6);
        assert!((p.avg_call_duration - 30.0).abs() < 1e-4);
    }

    #[test]
    fn rapid_calls_raise_velocity_and_risk() {
        let store = InMemoryProfileStore::new();
        for i in 0..6 {
            store.observe(
                "h2",
                CallObservation {
                    rejected: true,
                    connection_failed: false,
                    duration_secs: Some(5.0),
                    ts: at(i * 60), // one call per minute
                },
            );
        }
        let last = store.get("h2").unwrap();
        assert!(last.call_velocity > 5.0, "velocity {}", last.call_velocity);
        assert!(last.risk_score > 0.5, "risk {}", last.risk_score);
        assert!(last.risk_score <= 1.0);
    }

    #[test]
    fn profile_created_on_first_observation() {
        let store = InMemoryProfileStore::new();
        assert!(store.get("fresh").is_none());
        store.observe(
            "fresh",
            CallObservation {
                rejected: false,
                connection_failed: false,
                duration_secs: None,
                ts: at(0),
            },
        );
        assert_eq!(store.get("fresh").unwrap().total_calls, 1);
    }
}
