//! storage.rs — external storage collaborator, specified at the interface.
//!
//! Durable persistence of whitelist entries and spam profiles lives outside
//! this crate (a relational store). The engine talks to it through these
//! traits and never embeds SQL semantics; the in-memory implementations
//! below are the reference wiring used by the binary and the tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::decision::clamp01;

/// One user-scoped whitelist entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub id: u64,
    pub user_id: String,
    pub contact_phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    /// "manual" | "auto_learned" | "temporary"
    pub entry_type: String,
    pub confidence_score: f32,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WhitelistEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

/// Persisted risk record for a phone number, accumulated from reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamProfile {
    pub phone_hash: String,
    pub spam_category: String,
    pub risk_score: f32,
    pub confidence_level: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_vector: Option<serde_json::Value>,
    pub total_reports: u64,
    pub first_reported: DateTime<Utc>,
    pub last_reported: DateTime<Utc>,
}

#[async_trait]
pub trait WhitelistStore: Send + Sync {
    async fn find(&self, user_id: &str, phone: &str) -> Result<Option<WhitelistEntry>>;
    /// Insert or replace the entry for (user, phone). Returns the stored row.
    async fn upsert(&self, entry: NewWhitelistEntry) -> Result<WhitelistEntry>;
    /// Bump the hit counter, best-effort bookkeeping on a whitelist match.
    async fn record_hit(&self, user_id: &str, phone: &str) -> Result<()>;
    /// Deactivate entries whose expiry has passed. Returns how many were swept.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Insert shape; the store assigns id/counters/timestamps.
#[derive(Debug, Clone)]
pub struct NewWhitelistEntry {
    pub user_id: String,
    pub contact_phone: String,
    pub contact_name: Option<String>,
    pub entry_type: String,
    pub confidence_score: f32,
    pub expires_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait SpamProfileStore: Send + Sync {
    async fn get(&self, phone_hash: &str) -> Result<Option<SpamProfile>>;
    async fn upsert(&self, profile: SpamProfile) -> Result<()>;
}

// --- reference in-memory implementations ---

#[derive(Debug, Default)]
pub struct InMemoryWhitelistStore {
    inner: RwLock<HashMap<(String, String), WhitelistEntry>>,
    next_id: AtomicU64,
}

impl InMemoryWhitelistStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl WhitelistStore for InMemoryWhitelistStore {
    async fn find(&self, user_id: &str, phone: &str) -> Result<Option<WhitelistEntry>> {
        let map = self.inner.read().expect("whitelist lock poisoned");
        Ok(map.get(&(user_id.to_string(), phone.to_string())).cloned())
    }

    async fn upsert(&self, new: NewWhitelistEntry) -> Result<WhitelistEntry> {
        if new.contact_phone.trim().is_empty() {
            bail!("whitelist entry needs a phone number");
        }
        let mut map = self.inner.write().expect("whitelist lock poisoned");
        let key = (new.user_id.clone(), new.contact_phone.clone());
        let entry = match map.get(&key) {
            Some(existing) => WhitelistEntry {
                contact_name: new.contact_name.or_else(|| existing.contact_name.clone()),
                entry_type: new.entry_type,
                confidence_score: clamp01(new.confidence_score),
                is_active: true,
                expires_at: new.expires_at,
                updated_at: new.now,
                ..existing.clone()
            },
            None => WhitelistEntry {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                user_id: new.user_id,
                contact_phone: new.contact_phone,
                contact_name: new.contact_name,
                entry_type: new.entry_type,
                confidence_score: clamp01(new.confidence_score),
                is_active: true,
                expires_at: new.expires_at,
                hit_count: 0,
                created_at: new.now,
                updated_at: new.now,
            },
        };
        map.insert(key, entry.clone());
        Ok(entry)
    }

    async fn record_hit(&self, user_id: &str, phone: &str) -> Result<()> {
        let mut map = self.inner.write().expect("whitelist lock poisoned");
        if let Some(e) = map.get_mut(&(user_id.to_string(), phone.to_string())) {
            e.hit_count += 1;
        }
        Ok(())
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut map = self.inner.write().expect("whitelist lock poisoned");
        let mut swept = 0usize;
        for e in map.values_mut() {
            if e.is_active && e.expires_at.is_some_and(|x| x <= now) {
                e.is_active = false;
                e.updated_at = now;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[derive(Debug, Default)]
pub struct InMemorySpamProfileStore {
    inner: RwLock<HashMap<String, SpamProfile>>,
}

impl InMemorySpamProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SpamProfileStore for InMemorySpamProfileStore {
    async fn get(&self, phone_hash: &str) -> Result<Option<SpamProfile>> {
        let map = self.inner.read().expect("spam profile lock poisoned");
        Ok(map.get(phone_hash).cloned())
    }

    async fn upsert(&self, profile: SpamProfile) -> Result<()> {
        let mut map = self.inner.write().expect("spam profile lock poisoned");
        map.insert(profile.phone_hash.clone(), profile);
        Ok(())
    }
}
