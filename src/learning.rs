//! learning.rs — asynchronous feedback loop.
//!
//! Outcome feedback flows out-of-band into an in-memory queue; a background
//! worker drains it in batches and folds each event into exactly one
//! behavioral/spam profile. Event lifecycle: queued → batched → applied,
//! consumed exactly once, then discarded.
//!
//! Drain triggers: queue depth reaching half the configured maximum, or the
//! timer interval, whichever comes first. Drains are mutually exclusive; a
//! trigger that arrives mid-drain is a no-op and the remaining items wait
//! for the next trigger. This worker is the single writer of profile state,
//! so caller-facing evaluation never races it.

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{self, ResultCache};
use crate::decision::clamp01;
use crate::features::PhoneFeatures;
use crate::profile::{phone_hash, CallObservation, ProfileStore};
use crate::storage::{NewWhitelistEntry, SpamProfile, SpamProfileStore, WhitelistStore};

/// Risk ceiling for a spam profile created from a single report.
const FRESH_PROFILE_RISK_CAP: f32 = 0.8;
/// Per-report risk nudge multiplier.
const RISK_NUDGE: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Accept,
    Reject,
    ManualAdd,
    ManualRemove,
}

impl FeedbackKind {
    /// Negative feedback feeds the spam profile; positive feeds the
    /// behavioral profile (and, for manual adds, the whitelist).
    pub fn is_negative(&self) -> bool {
        matches!(self, FeedbackKind::Reject | FeedbackKind::ManualRemove)
    }
}

/// One unit of feedback describing an observed outcome for a prior decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub phone: String,
    pub kind: FeedbackKind,
    /// Free-form label ("user_rejected", "answered", ...).
    pub feedback: String,
    pub confidence: f32,
    /// Feature snapshot taken at decision time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<PhoneFeatures>,
    #[serde(default)]
    pub context: Value,
    pub ts: DateTime<Utc>,
}

/// Returned by `record_feedback`: did we take the event, and how deep is
/// the queue now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningAcceptance {
    pub accepted: bool,
    pub queue_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

pub struct LearningLoop {
    queue: Mutex<VecDeque<LearningEvent>>,
    drain_gate: tokio::sync::Mutex<()>,
    wakeup: Notify,
    max_queue: usize,
    profiles: Arc<dyn ProfileStore>,
    spam_profiles: Arc<dyn SpamProfileStore>,
    whitelist: Arc<dyn WhitelistStore>,
    cache: Arc<dyn ResultCache>,
}

impl LearningLoop {
    pub fn new(
        max_queue: usize,
        profiles: Arc<dyn ProfileStore>,
        spam_profiles: Arc<dyn SpamProfileStore>,
        whitelist: Arc<dyn WhitelistStore>,
        cache: Arc<dyn ResultCache>,
    ) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            drain_gate: tokio::sync::Mutex::new(()),
            wakeup: Notify::new(),
            max_queue: max_queue.max(2),
            profiles,
            spam_profiles,
            whitelist,
            cache,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().expect("learning queue poisoned").len()
    }

    /// Append an event. The queue is unbounded but monitored: saturation is
    /// reported back to the caller and a drain is nudged early at half the
    /// configured maximum.
    pub fn enqueue(&self, event: LearningEvent) -> LearningAcceptance {
        counter!("learning_events_total", "kind" => kind_label(event.kind)).increment(1);
        let depth = {
            let mut q = self.queue.lock().expect("learning queue poisoned");
            q.push_back(event);
            q.len()
        };
        gauge!("learning_queue_depth").set(depth as f64);

        if depth >= self.max_queue / 2 {
            self.wakeup.notify_one();
        }

        let note = (depth > self.max_queue).then(|| {
            warn!(target: "learning", depth, max = self.max_queue, "learning queue saturated");
            "queue saturated; drain pending".to_string()
        });
        LearningAcceptance {
            accepted: true,
            queue_depth: depth,
            note,
        }
    }

    /// Drain and apply everything queued at the moment the drain starts.
    /// Returns the number of applied events; 0 when another drain holds the
    /// gate (that call's snapshot will pick our items up, or the next
    /// trigger will).
    pub async fn drain(&self) -> usize {
        let Ok(_gate) = self.drain_gate.try_lock() else {
            debug!(target: "learning", "drain already in flight; skipping trigger");
            return 0;
        };

        let batch: Vec<LearningEvent> = {
            let mut q = self.queue.lock().expect("learning queue poisoned");
            q.drain(..).collect()
        };
        gauge!("learning_queue_depth").set(self.queue_depth() as f64);
        if batch.is_empty() {
            return 0;
        }

        let mut applied = 0usize;
        for event in batch {
            if let Err(e) = self.apply(&event).await {
                // The event is still consumed; learning is best-effort.
                warn!(target: "learning", error = %e, kind = kind_label(event.kind), "failed to apply learning event");
            } else {
                applied += 1;
            }
        }
        counter!("learning_drains_total").increment(1);
        counter!("learning_events_applied_total").increment(applied as u64);
        info!(target: "learning", applied, "learning drain finished");
        applied
    }

    /// Fold one event into exactly one profile.
    async fn apply(&self, event: &LearningEvent) -> anyhow::Result<()> {
        let hash = phone_hash(&event.phone);

        if event.kind.is_negative() {
            self.nudge_spam_profile(&hash, event).await?;
        }

        // Every outcome is also a behavioral observation.
        let obs = CallObservation {
            rejected: event.kind.is_negative(),
            connection_failed: event
                .context
                .get("connection_failed")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            duration_secs: event
                .context
                .get("duration_secs")
                .and_then(Value::as_f64)
                .map(|d| d as f32),
            ts: event.ts,
        };
        self.profiles.observe(&hash, obs);

        if event.kind == FeedbackKind::ManualAdd {
            match &event.user_id {
                Some(user) => {
                    self.whitelist
                        .upsert(NewWhitelistEntry {
                            user_id: user.clone(),
                            contact_phone: event.phone.clone(),
                            contact_name: event
                                .context
                                .get("contact_name")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            entry_type: "manual".into(),
                            confidence_score: clamp01(event.confidence),
                            expires_at: None,
                            now: event.ts,
                        })
                        .await?;
                }
                None => warn!(target: "learning", "manual_add without user id; whitelist skipped"),
            }
        }

        // Cached verdicts for this caller are stale now; invalidation is
        // best-effort (the TTL catches anything we miss).
        self.cache.invalidate(&cache::ml_result_key(&hash)).await;
        if let Some(user) = &event.user_id {
            self.cache
                .invalidate(&cache::whitelist_key(user, &event.phone))
                .await;
        }
        Ok(())
    }

    /// Reject-style feedback: bump report count and nudge risk upward by
    /// `confidence × 0.1`. A fresh profile is capped at 0.8; an existing one
    /// may climb to 1.0.
    async fn nudge_spam_profile(&self, hash: &str, event: &LearningEvent) -> anyhow::Result<()> {
        let conf = clamp01(event.confidence);
        let updated = match self.spam_profiles.get(hash).await? {
            Some(mut p) => {
                p.total_reports += 1;
                p.risk_score = (p.risk_score + conf * RISK_NUDGE).min(1.0);
                p.confidence_level = clamp01(0.7 * p.confidence_level + 0.3 * conf);
                p.last_reported = event.ts;
                if p.feature_vector.is_none() {
                    p.feature_vector = event
                        .features
                        .as_ref()
                        .and_then(|f| serde_json::to_value(f).ok());
                }
                p
            }
            None => SpamProfile {
                phone_hash: hash.to_string(),
                spam_category: if event.feedback.is_empty() {
                    "user_reported".to_string()
                } else {
                    event.feedback.clone()
                },
                risk_score: conf.min(FRESH_PROFILE_RISK_CAP),
                confidence_level: conf,
                feature_vector: event
                    .features
                    .as_ref()
                    .and_then(|f| serde_json::to_value(f).ok()),
                total_reports: 1,
                first_reported: event.ts,
                last_reported: event.ts,
            },
        };
        self.spam_profiles.upsert(updated).await
    }

    /// Spawn the drain worker: wakes on the timer interval or on a
    /// half-full queue nudge, whichever comes first.
    pub fn spawn_worker(self: &Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            // The first tick fires immediately; consume it so the loop
            // settles into the configured cadence.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.wakeup.notified() => {}
                }
                let _ = this.drain().await;
            }
        })
    }
}

fn kind_label(kind: FeedbackKind) -> &'static str {
    match kind {
        FeedbackKind::Accept => "accept",
        FeedbackKind::Reject => "reject",
        FeedbackKind::ManualAdd => "manual_add",
        FeedbackKind::ManualRemove => "manual_remove",
    }
}

/// Spawn the whitelist expiry sweep: fixed interval, best-effort (failures
/// are logged and retried on the next tick, never immediately).
pub fn spawn_expiry_sweep(
    whitelist: Arc<dyn WhitelistStore>,
    interval_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match whitelist.expire_due(Utc::now()).await {
                Ok(swept) => {
                    counter!("whitelist_expired_total").increment(swept as u64);
                    if swept > 0 {
                        info!(target: "learning", swept, "expired whitelist entries");
                    }
                }
                Err(e) => warn!(target: "learning", error = %e, "expiry sweep failed"),
            }
        }
    })
}
