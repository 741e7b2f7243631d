//! Rule storage: built-in global rules, hot-reloaded file rules, per-user
//! rules and rules synthesized from user preferences.
//!
//! The file overlay (`config/rules.json`, a JSON array of rules) is reloaded
//! on mtime change at each read, so operators can ship global rules without
//! a restart. Administrative mutations validate synchronously and are never
//! partially applied.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::RwLock,
    time::SystemTime,
};

use super::{ActionKind, CandidateRule, Operator, Rule, RuleAction, RuleCondition, RuleOrigin};

/// Per-user screening preferences; some become synthesized rules, the
/// manual-approval flag feeds the recommendation mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub allowed_prefixes: Vec<String>,
    pub blocked_prefixes: Vec<String>,
    /// Auto-learn: callers classified legitimate above this confidence get a
    /// temporary allow.
    pub auto_allow_threshold: Option<f32>,
    /// Lifetime of auto-learned temporary allows, in days.
    pub temporary_allow_days: Option<u32>,
    pub require_manual_approval: bool,
}

/// Bulk JSON round-trip shape for export/import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleExport {
    pub global: Vec<Rule>,
    #[serde(default)]
    pub users: BTreeMap<String, Vec<Rule>>,
}

/// Injectable rule storage seam.
pub trait RuleStore: Send + Sync {
    /// Enabled global rules: built-ins plus the hot-reloaded file overlay.
    fn global_rules(&self) -> Vec<Rule>;
    fn user_rules(&self, user_id: &str) -> Vec<Rule>;
    fn add_user_rule(&self, user_id: &str, rule: Rule) -> Result<()>;
    /// Returns true when a rule was actually removed.
    fn remove_user_rule(&self, user_id: &str, rule_id: &str) -> Result<bool>;
    fn preferences(&self, user_id: &str) -> Option<UserPreferences>;
    fn set_preferences(&self, user_id: &str, prefs: UserPreferences);
    fn export(&self) -> RuleExport;
    /// Replace global + per-user sets atomically; rejects invalid input
    /// without applying anything.
    fn import(&self, export: RuleExport) -> Result<()>;
}

/// Assemble and sort the candidate set for one request.
pub fn candidate_rules(store: &dyn RuleStore, user_id: Option<&str>) -> Vec<CandidateRule> {
    let mut out = Vec::new();
    let mut idx = 0usize;
    for rule in store.global_rules() {
        if rule.enabled {
            out.push(CandidateRule {
                rule,
                origin: RuleOrigin::Global,
                insert_idx: idx,
            });
            idx += 1;
        }
    }
    if let Some(user) = user_id {
        for rule in store.user_rules(user) {
            if rule.enabled {
                out.push(CandidateRule {
                    rule,
                    origin: RuleOrigin::User,
                    insert_idx: idx,
                });
                idx += 1;
            }
        }
        if let Some(prefs) = store.preferences(user) {
            for rule in synthesize_preference_rules(&prefs) {
                out.push(CandidateRule {
                    rule,
                    origin: RuleOrigin::Preference,
                    insert_idx: idx,
                });
                idx += 1;
            }
        }
    }
    super::sort_candidates(&mut out);
    out
}

/// Turn user preferences into concrete rules. One rule per prefix keeps the
/// conjunction-only invariant intact.
pub fn synthesize_preference_rules(prefs: &UserPreferences) -> Vec<Rule> {
    let mut out = Vec::new();

    for (i, prefix) in prefs.blocked_prefixes.iter().enumerate() {
        out.push(Rule {
            id: format!("pref-block-{i}"),
            name: format!("Blocked prefix {prefix}"),
            enabled: true,
            priority: 850,
            conditions: vec![RuleCondition {
                field: "phone".into(),
                op: Operator::StartsWith,
                value: json!(prefix),
                case_sensitive: false,
            }],
            action: RuleAction {
                kind: ActionKind::Block,
                confidence: 0.95,
                reason: format!("Caller prefix {prefix} is blocked by user preference"),
                temporary: false,
                duration_secs: None,
            },
        });
    }

    for (i, prefix) in prefs.allowed_prefixes.iter().enumerate() {
        out.push(Rule {
            id: format!("pref-allow-{i}"),
            name: format!("Allowed prefix {prefix}"),
            enabled: true,
            priority: 800,
            conditions: vec![RuleCondition {
                field: "phone".into(),
                op: Operator::StartsWith,
                value: json!(prefix),
                case_sensitive: false,
            }],
            action: RuleAction {
                kind: ActionKind::Allow,
                confidence: 0.95,
                reason: format!("Caller prefix {prefix} is allowed by user preference"),
                temporary: false,
                duration_secs: None,
            },
        });
    }

    if let Some(threshold) = prefs.auto_allow_threshold {
        let days = prefs.temporary_allow_days.unwrap_or(7) as u64;
        out.push(Rule {
            id: "pref-auto-learn".into(),
            name: "Auto-learn confident legitimate callers".into(),
            enabled: true,
            priority: 200,
            conditions: vec![
                RuleCondition {
                    field: "classification".into(),
                    op: Operator::Equals,
                    value: json!("legitimate"),
                    case_sensitive: false,
                },
                RuleCondition {
                    field: "classification_confidence".into(),
                    op: Operator::GreaterThan,
                    value: json!(threshold),
                    case_sensitive: false,
                },
            ],
            action: RuleAction {
                kind: ActionKind::Allow,
                confidence: 0.8,
                reason: "Confidently legitimate caller auto-allowed".into(),
                temporary: true,
                duration_secs: Some(days * 86_400),
            },
        });
    }

    out
}

/// Built-in global rule set. Emergency numbers sit above the short-circuit
/// threshold; the classification-aware rules sit below it so the ensemble
/// has run by the time they are evaluated.
pub fn builtin_global_rules() -> Vec<Rule> {
    vec![
        Rule {
            id: "global-emergency".into(),
            name: "Emergency services".into(),
            enabled: true,
            priority: 1000,
            conditions: vec![RuleCondition {
                field: "phone".into(),
                op: Operator::In,
                value: json!(["911", "112", "999", "988"]),
                case_sensitive: false,
            }],
            action: RuleAction {
                kind: ActionKind::Allow,
                confidence: 1.0,
                reason: "Emergency services number".into(),
                temporary: false,
                duration_secs: None,
            },
        },
        Rule {
            id: "global-spam-confident".into(),
            name: "Block confidently classified spam".into(),
            enabled: true,
            priority: 400,
            conditions: vec![
                RuleCondition {
                    field: "classification".into(),
                    op: Operator::StartsWith,
                    value: json!("spam_"),
                    case_sensitive: false,
                },
                RuleCondition {
                    field: "classification_confidence".into(),
                    op: Operator::GreaterThan,
                    value: json!(0.85),
                    case_sensitive: false,
                },
            ],
            action: RuleAction {
                kind: ActionKind::Block,
                confidence: 0.9,
                reason: "Classifier is highly confident this is spam".into(),
                temporary: false,
                duration_secs: None,
            },
        },
        Rule {
            id: "global-premium-flag".into(),
            name: "Flag premium-rate callers".into(),
            enabled: true,
            priority: 350,
            conditions: vec![RuleCondition {
                field: "features.is_premium".into(),
                op: Operator::Equals,
                value: json!(true),
                case_sensitive: false,
            }],
            action: RuleAction {
                kind: ActionKind::Flag,
                confidence: 0.7,
                reason: "Premium-rate number".into(),
                temporary: false,
                duration_secs: None,
            },
        },
        Rule {
            id: "global-suspicious-analyze".into(),
            name: "Route suspicious callers to analysis".into(),
            enabled: true,
            priority: 300,
            conditions: vec![
                RuleCondition {
                    field: "classification".into(),
                    op: Operator::Equals,
                    value: json!("suspicious"),
                    case_sensitive: false,
                },
                RuleCondition {
                    field: "features.spam_indicator_count".into(),
                    op: Operator::GreaterThan,
                    value: json!(2),
                    case_sensitive: false,
                },
            ],
            action: RuleAction {
                kind: ActionKind::Analyze,
                confidence: 0.6,
                reason: "Multiple spam indicators on a suspicious caller".into(),
                temporary: false,
                duration_secs: None,
            },
        },
    ]
}

fn validate_rule(rule: &Rule) -> Result<()> {
    if rule.id.trim().is_empty() {
        bail!("rule id must not be empty");
    }
    if !(0.0..=1.0).contains(&rule.action.confidence) {
        bail!(
            "rule '{}': action confidence {} outside [0,1]",
            rule.id,
            rule.action.confidence
        );
    }
    if rule.action.temporary && rule.action.duration_secs.is_none() {
        bail!("rule '{}': temporary action needs duration_secs", rule.id);
    }
    Ok(())
}

fn validate_set(rules: &[Rule]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        validate_rule(rule)?;
        if !seen.insert(rule.id.as_str()) {
            bail!("duplicate rule id '{}'", rule.id);
        }
    }
    Ok(())
}

/// Reference in-memory store with built-in globals and a hot-reloaded file
/// overlay.
pub struct InMemoryRuleStore {
    inner: RwLock<Inner>,
    file_rules: HotReloadRules,
}

struct Inner {
    globals: Vec<Rule>,
    users: HashMap<String, Vec<Rule>>,
    prefs: HashMap<String, UserPreferences>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::with_rules_file(None)
    }

    pub fn with_rules_file(path: Option<&Path>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                globals: builtin_global_rules(),
                users: HashMap::new(),
                prefs: HashMap::new(),
            }),
            file_rules: HotReloadRules::new(path),
        }
    }
}

impl Default for InMemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore for InMemoryRuleStore {
    fn global_rules(&self) -> Vec<Rule> {
        let mut out = self
            .inner
            .read()
            .expect("rule store lock poisoned")
            .globals
            .clone();
        out.extend(self.file_rules.current());
        out
    }

    fn user_rules(&self, user_id: &str) -> Vec<Rule> {
        self.inner
            .read()
            .expect("rule store lock poisoned")
            .users
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    fn add_user_rule(&self, user_id: &str, rule: Rule) -> Result<()> {
        validate_rule(&rule)?;
        let mut inner = self.inner.write().expect("rule store lock poisoned");
        let rules = inner.users.entry(user_id.to_string()).or_default();
        if rules.iter().any(|r| r.id == rule.id) {
            bail!("user '{user_id}' already has a rule with id '{}'", rule.id);
        }
        rules.push(rule);
        Ok(())
    }

    fn remove_user_rule(&self, user_id: &str, rule_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().expect("rule store lock poisoned");
        let Some(rules) = inner.users.get_mut(user_id) else {
            return Ok(false);
        };
        let before = rules.len();
        rules.retain(|r| r.id != rule_id);
        Ok(rules.len() != before)
    }

    fn preferences(&self, user_id: &str) -> Option<UserPreferences> {
        self.inner
            .read()
            .expect("rule store lock poisoned")
            .prefs
            .get(user_id)
            .cloned()
    }

    fn set_preferences(&self, user_id: &str, prefs: UserPreferences) {
        self.inner
            .write()
            .expect("rule store lock poisoned")
            .prefs
            .insert(user_id.to_string(), prefs);
    }

    fn export(&self) -> RuleExport {
        let inner = self.inner.read().expect("rule store lock poisoned");
        RuleExport {
            global: inner.globals.clone(),
            users: inner
                .users
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn import(&self, export: RuleExport) -> Result<()> {
        validate_set(&export.global).context("invalid global rule set")?;
        for (user, rules) in &export.users {
            validate_set(rules).with_context(|| format!("invalid rule set for user '{user}'"))?;
        }
        // Validated everything; now swap atomically.
        let mut inner = self.inner.write().expect("rule store lock poisoned");
        inner.globals = export.global;
        inner.users = export.users.into_iter().collect();
        Ok(())
    }
}

/// Hot-reloaded file overlay: a JSON array of rules, reloaded on mtime
/// change at each read.
#[derive(Debug)]
pub struct HotReloadRules {
    path: PathBuf,
    inner: RwLock<FileState>,
}

#[derive(Debug)]
struct FileState {
    rules: Vec<Rule>,
    last_modified: Option<SystemTime>,
}

impl HotReloadRules {
    pub fn new(path: Option<&Path>) -> Self {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("config/rules.json"));
        Self {
            path,
            inner: RwLock::new(FileState {
                rules: Vec::new(),
                last_modified: None,
            }),
        }
    }

    pub fn current(&self) -> Vec<Rule> {
        let needs_reload = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                let guard = self.inner.read().expect("file rules lock poisoned");
                guard.last_modified != Some(mtime)
            }
            Err(_) => false,
        };

        if !needs_reload {
            return self.inner.read().expect("file rules lock poisoned").rules.clone();
        }

        let mut guard = self.inner.write().expect("file rules lock poisoned");
        if let Ok(meta) = fs::metadata(&self.path) {
            if let Ok(mtime) = meta.modified() {
                if guard.last_modified != Some(mtime) {
                    match load_rules_file(&self.path) {
                        Ok(rules) => {
                            guard.rules = rules;
                            guard.last_modified = Some(mtime);
                        }
                        Err(e) => {
                            // Keep the previous set; a broken file must not
                            // drop rules that were live a second ago.
                            tracing::warn!(target: "rules", error = %e, path = %self.path.display(), "rules file reload failed");
                        }
                    }
                }
            }
        }
        guard.rules.clone()
    }
}

pub fn load_rules_file(path: &Path) -> io::Result<Vec<Rule>> {
    let bytes = fs::read(path)?;
    let rules: Vec<Rule> = serde_json::from_slice(&bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    validate_set(&rules).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(rules)
}
