//! config.rs — engine configuration.
//!
//! Two layers:
//! - `EngineConfig`: thresholds, timeouts and queue sizing from
//!   `config/engine.toml` (path overridable via `ENGINE_CONFIG_PATH`),
//!   every field individually defaulted so a missing file still boots.
//! - `FusionWeights`: the static ensemble weights, hot-reloaded from
//!   `config/weights.json` on mtime change at each `current()` call.

use serde::Deserialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::RwLock,
    time::SystemTime,
};

pub const DEFAULT_ENGINE_CONFIG_PATH: &str = "config/engine.toml";
pub const ENV_ENGINE_CONFIG_PATH: &str = "ENGINE_CONFIG_PATH";

/// Static tuning knobs for the decision pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rules above this priority short-circuit the pipeline pre-ensemble.
    pub high_priority_threshold: i32,
    /// Fusion score above this is classified spam.
    pub spam_threshold: f32,
    /// Per-scorer wall clock budget.
    pub scorer_timeout_ms: u64,
    /// Budget for a cache read; timeout reads as a miss.
    pub cache_read_timeout_ms: u64,
    /// Budget for a storage collaborator read on the hot path.
    pub store_read_timeout_ms: u64,
    pub features_ttl_secs: u64,
    pub ml_result_ttl_secs: u64,
    /// Learning queue bound; a drain triggers at half of this.
    pub max_queue_size: usize,
    pub drain_interval_secs: u64,
    pub sweep_interval_secs: u64,
    /// Global default for the manual-approval policy; user preferences
    /// override per user.
    pub require_manual_approval: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            high_priority_threshold: 500,
            spam_threshold: 0.6,
            scorer_timeout_ms: 50,
            cache_read_timeout_ms: 25,
            store_read_timeout_ms: 50,
            features_ttl_secs: 600,
            ml_result_ttl_secs: 300,
            max_queue_size: 1000,
            drain_interval_secs: 30,
            sweep_interval_secs: 300,
            require_manual_approval: false,
        }
    }
}

impl EngineConfig {
    /// Load from `ENGINE_CONFIG_PATH` (or the default path). A missing or
    /// unreadable file yields the defaults; a present-but-invalid file is a
    /// hard error so typos do not silently revert tuning.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(ENV_ENGINE_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_ENGINE_CONFIG_PATH));
        match fs::read_to_string(&path) {
            Ok(raw) => {
                let cfg: EngineConfig = toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid {}: {e}", path.display()))?;
                Ok(cfg)
            }
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Static fusion weights for the four ensemble scorers. Renormalization over
/// the scorers that actually ran happens at fusion time.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct FusionWeights {
    pub pattern: f32,
    pub contextual: f32,
    pub temporal: f32,
    pub behavioral: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            pattern: 0.4,
            contextual: 0.3,
            temporal: 0.2,
            behavioral: 0.1,
        }
    }
}

/// Hot-reload wrapper: reloads when the config file mtime changes.
#[derive(Debug)]
pub struct HotReloadWeights {
    path: PathBuf,
    inner: RwLock<State>,
}

#[derive(Debug)]
struct State {
    weights: FusionWeights,
    last_modified: Option<SystemTime>,
}

impl HotReloadWeights {
    /// Create with a path (defaults to "config/weights.json" if `None`).
    pub fn new(path: Option<&Path>) -> Self {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("config/weights.json"));
        Self {
            path,
            inner: RwLock::new(State {
                weights: FusionWeights::default(),
                last_modified: None,
            }),
        }
    }

    /// Get the latest weights, reloading if the config file changed.
    pub fn current(&self) -> FusionWeights {
        // Fast path: check metadata without grabbing the write lock yet.
        let needs_reload = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                let guard = self.inner.read().expect("weights lock poisoned");
                guard.last_modified != Some(mtime)
            }
            // If the file isn't there, keep defaults; no reload.
            Err(_) => false,
        };

        if !needs_reload {
            return self.inner.read().expect("weights lock poisoned").weights;
        }

        // Slow path: reload under the write lock, double-checking for races.
        let mut guard = self.inner.write().expect("weights lock poisoned");
        if let Ok(meta) = fs::metadata(&self.path) {
            if let Ok(mtime) = meta.modified() {
                if guard.last_modified != Some(mtime) {
                    if let Ok(w) = load_weights_file(&self.path) {
                        guard.weights = w;
                        guard.last_modified = Some(mtime);
                    }
                }
            }
        }
        guard.weights
    }
}

/// Load weights directly (no caching). Public for tests/tools.
pub fn load_weights_file(path: &Path) -> io::Result<FusionWeights> {
    let bytes = fs::read(path)?;
    let w: FusionWeights = serde_json::from_slice(&bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::{thread, time::Duration};

    fn unique_tmp_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        dir.push(format!("engine_cfg_test_{}", nanos));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.high_priority_threshold, 500);
        assert!((cfg.spam_threshold - 0.6).abs() < f32::EPSILON);
        assert!(cfg.max_queue_size >= 2);
    }

    #[test]
    fn default_weights_sum_to_one() {
        let w = FusionWeights::default();
        let sum = w.pattern + w.contextual + w.temporal + w.behavioral;
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn loads_and_hot_reloads() {
        let tmpdir = unique_tmp_dir();
        let path = tmpdir.join("weights.json");

        {
            let mut f = fs::File::create(&path).unwrap();
            write!(
                f,
                r#"{{"pattern":0.5,"contextual":0.2,"temporal":0.2,"behavioral":0.1}}"#
            )
            .unwrap();
            f.sync_all().unwrap();
        }

        let hot = HotReloadWeights::new(Some(&path));
        let w1 = hot.current();
        assert!((w1.pattern - 0.5).abs() < f32::EPSILON);

        // Ensure a different mtime (filesystem granularity can be coarse).
        thread::sleep(Duration::from_millis(1100));

        {
            let mut f = fs::File::create(&path).unwrap();
            write!(
                f,
                r#"{{"pattern":0.25,"contextual":0.25,"temporal":0.25,"behavioral":0.25}}"#
            )
            .unwrap();
            f.sync_all().unwrap();
        }

        let w2 = hot.current();
        assert!((w2.pattern - 0.25).abs() < f32::EPSILON);

        let _ = fs::remove_file(&path);
        let _ = fs::remove_dir_all(&tmpdir);
    }
}
