use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::llm::retry::RetryPolicy;

/// Engine tunables. Everything here can be overridden from the TOML config
/// file; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Process-wide cap on in-flight backend invocations.
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
    /// Per-request timeout applied at the HTTP client.
    pub request_timeout_secs: u64,
    /// Backend ids in failover priority order.
    pub backend_order: Vec<String>,
    /// Per-backend model override, keyed by backend id.
    pub models: HashMap<String, String>,
    /// Episodes requested per scripts-phase invocation.
    pub scripts_per_batch: u32,
    pub shots_per_minute: u32,
    /// Shots requested per storyboard invocation.
    pub shots_per_call: u32,
    /// Shots per invocation in per-shot enrichment phases.
    pub shot_batch_size: usize,
    /// Re-invocations of a unit that parsed to zero records, on top of the
    /// invocation layer's own retries.
    pub unit_max_retries: u32,
    pub call_pause_ms: u64,
    pub episode_pause_ms: u64,
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            retry: RetryPolicy::default(),
            request_timeout_secs: 120,
            backend_order: vec!["deepseek".to_string(), "openrouter".to_string()],
            models: HashMap::new(),
            scripts_per_batch: 10,
            shots_per_minute: 10,
            shots_per_call: 25,
            shot_batch_size: 10,
            unit_max_retries: 2,
            call_pause_ms: 300,
            episode_pause_ms: 500,
            data_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".showrunner")
            .join("config.toml")
    }

    /// Load from `path` (or the default location). A missing file is not an
    /// error; it just means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(cfg)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".showrunner")
        })
    }

    pub fn shots_per_episode(&self, minutes_per_episode: u32) -> u32 {
        (minutes_per_episode * self.shots_per_minute).max(1)
    }
}
