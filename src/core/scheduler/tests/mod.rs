//! Scheduler tests run against a scripted in-memory backend; nothing here
//! touches the network.

mod resume;

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::config::EngineConfig;
use crate::core::events::EventBus;
use crate::core::job::NewJob;
use crate::core::job::store::JobStore;
use crate::core::llm::{GenerateOutput, GenerateRequest, TokenUsage};
use crate::core::queue::{InvocationQueue, Invoker};
use crate::core::scheduler::Scheduler;

/// Fake backend that fabricates well-formed replies from the request
/// label, optionally failing specific episodes.
pub(super) struct ScriptedInvoker {
    pub fail_episodes: Vec<u32>,
    pub fail_labels: Vec<String>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        ScriptedInvoker {
            fail_episodes: Vec::new(),
            fail_labels: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(episodes: &[u32]) -> Self {
        ScriptedInvoker {
            fail_episodes: episodes.to_vec(),
            ..Self::new()
        }
    }

    /// Fail every request whose label starts with one of the prefixes.
    pub fn failing_labels(prefixes: &[&str]) -> Self {
        ScriptedInvoker {
            fail_labels: prefixes.iter().map(|p| p.to_string()).collect(),
            ..Self::new()
        }
    }

    pub async fn labels(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

fn ok(text: String) -> Result<GenerateOutput> {
    Ok(GenerateOutput {
        text,
        usage: TokenUsage::default(),
        reasoning: None,
    })
}

#[async_trait]
impl Invoker for ScriptedInvoker {
    async fn invoke(&self, request: GenerateRequest) -> Result<GenerateOutput> {
        self.calls.lock().await.push(request.label.clone());

        if self
            .fail_labels
            .iter()
            .any(|p| request.label.starts_with(p.as_str()))
        {
            bail!("backend refused {}", request.label);
        }

        if let Some(range) = request.label.strip_prefix("scripts ") {
            // "1-10 of 25"
            let range = range.split(' ').next().unwrap_or_default();
            let (start, end) = parse_range(range);
            let scripts: Vec<serde_json::Value> = (start..=end)
                .map(|e| {
                    serde_json::json!({
                        "episode": e,
                        "title": format!("Episode {}", e),
                        "summary": format!("Things escalate in episode {}.", e),
                        "scenes": [format!("Scene one of episode {}", e)],
                    })
                })
                .collect();
            return ok(serde_json::to_string(&scripts).unwrap());
        }

        if let Some(rest) = request.label.strip_prefix("episode ") {
            // "3 shots 1-25"
            let mut parts = rest.split(' ');
            let episode: u32 = parts.next().unwrap_or_default().parse().unwrap_or(0);
            if self.fail_episodes.contains(&episode) {
                bail!("backend refused episode {}", episode);
            }
            let range = parts.nth(1).unwrap_or_default();
            let (start, end) = parse_range(range);
            let shots: Vec<serde_json::Value> = (start..=end)
                .map(|s| {
                    serde_json::json!({
                        "shot_id": format!("E{:03}_S{:03}", episode, s),
                        "description": format!("Episode {} beat {}", episode, s),
                        "image_prompt": format!("frame {} of episode {}", s, episode),
                    })
                })
                .collect();
            return ok(serde_json::to_string(&shots).unwrap());
        }

        ok(format!("freeform output for {}", request.label))
    }
}

fn parse_range(range: &str) -> (u32, u32) {
    let mut it = range.split('-');
    let start = it.next().unwrap_or("1").parse().unwrap_or(1);
    let end = it.next().unwrap_or("1").parse().unwrap_or(start);
    (start, end)
}

/// Config with pacing disabled and two shots per episode.
pub(super) fn test_config() -> EngineConfig {
    EngineConfig {
        call_pause_ms: 0,
        episode_pause_ms: 0,
        unit_max_retries: 0,
        shots_per_minute: 2,
        ..EngineConfig::default()
    }
}

pub(super) struct Harness {
    pub scheduler: Scheduler,
    pub store: Arc<JobStore>,
    _dir: tempfile::TempDir,
}

pub(super) async fn harness(invoker: Arc<dyn Invoker>, config: EngineConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JobStore::open(dir.path()).await.unwrap());
    let queue = Arc::new(InvocationQueue::start(invoker, config.max_concurrent));
    let scheduler = Scheduler::new(store.clone(), queue, EventBus::default(), config);
    Harness {
        scheduler,
        store,
        _dir: dir,
    }
}

pub(super) fn job_params(episodes: u32) -> NewJob {
    NewJob {
        title: "The Hollow Lighthouse".to_string(),
        source_text: "A keeper discovers the lamp has been lit from inside for years."
            .to_string(),
        total_episodes: episodes,
        minutes_per_episode: 1,
        plan_id: "simple".to_string(),
    }
}
