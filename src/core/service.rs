//! Top-level service tying the store, queue, backends, and scheduler
//! together. All control surfaces (CLI today) go through this type.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::core::config::EngineConfig;
use crate::core::events::{EventBus, ProgressEvent};
use crate::core::export::{self, ExportFormat};
use crate::core::job::store::{JobStore, JobSummary};
use crate::core::job::{Job, NewJob, Script};
use crate::core::llm::generic_provider::GenericProvider;
use crate::core::llm::registry::ProviderRegistry;
use crate::core::llm::{LlmManager, TokenUsage};
use crate::core::queue::{InvocationQueue, QueueStatus};
use crate::core::scheduler::Scheduler;
use crate::core::scheduler::plans::PhasePlan;

pub struct StudioService {
    manager: Arc<LlmManager>,
    queue: Arc<InvocationQueue>,
    store: Arc<JobStore>,
    scheduler: Scheduler,
}

impl StudioService {
    /// Wire everything up: load the job snapshot, register every backend
    /// whose API key is present in the environment, and start the worker
    /// pool. Backends without keys are skipped with a warning; calls fail
    /// later only if none of the ordered backends is available.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(JobStore::open(&config.data_dir()).await?);

        let registry = ProviderRegistry::load();
        let mut manager = LlmManager::new(config.backend_order.clone(), config.retry.clone());
        manager.set_model_overrides(config.models.clone());
        for def in &registry.providers {
            match std::env::var(&def.env_key) {
                Ok(key) if !key.trim().is_empty() => {
                    manager.register_provider(Arc::new(GenericProvider::new(
                        def.clone(),
                        key,
                        config.request_timeout_secs,
                    )));
                    info!("registered backend {}", def.id);
                }
                _ => warn!("{} is not set, backend {} unavailable", def.env_key, def.id),
            }
        }
        let manager = Arc::new(manager);

        let queue = Arc::new(InvocationQueue::start(
            manager.clone(),
            config.max_concurrent,
        ));
        let scheduler = Scheduler::new(
            store.clone(),
            queue.clone(),
            EventBus::default(),
            config,
        );

        Ok(StudioService {
            manager,
            queue,
            store,
            scheduler,
        })
    }

    pub async fn create_job(&self, params: NewJob) -> Result<Job> {
        self.scheduler
            .plans()
            .get(&params.plan_id)
            .with_context(|| format!("unknown plan {}", params.plan_id))?;
        self.store.create(params).await
    }

    pub async fn generate_scripts(&self, job_id: &str) -> Result<Job> {
        self.scheduler.run_scripts_phase(job_id).await
    }

    pub async fn generate_episode(&self, job_id: &str, episode: u32) -> Result<Job> {
        self.scheduler.run_episode(job_id, episode).await
    }

    pub async fn generate_all_episodes(&self, job_id: &str) -> Result<Job> {
        self.scheduler.run_all_episodes(job_id).await
    }

    pub async fn run_plan(&self, job_id: &str) -> Result<Job> {
        self.scheduler.run_plan(job_id).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.store
            .get(job_id)
            .await
            .with_context(|| format!("no job with id {}", job_id))
    }

    pub async fn list_jobs(&self) -> Vec<JobSummary> {
        self.store.list().await
    }

    /// Replace one episode's script wholesale with the given JSON value.
    /// The episode number comes from the argument; any `episode` in the
    /// patch itself is ignored.
    pub async fn update_script(&self, job_id: &str, episode: u32, mut patch: Value) -> Result<Job> {
        if let Some(map) = patch.as_object_mut() {
            map.insert("episode".to_string(), Value::from(episode));
        }
        let script: Script =
            serde_json::from_value(patch).context("patch is not a valid script")?;
        let job = self.get_job(job_id).await?;
        job.script_for(episode)
            .with_context(|| format!("episode {} has no script to update", episode))?;
        self.store
            .update(job_id, |j| {
                if let Some(slot) = j.scripts.iter_mut().find(|s| s.episode == episode) {
                    *slot = script;
                }
            })
            .await
    }

    pub async fn export_job(&self, job_id: &str, format: ExportFormat) -> Result<String> {
        let job = self.get_job(job_id).await?;
        export::render(&job, format)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProgressEvent> {
        self.scheduler.events().subscribe()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.manager.usage()
    }

    pub fn backends(&self) -> Vec<String> {
        self.manager.provider_ids()
    }

    pub fn plans(&self) -> &[PhasePlan] {
        self.scheduler.plans().list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::NewJob;
    use serde_json::json;

    async fn service_in_tempdir() -> (StudioService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        (StudioService::start(config).await.unwrap(), dir)
    }

    async fn job_with_one_script(service: &StudioService) -> String {
        let job = service
            .create_job(NewJob {
                title: "t".to_string(),
                source_text: "s".to_string(),
                total_episodes: 1,
                minutes_per_episode: 1,
                plan_id: "simple".to_string(),
            })
            .await
            .unwrap();
        service
            .store
            .update(&job.id, |j| {
                j.scripts.push(
                    serde_json::from_value(json!({
                        "episode": 1,
                        "title": "Original",
                        "summary": "Before the edit.",
                        "scenes": [],
                    }))
                    .unwrap(),
                )
            })
            .await
            .unwrap();
        job.id
    }

    #[tokio::test]
    async fn update_script_accepts_a_patch_without_an_episode_field() {
        let (service, _dir) = service_in_tempdir().await;
        let job_id = job_with_one_script(&service).await;

        let updated = service
            .update_script(
                &job_id,
                1,
                json!({"title": "Revised", "summary": "After the edit."}),
            )
            .await
            .unwrap();
        let script = updated.script_for(1).unwrap();
        assert_eq!(script.episode, 1);
        assert_eq!(script.title, "Revised");
        assert_eq!(script.summary, "After the edit.");
    }

    #[tokio::test]
    async fn update_script_ignores_a_conflicting_episode_in_the_patch() {
        let (service, _dir) = service_in_tempdir().await;
        let job_id = job_with_one_script(&service).await;

        let updated = service
            .update_script(
                &job_id,
                1,
                json!({"episode": 7, "title": "Revised", "summary": "x"}),
            )
            .await
            .unwrap();
        assert_eq!(updated.scripts.len(), 1);
        assert_eq!(updated.script_for(1).unwrap().title, "Revised");
    }

    #[tokio::test]
    async fn update_script_rejects_a_missing_episode() {
        let (service, _dir) = service_in_tempdir().await;
        let job_id = job_with_one_script(&service).await;

        let err = service
            .update_script(&job_id, 3, json!({"title": "x", "summary": "y"}))
            .await
            .unwrap_err();
        assert!(format!("{}", err).contains("no script to update"));
    }

    #[tokio::test]
    async fn create_job_rejects_an_unknown_plan() {
        let (service, _dir) = service_in_tempdir().await;
        let err = service
            .create_job(NewJob {
                title: "t".to_string(),
                source_text: "s".to_string(),
                total_episodes: 1,
                minutes_per_episode: 1,
                plan_id: "cinematic".to_string(),
            })
            .await
            .unwrap_err();
        assert!(format!("{}", err).contains("unknown plan"));
    }
}
