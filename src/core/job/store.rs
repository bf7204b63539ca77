//! Persistent job registry with atomic checkpointing.
//!
//! All jobs live in one JSON snapshot on disk. Every mutation goes through
//! [`JobStore::update`], which applies the closure under the write lock and
//! checkpoints before returning, so a crash can lose at most the mutation
//! in flight. The snapshot is written to a temp file and renamed into
//! place; a partially written file never replaces a good one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{Job, JobStatus, NewJob};

const SNAPSHOT_FILE: &str = "projects.json";

/// Lightweight listing row.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub title: String,
    pub status: JobStatus,
    pub total_episodes: u32,
    pub scripts_generated: u32,
    pub total_shots: u32,
}

pub struct JobStore {
    path: PathBuf,
    jobs: RwLock<HashMap<String, Job>>,
}

impl JobStore {
    /// Open the store rooted at `data_dir`, creating the directory and
    /// loading any existing snapshot.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let path = data_dir.join(SNAPSHOT_FILE);
        let jobs: HashMap<String, Job> = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing job snapshot {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        if !jobs.is_empty() {
            info!("loaded {} jobs from {}", jobs.len(), path.display());
        }
        Ok(JobStore {
            path,
            jobs: RwLock::new(jobs),
        })
    }

    pub async fn create(&self, params: NewJob) -> Result<Job> {
        let job = Job::new(params);
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id.clone(), job.clone());
        self.checkpoint(&jobs).await?;
        debug!(job_id = %job.id, "created job");
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<JobSummary> {
        let jobs = self.jobs.read().await;
        let mut rows: Vec<JobSummary> = jobs
            .values()
            .map(|j| JobSummary {
                id: j.id.clone(),
                title: j.title.clone(),
                status: j.status,
                total_episodes: j.total_episodes,
                scripts_generated: j.scripts.len() as u32,
                total_shots: j.all_shots().len() as u32,
            })
            .collect();
        rows.sort_by(|a, b| a.title.cmp(&b.title));
        rows
    }

    /// Apply `mutate` to the job under the write lock and checkpoint the
    /// snapshot before releasing it. Returns the job after mutation.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .with_context(|| format!("no job with id {}", id))?;
        mutate(job);
        let snapshot = job.clone();
        self.checkpoint(&jobs).await?;
        Ok(snapshot)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(id)
            .with_context(|| format!("no job with id {}", id))?;
        self.checkpoint(&jobs).await
    }

    async fn checkpoint(&self, jobs: &HashMap<String, Job>) -> Result<()> {
        let text = serde_json::to_string_pretty(jobs).context("serializing job snapshot")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}
