//! Phase scheduling: turning a job's plan into queued backend invocations.
//!
//! Failure policy is best-effort per unit: a batch or episode that keeps
//! failing gets an error record and its siblings continue. Only total
//! failure of a mandatory phase marks the job `Error`.

pub mod plans;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::core::config::EngineConfig;
use crate::core::events::{EventBus, ProgressEvent};
use crate::core::job::store::JobStore;
use crate::core::job::{Job, JobStatus, Script, Shot, format_shot_id};
use crate::core::llm::GenerateRequest;
use crate::core::parser;
use crate::core::queue::InvocationQueue;
use plans::{Granularity, Phase, PlanRegistry};

/// Global outputs always fed into downstream prompts when present.
const ALWAYS_FED: &[&str] = &["concept", "characters", "artstyle"];

const SHOT_REQUIRED: &[&str] = &["shot_id", "description", "image_prompt"];
const SCRIPT_REQUIRED: &[&str] = &["title", "summary"];

pub struct Scheduler {
    store: Arc<JobStore>,
    queue: Arc<InvocationQueue>,
    events: EventBus,
    config: EngineConfig,
    plans: PlanRegistry,
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<InvocationQueue>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Scheduler {
            store,
            queue,
            events,
            config,
            plans: PlanRegistry::with_defaults(),
        }
    }

    pub fn plans(&self) -> &PlanRegistry {
        &self.plans
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    async fn load_job(&self, job_id: &str) -> Result<Job> {
        self.store
            .get(job_id)
            .await
            .with_context(|| format!("no job with id {}", job_id))
    }

    async fn set_status(&self, job_id: &str, next: JobStatus) -> Result<Job> {
        let job = self.load_job(job_id).await?;
        if !job.status.can_transition(next) {
            bail!("job {} cannot go from {} to {}", job_id, job.status, next);
        }
        self.store.update(job_id, |j| j.status = next).await
    }

    /// Run the job's full phase plan in order.
    pub async fn run_plan(&self, job_id: &str) -> Result<Job> {
        let job = self.load_job(job_id).await?;
        let plan = self
            .plans
            .get(&job.plan_id)
            .with_context(|| format!("unknown plan {}", job.plan_id))?
            .clone();
        info!(job_id, plan = %plan.plan_id, "running plan");
        let total = plan.phases.len();
        for (index, phase) in plan.phases.iter().enumerate() {
            self.events.emit(ProgressEvent::PhaseStarted {
                job_id: job_id.to_string(),
                phase: phase.output.clone(),
                index,
                total,
            });
            let result = self.run_phase(job_id, phase).await;
            match result {
                Ok(()) => {
                    self.events.emit(ProgressEvent::PhaseCompleted {
                        job_id: job_id.to_string(),
                        phase: phase.output.clone(),
                    });
                }
                // Scripts and storyboard manage their own Error state and
                // nothing downstream can run without them.
                Err(e) if matches!(phase.output.as_str(), "scripts" | "storyboard") => {
                    return Err(e.context(format!("phase {} failed", phase.output)));
                }
                Err(e) if phase.optional => {
                    warn!(job_id, phase = %phase.output, "optional phase skipped: {}", e);
                    self.store
                        .update(job_id, |j| {
                            j.record_error(&phase.output, None, None, format!("{}", e))
                        })
                        .await?;
                }
                Err(e) => {
                    warn!(job_id, phase = %phase.output, "phase failed, moving on: {}", e);
                    self.events.emit(ProgressEvent::UnitFailed {
                        job_id: job_id.to_string(),
                        phase: phase.output.clone(),
                        episode: None,
                        message: format!("{}", e),
                    });
                    self.store
                        .update(job_id, |j| {
                            j.record_error(&phase.output, None, None, format!("{}", e))
                        })
                        .await?;
                }
            }
        }
        let job = self.load_job(job_id).await?;
        self.events.emit(ProgressEvent::JobCompleted {
            job_id: job_id.to_string(),
            status: job.status.as_str().to_string(),
            total_shots: job.all_shots().len(),
        });
        Ok(job)
    }

    async fn run_phase(&self, job_id: &str, phase: &Phase) -> Result<()> {
        match (phase.output.as_str(), phase.granularity) {
            ("scripts", _) => self.run_scripts_phase(job_id).await.map(|_| ()),
            ("storyboard", _) => self.run_all_episodes(job_id).await.map(|_| ()),
            (_, Granularity::Global) => self.run_global_phase(job_id, phase).await,
            (_, Granularity::PerShot) => self.run_per_shot_phase(job_id, phase).await,
            (_, Granularity::PerEpisode) => {
                bail!("per-episode granularity is only defined for the storyboard phase")
            }
        }
    }

    /// Scripts phase: batched episode generation with a rolling
    /// previously-on context. Total failure of every batch marks the job
    /// `Error`; anything else ends `ScriptsReady`.
    pub async fn run_scripts_phase(&self, job_id: &str) -> Result<Job> {
        let job = self.set_status(job_id, JobStatus::ScriptsGenerating).await?;
        let batch_size = self.config.scripts_per_batch.max(1);
        let total = job.total_episodes;
        let mut accepted: Vec<Script> = Vec::new();

        let mut start = 1u32;
        let mut batch_index = 0u32;
        while start <= total {
            let end = (start + batch_size - 1).min(total);
            self.events.emit(ProgressEvent::BatchProgress {
                job_id: job_id.to_string(),
                phase: "scripts".to_string(),
                current: end as usize,
                total: total as usize,
            });
            let previously = previously_on(&accepted);
            let request = GenerateRequest {
                label: format!("scripts {}-{} of {}", start, end, total),
                system: scripts_system_prompt(),
                user: scripts_user_prompt(&job, start, end, &previously),
                model: None,
            };
            match self.invoke_until_parsed(&request, SCRIPT_REQUIRED).await {
                Some(records) => {
                    accepted.extend(scripts_from_records(records, start, end));
                }
                None => {
                    warn!(job_id, "scripts batch {}-{} produced nothing", start, end);
                    self.store
                        .update(job_id, |j| {
                            j.record_error(
                                "scripts",
                                None,
                                Some(batch_index),
                                format!("batch {}-{} yielded no scripts", start, end),
                            )
                        })
                        .await?;
                }
            }
            start = end + 1;
            batch_index += 1;
            if start <= total {
                tokio::time::sleep(Duration::from_millis(self.config.call_pause_ms)).await;
            }
        }

        if accepted.is_empty() {
            self.store
                .update(job_id, |j| j.status = JobStatus::Error)
                .await?;
            bail!("scripts generation produced no episodes for job {}", job_id);
        }
        let count = accepted.len() as u32;
        let job = self
            .store
            .update(job_id, |j| {
                j.scripts = accepted;
                j.status = JobStatus::ScriptsReady;
                j.timing.scripts_ready_at = Some(Utc::now());
                j.progress.scripts_generated = count;
            })
            .await?;
        info!(job_id, episodes = count, "scripts ready");
        Ok(job)
    }

    /// Generate one episode's shot list, replacing whatever was stored.
    pub async fn run_episode(&self, job_id: &str, episode: u32) -> Result<Job> {
        self.set_status(job_id, JobStatus::StoryboardGenerating)
            .await?;
        if let Err(e) = self.generate_episode_shots(job_id, episode).await {
            self.store
                .update(job_id, |j| j.status = JobStatus::Error)
                .await?;
            return Err(e);
        }
        self.finish_storyboards(job_id).await
    }

    /// Generate shots for every episode, skipping those that already have a
    /// non-empty shot list.
    pub async fn run_all_episodes(&self, job_id: &str) -> Result<Job> {
        let job = self.set_status(job_id, JobStatus::StoryboardGenerating).await?;
        let total = job.total_episodes;
        let mut attempted = 0u32;
        let mut succeeded = 0u32;
        for episode in 1..=total {
            if self.load_job(job_id).await?.episode_done(episode) {
                info!(job_id, episode, "episode already has shots, skipping");
                continue;
            }
            attempted += 1;
            self.events.emit(ProgressEvent::EpisodeProgress {
                job_id: job_id.to_string(),
                phase: "storyboard".to_string(),
                episode,
                total,
            });
            match self.generate_episode_shots(job_id, episode).await {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    warn!(job_id, episode, "episode failed: {}", e);
                    self.events.emit(ProgressEvent::UnitFailed {
                        job_id: job_id.to_string(),
                        phase: "storyboard".to_string(),
                        episode: Some(episode),
                        message: format!("{}", e),
                    });
                }
            }
            if episode < total {
                tokio::time::sleep(Duration::from_millis(self.config.episode_pause_ms)).await;
            }
        }
        if attempted > 0 && succeeded == 0 {
            self.store
                .update(job_id, |j| j.status = JobStatus::Error)
                .await?;
            bail!("every pending episode failed for job {}", job_id);
        }
        self.finish_storyboards(job_id).await
    }

    /// One episode's chunked shot generation. A chunk that parses to zero
    /// shots is re-invoked up to `unit_max_retries` times; a chunk that
    /// still yields nothing gets an error record and the episode moves on.
    /// The episode as a whole fails only when no chunk produced shots.
    async fn generate_episode_shots(&self, job_id: &str, episode: u32) -> Result<()> {
        let job = self.load_job(job_id).await?;
        let script = job
            .script_for(episode)
            .with_context(|| format!("episode {} has no script", episode))?
            .clone();
        let target = self.config.shots_per_episode(job.minutes_per_episode);
        let per_call = self.config.shots_per_call.max(1);
        let context = build_context(&job, &[]);

        self.store
            .update(job_id, |j| j.progress.generating_episode = Some(episode))
            .await?;

        let mut shots: Vec<Shot> = Vec::new();
        let mut seq_start = 1u32;
        let mut chunk_index = 0u32;
        while seq_start <= target {
            let count = per_call.min(target - seq_start + 1);
            let request = GenerateRequest {
                label: format!("episode {} shots {}-{}", episode, seq_start, seq_start + count - 1),
                system: storyboard_system_prompt(),
                user: storyboard_user_prompt(&job, &script, &context, seq_start, count, target),
                model: None,
            };
            let parsed = self
                .invoke_until_parsed(&request, SHOT_REQUIRED)
                .await
                .map(|records| shots_from_records(records, episode, &mut seq_start))
                .unwrap_or_default();
            if parsed.is_empty() {
                self.store
                    .update(job_id, |j| {
                        j.record_error(
                            "storyboard",
                            Some(episode),
                            Some(chunk_index),
                            format!(
                                "shots {}-{} yielded nothing after retries",
                                seq_start,
                                seq_start + count - 1
                            ),
                        )
                    })
                    .await?;
                seq_start += count;
            } else {
                shots.extend(parsed);
            }
            chunk_index += 1;
            if seq_start <= target {
                tokio::time::sleep(Duration::from_millis(self.config.call_pause_ms)).await;
            }
        }

        if shots.is_empty() {
            bail!("episode {} produced no shots", episode);
        }
        let produced = shots.len();
        self.store
            .update(job_id, |j| {
                j.storyboards.insert(episode, shots);
                j.progress.generating_episode = None;
                j.progress.completed_episodes =
                    (1..=j.total_episodes).filter(|e| j.episode_done(*e)).count() as u32;
                j.progress.total_shots = j.all_shots().len() as u32;
            })
            .await?;
        info!(job_id, episode, shots = produced, "episode storyboard stored");
        Ok(())
    }

    /// Close out a storyboard run: `Completed` when every episode has
    /// shots, otherwise back to `ScriptsReady` for another pass.
    async fn finish_storyboards(&self, job_id: &str) -> Result<Job> {
        let job = self.load_job(job_id).await?;
        let all_done = (1..=job.total_episodes).all(|e| job.episode_done(e));
        let job = self
            .store
            .update(job_id, |j| {
                if all_done {
                    j.status = JobStatus::Completed;
                    j.timing.completed_at = Some(Utc::now());
                } else {
                    j.status = JobStatus::ScriptsReady;
                }
            })
            .await?;
        Ok(job)
    }

    /// Generic global phase: one invocation, result stored under the
    /// phase's output key.
    async fn run_global_phase(&self, job_id: &str, phase: &Phase) -> Result<()> {
        let job = self.load_job(job_id).await?;
        let context = build_context(&job, &phase.enrich_with);
        let request = GenerateRequest {
            label: format!("{} phase", phase.output),
            system: global_system_prompt(&phase.agent),
            user: global_user_prompt(&job, &phase.output, &context),
            model: None,
        };
        let output = self.queue.submit(request).await?;
        let value = parser::parse_value(&output.text)
            .unwrap_or_else(|| Value::String(output.text.trim().to_string()));
        self.store
            .update(job_id, |j| {
                j.outputs.insert(phase.output.clone(), value);
            })
            .await?;
        Ok(())
    }

    /// Per-shot enrichment: batched passes over the flattened shot list.
    /// Results concatenate under the output key; storyboards are never
    /// mutated here.
    async fn run_per_shot_phase(&self, job_id: &str, phase: &Phase) -> Result<()> {
        let job = self.load_job(job_id).await?;
        let shots: Vec<Shot> = job.all_shots().into_iter().cloned().collect();
        if shots.is_empty() {
            bail!("no shots to enrich for phase {}", phase.output);
        }
        let context = build_context(&job, &phase.enrich_with);
        let batch_size = self.config.shot_batch_size.max(1);
        let total_batches = shots.len().div_ceil(batch_size);
        let mut sections: Vec<String> = Vec::new();

        for (batch_index, batch) in shots.chunks(batch_size).enumerate() {
            self.events.emit(ProgressEvent::BatchProgress {
                job_id: job_id.to_string(),
                phase: phase.output.clone(),
                current: batch_index + 1,
                total: total_batches,
            });
            let request = GenerateRequest {
                label: format!("{} batch {}/{}", phase.output, batch_index + 1, total_batches),
                system: global_system_prompt(&phase.agent),
                user: per_shot_user_prompt(&job, phase, &context, batch)?,
                model: None,
            };
            match self.queue.submit(request).await {
                Ok(output) => sections.push(output.text.trim().to_string()),
                Err(e) => {
                    warn!(job_id, phase = %phase.output, batch_index, "batch failed: {}", e);
                    self.store
                        .update(job_id, |j| {
                            j.record_error(
                                &phase.output,
                                None,
                                Some(batch_index as u32),
                                format!("{}", e),
                            )
                        })
                        .await?;
                }
            }
            if batch_index + 1 < total_batches {
                tokio::time::sleep(Duration::from_millis(self.config.call_pause_ms)).await;
            }
        }

        if sections.is_empty() {
            bail!("every batch of phase {} failed", phase.output);
        }
        let merged = Value::String(sections.join("\n\n"));
        self.store
            .update(job_id, |j| {
                j.outputs.insert(phase.output.clone(), merged);
            })
            .await?;
        Ok(())
    }

    /// Submit a request and parse records out of the reply, re-invoking on
    /// an empty parse up to `unit_max_retries` extra times. Returns `None`
    /// when every attempt yields nothing (including invocation errors,
    /// which the queue has already retried and failed over internally).
    async fn invoke_until_parsed(
        &self,
        request: &GenerateRequest,
        required: &[&str],
    ) -> Option<Vec<Value>> {
        let attempts = 1 + self.config.unit_max_retries;
        for attempt in 1..=attempts {
            match self.queue.submit(request.clone()).await {
                Ok(output) => {
                    let records = parser::parse_records(&output.text, required);
                    if !records.is_empty() {
                        return Some(records);
                    }
                    warn!(
                        label = %request.label,
                        attempt,
                        "reply parsed to zero records"
                    );
                }
                Err(e) => {
                    warn!(label = %request.label, attempt, "invocation failed: {}", e);
                }
            }
        }
        None
    }
}

/// Rolling context from the last three accepted scripts.
fn previously_on(accepted: &[Script]) -> String {
    accepted
        .iter()
        .rev()
        .take(3)
        .rev()
        .map(|s| format!("Episode {} \u{2014} {}: {}", s.episode, s.title, s.summary))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Turn parsed records into scripts renumbered onto the batch range.
/// Records beyond the range are dropped.
fn scripts_from_records(records: Vec<Value>, start: u32, end: u32) -> Vec<Script> {
    let mut out = Vec::new();
    let mut episode = start;
    for record in records {
        if episode > end {
            break;
        }
        match serde_json::from_value::<Script>(fill_episode(record, episode)) {
            Ok(mut script) => {
                script.episode = episode;
                out.push(script);
                episode += 1;
            }
            Err(e) => warn!("dropping unusable script record: {}", e),
        }
    }
    out
}

fn fill_episode(mut record: Value, episode: u32) -> Value {
    if let Some(map) = record.as_object_mut() {
        let needs_episode = !map.get("episode").is_some_and(Value::is_u64);
        if needs_episode {
            map.insert("episode".to_string(), Value::from(episode));
        }
        if !map.contains_key("title") {
            map.insert("title".to_string(), Value::from(format!("Episode {}", episode)));
        }
    }
    record
}

/// Turn parsed records into shots with ids rewritten to a continuous
/// per-episode sequence starting at `*seq`.
fn shots_from_records(records: Vec<Value>, episode: u32, seq: &mut u32) -> Vec<Shot> {
    let mut out = Vec::new();
    for record in records {
        match serde_json::from_value::<Shot>(record) {
            Ok(mut shot) => {
                shot.shot_id = format_shot_id(episode, *seq);
                shot.episode = episode;
                out.push(shot);
                *seq += 1;
            }
            Err(e) => warn!("dropping unusable shot record: {}", e),
        }
    }
    out
}

/// Assemble prompt context from stored global outputs: the requested
/// enrichment keys plus the always-fed ones, each at most once.
fn build_context(job: &Job, enrich_with: &[String]) -> String {
    let mut keys: Vec<&str> = Vec::new();
    for key in enrich_with {
        if !keys.contains(&key.as_str()) {
            keys.push(key);
        }
    }
    for key in ALWAYS_FED {
        if !keys.contains(key) {
            keys.push(key);
        }
    }
    let mut sections = Vec::new();
    for key in keys {
        if let Some(value) = job.outputs.get(key) {
            let text = match value {
                Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other).unwrap_or_default(),
            };
            if !text.trim().is_empty() {
                sections.push(format!("## {}\n{}", key, text.trim()));
            }
        }
    }
    sections.join("\n\n")
}

fn scripts_system_prompt() -> String {
    "You are a veteran episodic screenwriter. You reply with a strict JSON array and \
     nothing else: one object per episode with the fields \"episode\" (number), \
     \"title\", \"summary\" (4-6 sentences of plot), and \"scenes\" (array of short \
     scene descriptions). No markdown fences, no commentary."
        .to_string()
}

fn scripts_user_prompt(job: &Job, start: u32, end: u32, previously: &str) -> String {
    let mut prompt = format!(
        "Adapt the following source material into a {}-episode series titled {:?}. \
         Write episodes {} through {} now.\n\nSOURCE MATERIAL:\n{}",
        job.total_episodes, job.title, start, end, job.source_text
    );
    let context = build_context(job, &[]);
    if !context.is_empty() {
        prompt.push_str("\n\nESTABLISHED MATERIAL:\n");
        prompt.push_str(&context);
    }
    if !previously.is_empty() {
        prompt.push_str("\n\nPREVIOUSLY:\n");
        prompt.push_str(previously);
        prompt.push_str("\nKeep continuity with these episodes.");
    }
    prompt
}

fn storyboard_system_prompt() -> String {
    "You are a storyboard artist breaking scripts into shots. You reply with a strict \
     JSON array and nothing else: one object per shot with the fields \"shot_id\" \
     (format E001_S001), \"description\", \"dialogue\", \"duration_seconds\" (number), \
     \"image_prompt\", and \"video_prompt\". No markdown fences, no commentary."
        .to_string()
}

fn storyboard_user_prompt(
    job: &Job,
    script: &Script,
    context: &str,
    seq_start: u32,
    count: u32,
    target: u32,
) -> String {
    let mut prompt = format!(
        "Episode {} of {:?} runs about {} minutes and needs {} shots in total. \
         Produce shots {} through {} now, ids {} onward.\n\nEPISODE {} \u{2014} {}\n{}",
        script.episode,
        job.title,
        job.minutes_per_episode,
        target,
        seq_start,
        seq_start + count - 1,
        format_shot_id(script.episode, seq_start),
        script.episode,
        script.title,
        script.summary,
    );
    if !script.scenes.is_empty() {
        prompt.push_str("\n\nSCENES:\n");
        prompt.push_str(&script.scenes.join("\n"));
    }
    if !context.is_empty() {
        prompt.push_str("\n\nESTABLISHED MATERIAL:\n");
        prompt.push_str(context);
    }
    prompt
}

fn global_system_prompt(agent: &str) -> String {
    format!(
        "You are the {} for a generative video series. Be concrete and concise; \
         your answer is consumed by downstream generation phases.",
        agent.replace('_', " ")
    )
}

fn global_user_prompt(job: &Job, output: &str, context: &str) -> String {
    let mut prompt = format!(
        "Produce the {} for a {}-episode series titled {:?}.\n\nSOURCE MATERIAL:\n{}",
        output.replace('_', " "),
        job.total_episodes,
        job.title,
        job.source_text
    );
    if !context.is_empty() {
        prompt.push_str("\n\nESTABLISHED MATERIAL:\n");
        prompt.push_str(context);
    }
    prompt
}

fn per_shot_user_prompt(
    job: &Job,
    phase: &Phase,
    context: &str,
    batch: &[Shot],
) -> Result<String> {
    let shots_json =
        serde_json::to_string_pretty(batch).context("serializing shot batch for prompt")?;
    let mut prompt = format!(
        "Produce the {} for each of the following shots from the series {:?}. \
         Address every shot by its shot_id.\n\nSHOTS:\n{}",
        phase.output.replace('_', " "),
        job.title,
        shots_json
    );
    if !context.is_empty() {
        prompt.push_str("\n\nESTABLISHED MATERIAL:\n");
        prompt.push_str(context);
    }
    Ok(prompt)
}
