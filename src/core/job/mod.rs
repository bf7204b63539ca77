//! Job data model and status lifecycle.

pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Canonical shot identifier: `E{episode:03}_S{sequence:03}`.
pub fn format_shot_id(episode: u32, sequence: u32) -> String {
    format!("E{:03}_S{:03}", episode, sequence)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    ScriptsGenerating,
    ScriptsReady,
    StoryboardGenerating,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::ScriptsGenerating => "scripts_generating",
            JobStatus::ScriptsReady => "scripts_ready",
            JobStatus::StoryboardGenerating => "storyboard_generating",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    /// Whether a transition from `self` to `next` is legal. Re-running a
    /// phase over an existing job is allowed (scripts can be regenerated,
    /// storyboards can be resumed after completion or error).
    pub fn can_transition(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, ScriptsGenerating)
                | (ScriptsGenerating, ScriptsReady)
                | (ScriptsGenerating, Error)
                | (ScriptsReady, ScriptsGenerating)
                | (ScriptsReady, StoryboardGenerating)
                | (StoryboardGenerating, ScriptsReady)
                | (StoryboardGenerating, Completed)
                | (StoryboardGenerating, Error)
                | (Completed, StoryboardGenerating)
                | (Completed, ScriptsGenerating)
                | (Error, ScriptsGenerating)
                | (Error, StoryboardGenerating)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One episode's script. Backends may attach extra fields beyond the core
/// trio; those are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub episode: u32,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub scenes: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One storyboard shot. Everything beyond the identifier is
/// schema-flexible and flows through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shot {
    pub shot_id: String,
    #[serde(default)]
    pub episode: u32,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<u32>,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generating_episode: Option<u32>,
    #[serde(default)]
    pub completed_episodes: u32,
    #[serde(default)]
    pub scripts_generated: u32,
    #[serde(default)]
    pub total_shots: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTiming {
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts_ready_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub title: String,
    pub source_text: String,
    pub total_episodes: u32,
    pub minutes_per_episode: u32,
    pub plan_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub title: String,
    pub source_text: String,
    pub total_episodes: u32,
    pub minutes_per_episode: u32,
    pub plan_id: String,
    pub status: JobStatus,
    /// Outputs of global phases keyed by the phase's output name.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub scripts: Vec<Script>,
    /// Per-episode shot lists keyed by episode number.
    #[serde(default)]
    pub storyboards: BTreeMap<u32, Vec<Shot>>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    pub timing: JobTiming,
    #[serde(default)]
    pub progress: JobProgress,
}

impl Job {
    pub fn new(params: NewJob) -> Self {
        Job {
            id: Uuid::new_v4().to_string(),
            title: params.title,
            source_text: params.source_text,
            total_episodes: params.total_episodes,
            minutes_per_episode: params.minutes_per_episode,
            plan_id: params.plan_id,
            status: JobStatus::Created,
            outputs: BTreeMap::new(),
            scripts: Vec::new(),
            storyboards: BTreeMap::new(),
            errors: Vec::new(),
            timing: JobTiming {
                created_at: Utc::now(),
                scripts_ready_at: None,
                completed_at: None,
            },
            progress: JobProgress::default(),
        }
    }

    pub fn script_for(&self, episode: u32) -> Option<&Script> {
        self.scripts.iter().find(|s| s.episode == episode)
    }

    /// True when the episode already has a non-empty shot list; such
    /// episodes are skipped on resume.
    pub fn episode_done(&self, episode: u32) -> bool {
        self.storyboards.get(&episode).is_some_and(|shots| !shots.is_empty())
    }

    /// All shots across episodes, in episode order.
    pub fn all_shots(&self) -> Vec<&Shot> {
        self.storyboards.values().flatten().collect()
    }

    pub fn record_error(&mut self, phase: &str, episode: Option<u32>, unit: Option<u32>, message: String) {
        self.errors.push(ErrorRecord {
            phase: phase.to_string(),
            episode,
            unit,
            message,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shot_ids_are_zero_padded() {
        assert_eq!(format_shot_id(1, 1), "E001_S001");
        assert_eq!(format_shot_id(12, 345), "E012_S345");
    }

    #[test]
    fn lifecycle_follows_the_expected_path() {
        use JobStatus::*;
        assert!(Created.can_transition(ScriptsGenerating));
        assert!(ScriptsGenerating.can_transition(ScriptsReady));
        assert!(ScriptsReady.can_transition(StoryboardGenerating));
        assert!(StoryboardGenerating.can_transition(Completed));
    }

    #[test]
    fn rerunning_phases_is_allowed() {
        use JobStatus::*;
        assert!(ScriptsReady.can_transition(ScriptsGenerating));
        assert!(Completed.can_transition(StoryboardGenerating));
        assert!(Error.can_transition(ScriptsGenerating));
        assert!(Error.can_transition(StoryboardGenerating));
    }

    #[test]
    fn skipping_phases_is_rejected() {
        use JobStatus::*;
        assert!(!Created.can_transition(StoryboardGenerating));
        assert!(!Created.can_transition(Completed));
        assert!(!ScriptsGenerating.can_transition(Completed));
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let s = serde_json::to_string(&JobStatus::ScriptsReady).unwrap();
        assert_eq!(s, "\"scripts_ready\"");
    }

    #[test]
    fn shot_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "shot_id": "E001_S001",
            "episode": 1,
            "description": "wide establishing shot",
            "camera_movement": "slow push-in",
        });
        let shot: Shot = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(shot.shot_id, "E001_S001");
        assert_eq!(shot.fields["camera_movement"], "slow push-in");
        assert_eq!(serde_json::to_value(&shot).unwrap(), raw);
    }

    #[test]
    fn episode_done_requires_a_non_empty_shot_list() {
        let mut job = Job::new(NewJob {
            title: "t".into(),
            source_text: "s".into(),
            total_episodes: 3,
            minutes_per_episode: 1,
            plan_id: "simple".into(),
        });
        assert!(!job.episode_done(1));
        job.storyboards.insert(1, Vec::new());
        assert!(!job.episode_done(1));
        job.storyboards.insert(
            1,
            vec![Shot {
                shot_id: format_shot_id(1, 1),
                episode: 1,
                fields: serde_json::Map::new(),
            }],
        );
        assert!(job.episode_done(1));
    }
}
