//! Phase plans: the ordered recipe a job runs through.

use serde::{Deserialize, Serialize};

/// How a phase's work is divided into invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One logical pass over the whole job (batched internally where the
    /// phase calls for it).
    Global,
    /// One pass per episode.
    PerEpisode,
    /// Batched passes over the flattened shot list.
    PerShot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    /// Role name used in prompts and log lines.
    pub agent: String,
    /// Key under which this phase's result is stored.
    pub output: String,
    pub granularity: Granularity,
    /// Earlier outputs fed into this phase's context.
    #[serde(default)]
    pub enrich_with: Vec<String>,
    /// Optional phases log their failure and are skipped.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasePlan {
    pub plan_id: String,
    pub name: String,
    pub description: String,
    pub phases: Vec<Phase>,
}

pub struct PlanRegistry {
    plans: Vec<PhasePlan>,
}

impl PlanRegistry {
    pub fn with_defaults() -> Self {
        PlanRegistry {
            plans: default_plans(),
        }
    }

    pub fn get(&self, plan_id: &str) -> Option<&PhasePlan> {
        self.plans.iter().find(|p| p.plan_id == plan_id)
    }

    pub fn list(&self) -> &[PhasePlan] {
        &self.plans
    }
}

fn phase(agent: &str, output: &str, granularity: Granularity) -> Phase {
    Phase {
        agent: agent.to_string(),
        output: output.to_string(),
        granularity,
        enrich_with: Vec::new(),
        optional: false,
    }
}

/// The built-in plans. `scripts` and `storyboard` are special-cased by the
/// scheduler (they populate `scripts` / `storyboards` rather than
/// `outputs`); every other phase is generic.
pub fn default_plans() -> Vec<PhasePlan> {
    vec![
        PhasePlan {
            plan_id: "simple".to_string(),
            name: "Simple".to_string(),
            description: "Scripts, then a storyboard per episode.".to_string(),
            phases: vec![
                phase("screenwriter", "scripts", Granularity::Global),
                phase("storyboard_artist", "storyboard", Granularity::PerEpisode),
            ],
        },
        PhasePlan {
            plan_id: "standard".to_string(),
            name: "Standard".to_string(),
            description: "Concept and style passes before scripting, storyboards enriched \
                          with them, and per-shot prompt generation."
                .to_string(),
            phases: vec![
                phase("concept_designer", "concept", Granularity::Global),
                phase("screenwriter", "scripts", Granularity::Global),
                Phase {
                    agent: "character_designer".to_string(),
                    output: "characters".to_string(),
                    granularity: Granularity::Global,
                    enrich_with: vec!["concept".to_string()],
                    optional: true,
                },
                Phase {
                    agent: "art_director".to_string(),
                    output: "artstyle".to_string(),
                    granularity: Granularity::Global,
                    enrich_with: vec!["concept".to_string()],
                    optional: true,
                },
                Phase {
                    agent: "storyboard_artist".to_string(),
                    output: "storyboard".to_string(),
                    granularity: Granularity::PerEpisode,
                    enrich_with: vec![
                        "concept".to_string(),
                        "characters".to_string(),
                        "artstyle".to_string(),
                    ],
                    optional: false,
                },
                Phase {
                    agent: "prompt_engineer".to_string(),
                    output: "prompts".to_string(),
                    granularity: Granularity::PerShot,
                    enrich_with: vec!["artstyle".to_string()],
                    optional: false,
                },
            ],
        },
    ]
}
