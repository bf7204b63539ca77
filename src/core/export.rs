//! Export projections: flat shot lists as JSON or CSV.

use anyhow::{Result, bail};
use serde_json::Value;

use crate::core::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => bail!("unknown export format {:?} (expected json or csv)", other),
        }
    }
}

const CSV_COLUMNS: &[&str] = &[
    "shot_id",
    "episode",
    "description",
    "dialogue",
    "duration_seconds",
    "image_prompt",
    "video_prompt",
];

pub fn render(job: &Job, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => render_json(job),
        ExportFormat::Csv => Ok(render_csv(job)),
    }
}

fn render_json(job: &Job) -> Result<String> {
    let shots: Vec<Value> = job
        .all_shots()
        .into_iter()
        .map(|s| serde_json::to_value(s))
        .collect::<std::result::Result<_, _>>()?;
    Ok(serde_json::to_string_pretty(&shots)?)
}

fn render_csv(job: &Job) -> String {
    let mut out = String::new();
    out.push_str(&CSV_COLUMNS.join(","));
    out.push('\n');
    for shot in job.all_shots() {
        let row: Vec<String> = CSV_COLUMNS
            .iter()
            .map(|col| match *col {
                "shot_id" => csv_field(&shot.shot_id),
                "episode" => shot.episode.to_string(),
                other => shot
                    .fields
                    .get(other)
                    .map(|v| match v {
                        Value::String(s) => csv_field(s),
                        Value::Null => String::new(),
                        scalar => csv_field(&scalar.to_string()),
                    })
                    .unwrap_or_default(),
            })
            .collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

/// Quote a field when it contains a delimiter, quote, or newline;
/// embedded quotes double up.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::{NewJob, Shot, format_shot_id};
    use serde_json::json;

    fn job_with_shots() -> Job {
        let mut job = Job::new(NewJob {
            title: "t".into(),
            source_text: "s".into(),
            total_episodes: 2,
            minutes_per_episode: 1,
            plan_id: "simple".into(),
        });
        for episode in 1..=2 {
            let shot: Shot = serde_json::from_value(json!({
                "shot_id": format_shot_id(episode, 1),
                "episode": episode,
                "description": format!("beat {}, \"quoted\", with comma", episode),
                "duration_seconds": 4,
                "image_prompt": "wide shot",
            }))
            .unwrap();
            job.storyboards.insert(episode, vec![shot]);
        }
        job
    }

    #[test]
    fn json_export_is_a_flat_episode_ordered_list() {
        let text = render(&job_with_shots(), ExportFormat::Json).unwrap();
        let parsed: Vec<Value> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["shot_id"], "E001_S001");
        assert_eq!(parsed[1]["shot_id"], "E002_S001");
    }

    #[test]
    fn csv_export_quotes_awkward_fields() {
        let text = render(&job_with_shots(), ExportFormat::Csv).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "shot_id,episode,description,dialogue,duration_seconds,image_prompt,video_prompt"
        );
        let first = lines.next().unwrap();
        assert!(first.starts_with("E001_S001,1,"));
        assert!(first.contains("\"beat 1, \"\"quoted\"\", with comma\""));
        // Missing columns stay empty rather than shifting the row.
        assert!(first.ends_with(",4,wide shot,"));
    }

    #[test]
    fn format_parsing_accepts_case_variants() {
        assert_eq!(ExportFormat::parse("JSON").unwrap(), ExportFormat::Json);
        assert_eq!(ExportFormat::parse("csv").unwrap(), ExportFormat::Csv);
        assert!(ExportFormat::parse("xlsx").is_err());
    }
}
