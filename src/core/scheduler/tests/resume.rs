use std::sync::Arc;

use serde_json::json;

use crate::core::job::{JobStatus, Script, Shot, format_shot_id};

use super::{ScriptedInvoker, harness, job_params, test_config};

fn seed_script(episode: u32) -> Script {
    serde_json::from_value(json!({
        "episode": episode,
        "title": format!("Episode {}", episode),
        "summary": "Seeded.",
        "scenes": [],
    }))
    .unwrap()
}

fn seed_shot(episode: u32, seq: u32) -> Shot {
    serde_json::from_value(json!({
        "shot_id": format_shot_id(episode, seq),
        "episode": episode,
        "description": format!("hand-written shot {} of episode {}", seq, episode),
        "image_prompt": "previously generated",
    }))
    .unwrap()
}

#[tokio::test]
async fn resume_only_generates_missing_episodes() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let h = harness(invoker.clone(), test_config()).await;

    let job = h.store.create(job_params(5)).await.unwrap();
    h.store
        .update(&job.id, |j| {
            j.status = JobStatus::ScriptsReady;
            j.scripts = (1..=5).map(seed_script).collect();
            for episode in 1..=3 {
                j.storyboards
                    .insert(episode, vec![seed_shot(episode, 1), seed_shot(episode, 2)]);
            }
        })
        .await
        .unwrap();
    let before = h.store.get(&job.id).await.unwrap();

    let after = h.scheduler.run_all_episodes(&job.id).await.unwrap();

    // Only the two missing episodes hit the backend.
    let episode_calls: Vec<String> = invoker
        .labels()
        .await
        .into_iter()
        .filter(|l| l.starts_with("episode "))
        .collect();
    assert_eq!(episode_calls.len(), 2);
    assert!(episode_calls[0].starts_with("episode 4 "));
    assert!(episode_calls[1].starts_with("episode 5 "));

    // Pre-existing shot lists are untouched, byte for byte.
    for episode in 1..=3 {
        assert_eq!(
            serde_json::to_value(&after.storyboards[&episode]).unwrap(),
            serde_json::to_value(&before.storyboards[&episode]).unwrap(),
        );
    }
    assert_eq!(after.status, JobStatus::Completed);
    assert_eq!(after.progress.total_shots, 10);
}

#[tokio::test]
async fn rerun_on_a_completed_job_calls_no_backend() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let h = harness(invoker.clone(), test_config()).await;

    let job = h.store.create(job_params(2)).await.unwrap();
    h.store
        .update(&job.id, |j| {
            j.status = JobStatus::Completed;
            j.scripts = (1..=2).map(seed_script).collect();
            for episode in 1..=2 {
                j.storyboards.insert(episode, vec![seed_shot(episode, 1)]);
            }
        })
        .await
        .unwrap();

    let after = h.scheduler.run_all_episodes(&job.id).await.unwrap();
    assert!(invoker.labels().await.is_empty());
    assert_eq!(after.status, JobStatus::Completed);
}
