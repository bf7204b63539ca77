use serde::Serialize;
use tokio::sync::broadcast;

/// Progress notifications emitted by the scheduler. Delivery is
/// fire-and-forget: zero subscribers is fine, slow subscribers miss events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseStarted {
        job_id: String,
        phase: String,
        index: usize,
        total: usize,
    },
    PhaseCompleted {
        job_id: String,
        phase: String,
    },
    EpisodeProgress {
        job_id: String,
        phase: String,
        episode: u32,
        total: u32,
    },
    BatchProgress {
        job_id: String,
        phase: String,
        current: usize,
        total: usize,
    },
    UnitFailed {
        job_id: String,
        phase: String,
        episode: Option<u32>,
        message: String,
    },
    JobCompleted {
        job_id: String,
        status: String,
        total_shots: usize,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event); // Ignored if no receivers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
