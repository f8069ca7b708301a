use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    Dispatching,
    Done,
    Stalled,
}

/// Foto del estado de una corrida, publicada por el scheduler tras cada evento.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub phase: RunPhase,
    pub task_count: u32,

    // -------- Progreso --------
    pub completed: u32,
    pub outstanding: u32,
    pub in_flight: u32,
    pub live_workers: u32,

    // -------- Metricas --------
    pub dispatched: u64,
    pub failures: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    pub fn new(task_count: u32) -> Self {
        Self {
            phase: RunPhase::Dispatching,
            task_count,
            completed: 0,
            outstanding: task_count,
            in_flight: 0,
            live_workers: 0,
            dispatched: 0,
            failures: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn percent_complete(&self) -> f64 {
        if self.task_count == 0 {
            return 100.0;
        }
        self.completed as f64 / self.task_count as f64 * 100.0
    }
}
