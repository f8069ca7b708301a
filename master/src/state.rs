// master/src/state.rs

use common::{
    Assignment, EventSender, RunStatus, TaskId, WorkerId, WorkerLink, WorkerMetrics,
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;

/* ---------------- estado del scheduler ---------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy(TaskId),
    Retired,
}

#[derive(Debug)]
pub struct WorkerSlot {
    pub state: WorkerState,
    pub link: Option<WorkerLink>,
    pub busy_since: Option<Instant>,
}

/// Estado en memoria de una corrida. Lo toca solo el loop del scheduler.
///
/// `pool` son las tareas pendientes todavia sin asignar; sacar siempre la
/// primera da el desempate por id mas bajo. Lo autoritativo sigue siendo el
/// progress store.
#[derive(Debug, Default)]
pub struct RunState {
    pub pool: BTreeSet<TaskId>,
    pub in_flight: HashMap<TaskId, WorkerId>,
    pub workers: HashMap<WorkerId, WorkerSlot>,
    pub attempts: HashMap<TaskId, u32>,

    // conexiones vistas, cuentan contra worker_pool_size
    pub connected: u32,

    // Métricas
    pub already_complete: u32,
    pub dispatched: u64,
    pub completed: u64,
    pub failures: u64,
    pub disconnects: u64,
    pub timeouts: u64,
    pub store_failures: u64,
}

impl RunState {
    pub fn new(outstanding: BTreeSet<TaskId>, already_complete: u32) -> Self {
        Self {
            pool: outstanding,
            already_complete,
            ..Self::default()
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pool.len() + self.in_flight.len()
    }

    /// Nada pendiente y nadie ocupado.
    pub fn is_done(&self) -> bool {
        self.pool.is_empty() && self.in_flight.is_empty()
    }

    pub fn live_workers(&self) -> usize {
        self.workers
            .values()
            .filter(|slot| slot.state != WorkerState::Retired)
            .count()
    }

    pub fn state_of(&self, worker: &str) -> Option<WorkerState> {
        self.workers.get(worker).map(|slot| slot.state)
    }

    /// Marca al worker ocupado con `id`. Nunca dos workers con la misma tarea.
    pub fn mark_busy(&mut self, worker: &str, id: TaskId) {
        debug_assert!(
            !self.in_flight.contains_key(&id),
            "tarea {} asignada dos veces",
            id
        );
        if let Some(slot) = self.workers.get_mut(worker) {
            slot.state = WorkerState::Busy(id);
            slot.busy_since = Some(Instant::now());
            self.in_flight.insert(id, worker.to_string());
            self.dispatched += 1;
            *self.attempts.entry(id).or_insert(0) += 1;
        }
    }

    /// Saca la tarea del worker y lo deja Idle. Devuelve la tarea que tenia.
    pub fn release(&mut self, worker: &str) -> Option<TaskId> {
        let slot = self.workers.get_mut(worker)?;
        let WorkerState::Busy(id) = slot.state else {
            return None;
        };
        slot.state = WorkerState::Idle;
        slot.busy_since = None;
        self.in_flight.remove(&id);
        Some(id)
    }

    /// Devuelve una tarea al pool de pendientes.
    pub fn requeue(&mut self, id: TaskId) {
        self.pool.insert(id);
    }

    /// Retira al worker y suelta su link. Devuelve el link por si hay que
    /// mandarle Stop antes.
    pub fn retire(&mut self, worker: &str) -> Option<WorkerLink> {
        let slot = self.workers.get_mut(worker)?;
        slot.state = WorkerState::Retired;
        slot.busy_since = None;
        slot.link.take()
    }

    /// Workers ocupados hace mas de `timeout`.
    pub fn overdue(&self, timeout: Duration, now: Instant) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, slot)| {
                matches!(slot.state, WorkerState::Busy(_))
                    && slot.busy_since.is_some_and(|since| since + timeout <= now)
            })
            .map(|(worker, _)| worker.clone())
            .collect()
    }

    /// Proximo vencimiento del timeout de tarea, si hay alguien ocupado.
    pub fn next_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.workers
            .values()
            .filter_map(|slot| slot.busy_since)
            .min()
            .map(|since| since + timeout)
    }

    pub fn status(&self, task_count: u32, base: &RunStatus) -> RunStatus {
        let outstanding = self.outstanding() as u32;
        RunStatus {
            completed: task_count.saturating_sub(outstanding),
            outstanding,
            in_flight: self.in_flight.len() as u32,
            live_workers: self.live_workers() as u32,
            dispatched: self.dispatched,
            failures: self.failures,
            ..base.clone()
        }
    }
}

/* ---------------- estado compartido del transporte HTTP ---------------- */

pub type Mailbox = Arc<AsyncMutex<mpsc::UnboundedReceiver<Assignment>>>;

#[derive(Clone)]
pub struct AppState {
    // cola de eventos del scheduler
    pub events: EventSender,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // asignaciones pendientes de entregar a cada worker
    pub mailboxes: Arc<Mutex<HashMap<WorkerId, Mailbox>>>,
    pub status: watch::Receiver<RunStatus>,
    pub poll_timeout: Duration,
}

impl AppState {
    pub fn new(
        events: EventSender,
        status: watch::Receiver<RunStatus>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            events,
            workers: Arc::new(Mutex::new(HashMap::new())),
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            status,
            poll_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub current: Option<(TaskId, SystemTime)>,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String) -> Self {
        Self {
            hostname,
            last_heartbeat: SystemTime::now(),
            dead: false,
            current: None,
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_task_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }

    pub fn metrics(&self, worker_id: &WorkerId, now: SystemTime) -> WorkerMetrics {
        let avg_task_ms = if self.tasks_succeeded > 0 {
            Some(self.total_task_time_ms as f64 / self.tasks_succeeded as f64)
        } else {
            None
        };

        WorkerMetrics {
            worker_id: worker_id.clone(),
            hostname: self.hostname.clone(),
            dead: self.dead,
            last_heartbeat_secs_ago: now
                .duration_since(self.last_heartbeat)
                .unwrap_or_default()
                .as_secs(),
            tasks_started: self.tasks_started,
            tasks_succeeded: self.tasks_succeeded,
            tasks_failed: self.tasks_failed,
            avg_task_ms,
            cpu_percent: self.last_cpu_percent,
            mem_bytes: self.last_mem_bytes,
        }
    }
}
