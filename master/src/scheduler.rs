//! Scheduler: unico coordinador de la corrida.
//!
//! Procesa un evento a la vez desde una sola cola (fan-in de todos los
//! workers). Cada evento produce una sola decision: asignar, retirar o
//! terminar. Como nadie mas decide, dos workers nunca quedan con la misma
//! tarea.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use common::{
    Assignment, ConfigError, Event, EventReceiver, ProgressStore, Report, RunConfig, RunPhase,
    RunStatus, StoreError, TaskId, WorkerId, WorkerLink,
};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{sleep, timeout, timeout_at, Instant},
};
use tracing::{debug, error, info, warn};

use crate::state::{RunState, WorkerSlot, WorkerState};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("progress store ilegible, se aborta la corrida: {0}")]
    Store(#[from] StoreError),

    #[error("stalled: {outstanding} tasks outstanding, {workers} workers")]
    Stalled { outstanding: usize, workers: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub total: u32,
    pub already_complete: u32,
    pub dispatched: u64,
    pub completed: u64,
    pub failures: u64,
    pub disconnects: u64,
    pub timeouts: u64,
    pub store_failures: u64,
    pub elapsed: Duration,
}

pub struct Scheduler {
    config: RunConfig,
    store: Arc<dyn ProgressStore>,
    status: watch::Sender<RunStatus>,
    base_status: RunStatus,
}

impl Scheduler {
    pub fn new(config: RunConfig, store: Arc<dyn ProgressStore>) -> Self {
        let base_status = RunStatus::new(config.task_count);
        let (status, _) = watch::channel(base_status.clone());
        Self {
            config,
            store,
            status,
            base_status,
        }
    }

    /// Receptor del estado publicado tras cada evento.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    pub async fn run(mut self, mut events: EventReceiver) -> Result<RunSummary, SchedulerError> {
        self.config.validate()?;
        let started = Instant::now();

        let space = self.config.task_space();
        let outstanding = self.store.load_outstanding(space)?;
        debug_assert!(outstanding.iter().all(|id| space.contains(*id)));
        let already_complete = space.len - outstanding.len() as u32;

        info!(
            "{} tareas en total: {} ya completas, {} pendientes, pool de {} workers",
            space.len,
            already_complete,
            outstanding.len(),
            self.config.worker_pool_size
        );

        let mut state = RunState::new(outstanding, already_complete);
        self.publish(&state, RunPhase::Dispatching);

        loop {
            if state.is_done() {
                break;
            }

            // ya hubo workers y no queda ninguno vivo: esperar un reemplazo
            if state.live_workers() == 0 && state.connected > 0 {
                match timeout(self.config.stall_grace, events.recv()).await {
                    Ok(Some(event)) => {
                        self.handle(&mut state, event).await;
                        self.publish(&state, RunPhase::Dispatching);
                        continue;
                    }
                    _ => return Err(self.stalled(&state)),
                }
            }

            let deadline = self
                .config
                .task_timeout
                .and_then(|t| state.next_deadline(t));

            let event = match deadline {
                Some(deadline) => match timeout_at(deadline, events.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        self.expire_overdue(&mut state);
                        self.publish(&state, RunPhase::Dispatching);
                        continue;
                    }
                },
                None => events.recv().await,
            };

            let Some(event) = event else {
                // nadie mas puede mandar eventos
                return Err(self.stalled(&state));
            };

            self.handle(&mut state, event).await;
            self.publish(&state, RunPhase::Dispatching);
        }

        self.stop_pending_connections(&mut state, &mut events);
        self.publish(&state, RunPhase::Done);

        let summary = RunSummary {
            total: space.len,
            already_complete: state.already_complete,
            dispatched: state.dispatched,
            completed: state.completed,
            failures: state.failures,
            disconnects: state.disconnects,
            timeouts: state.timeouts,
            store_failures: state.store_failures,
            elapsed: started.elapsed(),
        };
        info!("corrida terminada: {:?}", summary);
        Ok(summary)
    }

    async fn handle(&mut self, state: &mut RunState, event: Event) {
        debug!("evento de {}", event.worker());
        match event {
            Event::Connected { worker, link } => self.on_connected(state, worker, link),
            Event::Report {
                worker,
                report: Report::Done { id },
            } => self.on_done(state, &worker, id).await,
            Event::Report {
                worker,
                report: Report::Failed { id, reason },
            } => self.on_failed(state, &worker, id, &reason),
            Event::Disconnected { worker } => self.on_disconnected(state, &worker),
        }
    }

    fn on_connected(&mut self, state: &mut RunState, worker: WorkerId, link: WorkerLink) {
        if state.workers.contains_key(&worker) {
            // mismo handle otra vez: lo anterior se da por perdido
            warn!("worker {} se reconecto, se descarta la sesion anterior", worker);
            self.on_disconnected(state, &worker);
        } else {
            state.connected += 1;
        }

        info!(
            "worker {} conectado ({}/{} del pool)",
            worker, state.connected, self.config.worker_pool_size
        );

        state.workers.insert(
            worker.clone(),
            WorkerSlot {
                state: WorkerState::Idle,
                link: Some(link),
                busy_since: None,
            },
        );
        self.assign_next(state, &worker);
    }

    async fn on_done(&mut self, state: &mut RunState, worker: &str, id: TaskId) {
        if state.state_of(worker) != Some(WorkerState::Busy(id)) {
            warn!(
                "reporte Done de tarea {} por worker {} que no la tenia asignada, se ignora",
                id, worker
            );
            return;
        }
        state.release(worker);

        if self.record_completion(id).await {
            state.completed += 1;
            info!(
                "[SUCCESS] worker {} termino tarea {} ({} pendientes)",
                worker,
                id,
                state.outstanding()
            );
        } else {
            state.store_failures += 1;
            state.requeue(id);
        }

        self.assign_next(state, worker);
    }

    fn on_failed(&mut self, state: &mut RunState, worker: &str, id: TaskId, reason: &str) {
        if state.state_of(worker) != Some(WorkerState::Busy(id)) {
            warn!(
                "reporte Failed de tarea {} por worker {} que no la tenia asignada, se ignora",
                id, worker
            );
            return;
        }
        state.release(worker);
        state.requeue(id);
        state.failures += 1;

        warn!(
            "worker {} fallo la tarea {} (intento {}): {}; vuelve al pool y se retira el worker",
            worker,
            id,
            state.attempts.get(&id).copied().unwrap_or(0),
            reason
        );
        self.stop_worker(state, worker);
    }

    fn on_disconnected(&mut self, state: &mut RunState, worker: &str) {
        match state.state_of(worker) {
            Some(WorkerState::Busy(id)) => {
                state.release(worker);
                state.requeue(id);
                state.disconnects += 1;
                warn!(
                    "worker {} se desconecto con la tarea {} en curso, vuelve al pool",
                    worker, id
                );
                state.retire(worker);
            }
            Some(WorkerState::Idle) => {
                debug!("worker {} idle desconectado", worker);
                state.retire(worker);
            }
            Some(WorkerState::Retired) | None => {
                debug!("desconexion de worker {} ya retirado", worker);
            }
        }
    }

    /// Da al worker la tarea pendiente mas baja, o Stop si no queda ninguna.
    fn assign_next(&mut self, state: &mut RunState, worker: &str) {
        let Some(id) = state.pool.pop_first() else {
            self.stop_worker(state, worker);
            return;
        };

        let sent = state
            .workers
            .get(worker)
            .and_then(|slot| slot.link.as_ref())
            .map(|link| link.send(Assignment::Task { id }).is_ok())
            .unwrap_or(false);

        if sent {
            state.mark_busy(worker, id);
            info!(
                "[MANAGER] asignada tarea {} al worker {} (intento {})",
                id,
                worker,
                state.attempts.get(&id).copied().unwrap_or(1)
            );
        } else {
            warn!(
                "no se pudo entregar la tarea {} al worker {}, se da por desconectado",
                id, worker
            );
            state.requeue(id);
            state.retire(worker);
        }
    }

    fn stop_worker(&mut self, state: &mut RunState, worker: &str) {
        if let Some(link) = state.retire(worker) {
            // si ya no escucha da igual
            let _ = link.send(Assignment::Stop);
            info!("worker {} recibe Stop", worker);
        }
    }

    fn expire_overdue(&mut self, state: &mut RunState) {
        let Some(limit) = self.config.task_timeout else {
            return;
        };

        for worker in state.overdue(limit, Instant::now()) {
            if let Some(id) = state.release(&worker) {
                state.requeue(id);
                state.timeouts += 1;
                warn!(
                    "worker {} supero el timeout de {:?} con la tarea {}, vuelve al pool y se retira",
                    worker, limit, id
                );
            }
            // soltar el link: cuando pida la proxima tarea vera el canal cerrado
            state.retire(&worker);
        }
    }

    /// `mark_complete` con reintentos acotados. `false` si nunca quedo escrito.
    async fn record_completion(&self, id: TaskId) -> bool {
        let mut attempt = 0;
        loop {
            let store = self.store.clone();
            let result = tokio::task::spawn_blocking(move || store.mark_complete(id)).await;

            let err = match result {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => e.to_string(),
                Err(join) => format!("join error: {}", join),
            };

            if attempt >= self.config.store_write_retries {
                error!(
                    "no se pudo registrar la tarea {} tras {} intentos ({}); queda pendiente",
                    id,
                    attempt + 1,
                    err
                );
                return false;
            }

            attempt += 1;
            warn!(
                "fallo al registrar tarea {} ({}), reintento {}/{}",
                id, err, attempt, self.config.store_write_retries
            );
            sleep(self.config.store_retry_backoff).await;
        }
    }

    /// Al terminar, los workers que se conectaron y todavia no fueron
    /// atendidos reciben Stop directamente.
    fn stop_pending_connections(&mut self, state: &mut RunState, events: &mut EventReceiver) {
        while let Ok(event) = events.try_recv() {
            if let Event::Connected { worker, link } = event {
                let _ = link.send(Assignment::Stop);
                info!("worker {} recibe Stop (corrida ya completa)", worker);
                state.connected += 1;
            }
        }
    }

    fn stalled(&self, state: &RunState) -> SchedulerError {
        let outstanding = state.outstanding();
        let workers = state.live_workers();
        error!(
            "stalled: {} tareas pendientes, {} workers vivos",
            outstanding, workers
        );
        self.publish(state, RunPhase::Stalled);
        SchedulerError::Stalled {
            outstanding,
            workers,
        }
    }

    fn publish(&self, state: &RunState, phase: RunPhase) {
        let mut status = state.status(self.config.task_count, &self.base_status);
        status.phase = phase;
        if phase != RunPhase::Dispatching {
            status.finished_at = Some(Utc::now());
        }
        self.status.send_replace(status);
    }
}
