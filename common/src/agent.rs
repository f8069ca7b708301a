//! Loop del worker: recibir una asignacion, ejecutar, reportar, repetir.
//!
//! El worker no guarda estado entre tareas ni toca el progress store. Si se
//! cae a mitad de una tarea solo se pierde esa tarea, que el scheduler vuelve
//! a poner en el pool.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::event::{Event, EventSender};
use crate::task::{Assignment, Report, TaskId};
use crate::work::WorkFn;
use crate::worker::WorkerId;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("el scheduler ya no acepta eventos")]
    SchedulerGone,

    #[error("error de transporte: {0:#}")]
    Transport(anyhow::Error),
}

/// Transporte entre un worker y el scheduler.
#[async_trait]
pub trait AgentLink: Send {
    fn worker_id(&self) -> &str;

    /// Bloquea hasta la proxima asignacion.
    async fn next_assignment(&mut self) -> Result<Assignment, AgentError>;

    async fn report(&mut self, report: Report) -> Result<(), AgentError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgentSummary {
    pub completed: u32,
    pub failed: u32,
}

pub async fn run_agent<L>(link: &mut L, work: Arc<dyn WorkFn>) -> Result<AgentSummary, AgentError>
where
    L: AgentLink + ?Sized,
{
    let mut summary = AgentSummary::default();

    loop {
        match link.next_assignment().await? {
            Assignment::Stop => {
                info!(
                    "worker {} recibio Stop ({} ok, {} fallidas)",
                    link.worker_id(),
                    summary.completed,
                    summary.failed
                );
                return Ok(summary);
            }
            Assignment::Task { id } => {
                info!("worker {} tiene tarea {} ({})", link.worker_id(), id, work.name());

                let report = execute_task(work.clone(), id).await;
                match report {
                    Report::Done { .. } => summary.completed += 1,
                    Report::Failed { .. } => summary.failed += 1,
                }

                link.report(report).await?;
            }
        }
    }
}

/// Corre la funcion de trabajo en un hilo bloqueante. Un error o un panic se
/// convierten en `Failed`.
pub async fn execute_task(work: Arc<dyn WorkFn>, id: TaskId) -> Report {
    let handle = tokio::task::spawn_blocking(move || work.execute(id));

    match handle.await {
        Ok(Ok(output)) => {
            debug!("tarea {} -> {}", id, output);
            Report::Done { id }
        }
        Ok(Err(e)) => {
            warn!("error procesando tarea {}: {:#}", id, e);
            Report::Failed {
                id,
                reason: format!("{:#}", e),
            }
        }
        Err(e) => {
            warn!("panic o join error en tarea {}: {:?}", id, e);
            Report::Failed {
                id,
                reason: format!("la funcion de trabajo no termino: {}", e),
            }
        }
    }
}

/// Link en proceso: canales de tokio directo a la cola del scheduler.
///
/// Al soltarse avisa `Disconnected`; si el worker ya estaba retirado el
/// scheduler lo ignora.
pub struct ChannelLink {
    worker: WorkerId,
    assignments: mpsc::UnboundedReceiver<Assignment>,
    events: EventSender,
}

impl ChannelLink {
    pub fn connect(worker: impl Into<WorkerId>, events: EventSender) -> Result<Self, AgentError> {
        let worker = worker.into();
        let (link, assignments) = mpsc::unbounded_channel();

        events
            .send(Event::Connected {
                worker: worker.clone(),
                link,
            })
            .map_err(|_| AgentError::SchedulerGone)?;

        Ok(Self {
            worker,
            assignments,
            events,
        })
    }
}

#[async_trait]
impl AgentLink for ChannelLink {
    fn worker_id(&self) -> &str {
        &self.worker
    }

    async fn next_assignment(&mut self) -> Result<Assignment, AgentError> {
        // canal cerrado = el scheduler nos solto
        Ok(self.assignments.recv().await.unwrap_or(Assignment::Stop))
    }

    async fn report(&mut self, report: Report) -> Result<(), AgentError> {
        self.events
            .send(Event::Report {
                worker: self.worker.clone(),
                report,
            })
            .map_err(|_| AgentError::SchedulerGone)
    }
}

impl Drop for ChannelLink {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Disconnected {
            worker: self.worker.clone(),
        });
    }
}

/// Conecta un worker en proceso y lo lanza como tarea de tokio. El evento
/// `Connected` queda encolado antes de volver.
pub fn spawn_local_worker(
    worker: impl Into<WorkerId>,
    events: EventSender,
    work: Arc<dyn WorkFn>,
) -> Result<JoinHandle<Result<AgentSummary, AgentError>>, AgentError> {
    let mut link = ChannelLink::connect(worker, events)?;
    Ok(tokio::spawn(async move { run_agent(&mut link, work).await }))
}
