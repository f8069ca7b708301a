use tokio::sync::mpsc;

use crate::task::{Assignment, Report};
use crate::worker::WorkerId;

/// Lado del scheduler para empujar asignaciones a un worker.
pub type WorkerLink = mpsc::UnboundedSender<Assignment>;

/// Productor de la cola de eventos del scheduler. Sin limite para que se
/// pueda avisar una desconexion desde un `Drop`.
pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn event_queue() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Eventos que entran a la cola unica del scheduler (fan-in).
/// Cada conexion de worker tiene su propio productor.
#[derive(Debug)]
pub enum Event {
    Connected { worker: WorkerId, link: WorkerLink },
    Report { worker: WorkerId, report: Report },
    Disconnected { worker: WorkerId },
}

impl Event {
    pub fn worker(&self) -> &WorkerId {
        match self {
            Event::Connected { worker, .. }
            | Event::Report { worker, .. }
            | Event::Disconnected { worker } => worker,
        }
    }
}
