use crate::state::AppState;
use common::{Event, WorkerId};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Cada `interval` revisa los heartbeats y da de baja a los workers callados.
pub async fn monitor_workers(state: AppState, heartbeat_timeout: Duration, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let dead = sweep_once(&state, heartbeat_timeout, SystemTime::now());
        if !dead.is_empty() {
            info!("{} workers dados por muertos", dead.len());
        }
    }
}

/// Marca muertos a los workers sin heartbeat hace mas de `heartbeat_timeout`,
/// cierra su mailbox y avisa `Disconnected` al scheduler.
pub fn sweep_once(state: &AppState, heartbeat_timeout: Duration, now: SystemTime) -> Vec<WorkerId> {
    // Detectar workers muertos
    let mut dead_workers: Vec<WorkerId> = Vec::new();
    {
        let Ok(mut workers) = state.workers.lock() else {
            warn!("registro de workers envenenado, se salta la revision");
            return dead_workers;
        };
        for (id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            if let Ok(elapsed) = now.duration_since(meta.last_heartbeat) {
                if elapsed > heartbeat_timeout {
                    meta.dead = true;
                    warn!(
                        "marcando worker {} ({}) como muerto: {:?} sin heartbeat",
                        id, meta.hostname, elapsed
                    );
                    dead_workers.push(id.clone());
                }
            }
        }
    }

    if dead_workers.is_empty() {
        return dead_workers;
    }

    if let Ok(mut mailboxes) = state.mailboxes.lock() {
        for id in &dead_workers {
            mailboxes.remove(id);
        }
    }

    for id in &dead_workers {
        // si el scheduler ya termino no hay a quien avisar
        let _ = state.events.send(Event::Disconnected { worker: id.clone() });
    }

    dead_workers
}
