//! `master local`: el scheduler y W workers en el mismo proceso.

use std::sync::Arc;

use common::{agent::spawn_local_worker, event_queue, ProgressStore, RunConfig, WorkFn};
use tracing::{debug, warn};

use crate::scheduler::{RunSummary, Scheduler, SchedulerError};

pub async fn run_local(
    config: RunConfig,
    store: Arc<dyn ProgressStore>,
    work: Arc<dyn WorkFn>,
) -> Result<RunSummary, SchedulerError> {
    config.validate()?;

    let (events, rx) = event_queue();

    // todos los Connected quedan encolados antes de arrancar el scheduler
    let mut agents = Vec::new();
    for k in 0..config.worker_pool_size {
        match spawn_local_worker(format!("local-{}", k), events.clone(), work.clone()) {
            Ok(handle) => agents.push(handle),
            Err(e) => warn!("no se pudo lanzar local-{}: {}", k, e),
        }
    }
    // si solo quedan los productores de los agentes, la cola cierra con ellos
    drop(events);

    let result = Scheduler::new(config, store).run(rx).await;

    for (k, agent) in agents.into_iter().enumerate() {
        if result.is_err() {
            agent.abort();
            continue;
        }
        match agent.await {
            Ok(Ok(summary)) => debug!(
                "local-{} termino: {} ok, {} fallidas",
                k, summary.completed, summary.failed
            ),
            Ok(Err(e)) => warn!("local-{} termino con error: {}", k, e),
            Err(e) => warn!("local-{} no termino limpio: {}", k, e),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{store::MemoryStore, TaskId};
    use serde_json::{json, Value};
    use std::collections::BTreeSet;

    struct Echo;

    impl WorkFn for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn execute(&self, id: TaskId) -> anyhow::Result<Value> {
            Ok(json!(id))
        }
    }

    /// Falla siempre la tarea 1.
    struct Cursed;

    impl WorkFn for Cursed {
        fn name(&self) -> &'static str {
            "cursed"
        }

        fn execute(&self, id: TaskId) -> anyhow::Result<Value> {
            if id == 1 {
                anyhow::bail!("tarea maldita");
            }
            Ok(json!(id))
        }
    }

    #[tokio::test]
    async fn pool_en_proceso_completa_la_corrida() {
        let store = Arc::new(MemoryStore::default());
        let config = RunConfig::new(25, 3, "/unused").unwrap();

        let summary = run_local(config, store.clone(), Arc::new(Echo)).await.unwrap();

        assert_eq!(summary.total, 25);
        assert_eq!(summary.dispatched, 25);
        assert_eq!(summary.completed, 25);
        assert_eq!(store.completed().unwrap(), (0..25).collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn tarea_que_siempre_falla_termina_en_stall() {
        let store = Arc::new(MemoryStore::default());
        let config = RunConfig::new(3, 2, "/unused").unwrap();

        // cada fallo retira un worker: con dos workers la tarea 1 agota el pool
        let result = run_local(config, store.clone(), Arc::new(Cursed)).await;
        match result {
            Err(SchedulerError::Stalled { outstanding, workers }) => {
                assert!(outstanding >= 1);
                assert_eq!(workers, 0);
            }
            other => panic!("esperaba Stalled, obtuve {:?}", other),
        }
        assert!(!store.is_complete(1).unwrap());
        assert!(store.is_complete(0).unwrap());
    }

    #[tokio::test]
    async fn config_invalida_no_lanza_workers() {
        let mut config = RunConfig::new(3, 2, "/unused").unwrap();
        config.worker_pool_size = 0;
        let result = run_local(config, Arc::new(MemoryStore::default()), Arc::new(Echo)).await;
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }
}
