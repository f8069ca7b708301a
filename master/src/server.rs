//! `master serve`: scheduler detras de la API HTTP.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use common::{event_queue, ProgressStore, RunConfig};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{info, warn};

use crate::{
    handlers,
    monitor,
    scheduler::{RunSummary, Scheduler, SchedulerError},
    state::AppState,
};

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub bind: SocketAddr,
    /// Cuanto retiene el long-poll de `/api/v1/tasks/next`.
    pub poll_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub monitor_interval: Duration,
    /// Tiempo que el servidor sigue arriba despues del final para que los
    /// workers lean su Stop.
    pub linger: Duration,
}

pub async fn serve(
    config: RunConfig,
    store: Arc<dyn ProgressStore>,
    opts: ServeOptions,
) -> anyhow::Result<RunSummary> {
    config.validate().map_err(SchedulerError::from)?;

    let (events, rx) = event_queue();
    let scheduler = Scheduler::new(config, store);
    let state = AppState::new(events, scheduler.subscribe(), opts.poll_timeout);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // monitor de heartbeats en segundo plano
    let monitor = tokio::spawn(monitor::monitor_workers(
        state.clone(),
        opts.heartbeat_timeout,
        opts.monitor_interval,
    ));

    let listener = TcpListener::bind(opts.bind)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", opts.bind))?;
    info!("master escuchando en {}", listener.local_addr()?);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let result = tokio::select! {
        result = scheduler.run(rx) => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            warn!("interrumpido; el progreso registrado queda en el store");
            Err(anyhow::anyhow!("corrida interrumpida"))
        }
    };

    if result.is_ok() {
        info!("esperando {:?} para que los workers lean su Stop", opts.linger);
        tokio::time::sleep(opts.linger).await;
    }

    monitor.abort();
    let _ = shutdown_tx.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("el servidor HTTP termino con error: {}", e),
        Err(e) => warn!("la tarea del servidor HTTP no termino limpio: {}", e),
    }

    result
}
