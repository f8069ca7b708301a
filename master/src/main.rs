mod handlers;
mod local;
mod monitor;
mod scheduler;
mod server;
mod state;

use std::{net::SocketAddr, path::PathBuf, process::ExitCode, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use common::{
    config::{DEFAULT_STORE_PATH, DEFAULT_STORE_WRITE_RETRIES},
    open_store, RunConfig, StoreKind, WorkArgs,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::scheduler::{RunSummary, SchedulerError};
use crate::server::ServeOptions;

pub const WORKER_DEAD_TIMEOUT: Duration = Duration::from_secs(20);
pub const HTTP_STALL_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "master", about = "Scheduler de tareas con progreso persistente")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scheduler y pool de workers en este mismo proceso
    Local {
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        work: WorkArgs,
    },
    /// Scheduler con API HTTP para workers remotos
    Serve {
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        http: HttpArgs,
    },
    /// Borra el progreso registrado (entre corridas)
    Reset {
        #[arg(long, env = "STORE_PATH", default_value = DEFAULT_STORE_PATH)]
        store: PathBuf,
        #[arg(long, env = "STORE_KIND", value_enum, default_value_t = StoreKind::Log)]
        store_kind: StoreKind,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Cantidad de tareas N; se numeran 0..N
    #[arg(long, env = "TASKS", allow_negative_numbers = true)]
    tasks: i64,

    /// Tamaño del pool de workers W
    #[arg(long, env = "WORKERS", allow_negative_numbers = true)]
    workers: i64,

    #[arg(long, env = "STORE_PATH", default_value = DEFAULT_STORE_PATH)]
    store: PathBuf,

    #[arg(long, env = "STORE_KIND", value_enum, default_value_t = StoreKind::Log)]
    store_kind: StoreKind,

    /// Reintentos extra al registrar una tarea completa
    #[arg(long, env = "STORE_RETRIES", default_value_t = DEFAULT_STORE_WRITE_RETRIES)]
    store_retries: u32,

    #[arg(long, env = "STORE_BACKOFF_MS", default_value_t = 50)]
    store_backoff_ms: u64,

    /// Timeout por tarea en segundos; sin valor no hay timeout
    #[arg(long, env = "TASK_TIMEOUT_SECS")]
    task_timeout_secs: Option<u64>,

    /// Espera por un worker de reemplazo antes de declarar stall
    #[arg(long, env = "STALL_GRACE_SECS")]
    stall_grace_secs: Option<u64>,
}

impl RunArgs {
    fn into_config(self, default_grace: Duration) -> Result<RunConfig, SchedulerError> {
        let mut config = RunConfig::new(self.tasks, self.workers, self.store)?;
        config.store_kind = self.store_kind;
        config.store_write_retries = self.store_retries;
        config.store_retry_backoff = Duration::from_millis(self.store_backoff_ms);
        config.task_timeout = self.task_timeout_secs.map(Duration::from_secs);
        config.stall_grace = self
            .stall_grace_secs
            .map(Duration::from_secs)
            .unwrap_or(default_grace);
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args)]
struct HttpArgs {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    #[arg(long, env = "POLL_TIMEOUT_SECS", default_value_t = 10)]
    poll_timeout_secs: u64,

    #[arg(long, env = "HEARTBEAT_TIMEOUT_SECS", default_value_t = WORKER_DEAD_TIMEOUT.as_secs())]
    heartbeat_timeout_secs: u64,

    #[arg(long, env = "LINGER_SECS", default_value_t = 15)]
    linger_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,common=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli.command).await {
        Ok(Some(summary)) => {
            println!("=== ALL TASKS COMPLETED ===");
            println!(
                "{} tareas ({} ya completas), {} despachos, {} fallos, {} desconexiones, {} timeouts en {:.1?}",
                summary.total,
                summary.already_complete,
                summary.dispatched,
                summary.failures,
                summary.disconnects,
                summary.timeouts,
                summary.elapsed
            );
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<SchedulerError>() {
                Some(SchedulerError::Config(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(command: Command) -> anyhow::Result<Option<RunSummary>> {
    match command {
        Command::Local { run, work } => {
            let config = run.into_config(Duration::ZERO)?;
            let store = open_store(config.store_kind, &config.store_path)
                .map_err(SchedulerError::from)?;
            let work = work.build(config.task_count);
            info!(
                "corrida local: {} tareas, {} workers, trabajo {}",
                config.task_count,
                config.worker_pool_size,
                work.name()
            );
            Ok(Some(local::run_local(config, store, work).await?))
        }
        Command::Serve { run, http } => {
            let config = run.into_config(HTTP_STALL_GRACE)?;
            let store = open_store(config.store_kind, &config.store_path)
                .map_err(SchedulerError::from)?;
            let heartbeat_timeout = Duration::from_secs(http.heartbeat_timeout_secs);
            let opts = ServeOptions {
                bind: http.bind,
                poll_timeout: Duration::from_secs(http.poll_timeout_secs),
                heartbeat_timeout,
                monitor_interval: (heartbeat_timeout / 4).max(Duration::from_secs(1)),
                linger: Duration::from_secs(http.linger_secs),
            };
            Ok(Some(server::serve(config, store, opts).await?))
        }
        Command::Reset { store, store_kind } => {
            let progress = open_store(store_kind, &store)
                .with_context(|| format!("no se pudo abrir el store {}", store.display()))?;
            let before = progress.completed_count()?;
            progress.reset()?;
            info!("store {} vaciado ({} registros borrados)", store.display(), before);
            Ok(None)
        }
    }
}
