mod heartbeat;
mod link;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use common::{
    agent::{run_agent, AgentLink},
    WorkArgs,
};
use reqwest::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::link::HttpLink;

#[derive(Parser)]
#[command(name = "worker", about = "Worker que pide tareas al master por HTTP")]
struct Cli {
    /// URL base del master (en Docker: http://master:8080)
    #[arg(long, env = "MASTER_URL", default_value = "http://localhost:8080")]
    master_url: String,

    /// N de la corrida; solo lo usa `--work pi`
    #[arg(long, env = "TASKS", default_value_t = 1)]
    tasks: u32,

    #[command(flatten)]
    work: WorkArgs,

    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 5)]
    heartbeat_secs: u64,

    /// Errores de transporte seguidos antes de abandonar
    #[arg(long, env = "MAX_ERROR_TOLERANCE", default_value_t = 5)]
    max_error_tolerance: u32,

    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 1000)]
    retry_backoff_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,common=info,reqwest=info")),
        )
        .init();

    let cli = Cli::parse();
    let work = cli.work.build(cli.tasks);

    // Nombre de host (solo para info)
    let hostname_str = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let client = Client::builder()
        .build()
        .context("no se pudo crear el cliente HTTP")?;
    let base_url = cli.master_url.trim_end_matches('/').to_string();

    let mut link = HttpLink::register(
        client,
        base_url,
        hostname_str,
        cli.max_error_tolerance,
        Duration::from_millis(cli.retry_backoff_ms),
    )
    .await?;

    let heartbeat = heartbeat::spawn_heartbeat(
        link.client().clone(),
        link.base_url().to_string(),
        link.worker_id().to_string(),
        Duration::from_secs(cli.heartbeat_secs.max(1)),
    );

    let result = run_agent(&mut link, work).await;
    heartbeat.abort();

    let summary = result.context("el worker termino por error de transporte")?;
    info!(
        "worker terminado: {} tareas ok, {} fallidas",
        summary.completed, summary.failed
    );
    Ok(())
}
