use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{RunPhase, RunStatus, WorkerMetrics};
use reqwest::Client;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el master")]
struct Cli {
    /// En Docker: http://master:8080
    #[arg(long, env = "MASTER_URL", default_value = "http://localhost:8080")]
    master_url: String,

    /// Salida JSON cruda en vez de texto
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estado de la corrida en curso
    Status,
    /// Metricas de los workers registrados
    Workers,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.master_url.trim_end_matches('/');

    match cli.command {
        Commands::Status => {
            let url = format!("{}/api/v1/run", base_url);
            let resp = client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("no se pudo contactar al master en {}", base_url))?;
            if !resp.status().is_success() {
                bail!("Error consultando /api/v1/run (status {})", resp.status());
            }

            let status: RunStatus = resp.json().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", render_status(&status));
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("no se pudo contactar al master en {}", base_url))?;
            if !resp.status().is_success() {
                bail!("Error consultando /api/v1/workers (status {})", resp.status());
            }

            let workers: Vec<WorkerMetrics> = resp.json().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&workers)?);
            } else if workers.is_empty() {
                println!("No hay workers registrados.");
            } else {
                for w in &workers {
                    print!("{}", render_worker(w));
                }
            }
        }
    }

    Ok(())
}

fn render_status(status: &RunStatus) -> String {
    let mut out = String::new();
    let phase = match status.phase {
        RunPhase::Dispatching => "despachando",
        RunPhase::Done => "completa",
        RunPhase::Stalled => "trabada (sin workers)",
    };

    out.push_str("Corrida:\n");
    out.push_str(&format!("  estado: {}\n", phase));
    out.push_str(&format!(
        "  tareas: total={}, completadas={}, pendientes={}, en vuelo={}\n",
        status.task_count, status.completed, status.outstanding, status.in_flight
    ));
    out.push_str(&format!("  progreso: {:.1}%\n", status.percent_complete()));
    out.push_str(&format!(
        "  workers vivos: {}, despachos: {}, fallos: {}\n",
        status.live_workers, status.dispatched, status.failures
    ));
    out.push_str(&format!("  iniciado: {}\n", status.started_at));
    if let Some(ref done) = status.finished_at {
        out.push_str(&format!("  finalizado: {}\n", done));
    }
    out
}

fn render_worker(w: &WorkerMetrics) -> String {
    let mut out = String::new();
    out.push_str(&format!("Worker {}\n", w.worker_id));
    out.push_str(&format!("  host           : {}\n", w.hostname));
    out.push_str(&format!("  dead           : {}\n", w.dead));
    out.push_str(&format!(
        "  last_heartbeat : {} s ago\n",
        w.last_heartbeat_secs_ago
    ));
    out.push_str(&format!(
        "  tareas         : started={}, ok={}, failed={}\n",
        w.tasks_started, w.tasks_succeeded, w.tasks_failed
    ));
    match w.avg_task_ms {
        Some(avg) => out.push_str(&format!("  avg_task_ms    : {:.1}\n", avg)),
        None => out.push_str("  avg_task_ms    : (sin datos)\n"),
    }
    match w.cpu_percent {
        Some(cpu) => out.push_str(&format!("  cpu_percent    : {:.1}%\n", cpu)),
        None => out.push_str("  cpu_percent    : (sin datos)\n"),
    }
    match w.mem_bytes {
        Some(mem) => out.push_str(&format!("  mem_bytes      : {}\n", mem)),
        None => out.push_str("  mem_bytes      : (sin datos)\n"),
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estado_con_progreso() {
        let mut status = RunStatus::new(8);
        status.completed = 2;
        status.outstanding = 6;
        status.in_flight = 3;

        let text = render_status(&status);
        assert!(text.contains("estado: despachando"));
        assert!(text.contains("completadas=2, pendientes=6, en vuelo=3"));
        assert!(text.contains("progreso: 25.0%"));
        assert!(!text.contains("finalizado"));
    }

    #[test]
    fn worker_sin_metricas() {
        let w = WorkerMetrics {
            worker_id: "w-1".to_string(),
            hostname: "nodo".to_string(),
            dead: false,
            last_heartbeat_secs_ago: 3,
            tasks_started: 2,
            tasks_succeeded: 1,
            tasks_failed: 0,
            avg_task_ms: None,
            cpu_percent: Some(40.0),
            mem_bytes: None,
        };

        let text = render_worker(&w);
        assert!(text.contains("Worker w-1"));
        assert!(text.contains("started=2, ok=1, failed=0"));
        assert!(text.contains("avg_task_ms    : (sin datos)"));
        assert!(text.contains("cpu_percent    : 40.0%"));
    }
}
