use std::time::Duration;

use common::WorkerHeartbeatRequest;
use reqwest::{Client, StatusCode};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// CPU global en % y memoria usada en bytes.
pub fn sample_host(sys: &mut System) -> (f32, u64) {
    sys.refresh_cpu();
    sys.refresh_memory();

    let cpu_percent = sys.global_cpu_info().cpu_usage();
    // used_memory devuelve KB -> lo pasamos a bytes
    let mem_bytes = sys.used_memory() * 1024;
    (cpu_percent, mem_bytes)
}

/// Heartbeats periodicos al master con CPU/MEM. Corta solo si el master
/// responde 410: ya nos dio por muertos.
pub fn spawn_heartbeat(
    client: Client,
    base_url: String,
    worker_id: String,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // System para leer CPU y memoria
        let mut sys = System::new_all();
        let hb_url = format!("{}/api/v1/workers/heartbeat", base_url);

        loop {
            let (cpu_percent, mem_bytes) = sample_host(&mut sys);

            let sent = client
                .post(&hb_url)
                .json(&WorkerHeartbeatRequest {
                    worker_id: worker_id.clone(),
                    cpu_percent,
                    mem_bytes,
                })
                .send()
                .await;

            match sent {
                Ok(res) if res.status() == StatusCode::GONE => {
                    warn!("el master dio por muerto al worker {}, sin mas heartbeats", worker_id);
                    return;
                }
                Ok(res) => debug!("heartbeat -> {}", res.status()),
                Err(e) => warn!("heartbeat fallido: {}", e),
            }

            tokio::time::sleep(interval).await;
        }
    })
}
