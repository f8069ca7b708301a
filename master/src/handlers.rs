use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::{
    Assignment, Event, Report, RunStatus, TaskAssignmentRequest, TaskAssignmentResponse, TaskId,
    TaskReportRequest, TaskReportResponse, WorkerHeartbeatRequest, WorkerHeartbeatResponse,
    WorkerMetrics, WorkerRegisterRequest, WorkerRegisterResponse,
};
use std::{sync::Arc, time::SystemTime};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::state::{AppState, Mailbox, WorkerMeta};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/run", get(run_status))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(next_assignment))
        .route("/api/v1/tasks/report", post(report_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

fn internal<E>(_: E) -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

// Registra un worker nuevo y lo conecta al scheduler
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Result<Json<WorkerRegisterResponse>, StatusCode> {
    let worker_id = uuid::Uuid::new_v4().to_string();
    let (link, rx) = mpsc::unbounded_channel();

    {
        let mut workers = state.workers.lock().map_err(internal)?;
        workers.insert(worker_id.clone(), WorkerMeta::new(req.hostname.clone()));
    }
    {
        let mut mailboxes = state.mailboxes.lock().map_err(internal)?;
        mailboxes.insert(worker_id.clone(), Arc::new(AsyncMutex::new(rx)));
    }

    let connected = state.events.send(Event::Connected {
        worker: worker_id.clone(),
        link,
    });
    if connected.is_err() {
        // corrida terminada: el mailbox queda cerrado y el worker lee Stop
        info!(
            "worker {} ({}) registrado despues del final de la corrida",
            worker_id, req.hostname
        );
    } else {
        info!("worker registrado: {} ({})", worker_id, req.hostname);
    }

    Ok(Json(WorkerRegisterResponse { worker_id }))
}

// Heartbeat de worker
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    let mut workers = state.workers.lock().map_err(internal)?;
    let meta = workers.get_mut(&req.worker_id).ok_or(StatusCode::NOT_FOUND)?;
    if meta.dead {
        return Err(StatusCode::GONE);
    }

    meta.last_heartbeat = SystemTime::now();
    meta.last_cpu_percent = Some(req.cpu_percent);
    meta.last_mem_bytes = Some(req.mem_bytes);
    Ok(Json(WorkerHeartbeatResponse { ok: true }))
}

/// Lo que toca entregar en un poll: la tarea ya entregada y todavia sin
/// reporte, o el mailbox para esperar la proxima.
enum Pending {
    Redeliver(TaskId),
    Wait(Mailbox),
}

/// 404 si no se conoce, 410 si el monitor ya lo dio por muerto.
fn pending_for(state: &AppState, worker_id: &str) -> Result<Pending, StatusCode> {
    {
        let workers = state.workers.lock().map_err(internal)?;
        let meta = workers.get(worker_id).ok_or(StatusCode::NOT_FOUND)?;
        if meta.dead {
            return Err(StatusCode::GONE);
        }
        // un worker pide otra tarea solo despues de reportar la anterior:
        // si vuelve a pedir con una en curso, la respuesta se perdio
        if let Some((id, _)) = meta.current {
            return Ok(Pending::Redeliver(id));
        }
    }

    let mailboxes = state.mailboxes.lock().map_err(internal)?;
    mailboxes
        .get(worker_id)
        .cloned()
        .map(Pending::Wait)
        .ok_or(StatusCode::GONE)
}

// Long-poll: espera la proxima asignacion hasta poll_timeout
async fn next_assignment(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Result<Json<TaskAssignmentResponse>, StatusCode> {
    let mailbox = match pending_for(&state, &req.worker_id)? {
        Pending::Wait(mailbox) => mailbox,
        Pending::Redeliver(id) => {
            warn!(
                "worker {} volvio a pedir sin reportar la tarea {}, se reenvia",
                req.worker_id, id
            );
            return Ok(Json(TaskAssignmentResponse {
                assignment: Some(Assignment::Task { id }),
            }));
        }
    };

    let received = {
        let mut rx = mailbox.lock().await;
        tokio::time::timeout(state.poll_timeout, rx.recv()).await
    };

    let assignment = match received {
        Ok(Some(assignment)) => assignment,
        // el scheduler solto el link: retirado o corrida terminada
        Ok(None) => Assignment::Stop,
        Err(_) => {
            debug!("worker {} sin asignacion, que vuelva a pedir", req.worker_id);
            return Ok(Json(TaskAssignmentResponse { assignment: None }));
        }
    };

    if let Assignment::Task { id } = assignment {
        let mut workers = state.workers.lock().map_err(internal)?;
        if let Some(meta) = workers.get_mut(&req.worker_id) {
            meta.current = Some((id, SystemTime::now()));
            meta.tasks_started += 1;
        }
    }

    Ok(Json(TaskAssignmentResponse {
        assignment: Some(assignment),
    }))
}

// Worker reporta el resultado de su tarea
async fn report_task(
    State(state): State<AppState>,
    Json(req): Json<TaskReportRequest>,
) -> Result<Json<TaskReportResponse>, StatusCode> {
    {
        let mut workers = state.workers.lock().map_err(internal)?;
        let meta = workers.get_mut(&req.worker_id).ok_or(StatusCode::NOT_FOUND)?;
        if meta.dead {
            warn!(
                "reporte de tarea {} del worker muerto {} rechazado",
                req.report.task_id(),
                req.worker_id
            );
            return Err(StatusCode::GONE);
        }

        // ---- Métricas de worker: duración de la tarea ----
        if let Some((_, started_at)) = meta.current.take() {
            let duration_ms = started_at
                .elapsed()
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            meta.total_task_time_ms += duration_ms;
        }
        match req.report {
            Report::Done { .. } => meta.tasks_succeeded += 1,
            Report::Failed { .. } => meta.tasks_failed += 1,
        }
    }

    state
        .events
        .send(Event::Report {
            worker: req.worker_id,
            report: req.report,
        })
        .map_err(|_| StatusCode::GONE)?;

    Ok(Json(TaskReportResponse { ok: true }))
}

async fn run_status(State(state): State<AppState>) -> Json<RunStatus> {
    Json(state.status.borrow().clone())
}

async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkerMetrics>>, StatusCode> {
    let now = SystemTime::now();
    let workers = state.workers.lock().map_err(internal)?;

    let mut out: Vec<WorkerMetrics> = workers
        .iter()
        .map(|(id, meta)| meta.metrics(id, now))
        .collect();
    out.sort_by(|a, b| a.hostname.cmp(&b.hostname).then(a.worker_id.cmp(&b.worker_id)));

    Ok(Json(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use common::{event_queue, EventReceiver, RunPhase};
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn test_state() -> (AppState, EventReceiver, watch::Sender<RunStatus>) {
        let (events, rx) = event_queue();
        let (status_tx, status_rx) = watch::channel(RunStatus::new(4));
        let state = AppState::new(events, status_rx, Duration::from_millis(50));
        (state, rx, status_tx)
    }

    async fn call<T: DeserializeOwned>(
        state: &AppState,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Option<T>) {
        let request = match body {
            Some(body) => Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder().uri(uri).body(Body::empty()).unwrap(),
        };

        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).ok())
    }

    async fn register(state: &AppState, rx: &mut EventReceiver) -> (String, common::WorkerLink) {
        let (status, resp) = call::<WorkerRegisterResponse>(
            state,
            "/api/v1/workers/register",
            Some(json!({ "hostname": "nodo-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let worker_id = resp.unwrap().worker_id;

        match rx.recv().await.unwrap() {
            Event::Connected { worker, link } => {
                assert_eq!(worker, worker_id);
                (worker_id, link)
            }
            other => panic!("esperaba Connected, obtuve {:?}", other),
        }
    }

    async fn next(state: &AppState, worker_id: &str) -> (StatusCode, Option<Assignment>) {
        let (status, resp) = call::<TaskAssignmentResponse>(
            state,
            "/api/v1/tasks/next",
            Some(json!({ "worker_id": worker_id })),
        )
        .await;
        (status, resp.and_then(|r| r.assignment))
    }

    async fn report(state: &AppState, worker_id: &str, report: Value) -> StatusCode {
        call::<Value>(
            state,
            "/api/v1/tasks/report",
            Some(json!({ "worker_id": worker_id, "report": report })),
        )
        .await
        .0
    }

    #[tokio::test]
    async fn respuesta_perdida_se_reenvia_hasta_el_reporte() {
        let (state, mut rx, _status) = test_state();
        let (worker_id, link) = register(&state, &mut rx).await;

        link.send(Assignment::Task { id: 3 }).unwrap();
        // la respuesta de este poll nunca llega al worker
        let _ = next(&state, &worker_id).await;

        // los reintentos vuelven a ofrecer la misma tarea
        for _ in 0..2 {
            assert_eq!(
                next(&state, &worker_id).await,
                (StatusCode::OK, Some(Assignment::Task { id: 3 }))
            );
        }
        assert_eq!(state.workers.lock().unwrap()[&worker_id].tasks_started, 1);

        assert_eq!(
            report(&state, &worker_id, json!({ "kind": "done", "id": 3 })).await,
            StatusCode::OK
        );
        // reportada: el poll vuelve a esperar el mailbox
        assert_eq!(next(&state, &worker_id).await, (StatusCode::OK, None));

        link.send(Assignment::Task { id: 5 }).unwrap();
        assert_eq!(
            next(&state, &worker_id).await,
            (StatusCode::OK, Some(Assignment::Task { id: 5 }))
        );
    }

    #[tokio::test]
    async fn health_ok() {
        let (state, _rx, _status) = test_state();
        let response = build_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn registro_y_asignacion_por_long_poll() {
        let (state, mut rx, _status) = test_state();
        let (worker_id, link) = register(&state, &mut rx).await;

        // sin nada en el mailbox el poll vuelve vacio
        assert_eq!(next(&state, &worker_id).await, (StatusCode::OK, None));

        link.send(Assignment::Task { id: 3 }).unwrap();
        assert_eq!(
            next(&state, &worker_id).await,
            (StatusCode::OK, Some(Assignment::Task { id: 3 }))
        );
        assert_eq!(state.workers.lock().unwrap()[&worker_id].tasks_started, 1);

        report(&state, &worker_id, json!({ "kind": "done", "id": 3 })).await;
        assert!(matches!(rx.recv().await.unwrap(), Event::Report { .. }));

        // link soltado por el scheduler = Stop
        drop(link);
        assert_eq!(
            next(&state, &worker_id).await,
            (StatusCode::OK, Some(Assignment::Stop))
        );
    }

    #[tokio::test]
    async fn reporte_llega_a_la_cola() {
        let (state, mut rx, _status) = test_state();
        let (worker_id, link) = register(&state, &mut rx).await;
        link.send(Assignment::Task { id: 2 }).unwrap();
        next(&state, &worker_id).await;

        let (status, resp) = call::<TaskReportResponse>(
            &state,
            "/api/v1/tasks/report",
            Some(json!({
                "worker_id": worker_id,
                "report": { "kind": "failed", "id": 2, "reason": "oom" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(resp.unwrap().ok);

        match rx.recv().await.unwrap() {
            Event::Report { worker, report } => {
                assert_eq!(worker, worker_id);
                assert_eq!(
                    report,
                    Report::Failed {
                        id: 2,
                        reason: "oom".to_string()
                    }
                );
            }
            other => panic!("esperaba Report, obtuve {:?}", other),
        }

        let meta = state.workers.lock().unwrap()[&worker_id].clone();
        assert_eq!(meta.tasks_failed, 1);
        assert!(meta.current.is_none());
    }

    #[tokio::test]
    async fn worker_muerto_recibe_gone() {
        let (state, mut rx, _status) = test_state();
        let (worker_id, _link) = register(&state, &mut rx).await;
        state
            .workers
            .lock()
            .unwrap()
            .get_mut(&worker_id)
            .unwrap()
            .dead = true;

        assert_eq!(next(&state, &worker_id).await.0, StatusCode::GONE);

        let (status, _) = call::<Value>(
            &state,
            "/api/v1/tasks/report",
            Some(json!({
                "worker_id": worker_id,
                "report": { "kind": "done", "id": 0 }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::GONE);
        // nada llego al scheduler
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn desconocido_es_not_found() {
        let (state, _rx, _status) = test_state();
        assert_eq!(next(&state, "nadie").await.0, StatusCode::NOT_FOUND);

        let (status, _) = call::<Value>(
            &state,
            "/api/v1/workers/heartbeat",
            Some(json!({ "worker_id": "nadie", "cpu_percent": 1.0, "mem_bytes": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn heartbeat_y_metricas() {
        let (state, mut rx, _status) = test_state();
        let (worker_id, _link) = register(&state, &mut rx).await;

        let (status, _) = call::<WorkerHeartbeatResponse>(
            &state,
            "/api/v1/workers/heartbeat",
            Some(json!({ "worker_id": worker_id, "cpu_percent": 12.5, "mem_bytes": 2048 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, workers) = call::<Vec<WorkerMetrics>>(&state, "/api/v1/workers", None).await;
        assert_eq!(status, StatusCode::OK);
        let workers = workers.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].hostname, "nodo-1");
        assert_eq!(workers[0].cpu_percent, Some(12.5));
        assert_eq!(workers[0].mem_bytes, Some(2048));
        assert!(!workers[0].dead);
    }

    #[tokio::test]
    async fn registro_despues_del_final_lee_stop() {
        let (state, rx, _status) = test_state();
        drop(rx);

        let (_, resp) = call::<WorkerRegisterResponse>(
            &state,
            "/api/v1/workers/register",
            Some(json!({ "hostname": "tarde" })),
        )
        .await;
        let worker_id = resp.unwrap().worker_id;

        assert_eq!(
            next(&state, &worker_id).await,
            (StatusCode::OK, Some(Assignment::Stop))
        );
    }

    #[tokio::test]
    async fn estado_de_la_corrida() {
        let (state, _rx, status_tx) = test_state();
        let mut status = RunStatus::new(4);
        status.phase = RunPhase::Done;
        status.completed = 4;
        status_tx.send_replace(status);

        let (code, body) = call::<Value>(&state, "/api/v1/run", None).await;
        assert_eq!(code, StatusCode::OK);
        let body = body.unwrap();
        assert_eq!(body["phase"], json!("DONE"));
        assert_eq!(body["completed"], json!(4));
        assert_eq!(body["task_count"], json!(4));
    }
}
