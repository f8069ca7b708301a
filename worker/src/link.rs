use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use common::{
    agent::{AgentError, AgentLink},
    Assignment, Report, TaskAssignmentRequest, TaskAssignmentResponse, TaskReportRequest,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Cuenta errores de transporte seguidos; un exito la vuelve a cero.
#[derive(Debug, Clone)]
pub struct ErrorBudget {
    max_consecutive: u32,
    consecutive: u32,
}

impl ErrorBudget {
    pub fn new(max_consecutive: u32) -> Self {
        Self {
            max_consecutive,
            consecutive: 0,
        }
    }

    /// `true` mientras se pueda seguir reintentando.
    pub fn record_error(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive <= self.max_consecutive
    }

    pub fn record_ok(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Link del worker contra la API HTTP del master.
pub struct HttpLink {
    client: Client,
    base_url: String,
    worker_id: String,
    budget: ErrorBudget,
    backoff: Duration,
}

impl HttpLink {
    /// Se registra en el master y devuelve el link listo para pedir tareas.
    pub async fn register(
        client: Client,
        base_url: impl Into<String>,
        hostname: String,
        max_error_tolerance: u32,
        backoff: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = base_url.into();
        let register_url = format!("{}/api/v1/workers/register", base_url);
        let mut budget = ErrorBudget::new(max_error_tolerance);

        let worker_id = loop {
            let attempt = async {
                let res = client
                    .post(&register_url)
                    .json(&WorkerRegisterRequest {
                        hostname: hostname.clone(),
                    })
                    .send()
                    .await?
                    .error_for_status()?;
                let WorkerRegisterResponse { worker_id } = res.json().await?;
                Ok::<_, reqwest::Error>(worker_id)
            }
            .await;

            match attempt {
                Ok(worker_id) => break worker_id,
                Err(e) if budget.record_error() => {
                    warn!(
                        "no se pudo registrar en {} ({}), reintento {}",
                        base_url,
                        e,
                        budget.consecutive()
                    );
                    sleep(backoff).await;
                }
                Err(e) => return Err(anyhow!("registro en {} fallo: {}", base_url, e)),
            }
        };

        info!("worker registrado con id = {} contra {}", worker_id, base_url);
        Ok(Self {
            client,
            base_url,
            worker_id,
            budget,
            backoff,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn transport_error(&mut self, what: &str, e: impl std::fmt::Display) -> Result<(), AgentError> {
        if self.budget.record_error() {
            warn!(
                "{} fallo ({}), reintento {} en {:?}",
                what,
                e,
                self.budget.consecutive(),
                self.backoff
            );
            sleep(self.backoff).await;
            Ok(())
        } else {
            Err(AgentError::Transport(anyhow!(
                "{} fallo {} veces seguidas: {}",
                what,
                self.budget.consecutive(),
                e
            )))
        }
    }
}

fn gone(worker_id: &str) -> AgentError {
    AgentError::Transport(anyhow!("el master dio por muerto al worker {}", worker_id))
}

#[async_trait]
impl AgentLink for HttpLink {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn next_assignment(&mut self) -> Result<Assignment, AgentError> {
        let url = format!("{}/api/v1/tasks/next", self.base_url);

        loop {
            let sent = self
                .client
                .post(&url)
                .json(&TaskAssignmentRequest {
                    worker_id: self.worker_id.clone(),
                })
                .send()
                .await;

            let res = match sent {
                Ok(res) => res,
                Err(e) => {
                    self.transport_error("pedir tarea", e).await?;
                    continue;
                }
            };

            if res.status() == StatusCode::GONE {
                return Err(gone(&self.worker_id));
            }
            let res = match res.error_for_status() {
                Ok(res) => res,
                Err(e) => {
                    self.transport_error("pedir tarea", e).await?;
                    continue;
                }
            };

            match res.json::<TaskAssignmentResponse>().await {
                Ok(TaskAssignmentResponse {
                    assignment: Some(assignment),
                }) => {
                    self.budget.record_ok();
                    return Ok(assignment);
                }
                Ok(TaskAssignmentResponse { assignment: None }) => {
                    self.budget.record_ok();
                    debug!("sin asignacion todavia, vuelvo a pedir");
                }
                Err(e) => self.transport_error("leer asignacion", e).await?,
            }
        }
    }

    async fn report(&mut self, report: Report) -> Result<(), AgentError> {
        let url = format!("{}/api/v1/tasks/report", self.base_url);

        loop {
            let sent = self
                .client
                .post(&url)
                .json(&TaskReportRequest {
                    worker_id: self.worker_id.clone(),
                    report: report.clone(),
                })
                .send()
                .await;

            match sent {
                Ok(res) if res.status() == StatusCode::GONE => return Err(gone(&self.worker_id)),
                Ok(res) => match res.error_for_status() {
                    Ok(_) => {
                        self.budget.record_ok();
                        return Ok(());
                    }
                    Err(e) => self.transport_error("reportar tarea", e).await?,
                },
                Err(e) => self.transport_error("reportar tarea", e).await?,
            }
        }
    }
}
