use std::{path::PathBuf, time::Duration};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::TaskSpace;

pub const DEFAULT_STORE_PATH: &str = "/cluster/task_log.txt";
pub const DEFAULT_STORE_WRITE_RETRIES: u32 = 3;
pub const DEFAULT_STORE_RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("task_count debe ser > 0 (recibido {0})")]
    InvalidTaskCount(i64),

    #[error("worker_pool_size debe ser > 0 (recibido {0})")]
    InvalidPoolSize(i64),

    #[error("task_timeout no puede ser cero")]
    ZeroTaskTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Log append-only, un id por linea
    Log,
    /// Snapshot completo reescrito atomicamente
    Snapshot,
}

/// Configuracion de una corrida, leida una sola vez en Init.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub task_count: u32,
    pub worker_pool_size: u32,
    pub store_path: PathBuf,
    pub store_kind: StoreKind,

    /// Reintentos extra de `mark_complete` antes de devolver la tarea al pool.
    pub store_write_retries: u32,
    pub store_retry_backoff: Duration,

    /// Timeout de vida por tarea. `None` = sin timeout.
    pub task_timeout: Option<Duration>,

    /// Cuanto esperar a un worker de reemplazo antes de declarar stall.
    pub stall_grace: Duration,
}

impl RunConfig {
    /// Valida los valores crudos de la CLI. Se reciben como `i64` para
    /// poder rechazar negativos con un mensaje claro.
    pub fn new(
        task_count: i64,
        worker_pool_size: i64,
        store_path: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        if task_count <= 0 || task_count > u32::MAX as i64 {
            return Err(ConfigError::InvalidTaskCount(task_count));
        }
        if worker_pool_size <= 0 || worker_pool_size > u32::MAX as i64 {
            return Err(ConfigError::InvalidPoolSize(worker_pool_size));
        }

        Ok(Self {
            task_count: task_count as u32,
            worker_pool_size: worker_pool_size as u32,
            store_path: store_path.into(),
            store_kind: StoreKind::Log,
            store_write_retries: DEFAULT_STORE_WRITE_RETRIES,
            store_retry_backoff: DEFAULT_STORE_RETRY_BACKOFF,
            task_timeout: None,
            stall_grace: Duration::ZERO,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_count == 0 {
            return Err(ConfigError::InvalidTaskCount(0));
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize(0));
        }
        if self.task_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroTaskTimeout);
        }
        Ok(())
    }

    pub fn task_space(&self) -> TaskSpace {
        TaskSpace::new(self.task_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rechaza_conteos_no_positivos() {
        assert_eq!(
            RunConfig::new(0, 4, "/tmp/x").unwrap_err(),
            ConfigError::InvalidTaskCount(0)
        );
        assert_eq!(
            RunConfig::new(10, -1, "/tmp/x").unwrap_err(),
            ConfigError::InvalidPoolSize(-1)
        );
    }

    #[test]
    fn defaults_razonables() {
        let cfg = RunConfig::new(50, 4, "/tmp/log.txt").unwrap();
        assert_eq!(cfg.task_space(), TaskSpace::new(50));
        assert_eq!(cfg.store_kind, StoreKind::Log);
        assert_eq!(cfg.store_write_retries, DEFAULT_STORE_WRITE_RETRIES);
        assert!(cfg.task_timeout.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn timeout_cero_es_invalido() {
        let mut cfg = RunConfig::new(1, 1, "/tmp/log.txt").unwrap();
        cfg.task_timeout = Some(Duration::ZERO);
        assert_eq!(cfg.validate().unwrap_err(), ConfigError::ZeroTaskTimeout);
    }
}
