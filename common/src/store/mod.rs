//! Registro durable de tareas completadas.
//!
//! El scheduler es el unico escritor. Al arrancar calcula
//! `outstanding = TaskSpace - completadas` y ese es todo el mecanismo de
//! recuperacion: un reinicio reconstruye exactamente el trabajo pendiente.

mod append_log;
mod memory;
mod snapshot;

use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

use thiserror::Error;

use crate::config::StoreKind;
use crate::task::{TaskId, TaskSpace};

pub use append_log::LogStore;
pub use memory::MemoryStore;
pub use snapshot::{Checkpoint, Snapshot, SnapshotStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("error de I/O en {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} linea {line}: registro invalido {content:?}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("snapshot invalido en {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("lock del store envenenado")]
    Poisoned,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Contrato del progress store.
///
/// Un error de I/O nunca se reporta como "completa": ante la duda se devuelve
/// error. Todas las operaciones toman `&self` y cada implementacion serializa
/// internamente, asi que es seguro llamarlas desde varios lados.
pub trait ProgressStore: Send + Sync {
    fn is_complete(&self, id: TaskId) -> Result<bool, StoreError>;

    /// Append durable. Idempotente: marcar dos veces el mismo id no escribe nada
    /// la segunda vez.
    fn mark_complete(&self, id: TaskId) -> Result<(), StoreError>;

    /// Cantidad de registros, incluidos ids fuera del espacio actual.
    fn completed_count(&self) -> Result<usize, StoreError>;

    /// Borra todo el historial. Solo para el operador, entre corridas.
    fn reset(&self) -> Result<(), StoreError>;

    fn load_outstanding(&self, space: TaskSpace) -> Result<BTreeSet<TaskId>, StoreError> {
        let mut outstanding = BTreeSet::new();
        for id in space.iter() {
            if !self.is_complete(id)? {
                outstanding.insert(id);
            }
        }
        Ok(outstanding)
    }
}

pub fn open_store(
    kind: StoreKind,
    path: impl Into<PathBuf>,
) -> Result<Arc<dyn ProgressStore>, StoreError> {
    let path = path.into();
    let store: Arc<dyn ProgressStore> = match kind {
        StoreKind::Log => Arc::new(LogStore::open(path)?),
        StoreKind::Snapshot => Arc::new(SnapshotStore::open(path)?),
    };
    Ok(store)
}
