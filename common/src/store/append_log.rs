use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{info, warn};

use super::{ProgressStore, StoreError};
use crate::task::TaskId;

/// Log append-only de tareas completadas: un id decimal por linea.
///
/// Nunca se reescribe en el lugar. Si el proceso muere a mitad de un append,
/// como mucho se pierde ese registro (la cola rota se descarta al abrir),
/// nunca el historial completo.
pub struct LogStore {
    path: PathBuf,
    inner: Mutex<LogInner>,
}

struct LogInner {
    file: File,
    completed: HashSet<TaskId>,
    /// Largo del archivo hasta el ultimo registro escrito completo.
    committed_len: u64,
}

impl LogStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .map_err(|e| StoreError::io(&path, e))?;

        let (completed, committed_len) = parse_log(&path, &raw)?;

        if committed_len < raw.len() as u64 {
            warn!(
                "{}: descartando registro incompleto al final ({} bytes)",
                path.display(),
                raw.len() as u64 - committed_len
            );
            file.set_len(committed_len)
                .and_then(|_| file.sync_data())
                .map_err(|e| StoreError::io(&path, e))?;
        }

        info!(
            "progress log {} abierto: {} tareas completas registradas",
            path.display(),
            completed.len()
        );

        Ok(Self {
            path,
            inner: Mutex::new(LogInner {
                file,
                completed,
                committed_len,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Devuelve los ids y el largo de la parte valida del log.
fn parse_log(path: &Path, raw: &[u8]) -> Result<(HashSet<TaskId>, u64), StoreError> {
    let mut completed = HashSet::new();
    let mut offset = 0usize;

    for (idx, chunk) in raw.split_inclusive(|b| *b == b'\n').enumerate() {
        if chunk.last() != Some(&b'\n') {
            // cola sin newline: append cortado por un crash
            break;
        }
        offset += chunk.len();

        let line = String::from_utf8_lossy(chunk);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let id = trimmed.parse::<TaskId>().map_err(|_| StoreError::Corrupt {
            path: path.to_path_buf(),
            line: idx + 1,
            content: trimmed.to_string(),
        })?;
        completed.insert(id);
    }

    Ok((completed, offset as u64))
}

impl ProgressStore for LogStore {
    fn is_complete(&self, id: TaskId) -> Result<bool, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.completed.contains(&id))
    }

    fn mark_complete(&self, id: TaskId) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let inner = &mut *guard;

        if inner.completed.contains(&id) {
            return Ok(());
        }

        let record = format!("{}\n", id);
        let file = &mut inner.file;
        let result = file
            .write_all(record.as_bytes())
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data());

        if let Err(e) = result {
            // un append a medias dejaria basura pegada al proximo registro
            if let Err(trunc) = inner.file.set_len(inner.committed_len) {
                warn!(
                    "{}: no se pudo truncar tras append fallido: {}",
                    self.path.display(),
                    trunc
                );
            }
            return Err(StoreError::io(&self.path, e));
        }

        inner.committed_len += record.len() as u64;
        inner.completed.insert(id);
        Ok(())
    }

    fn completed_count(&self) -> Result<usize, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.completed.len())
    }

    fn reset(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let inner = &mut *guard;
        inner
            .file
            .set_len(0)
            .and_then(|_| inner.file.sync_data())
            .map_err(|e| StoreError::io(&self.path, e))?;
        inner.completed.clear();
        inner.committed_len = 0;
        info!("progress log {} reseteado", self.path.display());
        Ok(())
    }
}
