use std::{
    collections::BTreeSet,
    fs::{self, File},
    io::{BufWriter, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

use super::{ProgressStore, StoreError};
use crate::task::TaskId;

/// Estado completo guardado junto con el paso en que se tomo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<S> {
    pub step: u64,
    pub state: S,
}

/// Checkpoint de estado completo en un archivo JSON.
///
/// Sirve cuando el trabajo no son tareas independientes sino pasos de un
/// mismo estado que evoluciona: se guarda todo el estado cada tanto y al
/// reiniciar se retoma desde el ultimo snapshot. Cada `save` escribe un
/// temporal y lo renombra encima, asi nunca queda un snapshot a medias.
pub struct Checkpoint<S> {
    path: PathBuf,
    _state: PhantomData<fn() -> S>,
}

impl<S: Serialize + DeserializeOwned> Checkpoint<S> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _state: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    pub fn save(&self, step: u64, state: &S) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        let tmp = self.tmp_path();
        let file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer(&mut writer, &Snapshot { step, state }).map_err(|e| {
            StoreError::Serde {
                path: tmp.clone(),
                source: e,
            }
        })?;

        let file = writer
            .into_inner()
            .map_err(|e| StoreError::io(&tmp, e.into_error()))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;

        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        debug!("checkpoint guardado en paso {} ({})", step, self.path.display());
        Ok(())
    }

    /// Ultimo snapshot, o `None` si nunca se guardo uno.
    pub fn load(&self) -> Result<Option<Snapshot<S>>, StoreError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let snapshot = serde_json::from_slice(&raw).map_err(|e| StoreError::Serde {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(Some(snapshot))
    }

    /// Borra el snapshot (al terminar bien, para que la proxima corrida arranque de cero).
    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }
}

/// Progress store sobre `Checkpoint`: cada `mark_complete` reescribe el
/// conjunto completo de ids terminados.
pub struct SnapshotStore {
    checkpoint: Checkpoint<BTreeSet<TaskId>>,
    inner: Mutex<Snapshot<BTreeSet<TaskId>>>,
}

impl SnapshotStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let checkpoint = Checkpoint::new(path);
        let snapshot = checkpoint.load()?.unwrap_or(Snapshot {
            step: 0,
            state: BTreeSet::new(),
        });

        info!(
            "snapshot {} abierto: paso {}, {} tareas completas",
            checkpoint.path().display(),
            snapshot.step,
            snapshot.state.len()
        );

        Ok(Self {
            checkpoint,
            inner: Mutex::new(snapshot),
        })
    }
}

impl ProgressStore for SnapshotStore {
    fn is_complete(&self, id: TaskId) -> Result<bool, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.state.contains(&id))
    }

    fn mark_complete(&self, id: TaskId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        if inner.state.contains(&id) {
            return Ok(());
        }

        let mut next = inner.state.clone();
        next.insert(id);
        let step = inner.step + 1;

        // solo se actualiza la memoria si el archivo quedo escrito
        self.checkpoint.save(step, &next)?;
        inner.step = step;
        inner.state = next;
        Ok(())
    }

    fn completed_count(&self) -> Result<usize, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.state.len())
    }

    fn reset(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        self.checkpoint.clear()?;
        inner.step = 0;
        inner.state.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Star {
        x: f64,
        y: f64,
        vx: f64,
        vy: f64,
    }

    #[test]
    fn checkpoint_guarda_y_recupera_estado() {
        let dir = tempfile::tempdir().unwrap();
        let cp: Checkpoint<Vec<Star>> = Checkpoint::new(dir.path().join("checkpoint.json"));

        assert!(cp.load().unwrap().is_none());

        let stars = vec![Star { x: 1.0, y: 2.0, vx: 0.0, vy: 0.5 }];
        cp.save(10, &stars).unwrap();
        cp.save(20, &stars).unwrap();

        let loaded = cp.load().unwrap().unwrap();
        assert_eq!(loaded.step, 20);
        assert_eq!(loaded.state, stars);
        // el temporal no queda tirado
        assert!(!dir.path().join("checkpoint.json.tmp").exists());

        cp.clear().unwrap();
        assert!(cp.load().unwrap().is_none());
        // clear sobre algo inexistente no es error
        cp.clear().unwrap();
    }

    #[test]
    fn snapshot_store_sobrevive_reapertura() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");

        {
            let store = SnapshotStore::open(&path).unwrap();
            store.mark_complete(2).unwrap();
            store.mark_complete(2).unwrap();
            store.mark_complete(0).unwrap();
        }

        let store = SnapshotStore::open(&path).unwrap();
        assert!(store.is_complete(0).unwrap());
        assert!(store.is_complete(2).unwrap());
        assert!(!store.is_complete(1).unwrap());
        assert_eq!(store.completed_count().unwrap(), 2);

        let raw: Snapshot<BTreeSet<TaskId>> =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        // el segundo mark de 2 no genero un paso nuevo
        assert_eq!(raw.step, 2);
    }

    #[test]
    fn snapshot_corrupto_es_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        fs::write(&path, b"{no es json").unwrap();

        assert!(matches!(
            SnapshotStore::open(&path),
            Err(StoreError::Serde { .. })
        ));
    }

    #[test]
    fn reset_borra_el_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let store = SnapshotStore::open(&path).unwrap();
        store.mark_complete(5).unwrap();

        store.reset().unwrap();
        assert!(!path.exists());
        assert_eq!(store.completed_count().unwrap(), 0);
    }
}
