use std::{collections::BTreeSet, sync::Mutex};

use super::{ProgressStore, StoreError};
use crate::task::TaskId;

/// Store en memoria, sin durabilidad. Para tests y corridas de prueba.
#[derive(Default)]
pub struct MemoryStore {
    completed: Mutex<BTreeSet<TaskId>>,
}

impl MemoryStore {
    pub fn with_completed(ids: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            completed: Mutex::new(ids.into_iter().collect()),
        }
    }

    pub fn completed(&self) -> Result<BTreeSet<TaskId>, StoreError> {
        let completed = self.completed.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(completed.clone())
    }
}

impl ProgressStore for MemoryStore {
    fn is_complete(&self, id: TaskId) -> Result<bool, StoreError> {
        let completed = self.completed.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(completed.contains(&id))
    }

    fn mark_complete(&self, id: TaskId) -> Result<(), StoreError> {
        let mut completed = self.completed.lock().map_err(|_| StoreError::Poisoned)?;
        completed.insert(id);
        Ok(())
    }

    fn completed_count(&self) -> Result<usize, StoreError> {
        let completed = self.completed.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(completed.len())
    }

    fn reset(&self) -> Result<(), StoreError> {
        let mut completed = self.completed.lock().map_err(|_| StoreError::Poisoned)?;
        completed.clear();
        Ok(())
    }
}
