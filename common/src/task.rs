use serde::{Deserialize, Serialize};

/// Identificador de una unidad de trabajo, en `[0, N)`.
/// No lleva payload: la funcion de trabajo lo deriva del id.
pub type TaskId = u32;

/// Espacio de tareas de una corrida: `0..len`, totalmente ordenado.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpace {
    pub len: u32,
}

impl TaskSpace {
    pub fn new(len: u32) -> Self {
        Self { len }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        id < self.len
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> {
        0..self.len
    }
}

/// Mensaje master -> worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assignment {
    Task { id: TaskId },
    Stop,
}

/// Mensaje worker -> master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Report {
    Done { id: TaskId },
    Failed { id: TaskId, reason: String },
}

impl Report {
    pub fn task_id(&self) -> TaskId {
        match self {
            Report::Done { id } | Report::Failed { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assignment_usa_kind_como_tag() {
        let task = serde_json::to_value(Assignment::Task { id: 7 }).unwrap();
        assert_eq!(task, json!({"kind": "task", "id": 7}));

        let stop = serde_json::to_value(Assignment::Stop).unwrap();
        assert_eq!(stop, json!({"kind": "stop"}));
    }

    #[test]
    fn report_failed_lleva_razon() {
        let raw = json!({"kind": "failed", "id": 3, "reason": "sin memoria"});
        let report: Report = serde_json::from_value(raw).unwrap();

        assert_eq!(
            report,
            Report::Failed {
                id: 3,
                reason: "sin memoria".to_string()
            }
        );
        assert_eq!(report.task_id(), 3);
    }

    #[test]
    fn task_space_itera_en_orden() {
        let space = TaskSpace::new(4);
        assert_eq!(space.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(space.contains(3));
        assert!(!space.contains(4));
    }
}
