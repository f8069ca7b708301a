//! Funciones de trabajo de demostracion.
//!
//! El scheduler no sabe nada de lo que se calcula: una funcion de trabajo es
//! una funcion pura del `TaskId` (mas parametros fijos de la corrida), asi que
//! redespachar una tarea despues de un crash da el mismo resultado.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::task::TaskId;

pub trait WorkFn: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Corre en un hilo bloqueante; puede tardar lo que quiera.
    fn execute(&self, id: TaskId) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Simula trabajo pesado durmiendo un rato
    Sleep,
    /// Cuenta primos en un bloque de enteros
    Primes,
    /// Suma parcial de la integral de 4/(1+x^2) en [0,1]
    Pi,
}

/// Parametros fijos de la corrida que usan las funciones de trabajo.
#[derive(Debug, Clone)]
pub struct WorkParams {
    pub task_count: u32,
    pub sleep: Duration,
    pub prime_block: u64,
    pub pi_steps_per_task: u64,
}

impl Default for WorkParams {
    fn default() -> Self {
        Self {
            task_count: 1,
            sleep: Duration::from_secs(1),
            prime_block: 100_000,
            pi_steps_per_task: 1_000_000,
        }
    }
}

/// Flags de CLI compartidos por `master local` y el binario `worker`.
#[derive(Debug, Clone, Args)]
pub struct WorkArgs {
    /// Funcion de trabajo a ejecutar por tarea
    #[arg(long, env = "WORK", value_enum, default_value_t = WorkKind::Sleep)]
    pub work: WorkKind,

    /// Duracion de cada tarea con `--work sleep`
    #[arg(long, env = "WORK_SLEEP_MS", default_value_t = 1000)]
    pub sleep_ms: u64,

    /// Enteros por bloque con `--work primes`
    #[arg(long, env = "WORK_PRIME_BLOCK", default_value_t = 100_000)]
    pub prime_block: u64,

    /// Rectangulos por tarea con `--work pi`
    #[arg(long, env = "WORK_PI_STEPS", default_value_t = 1_000_000)]
    pub pi_steps: u64,
}

impl WorkArgs {
    pub fn params(&self, task_count: u32) -> WorkParams {
        WorkParams {
            task_count,
            sleep: Duration::from_millis(self.sleep_ms),
            prime_block: self.prime_block,
            pi_steps_per_task: self.pi_steps,
        }
    }

    pub fn build(&self, task_count: u32) -> Arc<dyn WorkFn> {
        build_work(self.work, &self.params(task_count))
    }
}

pub fn build_work(kind: WorkKind, params: &WorkParams) -> Arc<dyn WorkFn> {
    match kind {
        WorkKind::Sleep => Arc::new(SleepWork {
            duration: params.sleep,
        }),
        WorkKind::Primes => Arc::new(PrimeCount {
            block: params.prime_block.max(1),
        }),
        WorkKind::Pi => Arc::new(PiSlice {
            task_count: params.task_count.max(1),
            steps_per_task: params.pi_steps_per_task.max(1),
        }),
    }
}

pub struct SleepWork {
    pub duration: Duration,
}

impl WorkFn for SleepWork {
    fn name(&self) -> &'static str {
        "sleep"
    }

    fn execute(&self, id: TaskId) -> Result<Value> {
        std::thread::sleep(self.duration);
        // el id de vuelta es la prueba de trabajo
        Ok(json!({ "task": id }))
    }
}

pub struct PrimeCount {
    pub block: u64,
}

fn is_prime(n: u64) -> bool {
    if n <= 1 {
        return false;
    }
    if n <= 3 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut i = 5u64;
    while i * i <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

impl WorkFn for PrimeCount {
    fn name(&self) -> &'static str {
        "primes"
    }

    fn execute(&self, id: TaskId) -> Result<Value> {
        let Some((start, end)) = (id as u64)
            .checked_mul(self.block)
            .and_then(|start| Some((start, start.checked_add(self.block)?)))
        else {
            bail!("bloque {} fuera de rango", id);
        };
        let count = (start..end).filter(|n| is_prime(*n)).count();
        Ok(json!({ "task": id, "start": start, "end": end, "primes": count }))
    }
}

pub struct PiSlice {
    pub task_count: u32,
    pub steps_per_task: u64,
}

impl WorkFn for PiSlice {
    fn name(&self) -> &'static str {
        "pi"
    }

    fn execute(&self, id: TaskId) -> Result<Value> {
        let Some(total) = (self.task_count as u64).checked_mul(self.steps_per_task) else {
            bail!("{} tareas x {} pasos no entra en u64", self.task_count, self.steps_per_task);
        };
        let Some((first, end)) = (id as u64)
            .checked_mul(self.steps_per_task)
            .and_then(|first| Some((first, first.checked_add(self.steps_per_task)?)))
        else {
            bail!("tramo {} fuera de rango", id);
        };
        let width = 1.0 / total as f64;

        let mut area = 0.0;
        for step in first..end {
            let x = (step as f64 + 0.5) * width;
            area += 4.0 / (1.0 + x * x);
        }
        Ok(json!({ "task": id, "partial": area * width }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primos_del_primer_bloque() {
        let work = PrimeCount { block: 100 };
        let out = work.execute(0).unwrap();
        assert_eq!(out["primes"], json!(25));

        let out = work.execute(1).unwrap();
        assert_eq!(out["start"], json!(100));
        assert_eq!(out["primes"], json!(21));
    }

    #[test]
    fn pi_sumando_todas_las_tareas() {
        let params = WorkParams {
            task_count: 8,
            pi_steps_per_task: 10_000,
            ..WorkParams::default()
        };
        let work = build_work(WorkKind::Pi, &params);

        let pi: f64 = (0..8)
            .map(|id| work.execute(id).unwrap()["partial"].as_f64().unwrap())
            .sum();
        assert!((pi - std::f64::consts::PI).abs() < 1e-6);
        assert_eq!(work.name(), "pi");
    }

    #[test]
    fn parametros_enormes_fallan_sin_desbordar() {
        let work = PrimeCount { block: u64::MAX };
        assert!(work.execute(2).is_err());
        let work = PrimeCount { block: u64::MAX / 2 };
        assert!(work.execute(3).is_err());

        let work = PiSlice {
            task_count: 4,
            steps_per_task: u64::MAX / 2,
        };
        assert!(work.execute(0).is_err());

        let work = PiSlice {
            task_count: 1,
            steps_per_task: u64::MAX,
        };
        assert!(work.execute(1).is_err());
    }

    #[test]
    fn sleep_devuelve_el_id() {
        let work = SleepWork {
            duration: Duration::from_millis(1),
        };
        assert_eq!(work.execute(9).unwrap(), json!({ "task": 9 }));
    }
}
