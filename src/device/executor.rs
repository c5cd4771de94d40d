//! The device boundary: something that runs a task's descriptors on a core.
//!
//! The dispatcher never touches hardware directly. Each physical core worker
//! hands a [`Job`] to an [`Executor`] and turns the [`JobOutcome`] into the
//! task's terminal status.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::SimulationConfig;
use crate::task::{ExtraMemory, TaskHandle, WorkDescriptor};

/// A task handed to a physical core for execution.
#[derive(Debug, Clone)]
pub struct Job {
    pub core: u32,
    pub task: TaskHandle,
    pub priority: u32,
    pub program: Arc<[WorkDescriptor]>,
    pub extra: Option<ExtraMemory>,
    /// Descriptor estimate already scaled to the core's clock.
    pub expected: Duration,
}

/// Result reported by the device for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Failed(String),
}

/// Runs jobs on a physical core.
///
/// Implementations must not call back into the runtime from `execute`; the
/// worker already holds no locks while awaiting it.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &Job) -> JobOutcome;
}

/// Software stand-in for accelerator firmware.
///
/// Sleeps for the job's expected duration (times `time_scale`), fails jobs
/// carrying an empty descriptor payload, and optionally injects random faults.
pub struct SimulatedExecutor {
    time_scale: f64,
    fault_rate: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedExecutor {
    pub fn new(cfg: &SimulationConfig) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            time_scale: cfg.time_scale,
            fault_rate: cfg.fault_rate,
            rng: Mutex::new(rng),
        }
    }

    fn inject_fault(&self) -> bool {
        if self.fault_rate <= 0.0 {
            return false;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen_bool(self.fault_rate.min(1.0))
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn execute(&self, job: &Job) -> JobOutcome {
        if let Some(pos) = job.program.iter().position(|d| d.payload().is_empty()) {
            return JobOutcome::Failed(format!("descriptor {pos} has an empty payload"));
        }

        let run_for = Duration::try_from_secs_f64(job.expected.as_secs_f64() * self.time_scale)
            .unwrap_or(Duration::MAX);
        if !run_for.is_zero() {
            tokio::time::sleep(run_for).await;
        } else {
            tokio::task::yield_now().await;
        }

        if self.inject_fault() {
            debug!(core = job.core, task = ?job.task, "simulated fault injected");
            return JobOutcome::Failed("simulated device fault".to_string());
        }
        JobOutcome::Done
    }
}
