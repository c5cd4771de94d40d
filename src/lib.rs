//! accel-dispatch -- task scheduling and resource arbitration for multi-core
//! compute accelerators.
//!
//! Callers open a [`CoreHandle`] over a mask of physical cores, allocate and
//! configure tasks, and submit them through the handle. Each physical core
//! buffers work in a bounded priority fifo; completions are observed
//! synchronously, per task, per core handle, or through a callback.
//!
//! ```no_run
//! use std::time::Duration;
//! use accel_dispatch::{ChooseMethod, DispatchConfig, Runtime, TaskType, WorkDescriptor};
//!
//! # async fn demo() -> accel_dispatch::Result<()> {
//! let rt = Runtime::new(DispatchConfig::load_or_default())?;
//! let core = rt.core_open(0b11, ChooseMethod::ByCapacity)?;
//! let task = rt.task_alloc(TaskType::TrigCore);
//! rt.task_config(task, vec![WorkDescriptor::new(vec![1u8, 2, 3].into(), Duration::from_micros(400))])?;
//! rt.process(core, task).await?;
//! let done = rt.core_wait(core, Some(Duration::from_secs(1))).await?;
//! rt.task_free(done)?;
//! rt.core_close(core)?;
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod config;
pub mod debug;
pub mod device;
pub mod error;
pub mod mem;
pub mod runtime;
pub mod scheduler;
pub mod task;

pub use config::DispatchConfig;
pub use device::executor::{Executor, Job, JobOutcome, SimulatedExecutor};
pub use device::{
    CoreFeatures, CoreInfo, CoreType, FirmwareFeatures, PowerState, CLK_OFF, CLK_ON, HIGHEST_FRQ,
};
pub use error::{BpuError, Result};
pub use mem::map::{MapHandle, MapInfo, MapMode};
pub use mem::{CacheOp, CopyDirection, MemFlags, MemKind};
pub use runtime::Runtime;
pub use scheduler::{ChooseMethod, CoreHandle};
pub use task::{
    CallbackAction, ExtraMemory, TaskHandle, TaskStatus, TaskType, TriggerSource, WorkDescriptor,
};

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library version as `(major, minor, patch)`.
pub fn version() -> (u32, u32, u32) {
    let part = |s: &str| s.parse().unwrap_or(0);
    (
        part(env!("CARGO_PKG_VERSION_MAJOR")),
        part(env!("CARGO_PKG_VERSION_MINOR")),
        part(env!("CARGO_PKG_VERSION_PATCH")),
    )
}
