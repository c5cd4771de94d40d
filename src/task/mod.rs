//! Tasks: one unit of compiled work plus its scheduling attributes.

pub mod state;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::Notify;

use crate::arena::Key;
use crate::error::{BpuError, Result};
use crate::scheduler::CoreHandle;

use self::state::TaskState;

/// Longest alias accepted by `task_set_alias`, in bytes.
pub const MAX_ALIAS_LEN: usize = 16;

/// Record header of a packed program: payload length, then estimate.
const PACKED_HEADER_LEN: usize = 4 + 8;

/// Opaque handle to a task.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub(crate) Key);

impl TaskHandle {
    pub fn to_raw(self) -> u64 {
        self.0.to_raw()
    }

    pub fn from_raw(raw: u64) -> Self {
        TaskHandle(Key::from_raw(raw))
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{:?}", self.0)
    }
}

/// How completion of a task is observed. Fixed at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// `process` blocks until the task is done.
    Sync = 0x0000,
    /// Completion observed with `task_wait`.
    TrigTask = 0x0001,
    /// Completion observed with `core_wait`.
    TrigCore = 0x0002,
    /// Buffered until triggered by a dependency; completion via `core_wait`.
    Graph = 0x0004,
}

impl TaskType {
    /// Whether completions land in the submitting core handle's ready set.
    pub fn delivers_to_core(self) -> bool {
        matches!(self, TaskType::TrigCore | TaskType::Graph)
    }
}

/// Externally visible task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle = 0,
    Config,
    Bind,
    ConfigBind,
    Process,
    Done,
    Err,
    /// Reported for a handle that does not name a live task.
    Invalid,
    Unknown,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Err)
    }
}

/// One compiled work descriptor. The payload is opaque to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDescriptor {
    payload: Bytes,
    estimated: Duration,
}

impl WorkDescriptor {
    /// `estimated` is the compiler's run time at the highest clock level.
    pub fn new(payload: Bytes, estimated: Duration) -> Self {
        Self { payload, estimated }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn estimated(&self) -> Duration {
        self.estimated
    }

    /// Split a pass-through blob into descriptors.
    ///
    /// Each record is a little-endian `u32` payload length, a little-endian
    /// `u64` estimate in nanoseconds, then the payload itself.
    pub fn unpack(mut blob: Bytes) -> Result<Vec<WorkDescriptor>> {
        let mut program = Vec::new();
        while blob.has_remaining() {
            if blob.remaining() < PACKED_HEADER_LEN {
                return Err(BpuError::invalid(format!(
                    "record {} has a truncated header",
                    program.len()
                )));
            }
            let len = blob.get_u32_le() as usize;
            let estimated = Duration::from_nanos(blob.get_u64_le());
            if blob.remaining() < len {
                return Err(BpuError::invalid(format!(
                    "record {} needs {len} payload bytes, {} left",
                    program.len(),
                    blob.remaining()
                )));
            }
            program.push(WorkDescriptor::new(blob.split_to(len), estimated));
        }
        Ok(program)
    }

    /// Inverse of [`WorkDescriptor::unpack`].
    pub fn pack(program: &[WorkDescriptor]) -> Bytes {
        let mut buf = BytesMut::new();
        for d in program {
            buf.put_u32_le(d.payload.len() as u32);
            buf.put_u64_le(u64::try_from(d.estimated.as_nanos()).unwrap_or(u64::MAX));
            buf.put_slice(&d.payload);
        }
        buf.freeze()
    }
}

/// Side-channel memory passed to the firmware alongside the descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtraMemory {
    pub addr: u64,
    pub size: u32,
}

/// What a completion callback wants done with the task afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// The callback handled the completion; skip the core's ready set.
    Consumed,
    /// Also deliver the task through `core_wait`.
    Forward,
}

/// Completion callback. Runs on a core worker, never under the runtime lock.
pub type TaskCallback = Arc<dyn Fn(TaskHandle, TaskStatus) -> CallbackAction + Send + Sync>;

/// Debug observer for every status change `(task, from, to)`.
pub type StatusHook = Arc<dyn Fn(TaskHandle, TaskStatus, TaskStatus) + Send + Sync>;

/// What released a graph task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// An upstream producer's frame; the frame id becomes the task id.
    Frame(u64),
    /// Another task; its correlation id is inherited.
    Task(TaskHandle),
}

/// Per-task bookkeeping held in the runtime arena.
pub(crate) struct TaskRecord {
    pub kind: TaskType,
    pub state: TaskState,
    pub priority: u32,
    pub group: u32,
    pub id: u64,
    pub alias: String,
    pub callback: Option<TaskCallback>,
    pub status_hook: Option<StatusHook>,
    /// Core handle the task was last submitted through.
    pub via: Option<CoreHandle>,
    /// Graph tasks stay buffered until this is set.
    pub triggered: bool,
    /// Graph tasks released when this task finishes successfully.
    pub downstream: Vec<TaskHandle>,
    /// Set by `task_cancel`, cleared by the next submission.
    pub cancelled: bool,
    pub notify: Arc<Notify>,
}

impl TaskRecord {
    pub fn new(kind: TaskType, serial: u64) -> Self {
        Self {
            kind,
            state: TaskState::Idle,
            priority: 0,
            group: 0,
            id: 0,
            alias: format!("T{serial}"),
            callback: None,
            status_hook: None,
            via: None,
            triggered: false,
            downstream: Vec::new(),
            cancelled: false,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    pub fn set_alias(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_ALIAS_LEN {
            return Err(BpuError::invalid(format!(
                "alias must be 1..={MAX_ALIAS_LEN} bytes, got {}",
                name.len()
            )));
        }
        self.alias = name.to_string();
        Ok(())
    }

    /// Slots a submission of this task occupies in a core fifo.
    pub fn slots(&self) -> u32 {
        match &self.state {
            TaskState::Config { program } | TaskState::ConfigBind { program, .. } => {
                program.len() as u32
            }
            TaskState::Process(sub) => sub.program.len() as u32,
            _ => 0,
        }
    }

    /// Sum of descriptor estimates at the highest clock, saturating at
    /// `Duration::MAX`.
    pub fn estimate(&self) -> Duration {
        let program = match &self.state {
            TaskState::Config { program } | TaskState::ConfigBind { program, .. } => program,
            TaskState::Process(sub) => &sub.program,
            _ => return Duration::ZERO,
        };
        program
            .iter()
            .map(WorkDescriptor::estimated)
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}
