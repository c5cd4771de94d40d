//! Task lifecycle as a sum type.
//!
//! Each state carries exactly the data that is meaningful in it. Transition
//! methods take `&self` and return the successor, so an illegal transition
//! is reported as `Invalid` and leaves the current state untouched.

use std::sync::Arc;

use crate::error::{BpuError, Result};
use crate::task::{ExtraMemory, TaskStatus, WorkDescriptor};

/// Compiled descriptors shared between the task and the core running it.
pub type Program = Arc<[WorkDescriptor]>;

/// A task that has been handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Submitted {
    pub program: Program,
    pub extra: Option<ExtraMemory>,
    pub core: u32,
    /// Set once the core has taken the task out of its fifo.
    pub started: bool,
}

/// A task whose execution has ended.
#[derive(Debug, Clone)]
pub struct Finished {
    pub program: Program,
    pub extra: Option<ExtraMemory>,
    pub core: u32,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TaskState {
    Idle,
    Config { program: Program },
    Bind { extra: ExtraMemory },
    ConfigBind { program: Program, extra: ExtraMemory },
    Process(Submitted),
    Done(Finished),
    Err(Finished),
}

impl TaskState {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskState::Idle => TaskStatus::Idle,
            TaskState::Config { .. } => TaskStatus::Config,
            TaskState::Bind { .. } => TaskStatus::Bind,
            TaskState::ConfigBind { .. } => TaskStatus::ConfigBind,
            TaskState::Process(_) => TaskStatus::Process,
            TaskState::Done(_) => TaskStatus::Done,
            TaskState::Err(_) => TaskStatus::Err,
        }
    }

    fn illegal(&self, op: &str) -> BpuError {
        BpuError::invalid(format!("cannot {op} a task in state {:?}", self.status()))
    }

    /// Attach compiled descriptors. Reconfiguring a configured task replaces them.
    pub fn configure(&self, program: Program) -> Result<TaskState> {
        if program.is_empty() {
            return Err(BpuError::invalid("a task needs at least one descriptor"));
        }
        match self {
            TaskState::Idle | TaskState::Config { .. } => Ok(TaskState::Config { program }),
            TaskState::Bind { extra } | TaskState::ConfigBind { extra, .. } => {
                Ok(TaskState::ConfigBind {
                    program,
                    extra: *extra,
                })
            }
            _ => Err(self.illegal("configure")),
        }
    }

    pub fn bind(&self, extra: ExtraMemory) -> Result<TaskState> {
        match self {
            TaskState::Idle => Ok(TaskState::Bind { extra }),
            TaskState::Config { program } => Ok(TaskState::ConfigBind {
                program: program.clone(),
                extra,
            }),
            TaskState::Bind { .. } | TaskState::ConfigBind { .. } => {
                Err(BpuError::invalid("extra memory already bound; unbind first"))
            }
            _ => Err(self.illegal("bind")),
        }
    }

    pub fn unbind(&self) -> Result<TaskState> {
        match self {
            TaskState::Bind { .. } => Ok(TaskState::Idle),
            TaskState::ConfigBind { program, .. } => Ok(TaskState::Config {
                program: program.clone(),
            }),
            TaskState::Idle | TaskState::Config { .. } => {
                Err(BpuError::invalid("no extra memory bound"))
            }
            _ => Err(self.illegal("unbind")),
        }
    }

    /// Hand the task to `core`; it is buffered, not yet started.
    pub fn submit(&self, core: u32) -> Result<TaskState> {
        let (program, extra) = match self {
            TaskState::Config { program } => (program.clone(), None),
            TaskState::ConfigBind { program, extra } => (program.clone(), Some(*extra)),
            _ => return Err(self.illegal("submit")),
        };
        Ok(TaskState::Process(Submitted {
            program,
            extra,
            core,
            started: false,
        }))
    }

    pub fn start(&self) -> Result<TaskState> {
        match self {
            TaskState::Process(sub) if !sub.started => Ok(TaskState::Process(Submitted {
                started: true,
                ..sub.clone()
            })),
            _ => Err(self.illegal("start")),
        }
    }

    /// End a started task; `None` means success.
    pub fn finish(&self, failure: Option<String>) -> Result<TaskState> {
        match self {
            TaskState::Process(sub) if sub.started => {
                let finished = Finished {
                    program: sub.program.clone(),
                    extra: sub.extra,
                    core: sub.core,
                    reason: failure,
                };
                Ok(if finished.reason.is_some() {
                    TaskState::Err(finished)
                } else {
                    TaskState::Done(finished)
                })
            }
            _ => Err(self.illegal("finish")),
        }
    }

    /// Revert a buffered task to its pre-submission state.
    pub fn cancel(&self) -> Result<TaskState> {
        match self {
            TaskState::Process(sub) if sub.started => Err(BpuError::Cancelled(
                "task already started on the core; cancel after start is unsupported".into(),
            )),
            TaskState::Process(sub) => Ok(match sub.extra {
                Some(extra) => TaskState::ConfigBind {
                    program: sub.program.clone(),
                    extra,
                },
                None => TaskState::Config {
                    program: sub.program.clone(),
                },
            }),
            _ => Err(self.illegal("cancel")),
        }
    }

    pub fn check_free(&self) -> Result<()> {
        match self {
            TaskState::Process(_) => Err(BpuError::invalid(
                "task is being processed; cancel or wait before freeing",
            )),
            _ => Ok(()),
        }
    }

    /// Configuration may only change before submission.
    pub fn check_mutable(&self) -> Result<()> {
        match self {
            TaskState::Idle
            | TaskState::Config { .. }
            | TaskState::Bind { .. }
            | TaskState::ConfigBind { .. } => Ok(()),
            _ => Err(self.illegal("modify")),
        }
    }

    pub fn assigned_core(&self) -> Option<u32> {
        match self {
            TaskState::Process(sub) => Some(sub.core),
            TaskState::Done(fin) | TaskState::Err(fin) => Some(fin.core),
            _ => None,
        }
    }

    /// Descriptors attached to the task, whatever its stage.
    pub fn program(&self) -> Option<&Program> {
        match self {
            TaskState::Config { program } | TaskState::ConfigBind { program, .. } => Some(program),
            TaskState::Process(sub) => Some(&sub.program),
            TaskState::Done(fin) | TaskState::Err(fin) => Some(&fin.program),
            TaskState::Idle | TaskState::Bind { .. } => None,
        }
    }

    pub fn submitted(&self) -> Option<&Submitted> {
        match self {
            TaskState::Process(sub) => Some(sub),
            _ => None,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, TaskState::Process(sub) if sub.started)
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            TaskState::Err(fin) => fin.reason.as_deref(),
            _ => None,
        }
    }
}
