//! Dispatcher: core handles, core selection, per-core fifos and completion
//! bookkeeping.
//!
//! Everything here operates on [`SchedState`], which the runtime keeps behind
//! a single lock. Methods never block and never call user code; callbacks
//! and status hooks are returned to the caller to run after unlocking.

pub mod engine;
pub mod fifo;
pub mod group;

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::arena::{Arena, Key};
use crate::config::DispatchConfig;
use crate::device::executor::{Job, JobOutcome};
use crate::device::{CoreFeatures, DeviceTable, FirmwareFeatures};
use crate::error::{BpuError, Result};
use crate::mem::map::Mapper;
use crate::mem::MemPool;
use crate::task::state::TaskState;
use crate::task::{StatusHook, TaskCallback, TaskHandle, TaskRecord, TaskStatus, TaskType};

use self::fifo::{CoreFifo, FifoEntry};
use self::group::{GroupRegistry, DEFAULT_GROUP};

/// Opaque handle to a set of physical cores opened together.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreHandle(pub(crate) Key);

impl CoreHandle {
    pub fn to_raw(self) -> u64 {
        self.0.to_raw()
    }

    pub fn from_raw(raw: u64) -> Self {
        CoreHandle(Key::from_raw(raw))
    }
}

impl fmt::Debug for CoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core:{:?}", self.0)
    }
}

/// How a multi-core handle picks the physical core for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChooseMethod {
    /// Core with the most free fifo slots.
    ByCapacity,
    /// Core with the lowest estimated load at the task's priority.
    ByEstimatedLoad,
}

pub(crate) struct CoreHandleRecord {
    pub mask: u32,
    pub cores: Vec<u32>,
    pub method: ChooseMethod,
    /// Completed tasks keyed by completion sequence.
    pub ready: BTreeMap<u64, ReadyEntry>,
    pub notify: Arc<Notify>,
    /// Tasks submitted through this handle that are still in `PROCESS`.
    pub in_flight: usize,
}

/// A completion in a handle's ready set.
///
/// `pending` entries hold their place while the task's callback decides
/// whether the completion is forwarded; `core_wait` does not pass them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadyEntry {
    pub task: TaskHandle,
    pub pending: bool,
}

/// Wake every current waiter and leave a permit for the next one.
pub(crate) fn broadcast(notify: &Notify) {
    notify.notify_waiters();
    notify.notify_one();
}

/// A status hook call deferred until the lock is released.
pub(crate) struct HookCall {
    hook: StatusHook,
    task: TaskHandle,
    from: TaskStatus,
    to: TaskStatus,
}

impl HookCall {
    pub fn fire(self) {
        let (task, from, to) = (self.task, self.from, self.to);
        if panic::catch_unwind(AssertUnwindSafe(|| (self.hook)(task, from, to))).is_err() {
            warn!(?task, ?from, ?to, "status hook panicked");
        }
    }
}

/// Outcome of accepting a submission.
pub(crate) struct Submission {
    pub core: u32,
    pub notify: Arc<Notify>,
}

/// What the worker must do after a job finished.
pub(crate) struct Completion {
    pub task: TaskHandle,
    pub status: TaskStatus,
    pub seq: u64,
    pub notify: Arc<Notify>,
    pub callback: Option<TaskCallback>,
    /// Handle holding a pending ready entry until the callback answers.
    pub reserved: Option<CoreHandle>,
    /// Cores holding graph tasks released by this completion.
    pub woken: Vec<u32>,
}

/// All scheduling state guarded by the runtime lock.
pub(crate) struct SchedState {
    pub devices: DeviceTable,
    pub fifos: Vec<CoreFifo>,
    pub groups: GroupRegistry,
    pub tasks: Arena<TaskRecord>,
    pub handles: Arena<CoreHandleRecord>,
    pub mapper: Mapper,
    pub mem: MemPool,
    max_priority: u32,
    next_seq: u64,
    next_completion: u64,
    task_serial: u64,
}

impl SchedState {
    pub fn new(config: &DispatchConfig) -> Self {
        let device = &config.device;
        Self {
            devices: DeviceTable::new(&device.cores),
            fifos: device.cores.iter().map(|c| CoreFifo::new(c.fifo_capacity)).collect(),
            groups: GroupRegistry::new(),
            tasks: Arena::new(),
            handles: Arena::new(),
            mapper: Mapper::new(device.page_size, device.max_mapped_pages),
            mem: MemPool::new(&config.memory, device.page_size),
            max_priority: device.max_priority,
            next_seq: 0,
            next_completion: 0,
            task_serial: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn task(&self, task: TaskHandle) -> Result<&TaskRecord> {
        self.tasks
            .get(task.0)
            .ok_or_else(|| BpuError::invalid(format!("{task:?} is not a live task")))
    }

    pub fn task_mut(&mut self, task: TaskHandle) -> Result<&mut TaskRecord> {
        self.tasks
            .get_mut(task.0)
            .ok_or_else(|| BpuError::invalid(format!("{task:?} is not a live task")))
    }

    pub fn handle(&self, core: CoreHandle) -> Result<&CoreHandleRecord> {
        self.handles
            .get(core.0)
            .ok_or_else(|| BpuError::invalid(format!("{core:?} is not an open core handle")))
    }

    fn handle_mut(&mut self, core: CoreHandle) -> Result<&mut CoreHandleRecord> {
        self.handles
            .get_mut(core.0)
            .ok_or_else(|| BpuError::invalid(format!("{core:?} is not an open core handle")))
    }

    pub fn fifo(&self, index: u32) -> Result<&CoreFifo> {
        self.fifos
            .get(index as usize)
            .ok_or_else(|| BpuError::invalid(format!("core index {index} out of range")))
    }

    pub fn features(&self) -> FirmwareFeatures {
        let cores = (0..self.devices.len() as u32)
            .zip(&self.fifos)
            .filter_map(|(index, fifo)| {
                let device = self.devices.core(index).ok()?;
                let info = self.devices.info(index).ok()?;
                Some(CoreFeatures {
                    index,
                    core_type: info.core_type,
                    firmware_version: info.firmware_version,
                    fifo_capacity: fifo.capacity(),
                    frequency_levels_hz: device.levels_hz().to_vec(),
                })
            })
            .collect();
        FirmwareFeatures {
            cores,
            max_priority: self.max_priority,
            page_size: self.mapper.page_size(),
            max_mapped_pages: self.mapper.max_pages(),
        }
    }

    pub fn est_load(&self, index: u32, priority: u32) -> Result<Duration> {
        let device = self.devices.core(index)?;
        Ok(self.fifo(index)?.est_load(priority, |d| device.scale(d)))
    }

    /// Replace a task's state, recording a deferred hook call if one is set.
    fn transition(&mut self, task: TaskHandle, next: TaskState, hooks: &mut Vec<HookCall>) -> Result<()> {
        let rec = self.task_mut(task)?;
        let from = rec.status();
        rec.state = next;
        let to = rec.status();
        debug!(?task, alias = %rec.alias, ?from, ?to, "task status changed");
        if from == to {
            return Ok(());
        }
        if let Some(hook) = &rec.status_hook {
            hooks.push(HookCall {
                hook: hook.clone(),
                task,
                from,
                to,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Core handles
    // -----------------------------------------------------------------------

    pub fn open(&mut self, mask: u32, method: ChooseMethod) -> Result<CoreHandle> {
        let installed = self.devices.installed_mask();
        let selected = mask & installed;
        if selected == 0 {
            return Err(BpuError::NoCore { mask });
        }
        if selected != mask {
            warn!(mask, installed, "core mask names cores that are not installed; ignoring them");
        }
        let cores: Vec<u32> = (0..32).filter(|i| selected & (1 << i) != 0).collect();
        let key = self.handles.insert(CoreHandleRecord {
            mask: selected,
            cores,
            method,
            ready: BTreeMap::new(),
            notify: Arc::new(Notify::new()),
            in_flight: 0,
        });
        let handle = CoreHandle(key);
        info!(?handle, mask = selected, ?method, "core handle opened");
        Ok(handle)
    }

    /// Release a handle together with every map made through it.
    pub fn close(&mut self, core: CoreHandle) -> Result<()> {
        let rec = self.handle(core)?;
        if rec.in_flight > 0 {
            return Err(BpuError::Busy(format!(
                "{} task(s) still buffered or running; wait or cancel first",
                rec.in_flight
            )));
        }
        let dropped = rec.ready.len();
        self.handles.remove(core.0);
        if dropped > 0 {
            warn!(handle = ?core, dropped, "closed core handle with unretrieved completions");
        }
        let maps = self.mapper.release_owner(core);
        info!(handle = ?core, maps, "core handle closed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub fn alloc_task(&mut self, kind: TaskType) -> TaskHandle {
        let serial = self.task_serial;
        self.task_serial += 1;
        TaskHandle(self.tasks.insert(TaskRecord::new(kind, serial)))
    }

    pub fn check_priority(&self, priority: u32) -> Result<()> {
        if priority > self.max_priority {
            return Err(BpuError::invalid(format!(
                "priority {priority} exceeds maximum {}",
                self.max_priority
            )));
        }
        Ok(())
    }

    /// Apply a pre-submission transition such as configure or bind.
    pub fn reconfigure(
        &mut self,
        task: TaskHandle,
        step: impl FnOnce(&TaskState) -> Result<TaskState>,
        hooks: &mut Vec<HookCall>,
    ) -> Result<()> {
        let next = step(&self.task(task)?.state)?;
        self.transition(task, next, hooks)
    }

    pub fn free_task(&mut self, task: TaskHandle) -> Result<()> {
        self.task(task)?.state.check_free()?;
        self.tasks.remove(task.0);
        debug!(?task, "task freed");
        Ok(())
    }

    /// Pick the physical core for a submission among `cores`.
    ///
    /// Only cores with enough free slots and group share are candidates; the
    /// choice is a snapshot and is never revisited.
    fn choose_core(
        &self,
        cores: &[u32],
        method: ChooseMethod,
        slots: u32,
        group: u32,
        priority: u32,
    ) -> Result<u32> {
        let largest = cores
            .iter()
            .filter_map(|&c| self.fifos.get(c as usize).map(CoreFifo::capacity))
            .max()
            .unwrap_or(0);
        if slots > largest {
            return Err(BpuError::invalid(format!(
                "task needs {slots} slots but the largest fifo holds {largest}"
            )));
        }

        let fits = |&core: &u32| {
            let fifo = &self.fifos[core as usize];
            let used = fifo.group_used(group);
            fifo.remaining() >= slots
                && (used == 0 || used + slots <= self.groups.slot_limit(group, fifo.capacity()))
        };
        let candidates = cores.iter().copied().filter(|c| fits(c));

        let chosen = match method {
            ChooseMethod::ByCapacity => {
                candidates.min_by_key(|&c| (Reverse(self.fifos[c as usize].remaining()), c))
            }
            ChooseMethod::ByEstimatedLoad => candidates.min_by_key(|&c| {
                let load = self.est_load(c, priority).unwrap_or(Duration::MAX);
                (load, c)
            }),
        };
        chosen.ok_or_else(|| {
            BpuError::Busy(format!(
                "no core can buffer {slots} slot(s) for group {group} right now"
            ))
        })
    }

    pub fn submit(
        &mut self,
        core: CoreHandle,
        task: TaskHandle,
        hooks: &mut Vec<HookCall>,
    ) -> Result<Submission> {
        let (cores, method) = {
            let handle = self.handle(core)?;
            (handle.cores.clone(), handle.method)
        };
        let rec = self.task(task)?;
        if !matches!(rec.status(), TaskStatus::Config | TaskStatus::ConfigBind) {
            return Err(BpuError::invalid(format!(
                "cannot submit a task in state {:?}",
                rec.status()
            )));
        }

        let group = if self.groups.proportion(rec.group).is_some() {
            rec.group
        } else {
            warn!(?task, group = rec.group, "task group was deleted; using default weighting");
            DEFAULT_GROUP
        };
        let priority = rec.priority;
        let slots = rec.slots();
        let estimate = rec.estimate();
        let runnable = rec.kind != TaskType::Graph;

        let index = match self.choose_core(&cores, method, slots, group, priority) {
            Ok(index) => index,
            Err(e) => {
                warn!(?task, handle = ?core, slots, group, error = %e, "submission rejected");
                return Err(e);
            }
        };
        let next = rec.state.submit(index)?;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.fifos[index as usize].push(FifoEntry {
            task,
            seq,
            priority,
            group,
            slots,
            estimate,
            runnable,
        });

        let rec = self.task_mut(task)?;
        rec.via = Some(core);
        rec.cancelled = false;
        rec.triggered = false;
        let notify = rec.notify.clone();
        self.handle_mut(core)?.in_flight += 1;
        self.transition(task, next, hooks)?;

        debug!(?task, core = index, priority, group, slots, seq, "task buffered");
        Ok(Submission {
            core: index,
            notify,
        })
    }

    /// Revert a buffered task. The fifo slot is released before returning.
    pub fn cancel(&mut self, task: TaskHandle, hooks: &mut Vec<HookCall>) -> Result<Arc<Notify>> {
        let rec = self.task(task)?;
        let next = rec.state.cancel()?;
        let index = rec
            .state
            .assigned_core()
            .ok_or_else(|| BpuError::Unknown("processing task without a core".into()))?;
        let via = rec.via;

        if self.fifos[index as usize].remove(task).is_none() {
            return Err(BpuError::Unknown(format!("{task:?} missing from core {index} fifo")));
        }
        if let Some(handle) = via.and_then(|h| self.handles.get_mut(h.0)) {
            handle.in_flight = handle.in_flight.saturating_sub(1);
        }
        let rec = self.task_mut(task)?;
        rec.cancelled = true;
        let notify = rec.notify.clone();
        self.transition(task, next, hooks)?;
        info!(?task, core = index, "task cancelled before start");
        Ok(notify)
    }

    // -----------------------------------------------------------------------
    // Graph triggers
    // -----------------------------------------------------------------------

    /// Release a buffered graph task, giving it the correlation id `id`.
    pub fn trigger(&mut self, task: TaskHandle, id: u64) -> Result<u32> {
        let rec = self.task_mut(task)?;
        if rec.kind != TaskType::Graph {
            return Err(BpuError::invalid("only graph tasks can be triggered"));
        }
        let index = match &rec.state {
            TaskState::Process(sub) if !sub.started => sub.core,
            _ => return Err(BpuError::invalid("graph task is not waiting in a fifo")),
        };
        if rec.triggered {
            return Err(BpuError::invalid("graph task already triggered"));
        }
        rec.triggered = true;
        rec.id = id;
        if !self.fifos[index as usize].mark_runnable(task) {
            return Err(BpuError::Unknown(format!("{task:?} missing from core {index} fifo")));
        }
        debug!(?task, core = index, id, "graph task triggered");
        Ok(index)
    }

    pub fn link(&mut self, upstream: TaskHandle, graph: TaskHandle) -> Result<()> {
        if upstream == graph {
            return Err(BpuError::invalid("a task cannot trigger itself"));
        }
        if self.task(graph)?.kind != TaskType::Graph {
            return Err(BpuError::invalid("link target must be a graph task"));
        }
        let rec = self.task_mut(upstream)?;
        if !rec.downstream.contains(&graph) {
            rec.downstream.push(graph);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Move the next runnable task on `index` to running, if the core is free.
    pub fn start_next(&mut self, index: u32, hooks: &mut Vec<HookCall>) -> Option<Job> {
        if !self.devices.core(index).ok()?.can_run()
            || self.fifos.get(index as usize)?.running().is_some()
        {
            return None;
        }
        loop {
            let entry = self.fifos[index as usize].pop_runnable()?;
            let started = self.tasks.get(entry.task.0).map(|rec| rec.state.start());
            let Some(Ok(next)) = started else {
                warn!(task = ?entry.task, core = index, "dropping fifo entry without a startable task");
                self.fifos[index as usize].release(&entry);
                continue;
            };
            let Some(sub) = next.submitted() else {
                self.fifos[index as usize].release(&entry);
                continue;
            };
            let expected = self
                .devices
                .core(index)
                .map(|d| d.scale(entry.estimate))
                .unwrap_or(entry.estimate);
            let job = Job {
                core: index,
                task: entry.task,
                priority: entry.priority,
                program: sub.program.clone(),
                extra: sub.extra,
                expected,
            };
            if let Err(e) = self.transition(job.task, next, hooks) {
                warn!(task = ?job.task, core = index, error = %e, "task vanished before start");
                self.fifos[index as usize].release(&entry);
                continue;
            }
            self.fifos[index as usize].set_running(entry, expected);
            debug!(task = ?job.task, core = index, ?expected, "task started");
            return Some(job);
        }
    }

    /// Record a finished job and work out how to deliver it.
    pub fn complete(
        &mut self,
        index: u32,
        job: &Job,
        outcome: JobOutcome,
        hooks: &mut Vec<HookCall>,
    ) -> Option<Completion> {
        self.fifos.get_mut(index as usize)?.finish_running();

        let failure = match outcome {
            JobOutcome::Done => None,
            JobOutcome::Failed(reason) => Some(reason),
        };
        let next = match self.tasks.get(job.task.0).map(|rec| rec.state.finish(failure)) {
            Some(Ok(next)) => next,
            _ => {
                warn!(task = ?job.task, core = index, "completion for a task that is not running");
                return None;
            }
        };
        self.transition(job.task, next, hooks).ok()?;

        let seq = self.next_completion;
        self.next_completion += 1;

        let rec = self.tasks.get(job.task.0)?;
        let status = rec.status();
        let kind = rec.kind;
        let via = rec.via;
        let id = rec.id;
        let notify = rec.notify.clone();
        let callback = rec.callback.clone();
        let downstream = if status == TaskStatus::Done {
            rec.downstream.clone()
        } else {
            Vec::new()
        };

        if let Some(handle) = via.and_then(|h| self.handles.get_mut(h.0)) {
            handle.in_flight = handle.in_flight.saturating_sub(1);
        }

        let mut woken = Vec::new();
        for graph in downstream {
            match self.trigger(graph, id) {
                Ok(core) => woken.push(core),
                Err(e) => warn!(upstream = ?job.task, ?graph, error = %e, "graph edge not fired"),
            }
        }

        // The ready position is taken now, so a callback running late
        // cannot reorder completions.
        let mut reserved = None;
        if let Some(handle) = via.filter(|_| kind.delivers_to_core()) {
            let pending = callback.is_some();
            self.deliver(handle, seq, job.task, pending);
            if pending {
                reserved = Some(handle);
            }
        }

        debug!(task = ?job.task, core = index, ?status, seq, "task finished");
        Some(Completion {
            task: job.task,
            status,
            seq,
            notify,
            callback,
            reserved,
            woken,
        })
    }

    /// Put a finished task into a handle's ready set.
    pub fn deliver(&mut self, handle: CoreHandle, seq: u64, task: TaskHandle, pending: bool) {
        match self.handles.get_mut(handle.0) {
            Some(rec) => {
                rec.ready.insert(seq, ReadyEntry { task, pending });
                if !pending {
                    rec.notify.notify_one();
                }
            }
            None => warn!(?handle, ?task, "completion for a closed core handle dropped"),
        }
    }

    /// Resolve a pending ready entry once the callback has answered.
    pub fn settle(&mut self, handle: CoreHandle, seq: u64, forward: bool) {
        let Some(rec) = self.handles.get_mut(handle.0) else {
            debug!(?handle, seq, "core handle closed before the callback answered");
            return;
        };
        if forward {
            if let Some(entry) = rec.ready.get_mut(&seq) {
                entry.pending = false;
            }
        } else {
            rec.ready.remove(&seq);
        }
        // Waiters parked behind the pending entry may all have work now.
        broadcast(&rec.notify);
    }

    /// Oldest completed task of a handle, skipping tasks freed meanwhile.
    ///
    /// Returns `None` while the oldest completion is still pending.
    pub fn pop_ready(&mut self, core: CoreHandle) -> Result<Option<TaskHandle>> {
        let tasks = &self.tasks;
        let handle = self
            .handles
            .get_mut(core.0)
            .ok_or_else(|| BpuError::invalid(format!("{core:?} is not an open core handle")))?;
        while let Some(mut first) = handle.ready.first_entry() {
            let entry = *first.get();
            if !tasks.contains(entry.task.0) {
                first.remove();
                continue;
            }
            if entry.pending {
                return Ok(None);
            }
            first.remove();
            return Ok(Some(entry.task));
        }
        Ok(None)
    }
}
