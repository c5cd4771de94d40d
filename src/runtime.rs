//! The shared dispatch context and its public API.
//!
//! A [`Runtime`] owns every physical core, the group registry, all handles and
//! the device memory bookkeeping. Clones share the same state. One background
//! worker per physical core drains that core's fifo into the [`Executor`].
//!
//! Blocking operations are `async`: [`Runtime::process`] for synchronous tasks,
//! [`Runtime::core_wait`] and [`Runtime::task_wait`]. Everything else completes
//! under the internal lock and returns immediately.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DispatchConfig;
use crate::device::executor::{Executor, SimulatedExecutor};
use crate::device::{CoreInfo, FirmwareFeatures, PowerState};
use crate::error::{BpuError, Result};
use crate::mem::map::{MapHandle, MapInfo, MapMode};
use crate::mem::{CacheOp, CopyDirection, MemFlags};
use crate::scheduler::{self, engine, ChooseMethod, CoreHandle, HookCall, SchedState};
use crate::task::{
    CallbackAction, ExtraMemory, StatusHook, TaskHandle, TaskRecord, TaskStatus, TaskType,
    TriggerSource, WorkDescriptor,
};

/// Shared, internally synchronised dispatch context.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    state: Mutex<SchedState>,
    executor: Arc<dyn Executor>,
    wake: Vec<Arc<Notify>>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Runtime {
    /// Start a runtime backed by the simulated executor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: DispatchConfig) -> Result<Self> {
        let executor = Arc::new(SimulatedExecutor::new(&config.simulation));
        Self::with_executor(config, executor)
    }

    /// Start a runtime that hands jobs to `executor`.
    pub fn with_executor(config: DispatchConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| BpuError::invalid(format!("{e:#}")))?;
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            BpuError::NotSupported("the dispatch runtime needs a tokio runtime".into())
        })?;

        let cores = config.device.cores.len();
        let wake: Vec<Arc<Notify>> = (0..cores).map(|_| Arc::new(Notify::new())).collect();
        let inner = Arc::new(Inner {
            state: Mutex::new(SchedState::new(&config)),
            executor,
            wake: wake.clone(),
            shutdown: CancellationToken::new(),
        });

        for (index, wake) in wake.into_iter().enumerate() {
            handle.spawn(engine::run_core_worker(
                Arc::downgrade(&inner),
                index as u32,
                wake,
                inner.shutdown.clone(),
            ));
        }
        info!(cores, "dispatch runtime started");
        Ok(Self { inner })
    }

    pub(crate) fn upgrade(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn executor(&self) -> Arc<dyn Executor> {
        self.inner.executor.clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the lock, then fire the status hooks it queued.
    pub(crate) fn with_state<T>(
        &self,
        f: impl FnOnce(&mut SchedState, &mut Vec<HookCall>) -> Result<T>,
    ) -> Result<T> {
        let mut hooks = Vec::new();
        let result = {
            let mut state = self.lock();
            f(&mut state, &mut hooks)
        };
        for hook in hooks {
            hook.fire();
        }
        result
    }

    /// Apply `f` to a task record that is still before submission.
    fn with_mutable_task<T>(
        &self,
        task: TaskHandle,
        f: impl FnOnce(&mut TaskRecord) -> Result<T>,
    ) -> Result<T> {
        self.with_state(|st, _| {
            let rec = st.task_mut(task)?;
            rec.state.check_mutable()?;
            f(rec)
        })
    }

    pub(crate) fn wake_core(&self, index: u32) {
        if let Some(wake) = self.inner.wake.get(index as usize) {
            wake.notify_one();
        }
    }

    /// Stop all core workers. Running jobs are abandoned; blocked waiters
    /// return `Driver`.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("dispatch runtime shutting down");
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(BpuError::Driver("dispatch runtime is shut down".into()));
        }
        Ok(())
    }

    /// Poll `check` until it yields a value, `notify` wakes us otherwise.
    async fn wait_until<T>(
        &self,
        notify: &Notify,
        timeout: Option<Duration>,
        mut check: impl FnMut() -> Result<Option<T>>,
    ) -> Result<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(value) = check()? {
                return Ok(value);
            }
            self.check_running()?;
            match deadline {
                None => tokio::select! {
                    _ = notify.notified() => {}
                    _ = self.inner.shutdown.cancelled() => {}
                },
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(BpuError::Timeout);
                    }
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = self.inner.shutdown.cancelled() => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            return check()?.ok_or(BpuError::Timeout);
                        }
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Physical cores
    // -----------------------------------------------------------------------

    /// Number of installed physical cores.
    pub fn core_num(&self) -> u32 {
        self.lock().devices.len() as u32
    }

    pub fn core_type(&self, index: u32) -> Result<CoreInfo> {
        self.lock().devices.info(index)
    }

    /// Estimated time until a task of `priority` submitted to `index` now
    /// could start.
    pub fn core_est_load(&self, index: u32, priority: u32) -> Result<Duration> {
        self.lock().est_load(index, priority)
    }

    /// Free fifo slots on `index`.
    pub fn core_cap(&self, index: u32) -> Result<u32> {
        Ok(self.lock().fifo(index)?.remaining())
    }

    pub fn set_power(&self, index: u32, state: PowerState) -> Result<()> {
        self.lock().devices.set_power(index, state)?;
        self.wake_core(index);
        Ok(())
    }

    pub fn get_power(&self, index: u32) -> Result<PowerState> {
        self.lock().devices.power(index)
    }

    /// See [`crate::device::DeviceTable::set_clk`] for the accepted values.
    pub fn set_clk(&self, index: u32, value: u64) -> Result<()> {
        self.lock().devices.set_clk(index, value)?;
        self.wake_core(index);
        Ok(())
    }

    pub fn get_clk(&self, index: u32) -> Result<u64> {
        self.lock().devices.clk(index)
    }

    pub fn frq_level_num(&self, index: u32) -> Result<i32> {
        self.lock().devices.frq_level_num(index)
    }

    pub fn set_frq_level(&self, index: u32, level: i32) -> Result<()> {
        self.lock().devices.set_frq_level(index, level)
    }

    pub fn get_frq_level(&self, index: u32) -> Result<i32> {
        self.lock().devices.frq_level(index)
    }

    pub fn fw_features(&self) -> FirmwareFeatures {
        self.lock().features()
    }

    /// Copy the JSON feature block into `buf`, truncating if it does not
    /// fit. Returns the full length so callers can retry with a larger
    /// buffer.
    pub fn fw_get_feature(&self, buf: &mut [u8]) -> Result<usize> {
        let json = serde_json::to_vec(&self.fw_features())
            .map_err(|e| BpuError::Unknown(format!("serialising features: {e}")))?;
        let n = json.len().min(buf.len());
        buf[..n].copy_from_slice(&json[..n]);
        Ok(json.len())
    }

    pub fn set_group_proportion(&self, group: u32, proportion: u32) -> Result<()> {
        self.lock().groups.set_proportion(group, proportion)
    }

    // -----------------------------------------------------------------------
    // Core handles
    // -----------------------------------------------------------------------

    /// Open a handle over the installed cores selected by `mask`.
    pub fn core_open(&self, mask: u32, method: ChooseMethod) -> Result<CoreHandle> {
        self.lock().open(mask, method)
    }

    /// Release a handle and unmap its maps. Fails with `Busy` while tasks
    /// submitted through it are still processing.
    pub fn core_close(&self, core: CoreHandle) -> Result<()> {
        let notify = {
            let mut st = self.lock();
            let notify = st.handle(core)?.notify.clone();
            st.close(core)?;
            notify
        };
        scheduler::broadcast(&notify);
        Ok(())
    }

    /// Submit `task` through `core`.
    ///
    /// Synchronous tasks block until they finish and return `Done` or `Err`;
    /// every other type returns `Process` once buffered.
    pub async fn process(&self, core: CoreHandle, task: TaskHandle) -> Result<TaskStatus> {
        self.check_running()?;
        let (kind, submission) = self.with_state(|st, hooks| {
            let kind = st.task(task)?.kind;
            Ok((kind, st.submit(core, task, hooks)?))
        })?;
        self.wake_core(submission.core);

        if kind != TaskType::Sync {
            return Ok(TaskStatus::Process);
        }
        self.wait_until(&submission.notify, None, || self.task_outcome(task))
            .await
    }

    /// Take the earliest finished task delivered to `core`.
    ///
    /// `None` blocks until one is available; `Some(Duration::ZERO)` only
    /// checks.
    pub async fn core_wait(&self, core: CoreHandle, timeout: Option<Duration>) -> Result<TaskHandle> {
        let notify = self.lock().handle(core)?.notify.clone();
        self.wait_until(&notify, timeout, || self.lock().pop_ready(core))
            .await
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub fn task_alloc(&self, kind: TaskType) -> TaskHandle {
        let task = self.lock().alloc_task(kind);
        debug!(?task, ?kind, "task allocated");
        task
    }

    pub fn task_free(&self, task: TaskHandle) -> Result<()> {
        self.lock().free_task(task)
    }

    /// Attach the compiled descriptors. Each descriptor takes one fifo slot.
    pub fn task_config(&self, task: TaskHandle, program: Vec<WorkDescriptor>) -> Result<()> {
        self.with_state(|st, hooks| st.reconfigure(task, |s| s.configure(program.into()), hooks))
    }

    /// Like [`Runtime::task_config`], for a program packed into one
    /// pass-through blob. See [`WorkDescriptor::unpack`] for the layout.
    pub fn task_pt_config(&self, task: TaskHandle, blob: Bytes) -> Result<()> {
        let program = WorkDescriptor::unpack(blob)?;
        self.task_config(task, program)
    }

    pub fn task_bind(&self, task: TaskHandle, extra: ExtraMemory) -> Result<()> {
        self.with_state(|st, hooks| st.reconfigure(task, |s| s.bind(extra), hooks))
    }

    pub fn task_unbind(&self, task: TaskHandle) -> Result<()> {
        self.with_state(|st, hooks| st.reconfigure(task, |s| s.unbind(), hooks))
    }

    /// Set the correlation id. Graph tasks inherit theirs from the trigger.
    pub fn task_set_id(&self, task: TaskHandle, id: u64) -> Result<()> {
        self.with_mutable_task(task, |rec| {
            if rec.kind == TaskType::Graph {
                return Err(BpuError::invalid("graph task ids are set by their trigger"));
            }
            rec.id = id;
            Ok(())
        })
    }

    pub fn task_get_id(&self, task: TaskHandle) -> Result<u64> {
        Ok(self.lock().task(task)?.id)
    }

    /// Larger values are more urgent.
    pub fn task_set_prio(&self, task: TaskHandle, priority: u32) -> Result<()> {
        self.with_state(|st, _| {
            st.check_priority(priority)?;
            let rec = st.task_mut(task)?;
            rec.state.check_mutable()?;
            rec.priority = priority;
            Ok(())
        })
    }

    /// Install a completion callback. Not available for synchronous tasks.
    pub fn task_set_cb<F>(&self, task: TaskHandle, callback: F) -> Result<()>
    where
        F: Fn(TaskHandle, TaskStatus) -> CallbackAction + Send + Sync + 'static,
    {
        self.with_mutable_task(task, |rec| {
            if rec.kind == TaskType::Sync {
                return Err(BpuError::NotSupported(
                    "synchronous tasks cannot carry a completion callback".into(),
                ));
            }
            rec.callback = Some(Arc::new(callback));
            Ok(())
        })
    }

    pub fn task_set_group(&self, task: TaskHandle, group: u32) -> Result<()> {
        self.with_state(|st, _| {
            st.groups.check_assignable(group)?;
            let rec = st.task_mut(task)?;
            rec.state.check_mutable()?;
            rec.group = group;
            Ok(())
        })
    }

    pub fn task_set_alias(&self, task: TaskHandle, name: &str) -> Result<()> {
        self.lock().task_mut(task)?.set_alias(name)
    }

    pub fn task_get_alias(&self, task: TaskHandle) -> Result<String> {
        Ok(self.lock().task(task)?.alias.clone())
    }

    /// Pull a buffered task back out of its fifo.
    ///
    /// On success the task is in `Config` or `ConfigBind` and will not start.
    /// A task that already started keeps running and `Cancelled` is returned.
    pub fn task_cancel(&self, task: TaskHandle) -> Result<()> {
        let notify = self.with_state(|st, hooks| st.cancel(task, hooks))?;
        scheduler::broadcast(&notify);
        Ok(())
    }

    /// Physical core picked at submission, if any.
    pub fn task_assigned_core(&self, task: TaskHandle) -> Result<Option<u32>> {
        Ok(self.lock().task(task)?.state.assigned_core())
    }

    /// Current status; stale handles report `Invalid`.
    pub fn task_status(&self, task: TaskHandle) -> TaskStatus {
        self.lock()
            .task(task)
            .map(TaskRecord::status)
            .unwrap_or(TaskStatus::Invalid)
    }

    pub fn task_type(&self, task: TaskHandle) -> Result<TaskType> {
        Ok(self.lock().task(task)?.kind)
    }

    /// Reason reported by the device for an `Err` task.
    pub fn task_failure(&self, task: TaskHandle) -> Result<Option<String>> {
        Ok(self.lock().task(task)?.state.failure().map(str::to_string))
    }

    /// Wait for one trigger-per-task task to finish.
    pub async fn task_wait(&self, task: TaskHandle, timeout: Option<Duration>) -> Result<TaskStatus> {
        let notify = {
            let st = self.lock();
            let rec = st.task(task)?;
            if rec.kind != TaskType::TrigTask {
                return Err(BpuError::invalid(format!(
                    "task_wait needs a trigger-per-task task, not {:?}",
                    rec.kind
                )));
            }
            rec.notify.clone()
        };
        self.wait_until(&notify, timeout, || self.task_outcome(task))
            .await
    }

    /// `Some` once waiting on `task` is over.
    fn task_outcome(&self, task: TaskHandle) -> Result<Option<TaskStatus>> {
        let st = self.lock();
        let rec = st.task(task)?;
        match rec.status() {
            status if status.is_terminal() => Ok(Some(status)),
            TaskStatus::Process => Ok(None),
            _ if rec.cancelled => Err(BpuError::Cancelled(format!(
                "{} was cancelled before it started",
                rec.alias
            ))),
            status => Err(BpuError::invalid(format!(
                "{} is not submitted (status {status:?})",
                rec.alias
            ))),
        }
    }

    /// Observe every status change of `task`, for debugging.
    pub fn task_set_status_hook<F>(&self, task: TaskHandle, hook: F) -> Result<()>
    where
        F: Fn(TaskHandle, TaskStatus, TaskStatus) + Send + Sync + 'static,
    {
        let hook: StatusHook = Arc::new(hook);
        self.lock().task_mut(task)?.status_hook = Some(hook);
        Ok(())
    }

    pub fn task_clear_status_hook(&self, task: TaskHandle) -> Result<()> {
        self.lock().task_mut(task)?.status_hook = None;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Graph tasks
    // -----------------------------------------------------------------------

    /// Release a buffered graph task.
    pub fn graph_trigger(&self, task: TaskHandle, source: TriggerSource) -> Result<()> {
        let core = self.with_state(|st, _| {
            let id = match source {
                TriggerSource::Frame(id) => id,
                TriggerSource::Task(upstream) => st.task(upstream)?.id,
            };
            st.trigger(task, id)
        })?;
        self.wake_core(core);
        Ok(())
    }

    /// Trigger `graph` whenever `upstream` finishes `Done`.
    pub fn graph_link(&self, upstream: TaskHandle, graph: TaskHandle) -> Result<()> {
        self.lock().link(upstream, graph)
    }

    // -----------------------------------------------------------------------
    // Maps
    // -----------------------------------------------------------------------

    /// Make `[base, base + size)` visible to the cores of `core`, read/write.
    pub fn map(&self, core: CoreHandle, base: u64, size: u64) -> Result<MapHandle> {
        let mut st = self.lock();
        let cores = st.handle(core)?.cores.clone();
        st.mapper.map(core, &cores, base, size)
    }

    pub fn unmap(&self, map: MapHandle) -> Result<()> {
        self.lock().mapper.unmap(map)
    }

    pub fn map_mode_set(&self, map: MapHandle, index: u32, mode: MapMode) -> Result<()> {
        self.lock().mapper.set_mode(map, index, mode)
    }

    pub fn map_mode_get(&self, map: MapHandle, index: u32) -> Result<MapMode> {
        self.lock().mapper.mode(map, index)
    }

    pub fn map_info(&self, map: MapHandle) -> Result<MapInfo> {
        self.lock().mapper.info(map)
    }

    // -----------------------------------------------------------------------
    // Device memory
    // -----------------------------------------------------------------------

    /// Allocate from the device window. Affinity bits must name installed
    /// cores.
    pub fn mem_alloc(&self, size: u64, flags: MemFlags, label: Option<&str>) -> Result<u64> {
        let mut st = self.lock();
        check_affinity(&st, flags)?;
        st.mem.alloc(size, flags, label)
    }

    pub fn mem_free(&self, addr: u64) -> Result<()> {
        self.lock().mem.free(addr)
    }

    /// Allocate host-side memory, addressed like device memory.
    pub fn cpumem_alloc(&self, size: u64, flags: MemFlags, label: Option<&str>) -> Result<u64> {
        let mut st = self.lock();
        check_affinity(&st, flags)?;
        st.mem.cpu_alloc(size, flags, label)
    }

    pub fn cpumem_free(&self, addr: u64) -> Result<()> {
        self.lock().mem.cpu_free(addr)
    }

    pub fn mem_memcpy(&self, dst: u64, src: u64, size: u64, direction: CopyDirection) -> Result<()> {
        self.lock().mem.memcpy(dst, src, size, direction)
    }

    pub fn mem_write(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.lock().mem.write(addr, bytes)
    }

    pub fn mem_read(&self, addr: u64, len: u64) -> Result<Bytes> {
        self.lock().mem.read(addr, len)
    }

    pub fn mem_is_cacheable(&self, addr: u64) -> Result<bool> {
        self.lock().mem.is_cacheable(addr)
    }

    pub fn mem_phyaddr(&self, addr: u64) -> Result<u64> {
        self.lock().mem.phys_addr(addr)
    }

    /// Address core `index` uses to reach the allocation at `addr`.
    pub fn mem_device_iova(&self, addr: u64, index: u32) -> Result<u64> {
        let st = self.lock();
        st.devices.core(index)?;
        st.mem.device_iova(addr, index)
    }

    /// Host-side view of the allocation at `addr` as seen for core `index`.
    pub fn mem_host_iova(&self, addr: u64, index: u32) -> Result<u64> {
        let st = self.lock();
        st.devices.core(index)?;
        st.mem.host_iova(addr, index)
    }

    pub fn mem_register(&self, addr: u64, size: u64) -> Result<u64> {
        self.lock().mem.register(addr, size)
    }

    pub fn mem_unregister(&self, addr: u64) -> Result<()> {
        self.lock().mem.unregister(addr)
    }

    pub fn mem_cache_sync(&self, addr: u64, size: u64, op: CacheOp) -> Result<()> {
        self.lock().mem.cache_sync(addr, size, op)
    }
}

fn check_affinity(st: &SchedState, flags: MemFlags) -> Result<()> {
    let stray = flags.affinity() & !st.devices.installed_mask();
    if stray != 0 {
        return Err(BpuError::invalid(format!(
            "affinity {stray:#x} names cores that are not installed"
        )));
    }
    Ok(())
}
