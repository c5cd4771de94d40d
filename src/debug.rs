//! Introspection: serialisable snapshots of cores and tasks.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::device::{CoreType, PowerState};
use crate::error::{BpuError, Result};
use crate::mem::Allocation;
use crate::runtime::Runtime;
use crate::scheduler::SchedState;
use crate::task::{TaskHandle, TaskStatus, TaskType};

#[derive(Debug, Clone, Serialize)]
pub struct CoreReport {
    pub index: u32,
    pub core_type: CoreType,
    pub firmware_version: u64,
    pub power: PowerState,
    /// `0` when the clock is gated or the core is powered down.
    pub clock_hz: u64,
    pub frq_level: i32,
    pub capacity: u32,
    pub remaining: u32,
    pub buffered: usize,
    pub running: Option<String>,
    /// Load seen by a lowest-priority submission, in microseconds.
    pub est_load_us: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub handle: u64,
    pub alias: String,
    pub kind: TaskType,
    pub status: TaskStatus,
    pub priority: u32,
    pub group: u32,
    pub id: u64,
    pub core: Option<u32>,
    pub failure: Option<String>,
}

/// Tasks sharing one alias, which names the compiled model they run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelReport {
    pub alias: String,
    pub tasks: usize,
    pub descriptors: usize,
    pub processing: usize,
    pub done: usize,
    pub err: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub group: u32,
    pub proportion: u32,
}

/// Everything `dump_info` writes.
#[derive(Debug, Clone, Serialize)]
pub struct InfoDump {
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub cores: Vec<CoreReport>,
    pub tasks: Vec<TaskReport>,
    pub models: Vec<ModelReport>,
    pub groups: Vec<GroupReport>,
    pub mapped_pages: u64,
    pub allocations: Vec<Allocation>,
}

fn core_reports(st: &SchedState) -> Vec<CoreReport> {
    (0..st.devices.len() as u32)
        .filter_map(|index| {
            let info = st.devices.info(index).ok()?;
            let fifo = st.fifo(index).ok()?;
            let running = fifo
                .running()
                .and_then(|r| st.tasks.get(r.entry.task.0))
                .map(|rec| rec.alias.clone());
            Some(CoreReport {
                index,
                core_type: info.core_type,
                firmware_version: info.firmware_version,
                power: st.devices.power(index).ok()?,
                clock_hz: st.devices.clk(index).ok()?,
                frq_level: st.devices.frq_level(index).ok()?,
                capacity: fifo.capacity(),
                remaining: fifo.remaining(),
                buffered: fifo.buffered(),
                running,
                est_load_us: st
                    .est_load(index, 0)
                    .map(|d| d.as_micros() as u64)
                    .unwrap_or(0),
            })
        })
        .collect()
}

fn task_reports(st: &SchedState) -> Vec<TaskReport> {
    st.tasks
        .iter()
        .map(|(key, rec)| TaskReport {
            handle: TaskHandle(key).to_raw(),
            alias: rec.alias.clone(),
            kind: rec.kind,
            status: rec.status(),
            priority: rec.priority,
            group: rec.group,
            id: rec.id,
            core: rec.state.assigned_core(),
            failure: rec.state.failure().map(str::to_string),
        })
        .collect()
}

fn model_reports(st: &SchedState) -> Vec<ModelReport> {
    let mut models: BTreeMap<&str, ModelReport> = BTreeMap::new();
    for (_, rec) in st.tasks.iter() {
        let model = models.entry(rec.alias.as_str()).or_insert_with(|| ModelReport {
            alias: rec.alias.clone(),
            ..ModelReport::default()
        });
        model.tasks += 1;
        model.descriptors += rec.state.program().map_or(0, |p| p.len());
        match rec.status() {
            TaskStatus::Process => model.processing += 1,
            TaskStatus::Done => model.done += 1,
            TaskStatus::Err => model.err += 1,
            _ => {}
        }
    }
    models.into_values().collect()
}

fn io_error(path: &Path, e: io::Error) -> BpuError {
    let msg = format!("{}: {e}", path.display());
    match e.kind() {
        io::ErrorKind::PermissionDenied => BpuError::NoPermission(msg),
        _ => BpuError::Unknown(msg),
    }
}

impl Runtime {
    pub fn cores_info(&self) -> Vec<CoreReport> {
        core_reports(&self.lock())
    }

    pub fn tasks_info(&self) -> Vec<TaskReport> {
        task_reports(&self.lock())
    }

    /// Live tasks grouped by alias, sorted by alias.
    pub fn models_info(&self) -> Vec<ModelReport> {
        model_reports(&self.lock())
    }

    /// One consistent snapshot of the whole runtime.
    pub fn info(&self) -> InfoDump {
        let st = self.lock();
        InfoDump {
            timestamp: Utc::now(),
            version: crate::VERSION.to_string(),
            cores: core_reports(&st),
            tasks: task_reports(&st),
            models: model_reports(&st),
            groups: st
                .groups
                .iter()
                .map(|(group, proportion)| GroupReport { group, proportion })
                .collect(),
            mapped_pages: st.mapper.used_pages(),
            allocations: st.mem.allocations().cloned().collect(),
        }
    }

    /// Write [`Runtime::info`] to `path` as pretty JSON.
    pub fn dump_info(&self, path: &Path) -> Result<()> {
        let dump = self.info();
        let json = serde_json::to_string_pretty(&dump)
            .map_err(|e| BpuError::Unknown(format!("serialising info dump: {e}")))?;
        std::fs::write(path, json).map_err(|e| io_error(path, e))?;
        info!(path = %path.display(), tasks = dump.tasks.len(), "runtime info dumped");
        Ok(())
    }
}
