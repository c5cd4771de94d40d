//! Bounded per-core buffer ordered by priority, FIFO within a priority.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::task::TaskHandle;

/// A buffered task.
#[derive(Debug, Clone)]
pub struct FifoEntry {
    pub task: TaskHandle,
    pub seq: u64,
    pub priority: u32,
    pub group: u32,
    pub slots: u32,
    /// Estimate at the highest clock level.
    pub estimate: Duration,
    /// False for graph tasks still waiting on their trigger.
    pub runnable: bool,
}

/// The task currently executing on the core.
#[derive(Debug, Clone)]
pub struct RunningEntry {
    pub entry: FifoEntry,
    pub started_at: Instant,
    /// Estimate scaled to the clock the job started at.
    pub expected: Duration,
}

impl RunningEntry {
    pub fn remaining(&self) -> Duration {
        self.expected.saturating_sub(self.started_at.elapsed())
    }
}

#[derive(Debug)]
pub struct CoreFifo {
    capacity: u32,
    used: u32,
    queues: BTreeMap<u32, VecDeque<FifoEntry>>,
    running: Option<RunningEntry>,
    group_slots: HashMap<u32, u32>,
}

impl CoreFifo {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            used: 0,
            queues: BTreeMap::new(),
            running: None,
            group_slots: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Free slots; a running task keeps its slots until it finishes.
    pub fn remaining(&self) -> u32 {
        self.capacity - self.used
    }

    pub fn group_used(&self, group: u32) -> u32 {
        self.group_slots.get(&group).copied().unwrap_or(0)
    }

    pub fn buffered(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn running(&self) -> Option<&RunningEntry> {
        self.running.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_none() && self.queues.is_empty()
    }

    /// Caller has checked capacity and group share.
    pub fn push(&mut self, entry: FifoEntry) {
        debug_assert!(entry.slots <= self.remaining());
        self.used += entry.slots;
        *self.group_slots.entry(entry.group).or_insert(0) += entry.slots;
        self.queues.entry(entry.priority).or_default().push_back(entry);
    }

    /// Give back the slots of an entry popped without being run.
    pub fn release(&mut self, entry: &FifoEntry) {
        self.used -= entry.slots;
        if let Some(n) = self.group_slots.get_mut(&entry.group) {
            *n -= entry.slots;
            if *n == 0 {
                self.group_slots.remove(&entry.group);
            }
        }
    }

    /// Take a buffered (not started) task out of the fifo.
    pub fn remove(&mut self, task: TaskHandle) -> Option<FifoEntry> {
        let (prio, pos) = self.queues.iter().find_map(|(prio, q)| {
            q.iter().position(|e| e.task == task).map(|pos| (*prio, pos))
        })?;
        let queue = self.queues.get_mut(&prio)?;
        let entry = queue.remove(pos)?;
        if queue.is_empty() {
            self.queues.remove(&prio);
        }
        self.release(&entry);
        Some(entry)
    }

    /// Release a waiting graph task. Returns false when the task is not buffered here.
    pub fn mark_runnable(&mut self, task: TaskHandle) -> bool {
        for queue in self.queues.values_mut() {
            if let Some(entry) = queue.iter_mut().find(|e| e.task == task) {
                entry.runnable = true;
                return true;
            }
        }
        false
    }

    /// Highest priority runnable entry, earliest submitted first.
    pub fn pop_runnable(&mut self) -> Option<FifoEntry> {
        let (prio, pos) = self.queues.iter().rev().find_map(|(prio, q)| {
            q.iter().position(|e| e.runnable).map(|pos| (*prio, pos))
        })?;
        let queue = self.queues.get_mut(&prio)?;
        let entry = queue.remove(pos)?;
        if queue.is_empty() {
            self.queues.remove(&prio);
        }
        Some(entry)
    }

    pub fn set_running(&mut self, entry: FifoEntry, expected: Duration) {
        self.running = Some(RunningEntry {
            entry,
            started_at: Instant::now(),
            expected,
        });
    }

    /// Clear the running task and give its slots back.
    pub fn finish_running(&mut self) -> Option<RunningEntry> {
        let running = self.running.take()?;
        self.release(&running.entry);
        Some(running)
    }

    /// Time until a task of `priority` submitted now could start.
    ///
    /// Counts the remainder of the running job (jobs are not preempted) plus
    /// every buffered entry of equal or higher priority, scaled by `scale`.
    pub fn est_load(&self, priority: u32, scale: impl Fn(Duration) -> Duration) -> Duration {
        let running = self.running.as_ref().map(RunningEntry::remaining).unwrap_or_default();
        self.queues
            .range(priority..)
            .flat_map(|(_, q)| q.iter())
            .map(|e| scale(e.estimate))
            .fold(running, Duration::saturating_add)
    }

    /// Buffered entries in dispatch order.
    pub fn entries(&self) -> impl Iterator<Item = &FifoEntry> {
        self.queues.values().rev().flat_map(|q| q.iter())
    }
}
