//! End-to-end dispatch scenarios against the simulated executor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use accel_dispatch::config::CoreConfig;
use accel_dispatch::{
    BpuError, CallbackAction, ChooseMethod, DispatchConfig, Executor, ExtraMemory, Job,
    JobOutcome, MapMode, Runtime, TaskHandle, TaskStatus, TaskType, TriggerSource,
    WorkDescriptor, CLK_OFF, CLK_ON,
};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn config(capacities: &[u32]) -> DispatchConfig {
    let mut cfg = DispatchConfig::default();
    cfg.device.cores = capacities
        .iter()
        .map(|&fifo_capacity| CoreConfig {
            fifo_capacity,
            ..CoreConfig::default()
        })
        .collect();
    cfg.simulation.time_scale = 0.0;
    cfg
}

fn runtime(capacities: &[u32]) -> Runtime {
    Runtime::new(config(capacities)).unwrap()
}

fn program(descriptors: usize, estimate_us: u64) -> Vec<WorkDescriptor> {
    (0..descriptors)
        .map(|_| {
            WorkDescriptor::new(
                Bytes::from_static(b"\x01\x02"),
                Duration::from_micros(estimate_us),
            )
        })
        .collect()
}

fn configured(rt: &Runtime, kind: TaskType, descriptors: usize) -> TaskHandle {
    let task = rt.task_alloc(kind);
    rt.task_config(task, program(descriptors, 100)).unwrap();
    task
}

/// Executor that parks every job until the test releases it.
#[derive(Default)]
struct GatedExecutor {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl Executor for GatedExecutor {
    async fn execute(&self, _job: &Job) -> JobOutcome {
        self.started.notify_one();
        self.release.notified().await;
        JobOutcome::Done
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_a_sync_process() {
    let rt = runtime(&[32]);
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();
    assert!(rt.core_num() >= 1);

    let task = configured(&rt, TaskType::Sync, 1);
    let status = rt.process(core, task).await.unwrap();
    assert!(matches!(status, TaskStatus::Done | TaskStatus::Err));
    assert_eq!(rt.task_status(task), status);
}

#[tokio::test]
async fn test_scenario_b_cancel_restores_capacity() {
    let rt = runtime(&[32]);
    rt.set_clk(0, CLK_OFF).unwrap();
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();

    let task = rt.task_alloc(TaskType::TrigCore);
    rt.task_config(task, program(3, 100)).unwrap();
    rt.task_bind(task, ExtraMemory { addr: 0x8000_0000, size: 256 }).unwrap();
    let before = rt.core_cap(0).unwrap();

    rt.process(core, task).await.unwrap();
    assert_eq!(rt.core_cap(0).unwrap(), before - 3);

    rt.task_cancel(task).unwrap();
    assert_eq!(rt.task_status(task), TaskStatus::ConfigBind);
    assert_eq!(rt.core_cap(0).unwrap(), before);
    assert_eq!(rt.task_assigned_core(task).unwrap(), None);

    // The cancelled task never runs once the clock comes back.
    rt.set_clk(0, CLK_ON).unwrap();
    assert_eq!(
        rt.core_wait(core, Some(Duration::from_millis(100))).await,
        Err(BpuError::Timeout)
    );
    assert_eq!(rt.task_status(task), TaskStatus::ConfigBind);
}

#[tokio::test]
async fn test_scenario_c_groups_share_a_handle() {
    let rt = runtime(&[8]);
    rt.set_group_proportion(5, 50).unwrap();
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();

    let plain = configured(&rt, TaskType::TrigCore, 1);
    let grouped = configured(&rt, TaskType::TrigCore, 1);
    rt.task_set_group(grouped, 5).unwrap();

    rt.process(core, plain).await.unwrap();
    rt.process(core, grouped).await.unwrap();

    let mut seen = vec![
        rt.core_wait(core, WAIT).await.unwrap(),
        rt.core_wait(core, WAIT).await.unwrap(),
    ];
    seen.sort_by_key(|t| t.to_raw());
    let mut expected = vec![plain, grouped];
    expected.sort_by_key(|t| t.to_raw());
    assert_eq!(seen, expected);
    assert_eq!(rt.task_status(plain), TaskStatus::Done);
    assert_eq!(rt.task_status(grouped), TaskStatus::Done);
}

#[tokio::test]
async fn test_scenario_d_free_while_processing() {
    let rt = runtime(&[8]);
    rt.set_power(0, accel_dispatch::PowerState::Off).unwrap();
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();
    let task = configured(&rt, TaskType::TrigCore, 1);
    rt.task_set_alias(task, "stay").unwrap();
    rt.process(core, task).await.unwrap();

    assert!(matches!(rt.task_free(task), Err(BpuError::Invalid(_))));
    assert_eq!(rt.task_status(task), TaskStatus::Process);
    assert_eq!(rt.task_get_alias(task).unwrap(), "stay");
    assert_eq!(rt.task_assigned_core(task).unwrap(), Some(0));
}

#[tokio::test]
async fn test_scenario_e_zero_timeout_wait() {
    let rt = runtime(&[8]);
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();

    let started = std::time::Instant::now();
    let result = rt.core_wait(core, Some(Duration::ZERO)).await;
    assert_eq!(result, Err(BpuError::Timeout));
    assert!(started.elapsed() < Duration::from_millis(100));
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_capacity_choice_never_overfills() {
    let rt = runtime(&[6, 9, 4]);
    for index in 0..3 {
        rt.set_clk(index, CLK_OFF).unwrap();
    }
    let core = rt.core_open(0b111, ChooseMethod::ByCapacity).unwrap();

    for slots in [5, 4, 3, 2, 1, 6, 3] {
        let caps: Vec<u32> = (0..3).map(|i| rt.core_cap(i).unwrap()).collect();
        let task = configured(&rt, TaskType::TrigCore, slots);
        match rt.process(core, task).await {
            Ok(_) => {
                let chosen = rt.task_assigned_core(task).unwrap().unwrap();
                assert!(caps[chosen as usize] >= slots as u32);
                assert_eq!(caps[chosen as usize], *caps.iter().max().unwrap());
            }
            Err(BpuError::Busy(_)) => {
                assert!(caps.iter().all(|&c| c < slots as u32));
                assert_eq!(rt.task_status(task), TaskStatus::Config);
            }
            Err(e) => panic!("unexpected error {e}"),
        }
    }
}

#[tokio::test]
async fn test_reopen_observes_same_cores() {
    let rt = runtime(&[8, 8]);
    let core = rt.core_open(0b11, ChooseMethod::ByEstimatedLoad).unwrap();
    let before = (rt.core_num(), rt.core_type(0).unwrap(), rt.core_type(1).unwrap());
    rt.core_close(core).unwrap();

    let again = rt.core_open(0b11, ChooseMethod::ByEstimatedLoad).unwrap();
    assert_ne!(again, core);
    let after = (rt.core_num(), rt.core_type(0).unwrap(), rt.core_type(1).unwrap());
    assert_eq!(before, after);
    // The old handle is stale, not aliased.
    assert!(matches!(rt.core_close(core), Err(BpuError::Invalid(_))));
}

#[tokio::test]
async fn test_map_round_trip_leaves_capacity() {
    let rt = runtime(&[8, 8]);
    rt.set_clk(0, CLK_OFF).unwrap();
    let core = rt.core_open(0b11, ChooseMethod::ByCapacity).unwrap();
    let task = configured(&rt, TaskType::TrigCore, 2);
    rt.process(core, task).await.unwrap();

    let cap = rt.core_cap(0).unwrap();
    let load = rt.core_est_load(0, 0).unwrap();
    let map = rt.map(core, 0x4000_0000, 0x10_000).unwrap();
    rt.map_mode_set(map, 1, MapMode::READ).unwrap();
    rt.unmap(map).unwrap();
    assert_eq!(rt.core_cap(0).unwrap(), cap);
    assert_eq!(rt.core_est_load(0, 0).unwrap(), load);
}

#[tokio::test]
async fn test_priority_then_submission_order() {
    let rt = runtime(&[16]);
    rt.set_clk(0, CLK_OFF).unwrap();
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();

    let low: Vec<TaskHandle> = (0..4)
        .map(|_| configured(&rt, TaskType::TrigCore, 1))
        .collect();
    let urgent = configured(&rt, TaskType::TrigCore, 1);
    rt.task_set_prio(urgent, 10).unwrap();
    for &task in &low {
        rt.process(core, task).await.unwrap();
    }
    rt.process(core, urgent).await.unwrap();

    rt.set_clk(0, CLK_ON).unwrap();
    let mut order = Vec::new();
    for _ in 0..5 {
        order.push(rt.core_wait(core, WAIT).await.unwrap());
    }
    let mut expected = vec![urgent];
    expected.extend(low);
    assert_eq!(order, expected);
}

#[tokio::test]
async fn test_est_load_tracks_priority_and_clock() {
    let rt = runtime(&[16]);
    rt.set_clk(0, CLK_OFF).unwrap();
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();

    let a = configured(&rt, TaskType::TrigCore, 2);
    let b = configured(&rt, TaskType::TrigCore, 1);
    rt.task_set_prio(b, 5).unwrap();
    rt.process(core, a).await.unwrap();
    rt.process(core, b).await.unwrap();

    assert_eq!(rt.core_est_load(0, 0).unwrap(), Duration::from_micros(300));
    assert_eq!(rt.core_est_load(0, 5).unwrap(), Duration::from_micros(100));
    assert_eq!(rt.core_est_load(0, 6).unwrap(), Duration::ZERO);

    // 1 GHz -> 400 MHz stretches the estimate by 2.5x.
    rt.set_frq_level(0, -3).unwrap();
    assert_eq!(rt.get_clk(0).unwrap(), 0);
    assert_eq!(rt.core_est_load(0, 0).unwrap(), Duration::from_micros(750));
}

#[tokio::test]
async fn test_load_choice_prefers_idle_core() {
    let rt = runtime(&[16, 16]);
    rt.set_clk(0, CLK_OFF).unwrap();
    rt.set_clk(1, CLK_OFF).unwrap();
    let pinned = rt.core_open(0b01, ChooseMethod::ByCapacity).unwrap();
    let spread = rt.core_open(0b11, ChooseMethod::ByEstimatedLoad).unwrap();

    rt.process(pinned, configured(&rt, TaskType::TrigCore, 1))
        .await
        .unwrap();
    let task = configured(&rt, TaskType::TrigCore, 4);
    rt.process(spread, task).await.unwrap();
    assert_eq!(rt.task_assigned_core(task).unwrap(), Some(1));
}

#[tokio::test]
async fn test_no_core_mask() {
    let rt = runtime(&[8, 8]);
    assert_eq!(
        rt.core_open(0b1100, ChooseMethod::ByCapacity),
        Err(BpuError::NoCore { mask: 0b1100 })
    );
    assert_eq!(BpuError::NoCore { mask: 0 }.code(), -1);
}

#[tokio::test]
async fn test_cancel_after_start_is_refused() {
    let gate = Arc::new(GatedExecutor::default());
    let rt = Runtime::with_executor(config(&[8]), gate.clone()).unwrap();
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();
    let task = configured(&rt, TaskType::TrigTask, 1);

    rt.process(core, task).await.unwrap();
    gate.started.notified().await;

    assert!(matches!(rt.task_cancel(task), Err(BpuError::Cancelled(_))));
    assert_eq!(rt.task_status(task), TaskStatus::Process);

    gate.release.notify_one();
    assert_eq!(rt.task_wait(task, WAIT).await.unwrap(), TaskStatus::Done);
}

#[tokio::test]
async fn test_cancelled_task_wait_returns_cancelled() {
    let rt = runtime(&[8]);
    rt.set_clk(0, CLK_OFF).unwrap();
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();
    let task = configured(&rt, TaskType::TrigTask, 1);
    rt.process(core, task).await.unwrap();

    let waiter = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.task_wait(task, None).await })
    };
    tokio::task::yield_now().await;
    rt.task_cancel(task).unwrap();

    assert!(matches!(waiter.await.unwrap(), Err(BpuError::Cancelled(_))));
    assert_eq!(rt.task_status(task), TaskStatus::Config);
}

#[tokio::test]
async fn test_cancelled_sync_process_returns_cancelled() {
    let rt = runtime(&[8]);
    rt.set_clk(0, CLK_OFF).unwrap();
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();
    let task = configured(&rt, TaskType::Sync, 1);

    let submitter = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.process(core, task).await })
    };
    while rt.task_status(task) != TaskStatus::Process {
        tokio::task::yield_now().await;
    }
    rt.task_cancel(task).unwrap();
    assert!(matches!(submitter.await.unwrap(), Err(BpuError::Cancelled(_))));
}

#[tokio::test]
async fn test_busy_then_retry_after_drain() {
    let rt = runtime(&[2]);
    rt.set_clk(0, CLK_OFF).unwrap();
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();

    let first = configured(&rt, TaskType::TrigCore, 2);
    rt.process(core, first).await.unwrap();
    let second = configured(&rt, TaskType::TrigCore, 1);
    let err = rt.process(core, second).await.unwrap_err();
    assert!(matches!(err, BpuError::Busy(_)));
    assert!(err.is_retryable());

    rt.set_clk(0, CLK_ON).unwrap();
    assert_eq!(rt.core_wait(core, WAIT).await.unwrap(), first);
    rt.process(core, second).await.unwrap();
    assert_eq!(rt.core_wait(core, WAIT).await.unwrap(), second);
}

#[tokio::test]
async fn test_deleted_group_falls_back_to_default_share() {
    let rt = runtime(&[8]);
    rt.set_clk(0, CLK_OFF).unwrap();
    rt.set_group_proportion(5, 25).unwrap();
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();

    // A quarter of eight slots leaves group 5 two.
    let first = configured(&rt, TaskType::TrigCore, 2);
    let second = configured(&rt, TaskType::TrigCore, 3);
    rt.task_set_group(first, 5).unwrap();
    rt.task_set_group(second, 5).unwrap();
    rt.process(core, first).await.unwrap();
    assert!(matches!(rt.process(core, second).await, Err(BpuError::Busy(_))));

    rt.set_group_proportion(5, 0).unwrap();
    assert_eq!(rt.process(core, second).await.unwrap(), TaskStatus::Process);
    assert_eq!(rt.core_cap(0).unwrap(), 3);
    let late = configured(&rt, TaskType::TrigCore, 1);
    assert!(matches!(rt.task_set_group(late, 5), Err(BpuError::NoGroup(5))));

    rt.set_clk(0, CLK_ON).unwrap();
    assert_eq!(rt.core_wait(core, WAIT).await.unwrap(), first);
    assert_eq!(rt.core_wait(core, WAIT).await.unwrap(), second);
}

#[tokio::test]
async fn test_close_requires_drain() {
    let rt = runtime(&[8]);
    rt.set_clk(0, CLK_OFF).unwrap();
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();
    let task = configured(&rt, TaskType::TrigCore, 1);
    rt.process(core, task).await.unwrap();

    assert!(matches!(rt.core_close(core), Err(BpuError::Busy(_))));
    rt.set_clk(0, CLK_ON).unwrap();
    while rt.task_status(task) != TaskStatus::Done {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Unretrieved completions are dropped with the handle.
    rt.core_close(core).unwrap();
    assert_eq!(rt.task_status(task), TaskStatus::Done);
    assert!(matches!(
        rt.core_wait(core, Some(Duration::ZERO)).await,
        Err(BpuError::Invalid(_))
    ));
    rt.task_free(task).unwrap();
    assert_eq!(rt.task_status(task), TaskStatus::Invalid);
}

#[tokio::test]
async fn test_concurrent_waiters_get_distinct_tasks() {
    let rt = runtime(&[8, 8]);
    let core = rt.core_open(0b11, ChooseMethod::ByCapacity).unwrap();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let rt = rt.clone();
            tokio::spawn(async move { rt.core_wait(core, WAIT).await })
        })
        .collect();

    let mut submitted = Vec::new();
    for _ in 0..4 {
        let task = configured(&rt, TaskType::TrigCore, 1);
        rt.process(core, task).await.unwrap();
        submitted.push(task);
    }

    let mut received = Vec::new();
    for waiter in waiters {
        received.push(waiter.await.unwrap().unwrap());
    }
    received.sort_by_key(|t| t.to_raw());
    submitted.sort_by_key(|t| t.to_raw());
    assert_eq!(received, submitted);
}

#[tokio::test]
async fn test_graph_link_inherits_upstream_id() {
    let rt = runtime(&[8]);
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();

    let upstream = configured(&rt, TaskType::TrigCore, 1);
    rt.task_set_id(upstream, 1234).unwrap();
    let graph = configured(&rt, TaskType::Graph, 1);
    rt.graph_link(upstream, graph).unwrap();

    rt.process(core, graph).await.unwrap();
    rt.process(core, upstream).await.unwrap();

    assert_eq!(rt.core_wait(core, WAIT).await.unwrap(), upstream);
    assert_eq!(rt.core_wait(core, WAIT).await.unwrap(), graph);
    assert_eq!(rt.task_get_id(graph).unwrap(), 1234);
}

#[tokio::test]
async fn test_graph_trigger_from_task() {
    let rt = runtime(&[8]);
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();
    let source = configured(&rt, TaskType::TrigTask, 1);
    rt.task_set_id(source, 88).unwrap();
    let graph = configured(&rt, TaskType::Graph, 1);

    // Not buffered yet.
    assert!(rt.graph_trigger(graph, TriggerSource::Task(source)).is_err());
    rt.process(core, graph).await.unwrap();
    rt.graph_trigger(graph, TriggerSource::Task(source)).unwrap();
    // A second trigger has nothing left to release.
    assert!(rt.graph_trigger(graph, TriggerSource::Frame(1)).is_err());

    assert_eq!(rt.core_wait(core, WAIT).await.unwrap(), graph);
    assert_eq!(rt.task_get_id(graph).unwrap(), 88);
}

#[tokio::test]
async fn test_status_only_moves_forward() {
    fn legal(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Idle, Config)
                | (Idle, Bind)
                | (Bind, ConfigBind)
                | (Bind, Idle)
                | (Config, ConfigBind)
                | (ConfigBind, Config)
                | (Config, Process)
                | (ConfigBind, Process)
                | (Process, Done)
                | (Process, Err)
                | (Process, Config)
                | (Process, ConfigBind)
        )
    }

    let rt = runtime(&[8]);
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let task = rt.task_alloc(TaskType::TrigCore);
    let sink = log.clone();
    rt.task_set_status_hook(task, move |_, from, to| sink.lock().unwrap().push((from, to)))
        .unwrap();
    rt.task_bind(task, ExtraMemory { addr: 0x1000, size: 16 }).unwrap();
    rt.task_config(task, program(1, 10)).unwrap();
    rt.task_unbind(task).unwrap();
    rt.set_clk(0, CLK_OFF).unwrap();
    rt.process(core, task).await.unwrap();
    rt.task_cancel(task).unwrap();
    rt.set_clk(0, CLK_ON).unwrap();
    rt.process(core, task).await.unwrap();
    rt.core_wait(core, WAIT).await.unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(log.len(), 7);
    for (from, to) in &log {
        assert!(legal(*from, *to), "illegal transition {from:?} -> {to:?}");
    }
    assert_eq!(log.last(), Some(&(TaskStatus::Process, TaskStatus::Done)));

    // Terminal tasks are not resubmitted.
    assert!(matches!(rt.process(core, task).await, Err(BpuError::Invalid(_))));
}

#[tokio::test]
async fn test_faulty_device_reports_err_status() {
    let mut cfg = config(&[8]);
    cfg.simulation.fault_rate = 1.0;
    cfg.simulation.seed = Some(7);
    let rt = Runtime::new(cfg).unwrap();
    let core = rt.core_open(0b1, ChooseMethod::ByCapacity).unwrap();

    let task = configured(&rt, TaskType::TrigCore, 1);
    rt.task_set_cb(task, |_, status| {
        assert_eq!(status, TaskStatus::Err);
        CallbackAction::Forward
    })
    .unwrap();
    // Submission itself succeeds; the failure is a task status.
    rt.process(core, task).await.unwrap();
    assert_eq!(rt.core_wait(core, WAIT).await.unwrap(), task);
    assert_eq!(rt.task_status(task), TaskStatus::Err);
    assert!(rt.task_failure(task).unwrap().is_some());
}

#[tokio::test]
async fn test_device_memory_and_cache_sync() {
    let rt = runtime(&[8]);
    let addr = rt
        .mem_alloc(0x3000, accel_dispatch::MemFlags::CACHEABLE, Some("weights"))
        .unwrap();
    rt.mem_cache_sync(addr, 0x3000, accel_dispatch::CacheOp::Clean)
        .unwrap();
    assert!(rt
        .mem_cache_sync(addr + 0x2000, 0x2000, accel_dispatch::CacheOp::Invalidate)
        .is_err());
    rt.mem_free(addr).unwrap();
    assert!(rt.mem_free(addr).is_err());
}
