use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use accel_dispatch::config::LoggingConfig;
use accel_dispatch::{
    BpuError, ChooseMethod, DispatchConfig, Runtime, TaskHandle, TaskStatus, TaskType,
    WorkDescriptor,
};
use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "accel-dispatch",
    about = "Task dispatch for multi-core compute accelerators",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $ACCEL_DISPATCH_CONFIG, then the system path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show installed cores, groups and device memory
    Info {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Submit a batch of simulated tasks and report completion statistics
    Bench {
        /// Core mask to open
        #[arg(long, default_value = "3")]
        mask: u32,

        /// How the handle picks a core
        #[arg(long, value_enum, default_value = "capacity")]
        choose: ChooseArg,

        /// Task type to submit
        #[arg(long, value_enum, default_value = "trig-core")]
        kind: KindArg,

        /// Number of tasks
        #[arg(long, default_value = "64")]
        tasks: u32,

        /// Descriptors per task (fifo slots per task)
        #[arg(long, default_value = "2")]
        descriptors: usize,

        /// Estimated run time of one descriptor at the highest clock, in microseconds
        #[arg(long, default_value = "200")]
        estimate_us: u64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the library version
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum ChooseArg {
    Capacity,
    Load,
}

impl From<ChooseArg> for ChooseMethod {
    fn from(arg: ChooseArg) -> Self {
        match arg {
            ChooseArg::Capacity => ChooseMethod::ByCapacity,
            ChooseArg::Load => ChooseMethod::ByEstimatedLoad,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Sync,
    TrigTask,
    TrigCore,
}

impl From<KindArg> for TaskType {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Sync => TaskType::Sync,
            KindArg::TrigTask => TaskType::TrigTask,
            KindArg::TrigCore => TaskType::TrigCore,
        }
    }
}

#[derive(Default, Serialize)]
struct BenchReport {
    tasks: u32,
    done: u32,
    failed: u32,
    busy_retries: u32,
    elapsed_ms: u64,
    per_core: BTreeMap<u32, u32>,
}

impl BenchReport {
    fn record(&mut self, rt: &Runtime, task: TaskHandle) -> Result<()> {
        match rt.task_status(task) {
            TaskStatus::Done => self.done += 1,
            _ => self.failed += 1,
        }
        if let Some(core) = rt.task_assigned_core(task)? {
            *self.per_core.entry(core).or_insert(0) += 1;
        }
        rt.task_free(task)?;
        Ok(())
    }
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for the oldest outstanding asynchronous task.
async fn reap_one(
    rt: &Runtime,
    core: accel_dispatch::CoreHandle,
    kind: TaskType,
    outstanding: &mut Vec<TaskHandle>,
    timeout: Option<Duration>,
) -> Result<Option<TaskHandle>> {
    let result = match kind {
        TaskType::TrigTask => {
            let Some(&oldest) = outstanding.first() else {
                return Ok(None);
            };
            rt.task_wait(oldest, timeout).await.map(|_| oldest)
        }
        _ => rt.core_wait(core, timeout).await,
    };
    match result {
        Ok(task) => {
            outstanding.retain(|t| *t != task);
            Ok(Some(task))
        }
        Err(BpuError::Timeout) => Ok(None),
        Err(e) => Err(e).context("waiting for a completion"),
    }
}

async fn run_bench(
    rt: &Runtime,
    mask: u32,
    method: ChooseMethod,
    kind: TaskType,
    tasks: u32,
    descriptors: usize,
    estimate: Duration,
) -> Result<BenchReport> {
    let core = rt.core_open(mask, method).context("opening core handle")?;
    let mut report = BenchReport {
        tasks,
        ..BenchReport::default()
    };
    let mut outstanding = Vec::new();
    let started = Instant::now();

    for n in 0..tasks {
        let task = rt.task_alloc(kind);
        let program = (0..descriptors)
            .map(|d| WorkDescriptor::new(Bytes::from(format!("job{n}-op{d}")), estimate))
            .collect();
        rt.task_config(task, program)?;
        rt.task_set_prio(task, n % 4)?;

        loop {
            match rt.process(core, task).await {
                Ok(TaskStatus::Process) => {
                    outstanding.push(task);
                    break;
                }
                Ok(_) => {
                    report.record(rt, task)?;
                    break;
                }
                Err(e) if e.is_retryable() => {
                    report.busy_retries += 1;
                    let wait = Some(Duration::from_millis(50));
                    if let Some(finished) = reap_one(rt, core, kind, &mut outstanding, wait).await? {
                        report.record(rt, finished)?;
                    }
                }
                Err(e) => return Err(e).with_context(|| format!("submitting task {n}")),
            }
        }
    }

    while !outstanding.is_empty() {
        if let Some(finished) = reap_one(rt, core, kind, &mut outstanding, None).await? {
            report.record(rt, finished)?;
        }
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    rt.core_close(core).context("closing core handle")?;
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DispatchConfig::load(path)?,
        None => DispatchConfig::load_or_default(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Info { json } => {
            let rt = Runtime::new(config).context("starting dispatch runtime")?;
            let info = rt.info();
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("\naccel-dispatch {}", info.version);
                println!(
                    "{:<5} | {:<8} | {:<14} | {:<5} | {:<12} | Slots",
                    "Core", "Type", "Firmware", "Power", "Clock"
                );
                println!("{:-<5}-|-{:-<8}-|-{:-<14}-|-{:-<5}-|-{:-<12}-|-{:-<9}", "", "", "", "", "", "");
                for core in &info.cores {
                    println!(
                        "{:<5} | {:<8} | {:<#14x} | {:<5} | {:<12} | {}/{}",
                        core.index,
                        format!("{:?}", core.core_type),
                        core.firmware_version,
                        format!("{:?}", core.power),
                        core.clock_hz,
                        core.remaining,
                        core.capacity
                    );
                }
                println!("\nGroups:");
                for group in &info.groups {
                    println!(" - group {:<4} proportion {}%", group.group, group.proportion);
                }
                println!("Mapped pages: {}", info.mapped_pages);
                println!();
            }
            rt.shutdown();
        }
        Commands::Bench {
            mask,
            choose,
            kind,
            tasks,
            descriptors,
            estimate_us,
            json,
        } => {
            let rt = Runtime::new(config).context("starting dispatch runtime")?;
            tracing::info!(mask, tasks, descriptors, estimate_us, "running dispatch bench");
            let report = run_bench(
                &rt,
                mask,
                choose.into(),
                kind.into(),
                tasks,
                descriptors,
                Duration::from_micros(estimate_us),
            )
            .await?;
            rt.shutdown();

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\n=== Dispatch Bench ===");
                println!("Tasks:        {}", report.tasks);
                println!("Done:         {}", report.done);
                println!("Failed:       {}", report.failed);
                println!("Busy retries: {}", report.busy_retries);
                println!("Elapsed:      {} ms", report.elapsed_ms);
                for (core, count) in &report.per_core {
                    println!(" - core {core}: {count} task(s)");
                }
                println!("======================\n");
            }
        }
        Commands::Version => {
            let (major, minor, patch) = accel_dispatch::version();
            println!("accel-dispatch {major}.{minor}.{patch}");
        }
    }

    Ok(())
}
