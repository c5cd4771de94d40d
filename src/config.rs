//! TOML configuration for the dispatch runtime.
//!
//! A layered model: every section has compiled-in defaults, a file may
//! override any subset, and the file path can be supplied explicitly, through
//! the `ACCEL_DISPATCH_CONFIG` environment variable, or from the standard
//! system location.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::device::CoreType;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "ACCEL_DISPATCH_CONFIG";

/// Standard system location of the configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/accel-dispatch/dispatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a dispatch runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DispatchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), cores = config.device.cores.len(), "loaded dispatch configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `ACCEL_DISPATCH_CONFIG`.
    /// 2. `/etc/accel-dispatch/dispatch.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ACCEL_DISPATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject configurations the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.device.cores.len() > 32 {
            anyhow::bail!("at most 32 cores can be addressed by a core mask");
        }
        if !self.device.page_size.is_power_of_two() {
            anyhow::bail!("page_size {:#x} is not a power of two", self.device.page_size);
        }
        for (index, core) in self.device.cores.iter().enumerate() {
            if core.fifo_capacity == 0 {
                anyhow::bail!("core {index}: fifo_capacity must be > 0");
            }
            if core.frequency_levels_hz.is_empty() {
                anyhow::bail!("core {index}: at least one frequency level is required");
            }
            if core.frequency_levels_hz.iter().any(|&hz| hz <= 1) {
                anyhow::bail!("core {index}: frequency levels must be > 1 Hz");
            }
            if core.frequency_levels_hz.windows(2).any(|w| w[0] <= w[1]) {
                anyhow::bail!("core {index}: frequency levels must be strictly descending");
            }
        }
        if self.memory.window_base % self.device.page_size != 0 {
            anyhow::bail!("memory window base is not page aligned");
        }
        if self.memory.phys_base % self.device.page_size != 0 {
            anyhow::bail!("memory phys_base is not page aligned");
        }
        if !(0.0..=1.0).contains(&self.simulation.fault_rate) {
            anyhow::bail!("fault_rate must be within [0, 1]");
        }
        if self.simulation.time_scale < 0.0 {
            anyhow::bail!("time_scale must not be negative");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Installed physical cores and device-wide limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// One entry per installed core; the position is the core index.
    pub cores: Vec<CoreConfig>,
    /// Page size used for map alignment.
    pub page_size: u64,
    /// Device-side translation entries (in pages) shared by all maps.
    pub max_mapped_pages: u64,
    /// Highest priority a task may request.
    pub max_priority: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            cores: vec![CoreConfig::default(), CoreConfig::default()],
            page_size: 0x1000,
            max_mapped_pages: 262_144,
            max_priority: 255,
        }
    }
}

/// A single physical core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub core_type: CoreType,
    pub firmware_version: u64,
    /// Buffer slots; a task consumes one slot per work descriptor.
    pub fifo_capacity: u32,
    /// Available clock points, highest first. Level 0 is the first entry.
    pub frequency_levels_hz: Vec<u64>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            core_type: CoreType::FourPe,
            firmware_version: 0x0002_0001_0002,
            fifo_capacity: 32,
            frequency_levels_hz: vec![1_000_000_000, 800_000_000, 600_000_000, 400_000_000],
        }
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Simulated device memory window served by the memory pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub window_base: u64,
    pub window_size: u64,
    /// Physical address the window starts at.
    pub phys_base: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            window_base: 0x8000_0000,
            window_size: 256 * 1024 * 1024,
            phys_base: 0x2000_0000,
        }
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Behaviour of the built-in simulated executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Multiplier on descriptor estimates (0 runs jobs back to back).
    pub time_scale: f64,
    /// Probability that a job ends in the error state.
    pub fault_rate: f64,
    /// Seed for fault injection; random when unset.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            fault_rate: 0.0,
            seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging configuration for the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
