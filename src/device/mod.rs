//! Physical accelerator cores: identity, power and clock management.
//!
//! Power and clock state live in the shared runtime context and are consulted
//! by the dispatcher before a core starts its next job.

pub mod executor;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::CoreConfig;
use crate::error::{BpuError, Result};

/// Clock value passed to [`DeviceTable::set_clk`] to gate the clock.
pub const CLK_OFF: u64 = 0;
/// Clock value passed to [`DeviceTable::set_clk`] to ungate at the current level.
pub const CLK_ON: u64 = 1;
/// Frequency level of the fastest clock point.
pub const HIGHEST_FRQ: i32 = 0;

/// Internal parallelism of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreType {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "4pe")]
    FourPe,
    #[serde(rename = "1pe")]
    OnePe,
    #[serde(rename = "2pe")]
    TwoPe,
    /// Arbitrary processing-element configuration.
    #[serde(rename = "any")]
    Any,
}

/// Identity of one physical core as reported by `core_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoreInfo {
    pub core_type: CoreType,
    pub firmware_version: u64,
}

/// What one core advertises to `fw_get_feature`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreFeatures {
    pub index: u32,
    pub core_type: CoreType,
    pub firmware_version: u64,
    pub fifo_capacity: u32,
    pub frequency_levels_hz: Vec<u64>,
}

/// Feature block of the whole device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareFeatures {
    pub cores: Vec<CoreFeatures>,
    pub max_priority: u32,
    pub page_size: u64,
    pub max_mapped_pages: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Off,
    On,
}

/// Runtime state of one physical core.
#[derive(Debug)]
pub struct CoreDevice {
    info: CoreInfo,
    power: PowerState,
    clock_enabled: bool,
    levels_hz: Vec<u64>,
    /// Index into `levels_hz`; level `0` is the highest frequency.
    level: usize,
}

impl CoreDevice {
    fn new(cfg: &CoreConfig) -> Self {
        Self {
            info: CoreInfo {
                core_type: cfg.core_type,
                firmware_version: cfg.firmware_version,
            },
            power: PowerState::On,
            clock_enabled: true,
            levels_hz: cfg.frequency_levels_hz.clone(),
            level: 0,
        }
    }

    /// Whether the core may start a new job.
    pub fn can_run(&self) -> bool {
        self.power == PowerState::On && self.clock_enabled
    }

    /// Clock points, fastest first.
    pub fn levels_hz(&self) -> &[u64] {
        &self.levels_hz
    }

    pub fn current_hz(&self) -> u64 {
        self.levels_hz[self.level]
    }

    /// Stretch a time estimated at the highest clock to the current clock.
    pub fn scale(&self, at_highest: Duration) -> Duration {
        let highest = self.levels_hz[0] as u128;
        let current = self.current_hz() as u128;
        let nanos = at_highest.as_nanos().saturating_mul(highest) / current;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

/// Table of installed physical cores indexed by core number.
#[derive(Debug)]
pub struct DeviceTable {
    cores: Vec<CoreDevice>,
}

impl DeviceTable {
    pub fn new(cfgs: &[CoreConfig]) -> Self {
        Self {
            cores: cfgs.iter().map(CoreDevice::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    /// Bitmask with one bit set per installed core.
    pub fn installed_mask(&self) -> u32 {
        match self.cores.len() {
            0 => 0,
            n if n >= 32 => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }

    pub fn core(&self, index: u32) -> Result<&CoreDevice> {
        self.cores
            .get(index as usize)
            .ok_or_else(|| BpuError::invalid(format!("core index {index} out of range")))
    }

    fn core_mut(&mut self, index: u32) -> Result<&mut CoreDevice> {
        self.cores
            .get_mut(index as usize)
            .ok_or_else(|| BpuError::invalid(format!("core index {index} out of range")))
    }

    pub fn info(&self, index: u32) -> Result<CoreInfo> {
        Ok(self.core(index)?.info)
    }

    pub fn set_power(&mut self, index: u32, state: PowerState) -> Result<()> {
        let core = self.core_mut(index)?;
        if core.power != state {
            info!(core = index, ?state, "core power changed");
        }
        core.power = state;
        Ok(())
    }

    pub fn power(&self, index: u32) -> Result<PowerState> {
        Ok(self.core(index)?.power)
    }

    /// `CLK_OFF` gates the clock, `CLK_ON` ungates it at the current level, any
    /// other value selects that exact frequency point and ungates.
    pub fn set_clk(&mut self, index: u32, value: u64) -> Result<()> {
        let core = self.core_mut(index)?;
        match value {
            CLK_OFF => core.clock_enabled = false,
            CLK_ON => core.clock_enabled = true,
            hz => {
                let level = core
                    .levels_hz
                    .iter()
                    .position(|&l| l == hz)
                    .ok_or_else(|| {
                        BpuError::invalid(format!("{hz} Hz is not a frequency point of core {index}"))
                    })?;
                core.level = level;
                core.clock_enabled = true;
            }
        }
        info!(core = index, value, "core clock set");
        Ok(())
    }

    /// Current clock in Hz, or `CLK_OFF` when gated or powered down.
    pub fn clk(&self, index: u32) -> Result<u64> {
        let core = self.core(index)?;
        if core.can_run() {
            Ok(core.current_hz())
        } else {
            Ok(CLK_OFF)
        }
    }

    pub fn frq_level_num(&self, index: u32) -> Result<i32> {
        Ok(self.core(index)?.levels_hz.len() as i32)
    }

    /// `0` is the highest level; `-n` steps down `n` frequency points.
    pub fn set_frq_level(&mut self, index: u32, level: i32) -> Result<()> {
        let core = self.core_mut(index)?;
        let steps = level.checked_neg().filter(|s| *s >= 0).ok_or_else(|| {
            BpuError::invalid(format!("frequency level {level} must be <= {HIGHEST_FRQ}"))
        })? as usize;
        if steps >= core.levels_hz.len() {
            return Err(BpuError::invalid(format!(
                "frequency level {level} below lowest level -{}",
                core.levels_hz.len() - 1
            )));
        }
        core.level = steps;
        info!(core = index, level, hz = core.current_hz(), "core frequency level set");
        Ok(())
    }

    pub fn frq_level(&self, index: u32) -> Result<i32> {
        Ok(-(self.core(index)?.level as i32))
    }
}
