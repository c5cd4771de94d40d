//! Group registry: scheduling proportions shared by every core handle.
//!
//! A group's proportion caps the share of each physical core's fifo slots
//! that its tasks may hold at once. Group 0 always exists at 100.

use std::collections::BTreeMap;

use tracing::info;

use crate::error::{BpuError, Result};

pub const DEFAULT_GROUP: u32 = 0;
pub const MAX_PROPORTION: u32 = 100;

#[derive(Debug)]
pub struct GroupRegistry {
    proportions: BTreeMap<u32, u32>,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupRegistry {
    pub fn new() -> Self {
        let mut proportions = BTreeMap::new();
        proportions.insert(DEFAULT_GROUP, MAX_PROPORTION);
        Self { proportions }
    }

    /// Set a group's proportion; `0` deletes the record.
    ///
    /// Proportions across groups are not required to sum to 100.
    pub fn set_proportion(&mut self, group: u32, proportion: u32) -> Result<()> {
        if proportion > MAX_PROPORTION {
            return Err(BpuError::invalid(format!(
                "proportion {proportion} exceeds {MAX_PROPORTION}"
            )));
        }
        if group == DEFAULT_GROUP {
            if proportion != MAX_PROPORTION {
                return Err(BpuError::invalid("group 0 proportion is fixed at 100"));
            }
            return Ok(());
        }
        if proportion == 0 {
            if self.proportions.remove(&group).is_some() {
                info!(group, "group record deleted");
            }
        } else {
            self.proportions.insert(group, proportion);
            info!(group, proportion, "group proportion set");
        }
        Ok(())
    }

    pub fn proportion(&self, group: u32) -> Option<u32> {
        self.proportions.get(&group).copied()
    }

    /// Tasks may only join groups with a live record.
    pub fn check_assignable(&self, group: u32) -> Result<()> {
        if self.proportions.contains_key(&group) {
            Ok(())
        } else {
            Err(BpuError::NoGroup(group))
        }
    }

    /// Slots `group` may hold on a fifo of `capacity` slots.
    ///
    /// A deleted group is treated like group 0.
    pub fn slot_limit(&self, group: u32, capacity: u32) -> u32 {
        let proportion = self.proportion(group).unwrap_or(MAX_PROPORTION);
        let share = u64::from(capacity) * u64::from(proportion) / u64::from(MAX_PROPORTION);
        (share as u32).max(1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.proportions.iter().map(|(g, p)| (*g, *p))
    }
}
