//! Host memory ranges made visible to physical cores.
//!
//! Maps are bookkeeping only: they are not reference counted against tasks,
//! and unmapping a range still named by in-flight descriptors is caller error.
//! Closing a core handle releases the maps made through it.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::arena::{Arena, Key};
use crate::error::{BpuError, Result};
use crate::scheduler::CoreHandle;

/// Opaque handle to a map.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapHandle(pub(crate) Key);

impl MapHandle {
    pub fn to_raw(self) -> u64 {
        self.0.to_raw()
    }

    pub fn from_raw(raw: u64) -> Self {
        MapHandle(Key::from_raw(raw))
    }
}

impl fmt::Debug for MapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map:{:?}", self.0)
    }
}

/// Per-core access bits of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MapMode(u32);

impl MapMode {
    pub const NONE: MapMode = MapMode(0);
    pub const READ: MapMode = MapMode(0x1);
    pub const WRITE: MapMode = MapMode(0x2);
    pub const READ_WRITE: MapMode = MapMode(0x3);

    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::READ_WRITE.0 != 0 {
            return Err(BpuError::invalid(format!("unknown map mode bits {bits:#x}")));
        }
        Ok(MapMode(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Write access implies read access.
    pub fn allows_read(self) -> bool {
        self.0 & (Self::READ.0 | Self::WRITE.0) != 0
    }

    pub fn allows_write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

impl std::ops::BitOr for MapMode {
    type Output = MapMode;

    fn bitor(self, rhs: MapMode) -> MapMode {
        MapMode(self.0 | rhs.0)
    }
}

/// Summary of a live map.
#[derive(Debug, Clone, Serialize)]
pub struct MapInfo {
    pub base: u64,
    pub size: u64,
    pub modes: BTreeMap<u32, MapMode>,
}

struct MapRecord {
    owner: CoreHandle,
    base: u64,
    size: u64,
    pages: u64,
    modes: BTreeMap<u32, MapMode>,
}

impl MapRecord {
    fn overlaps(&self, base: u64, size: u64) -> bool {
        base < self.base + self.size && self.base < base + size
    }
}

pub struct Mapper {
    maps: Arena<MapRecord>,
    page_size: u64,
    max_pages: u64,
    used_pages: u64,
}

impl Mapper {
    pub fn new(page_size: u64, max_pages: u64) -> Self {
        Self {
            maps: Arena::new(),
            page_size,
            max_pages,
            used_pages: 0,
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn max_pages(&self) -> u64 {
        self.max_pages
    }

    pub fn used_pages(&self) -> u64 {
        self.used_pages
    }

    /// Map `[base, base + size)` for every core in `cores`, read/write by default.
    pub fn map(&mut self, owner: CoreHandle, cores: &[u32], base: u64, size: u64) -> Result<MapHandle> {
        if size == 0 {
            return Err(BpuError::invalid("map size must be non-zero"));
        }
        if base % self.page_size != 0 || size % self.page_size != 0 {
            return Err(BpuError::invalid(format!(
                "map range {base:#x}+{size:#x} is not aligned to {:#x}",
                self.page_size
            )));
        }
        if base.checked_add(size).is_none() {
            return Err(BpuError::invalid("map range overflows the address space"));
        }
        if self
            .maps
            .iter()
            .any(|(_, m)| m.owner == owner && m.overlaps(base, size))
        {
            return Err(BpuError::invalid(format!(
                "range {base:#x}+{size:#x} overlaps an existing map of this core handle"
            )));
        }
        let pages = size / self.page_size;
        if self.used_pages + pages > self.max_pages {
            return Err(BpuError::NoMemory(format!(
                "{pages} pages requested, {} translation entries left",
                self.max_pages - self.used_pages
            )));
        }

        self.used_pages += pages;
        let modes = cores.iter().map(|&c| (c, MapMode::READ_WRITE)).collect();
        let key = self.maps.insert(MapRecord {
            owner,
            base,
            size,
            pages,
            modes,
        });
        debug!(map = ?key, base, size, pages, "range mapped");
        Ok(MapHandle(key))
    }

    pub fn unmap(&mut self, map: MapHandle) -> Result<()> {
        let record = self
            .maps
            .remove(map.0)
            .ok_or_else(|| BpuError::invalid(format!("{map:?} is not a live map")))?;
        self.used_pages -= record.pages;
        debug!(?map, base = record.base, "range unmapped");
        Ok(())
    }

    /// Drop every map owned by `owner`, returning how many were released.
    pub fn release_owner(&mut self, owner: CoreHandle) -> usize {
        let owned: Vec<Key> = self
            .maps
            .iter()
            .filter(|(_, m)| m.owner == owner)
            .map(|(key, _)| key)
            .collect();
        for key in &owned {
            if let Some(record) = self.maps.remove(*key) {
                self.used_pages -= record.pages;
            }
        }
        owned.len()
    }

    fn record_mut(&mut self, map: MapHandle) -> Result<&mut MapRecord> {
        self.maps
            .get_mut(map.0)
            .ok_or_else(|| BpuError::invalid(format!("{map:?} is not a live map")))
    }

    pub fn set_mode(&mut self, map: MapHandle, core: u32, mode: MapMode) -> Result<()> {
        let record = self.record_mut(map)?;
        let slot = record
            .modes
            .get_mut(&core)
            .ok_or_else(|| BpuError::invalid(format!("core {core} is not covered by {map:?}")))?;
        *slot = mode;
        Ok(())
    }

    pub fn mode(&self, map: MapHandle, core: u32) -> Result<MapMode> {
        let record = self
            .maps
            .get(map.0)
            .ok_or_else(|| BpuError::invalid(format!("{map:?} is not a live map")))?;
        record
            .modes
            .get(&core)
            .copied()
            .ok_or_else(|| BpuError::invalid(format!("core {core} is not covered by {map:?}")))
    }

    pub fn info(&self, map: MapHandle) -> Result<MapInfo> {
        let record = self
            .maps
            .get(map.0)
            .ok_or_else(|| BpuError::invalid(format!("{map:?} is not a live map")))?;
        Ok(MapInfo {
            base: record.base,
            size: record.size,
            modes: record.modes.clone(),
        })
    }
}
