//! Device memory: a page-granular allocator over the device window, plus
//! registration of externally owned ranges, plus per-core maps.
//!
//! Accelerator-side and CPU-side allocations share one window and one
//! address space. Every known range is backed by host bytes that grow on
//! first write, so copies between ranges can be checked end to end.

pub mod map;

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tracing::debug;

use crate::config::MemoryConfig;
use crate::error::{BpuError, Result};

/// Width of one core's slice of the simulated IOVA space.
pub const IOVA_CORE_STRIDE: u64 = 1 << 40;
/// Start of the host-side IOVA space; device-side IOVAs sit below it.
pub const HOST_IOVA_BASE: u64 = 1 << 48;

/// Allocation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemFlags(u32);

impl MemFlags {
    pub const NON_CACHEABLE: MemFlags = MemFlags(0);
    pub const CACHEABLE: MemFlags = MemFlags(0x1);
    pub const COHERENT: MemFlags = MemFlags(0x2);
    /// Read-only for the accelerator.
    pub const READ_ONLY: MemFlags = MemFlags(0x100);
    /// Core affinity. Without any core bit the memory serves every core.
    pub const CORE0: MemFlags = MemFlags(0x1_0000);
    pub const CORE1: MemFlags = MemFlags(0x2_0000);
    pub const CORE2: MemFlags = MemFlags(0x4_0000);

    const AFFINITY_SHIFT: u32 = 16;
    const AFFINITY_BITS: u32 = 0x7;

    pub fn contains(self, other: MemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Core mask named by the affinity bits; `0` means no restriction.
    pub fn affinity(self) -> u32 {
        (self.0 >> Self::AFFINITY_SHIFT) & Self::AFFINITY_BITS
    }

    /// Whether memory with these flags may be used by `core`.
    pub fn serves_core(self, core: u32) -> bool {
        let mask = self.affinity();
        mask == 0 || (core < 32 && mask & (1 << core) != 0)
    }
}

impl std::ops::BitOr for MemFlags {
    type Output = MemFlags;

    fn bitor(self, rhs: MemFlags) -> MemFlags {
        MemFlags(self.0 | rhs.0)
    }
}

/// Cache maintenance requested by [`MemPool::cache_sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// Drop CPU cache lines so device writes become visible.
    Invalidate,
    /// Write back CPU cache lines so the device sees them.
    Clean,
}

/// Direction of a [`MemPool::memcpy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// From CPU-side or registered memory into accelerator memory.
    CpuToBpu,
    /// From accelerator memory into CPU-side or registered memory.
    BpuToCpu,
}

/// Who a range of memory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemKind {
    /// Allocated for the accelerator.
    Device,
    /// Allocated for CPU use.
    Cpu,
    /// Registered from outside the pool.
    External,
}

impl MemKind {
    fn host_side(self) -> bool {
        matches!(self, MemKind::Cpu | MemKind::External)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub addr: u64,
    pub size: u64,
    pub flags: MemFlags,
    pub label: Option<String>,
    pub kind: MemKind,
}

impl Allocation {
    fn end(&self) -> u64 {
        self.addr + self.size
    }

    fn contains(&self, addr: u64, size: u64) -> bool {
        addr >= self.addr && addr.saturating_add(size) <= self.end()
    }
}

struct Region {
    info: Allocation,
    /// Bytes written so far; anything past the end reads as zero.
    data: BytesMut,
}

pub struct MemPool {
    base: u64,
    end: u64,
    phys_base: u64,
    page_size: u64,
    regions: BTreeMap<u64, Region>,
}

impl MemPool {
    pub fn new(cfg: &MemoryConfig, page_size: u64) -> Self {
        Self {
            base: cfg.window_base,
            end: cfg.window_base.saturating_add(cfg.window_size),
            phys_base: cfg.phys_base,
            page_size,
            regions: BTreeMap::new(),
        }
    }

    fn round_up(&self, size: u64) -> Option<u64> {
        size.checked_add(self.page_size - 1)
            .map(|s| s / self.page_size * self.page_size)
    }

    /// First-fit page-aligned allocation for the accelerator.
    pub fn alloc(&mut self, size: u64, flags: MemFlags, label: Option<&str>) -> Result<u64> {
        self.carve(size, flags, label, MemKind::Device)
    }

    /// First-fit page-aligned allocation for CPU use.
    pub fn cpu_alloc(&mut self, size: u64, flags: MemFlags, label: Option<&str>) -> Result<u64> {
        self.carve(size, flags, label, MemKind::Cpu)
    }

    fn carve(&mut self, size: u64, flags: MemFlags, label: Option<&str>, kind: MemKind) -> Result<u64> {
        if size == 0 {
            return Err(BpuError::invalid("allocation size must be non-zero"));
        }
        let size = self
            .round_up(size)
            .ok_or_else(|| BpuError::invalid("allocation size overflows"))?;

        // Registered ranges inside the window are holes like any other.
        let mut cursor = self.base;
        for a in self.regions.values().map(|r| &r.info) {
            if a.addr >= cursor && a.addr - cursor >= size {
                break;
            }
            cursor = cursor.max(self.round_up(a.end()).unwrap_or(u64::MAX));
        }
        if self.end.saturating_sub(cursor) < size {
            return Err(BpuError::NoMemory(format!("no {size:#x}-byte gap in device window")));
        }

        self.insert(Allocation {
            addr: cursor,
            size,
            flags,
            label: label.map(str::to_string),
            kind,
        });
        debug!(addr = cursor, size, ?kind, ?label, "memory allocated");
        Ok(cursor)
    }

    fn insert(&mut self, info: Allocation) {
        self.regions.insert(
            info.addr,
            Region {
                info,
                data: BytesMut::new(),
            },
        );
    }

    fn remove_kind(&mut self, addr: u64, kind: MemKind) -> Result<()> {
        match self.regions.get(&addr) {
            Some(r) if r.info.kind == kind => {
                self.regions.remove(&addr);
                debug!(addr, ?kind, "memory released");
                Ok(())
            }
            _ => Err(BpuError::invalid(format!("{addr:#x} is not a {kind:?} allocation"))),
        }
    }

    pub fn free(&mut self, addr: u64) -> Result<()> {
        self.remove_kind(addr, MemKind::Device)
    }

    pub fn cpu_free(&mut self, addr: u64) -> Result<()> {
        self.remove_kind(addr, MemKind::Cpu)
    }

    /// Make an externally owned range known to the device.
    pub fn register(&mut self, addr: u64, size: u64) -> Result<u64> {
        if size == 0 || addr.checked_add(size).is_none() {
            return Err(BpuError::invalid("registered range is empty or overflows"));
        }
        let overlaps = self
            .regions
            .values()
            .any(|r| addr < r.info.end() && r.info.addr < addr + size);
        if overlaps {
            return Err(BpuError::invalid(format!(
                "range {addr:#x}+{size:#x} overlaps known device memory"
            )));
        }
        self.insert(Allocation {
            addr,
            size,
            flags: MemFlags::NON_CACHEABLE,
            label: None,
            kind: MemKind::External,
        });
        Ok(addr)
    }

    pub fn unregister(&mut self, addr: u64) -> Result<()> {
        match self.regions.get(&addr) {
            Some(r) if r.info.kind == MemKind::External => {
                self.regions.remove(&addr);
                Ok(())
            }
            _ => Err(BpuError::invalid(format!("{addr:#x} is not a registered range"))),
        }
    }

    fn region(&self, addr: u64, size: u64) -> Result<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.info.contains(addr, size))
            .ok_or_else(|| {
                BpuError::invalid(format!("{addr:#x}+{size:#x} is not inside known memory"))
            })
    }

    fn region_mut(&mut self, addr: u64, size: u64) -> Result<&mut Region> {
        self.regions
            .range_mut(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.info.contains(addr, size))
            .ok_or_else(|| {
                BpuError::invalid(format!("{addr:#x}+{size:#x} is not inside known memory"))
            })
    }

    /// Validate a cache maintenance request. Non-cacheable memory needs none.
    pub fn cache_sync(&self, addr: u64, size: u64, op: CacheOp) -> Result<()> {
        let region = self.region(addr, size)?;
        if region.info.flags.contains(MemFlags::CACHEABLE) {
            debug!(addr, size, ?op, "cache maintenance");
        }
        Ok(())
    }

    pub fn is_cacheable(&self, addr: u64) -> Result<bool> {
        Ok(self.region(addr, 1)?.info.flags.contains(MemFlags::CACHEABLE))
    }

    /// Store `bytes` at `addr` from the host side.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        let region = self.region_mut(addr, bytes.len() as u64)?;
        let offset = (addr - region.info.addr) as usize;
        let end = offset + bytes.len();
        if region.data.len() < end {
            region.data.resize(end, 0);
        }
        region.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Read `len` bytes at `addr`.
    pub fn read(&self, addr: u64, len: u64) -> Result<Bytes> {
        let region = self.region(addr, len)?;
        let offset = (addr - region.info.addr) as usize;
        let mut out = BytesMut::zeroed(len as usize);
        let stored = region.data.len().saturating_sub(offset).min(out.len());
        if stored > 0 {
            out[..stored].copy_from_slice(&region.data[offset..offset + stored]);
        }
        Ok(out.freeze())
    }

    /// Copy between CPU-side and accelerator memory.
    ///
    /// `CpuToBpu` needs a CPU or registered source and a device destination;
    /// `BpuToCpu` the reverse.
    pub fn memcpy(&mut self, dst: u64, src: u64, size: u64, direction: CopyDirection) -> Result<()> {
        if size == 0 {
            return Err(BpuError::invalid("copy size must be non-zero"));
        }
        let src_kind = self.region(src, size)?.info.kind;
        let dst_kind = self.region(dst, size)?.info.kind;
        let legal = match direction {
            CopyDirection::CpuToBpu => src_kind.host_side() && dst_kind == MemKind::Device,
            CopyDirection::BpuToCpu => src_kind == MemKind::Device && dst_kind.host_side(),
        };
        if !legal {
            return Err(BpuError::invalid(format!(
                "{direction:?} copy from {src_kind:?} to {dst_kind:?} memory"
            )));
        }
        let bytes = self.read(src, size)?;
        self.write(dst, &bytes)?;
        debug!(dst, src, size, ?direction, "memory copied");
        Ok(())
    }

    /// Physical address behind `addr`. Registered ranges are physical already.
    pub fn phys_addr(&self, addr: u64) -> Result<u64> {
        let region = self.region(addr, 1)?;
        Ok(match region.info.kind {
            MemKind::External => addr,
            MemKind::Device | MemKind::Cpu => self.phys_base + (addr - self.base),
        })
    }

    fn iova(&self, addr: u64, core: u32, space: u64) -> Result<u64> {
        let flags = self.region(addr, 1)?.info.flags;
        if !flags.serves_core(core) {
            return Err(BpuError::NoData);
        }
        let phys = self.phys_addr(addr)?;
        Ok(space + u64::from(core) * IOVA_CORE_STRIDE + phys % IOVA_CORE_STRIDE)
    }

    /// Address `core` uses to reach `addr`. `NoData` when the memory's
    /// affinity excludes the core.
    pub fn device_iova(&self, addr: u64, core: u32) -> Result<u64> {
        self.iova(addr, core, IOVA_CORE_STRIDE)
    }

    /// Host-side translation of `addr` for `core`.
    pub fn host_iova(&self, addr: u64, core: u32) -> Result<u64> {
        self.iova(addr, core, HOST_IOVA_BASE)
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.regions.values().map(|r| &r.info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> MemPool {
        MemPool::new(
            &MemoryConfig {
                window_base: 0x10_0000,
                window_size: 0x4000,
                phys_base: 0x2000_0000,
            },
            0x1000,
        )
    }

    #[test]
    fn test_alloc_rounds_to_pages() {
        let mut p = pool();
        let a = p.alloc(10, MemFlags::CACHEABLE, Some("weights")).unwrap();
        let b = p.alloc(0x1001, MemFlags::NON_CACHEABLE, None).unwrap();
        assert_eq!(a, 0x10_0000);
        assert_eq!(b, 0x10_1000);
        assert_eq!(p.allocations().count(), 2);
    }

    #[test]
    fn test_window_exhausted_then_reused() {
        let mut p = pool();
        let a = p.alloc(0x2000, MemFlags::NON_CACHEABLE, None).unwrap();
        p.alloc(0x2000, MemFlags::NON_CACHEABLE, None).unwrap();
        assert!(matches!(
            p.alloc(0x1000, MemFlags::NON_CACHEABLE, None),
            Err(BpuError::NoMemory(_))
        ));
        p.free(a).unwrap();
        assert_eq!(p.alloc(0x1000, MemFlags::NON_CACHEABLE, None).unwrap(), a);
    }

    #[test]
    fn test_free_unknown_rejected() {
        let mut p = pool();
        assert!(p.free(0x1234).is_err());
        assert!(p.alloc(0, MemFlags::NON_CACHEABLE, None).is_err());
    }

    #[test]
    fn test_register_external() {
        let mut p = pool();
        let addr = p.register(0x9000_0000, 0x800).unwrap();
        assert!(p.register(0x9000_0400, 0x100).is_err());
        assert!(p.free(addr).is_err());
        p.unregister(addr).unwrap();
        assert!(p.unregister(addr).is_err());
    }

    #[test]
    fn test_alloc_skips_registered_range_in_window() {
        let mut p = pool();
        p.register(0x10_0000, 0x1000).unwrap();
        let a = p.alloc(0x1000, MemFlags::NON_CACHEABLE, None).unwrap();
        assert_eq!(a, 0x10_1000);

        // The gap after an unaligned registration starts on the next page.
        p.register(0x10_2000, 0x800).unwrap();
        assert_eq!(p.alloc(0x1000, MemFlags::NON_CACHEABLE, None).unwrap(), 0x10_3000);
        assert!(matches!(
            p.alloc(0x1000, MemFlags::NON_CACHEABLE, None),
            Err(BpuError::NoMemory(_))
        ));

        p.unregister(0x10_0000).unwrap();
        p.unregister(0x10_2000).unwrap();
        assert_eq!(p.alloc(0x1000, MemFlags::NON_CACHEABLE, None).unwrap(), 0x10_0000);
    }

    #[test]
    fn test_cpu_and_device_frees_do_not_mix() {
        let mut p = pool();
        let cpu = p.cpu_alloc(0x100, MemFlags::CACHEABLE, Some("frame")).unwrap();
        let dev = p.alloc(0x100, MemFlags::NON_CACHEABLE, None).unwrap();
        assert!(p.free(cpu).is_err());
        assert!(p.cpu_free(dev).is_err());
        p.cpu_free(cpu).unwrap();
        p.free(dev).unwrap();
    }

    #[test]
    fn test_cache_sync_bounds() {
        let mut p = pool();
        let a = p.alloc(0x1000, MemFlags::CACHEABLE | MemFlags::COHERENT, None).unwrap();
        assert!(p.cache_sync(a + 0x10, 0x100, CacheOp::Clean).is_ok());
        assert!(p.cache_sync(a + 0x800, 0x1000, CacheOp::Invalidate).is_err());
        assert!(p.cache_sync(0x1, 0x1, CacheOp::Clean).is_err());
        assert!(p.is_cacheable(a + 0x20).unwrap());
        assert!(p.is_cacheable(0x1).is_err());
    }

    #[test]
    fn test_memcpy_follows_direction() {
        let mut p = pool();
        let host = p.cpu_alloc(0x1000, MemFlags::NON_CACHEABLE, None).unwrap();
        let dev = p.alloc(0x1000, MemFlags::NON_CACHEABLE, None).unwrap();
        p.write(host + 4, b"tensor").unwrap();

        p.memcpy(dev, host, 16, CopyDirection::CpuToBpu).unwrap();
        assert_eq!(&p.read(dev + 4, 6).unwrap()[..], b"tensor");
        assert_eq!(&p.read(dev, 4).unwrap()[..], &[0, 0, 0, 0]);

        assert!(p.memcpy(dev, host, 16, CopyDirection::BpuToCpu).is_err());
        assert!(p.memcpy(host, dev, 0x2000, CopyDirection::BpuToCpu).is_err());

        let out = p.register(0x9000_0000, 0x100).unwrap();
        p.memcpy(out, dev + 4, 6, CopyDirection::BpuToCpu).unwrap();
        assert_eq!(&p.read(out, 6).unwrap()[..], b"tensor");
    }

    #[test]
    fn test_physical_and_iova_addresses() {
        let mut p = pool();
        let any = p.alloc(0x1000, MemFlags::NON_CACHEABLE, None).unwrap();
        let pinned = p.alloc(0x1000, MemFlags::CORE1, None).unwrap();
        let ext = p.register(0x7000_0000, 0x1000).unwrap();

        assert_eq!(p.phys_addr(any + 0x10).unwrap(), 0x2000_0010);
        assert_eq!(p.phys_addr(ext).unwrap(), 0x7000_0000);

        assert_eq!(p.device_iova(any, 0).unwrap(), IOVA_CORE_STRIDE + 0x2000_0000);
        assert_eq!(
            p.host_iova(any, 2).unwrap(),
            HOST_IOVA_BASE + 2 * IOVA_CORE_STRIDE + 0x2000_0000
        );
        assert!(p.device_iova(pinned, 1).is_ok());
        assert_eq!(p.device_iova(pinned, 0), Err(BpuError::NoData));
    }

    #[test]
    fn test_affinity_bits() {
        assert_eq!((MemFlags::CORE0 | MemFlags::CORE2).affinity(), 0b101);
        assert!(MemFlags::CACHEABLE.serves_core(7));
        assert!(!MemFlags::CORE0.serves_core(1));
    }
}
