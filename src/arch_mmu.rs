//! Architecture MMU layer - hardware page table model.
//!
//! The VM core treats the hardware MMU as an opaque collaborator with four
//! operations (map, unmap, query, protect) plus cache maintenance. This
//! module models it as a sparse software page table per address space:
//! translations are installed and removed synchronously, so an unmap that has
//! returned can never satisfy a later lookup - the model's equivalent of
//! invalidate-before-return. Architecture-specific instruction sequences
//! (TLB shootdown, cache line ops) are out of scope and tracked only as
//! counters.

use alloc::collections::BTreeMap;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::pmm;
use crate::types::{Paddr, Vaddr};

bitflags! {
    /// Mapping permission flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmuFlags: u32 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXECUTE = 1 << 2;
        /// Accessible from user mode.
        const USER = 1 << 3;
    }
}

impl MmuFlags {
    /// Read/write kernel data mapping.
    pub const KERNEL_DATA: MmuFlags = MmuFlags::READ.union(MmuFlags::WRITE);
    /// Read/write user data mapping.
    pub const USER_DATA: MmuFlags = MmuFlags::KERNEL_DATA.union(MmuFlags::USER);
}

/// One installed translation.
#[derive(Debug, Clone, Copy)]
struct Translation {
    paddr: Paddr,
    flags: MmuFlags,
}

// ============================================================================
// Per-aspace page table context
// ============================================================================

/// Software page-table root for one address space.
#[derive(Debug, Default)]
pub struct ArchVmAspace {
    /// Installed translations, keyed by page-aligned virtual address.
    table: BTreeMap<Vaddr, Translation>,
    /// TLB invalidations issued (unmap, replace, protect).
    tlb_invalidations: u64,
}

impl ArchVmAspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the translation for one page.
    pub fn map_page(&mut self, vaddr: Vaddr, paddr: Paddr, flags: MmuFlags) {
        debug_assert!(pmm::is_page_aligned(vaddr));
        debug_assert!(pmm::is_page_aligned(paddr));
        if self.table.insert(vaddr, Translation { paddr, flags }).is_some() {
            self.tlb_invalidations += 1;
        }
    }

    /// Remove every translation in `[vaddr, vaddr + len)`.
    ///
    /// Returns the number of pages unmapped. Translations are gone when this
    /// returns; a subsequent `query` cannot observe them.
    pub fn unmap_range(&mut self, vaddr: Vaddr, len: u64) -> usize {
        let start = pmm::trunc_page(vaddr);
        let end = pmm::round_page(vaddr.saturating_add(len));
        let victims: alloc::vec::Vec<Vaddr> =
            self.table.range(start..end).map(|(&va, _)| va).collect();
        for va in &victims {
            self.table.remove(va);
        }
        self.tlb_invalidations += victims.len() as u64;
        victims.len()
    }

    /// Translate a virtual address. Returns the backing page frame and the
    /// mapping flags; the caller applies the intra-page offset.
    pub fn query(&self, vaddr: Vaddr) -> Option<(Paddr, MmuFlags)> {
        let t = self.table.get(&pmm::trunc_page(vaddr))?;
        Some((t.paddr, t.flags))
    }

    /// Change protection on existing translations in `[vaddr, vaddr + len)`.
    pub fn protect_range(&mut self, vaddr: Vaddr, len: u64, flags: MmuFlags) -> usize {
        let start = pmm::trunc_page(vaddr);
        let end = pmm::round_page(vaddr.saturating_add(len));
        let mut changed = 0;
        for (_, t) in self.table.range_mut(start..end) {
            t.flags = flags;
            changed += 1;
        }
        self.tlb_invalidations += changed as u64;
        changed
    }

    /// Drop every translation. Used on aspace teardown.
    pub fn reset(&mut self) {
        self.tlb_invalidations += self.table.len() as u64;
        self.table.clear();
    }

    /// Number of installed translations.
    pub fn resident_count(&self) -> usize {
        self.table.len()
    }

    /// TLB invalidations issued so far.
    pub fn tlb_invalidations(&self) -> u64 {
        self.tlb_invalidations
    }
}

// ============================================================================
// Cache maintenance
// ============================================================================

/// Cache maintenance counters. The operations themselves are
/// architecture-supplied; the model only records that they were issued.
pub struct CacheStats {
    pub clean: AtomicU64,
    pub invalidate: AtomicU64,
    pub clean_invalidate: AtomicU64,
    pub sync: AtomicU64,
}

static CACHE_STATS: CacheStats = CacheStats {
    clean: AtomicU64::new(0),
    invalidate: AtomicU64::new(0),
    clean_invalidate: AtomicU64::new(0),
    sync: AtomicU64::new(0),
};

/// Get cache maintenance statistics.
pub fn cache_stats() -> &'static CacheStats {
    &CACHE_STATS
}

/// Write back dirty lines covering the physical range.
pub fn clean_range(_paddr: Paddr, _len: usize) {
    CACHE_STATS.clean.fetch_add(1, Ordering::Relaxed);
}

/// Discard lines covering the physical range.
pub fn invalidate_range(_paddr: Paddr, _len: usize) {
    CACHE_STATS.invalidate.fetch_add(1, Ordering::Relaxed);
}

/// Write back then discard lines covering the physical range.
pub fn clean_invalidate_range(_paddr: Paddr, _len: usize) {
    CACHE_STATS.clean_invalidate.fetch_add(1, Ordering::Relaxed);
}

/// Synchronize instruction/data caches for the physical range.
pub fn sync_range(_paddr: Paddr, _len: usize) {
    CACHE_STATS.sync.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmm::PAGE_SIZE;

    const P: u64 = PAGE_SIZE as u64;

    #[test]
    fn test_map_query_unmap() {
        let mut arch = ArchVmAspace::new();
        arch.map_page(0x1000, 0x8000, MmuFlags::KERNEL_DATA);

        let (paddr, flags) = arch.query(0x1234).unwrap();
        assert_eq!(paddr, 0x8000);
        assert!(flags.contains(MmuFlags::WRITE));

        assert_eq!(arch.unmap_range(0x1000, P), 1);
        assert!(arch.query(0x1234).is_none());
    }

    #[test]
    fn test_unmap_is_synchronous() {
        let mut arch = ArchVmAspace::new();
        for i in 0..4u64 {
            arch.map_page(0x1000 + i * P, 0x8000 + i * P, MmuFlags::USER_DATA);
        }
        let before = arch.tlb_invalidations();
        assert_eq!(arch.unmap_range(0x1000, 2 * P), 2);
        assert_eq!(arch.tlb_invalidations(), before + 2);
        assert!(arch.query(0x1000).is_none());
        assert!(arch.query(0x3000).is_some());
    }

    #[test]
    fn test_replace_counts_invalidation() {
        let mut arch = ArchVmAspace::new();
        arch.map_page(0x1000, 0x8000, MmuFlags::KERNEL_DATA);
        let before = arch.tlb_invalidations();
        arch.map_page(0x1000, 0x9000, MmuFlags::KERNEL_DATA);
        assert_eq!(arch.tlb_invalidations(), before + 1);
        assert_eq!(arch.query(0x1000).unwrap().0, 0x9000);
    }

    #[test]
    fn test_protect_range() {
        let mut arch = ArchVmAspace::new();
        arch.map_page(0x1000, 0x8000, MmuFlags::USER_DATA);
        assert_eq!(arch.protect_range(0x1000, P, MmuFlags::READ | MmuFlags::USER), 1);
        let (_, flags) = arch.query(0x1000).unwrap();
        assert!(!flags.contains(MmuFlags::WRITE));
    }
}
