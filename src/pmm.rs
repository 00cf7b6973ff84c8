//! Physical frame allocator.
//!
//! The VM core consumes this interface only: zero-filled single-frame
//! allocation, aligned contiguous runs, and release. Frame contents are
//! reached through the accessors at the bottom of this module, which stand in
//! for the kernel physmap. The allocator is safe to call while holding a
//! VmObject lock and never re-enters one.

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::types::Paddr;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms).
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE).
pub const PAGE_SHIFT: usize = 12;

/// First frame sits one page up so that physical address 0 stays invalid.
const FRAME_BASE: Paddr = PAGE_SIZE as Paddr;

/// Round address down to page boundary.
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round address up to page boundary.
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Check page alignment.
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE as u64 - 1) == 0
}

// ============================================================================
// Frame Manager
// ============================================================================

/// Frame allocator state: one backing slab, a sorted free set.
pub struct FrameManager {
    /// Backing storage, `total` frames long.
    memory: Vec<u8>,
    /// Free frame indices.
    free: BTreeSet<u32>,
    /// Total frame count.
    total: usize,
}

impl FrameManager {
    fn new(total: usize) -> Self {
        Self {
            memory: vec![0u8; total * PAGE_SIZE],
            free: (0..total as u32).collect(),
            total,
        }
    }

    fn index_of(&self, paddr: Paddr) -> usize {
        debug_assert!(is_page_aligned(paddr));
        debug_assert!(paddr >= FRAME_BASE);
        let idx = ((paddr - FRAME_BASE) >> PAGE_SHIFT) as usize;
        assert!(idx < self.total, "paddr {:#x} outside managed range", paddr);
        idx
    }

    fn paddr_of(idx: u32) -> Paddr {
        FRAME_BASE + ((idx as Paddr) << PAGE_SHIFT)
    }

    /// Allocate one zero-filled frame.
    fn alloc(&mut self) -> Option<Paddr> {
        let idx = *self.free.iter().next()?;
        self.free.remove(&idx);
        self.frame_mut(idx).fill(0);
        Some(Self::paddr_of(idx))
    }

    /// Allocate `count` physically consecutive frames, the first aligned to
    /// `1 << align_log2` bytes.
    fn alloc_contiguous(&mut self, count: usize, align_log2: usize) -> Option<Paddr> {
        if count == 0 {
            return None;
        }
        let align = 1u64 << align_log2.max(PAGE_SHIFT);
        let mut start = 0u32;
        while (start as usize) + count <= self.total {
            let paddr = Self::paddr_of(start);
            if paddr % align != 0 {
                start += 1;
                continue;
            }
            let run_free = (start..start + count as u32).all(|i| self.free.contains(&i));
            if run_free {
                for i in start..start + count as u32 {
                    self.free.remove(&i);
                    self.frame_mut(i).fill(0);
                }
                return Some(paddr);
            }
            start += 1;
        }
        None
    }

    /// Return a frame to the free set.
    fn free(&mut self, paddr: Paddr) {
        let idx = self.index_of(paddr) as u32;
        assert!(self.free.insert(idx), "double free of frame {:#x}", paddr);
    }

    fn frame_mut(&mut self, idx: u32) -> &mut [u8] {
        let base = idx as usize * PAGE_SIZE;
        &mut self.memory[base..base + PAGE_SIZE]
    }

    fn frame(&self, idx: u32) -> &[u8] {
        let base = idx as usize * PAGE_SIZE;
        &self.memory[base..base + PAGE_SIZE]
    }

    fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.total,
            free: self.free.len(),
        }
    }
}

/// Frame allocator statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
}

// ============================================================================
// Global State
// ============================================================================

static FRAME_MANAGER: spin::Once<Mutex<FrameManager>> = spin::Once::new();

/// Initialize the frame allocator with `total` frames. Idempotent.
pub fn init(total: usize) {
    FRAME_MANAGER.call_once(|| {
        log::info!("pmm: managing {} frames ({} KiB)", total, total * PAGE_SIZE / 1024);
        Mutex::new(FrameManager::new(total))
    });
}

fn frame_manager() -> &'static Mutex<FrameManager> {
    FRAME_MANAGER.get().expect("frame manager not initialized")
}

/// Allocate one zero-filled page frame.
pub fn alloc_page() -> Option<Paddr> {
    frame_manager().lock().alloc()
}

/// Allocate `count` consecutive frames aligned to `1 << align_log2`.
pub fn alloc_contiguous(count: usize, align_log2: usize) -> Option<Paddr> {
    frame_manager().lock().alloc_contiguous(count, align_log2)
}

/// Release a frame.
pub fn free_page(paddr: Paddr) {
    frame_manager().lock().free(paddr);
}

/// Get allocator statistics.
pub fn frame_stats() -> FrameStats {
    frame_manager().lock().stats()
}

// ============================================================================
// Frame Access (physmap stand-in)
// ============================================================================

/// Run `f` over the bytes of the frame at `paddr`.
pub fn with_frame<R>(paddr: Paddr, f: impl FnOnce(&mut [u8]) -> R) -> R {
    let mut mgr = frame_manager().lock();
    let idx = mgr.index_of(paddr) as u32;
    f(mgr.frame_mut(idx))
}

/// Copy one whole frame.
pub fn copy_frame(src: Paddr, dst: Paddr) {
    let mut mgr = frame_manager().lock();
    debug_assert_ne!(src, dst);
    let si = mgr.index_of(src) as u32;
    let di = mgr.index_of(dst) as u32;
    let mut buf = [0u8; PAGE_SIZE];
    buf.copy_from_slice(mgr.frame(si));
    mgr.frame_mut(di).copy_from_slice(&buf);
}

/// Zero one whole frame.
pub fn zero_frame(paddr: Paddr) {
    with_frame(paddr, |bytes| bytes.fill(0));
}

/// Serializes tests whose assertions depend on global frame counts.
#[cfg(test)]
pub(crate) fn test_lock() -> spin::MutexGuard<'static, ()> {
    static TEST_LOCK: Mutex<()> = Mutex::new(());
    TEST_LOCK.lock()
}
