//! Sparse page list: page-aligned object offset -> owned physical frame.
//!
//! Each VmObject owns one of these. Entries exist only for pages the object
//! owns directly; content inherited from a COW parent has no entry here until
//! the first private copy is made.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::pmm;
use crate::types::Paddr;

// ============================================================================
// Page Entry
// ============================================================================

/// One resident page owned by a VmObject.
#[derive(Debug)]
pub struct VmPage {
    /// Physical frame backing this page.
    pub paddr: Paddr,
    /// Outstanding pin operations covering this page.
    pub pin_count: u32,
    /// Frame belongs to an external physical window; never returned to the
    /// allocator.
    pub borrowed: bool,
}

impl VmPage {
    /// Wrap a frame owned by the allocator.
    pub fn new(paddr: Paddr) -> Self {
        Self {
            paddr,
            pin_count: 0,
            borrowed: false,
        }
    }

    /// Wrap a frame of an external physical window.
    pub fn new_borrowed(paddr: Paddr) -> Self {
        Self {
            paddr,
            pin_count: 0,
            borrowed: true,
        }
    }

    /// Check whether the page is pinned.
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    /// Release the backing frame.
    fn release(self) {
        debug_assert_eq!(self.pin_count, 0, "releasing a pinned page");
        if !self.borrowed {
            pmm::free_page(self.paddr);
        }
    }
}

// ============================================================================
// Page List
// ============================================================================

/// Sparse offset -> page mapping with O(log n) insert/lookup/remove and
/// range-limited iteration.
#[derive(Debug, Default)]
pub struct PageList {
    pages: BTreeMap<u64, VmPage>,
}

impl PageList {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Look up the page at a page-aligned offset.
    pub fn get(&self, offset: u64) -> Option<&VmPage> {
        debug_assert!(pmm::is_page_aligned(offset));
        self.pages.get(&offset)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, offset: u64) -> Option<&mut VmPage> {
        debug_assert!(pmm::is_page_aligned(offset));
        self.pages.get_mut(&offset)
    }

    /// Insert a page, returning any page previously at that offset.
    pub fn insert(&mut self, offset: u64, page: VmPage) -> Option<VmPage> {
        debug_assert!(pmm::is_page_aligned(offset));
        self.pages.insert(offset, page)
    }

    /// Remove the entry at `offset` without releasing its frame.
    pub fn remove(&mut self, offset: u64) -> Option<VmPage> {
        debug_assert!(pmm::is_page_aligned(offset));
        self.pages.remove(&offset)
    }

    /// Resident page count.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Iterate resident pages with offsets in `[start, end)`, ascending.
    pub fn iter_range(&self, start: u64, end: u64) -> impl Iterator<Item = (u64, &VmPage)> {
        self.pages.range(start..end).map(|(&off, page)| (off, page))
    }

    /// Check for pinned pages in `[start, end)`.
    pub fn any_pinned_in_range(&self, start: u64, end: u64) -> bool {
        self.pages.range(start..end).any(|(_, p)| p.is_pinned())
    }

    /// Detach all entries with offsets in `[start, end)`.
    pub fn take_range(&mut self, start: u64, end: u64) -> Vec<(u64, VmPage)> {
        let keys: Vec<u64> = self.pages.range(start..end).map(|(&k, _)| k).collect();
        keys.into_iter()
            .filter_map(|k| self.pages.remove(&k).map(|page| (k, page)))
            .collect()
    }

    /// Remove entries in `[start, end)` and release their frames.
    ///
    /// Returns the number of pages released. Callers must have verified that
    /// no page in the range is pinned.
    pub fn release_range(&mut self, start: u64, end: u64) -> usize {
        let taken = self.take_range(start, end);
        let count = taken.len();
        for (_, page) in taken {
            page.release();
        }
        count
    }

    /// Release every frame. Used on object teardown.
    pub fn release_all(&mut self) {
        let pages = core::mem::take(&mut self.pages);
        for (_, mut page) in pages {
            // Teardown of a still-pinned object is a caller bug everywhere
            // except process death, where outstanding pins die with it.
            page.pin_count = 0;
            page.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmm::PAGE_SIZE;

    const P: u64 = PAGE_SIZE as u64;

    fn setup() -> spin::MutexGuard<'static, ()> {
        pmm::init(4096);
        pmm::test_lock()
    }

    #[test]
    fn test_insert_lookup_remove() {
        let _guard = setup();
        let mut list = PageList::new();
        let a = pmm::alloc_page().unwrap();
        let b = pmm::alloc_page().unwrap();

        assert!(list.insert(0, VmPage::new(a)).is_none());
        assert!(list.insert(P, VmPage::new(b)).is_none());

        assert_eq!(list.get(0).unwrap().paddr, a);
        assert_eq!(list.get(P).unwrap().paddr, b);
        assert!(list.get(2 * P).is_none());
        assert_eq!(list.len(), 2);

        list.release_all();
        assert!(list.is_empty());
    }

    #[test]
    fn test_range_iteration_ascending() {
        let _guard = setup();
        let mut list = PageList::new();
        for i in [3u64, 0, 7, 1] {
            list.insert(i * P, VmPage::new(pmm::alloc_page().unwrap()));
        }
        let offsets: Vec<u64> = list.iter_range(0, 8 * P).map(|(o, _)| o).collect();
        assert_eq!(offsets, [0, P, 3 * P, 7 * P]);

        let mid: Vec<u64> = list.iter_range(P, 7 * P).map(|(o, _)| o).collect();
        assert_eq!(mid, [P, 3 * P]);
        list.release_all();
    }

    #[test]
    fn test_pin_scan_and_release() {
        let _guard = setup();
        let mut list = PageList::new();
        list.insert(0, VmPage::new(pmm::alloc_page().unwrap()));
        list.insert(P, VmPage::new(pmm::alloc_page().unwrap()));
        list.get_mut(P).unwrap().pin_count = 1;

        assert!(!list.any_pinned_in_range(0, P));
        assert!(list.any_pinned_in_range(0, 2 * P));

        let free_before = pmm::frame_stats().free;
        assert_eq!(list.release_range(0, P), 1);
        assert_eq!(pmm::frame_stats().free, free_before + 1);

        list.get_mut(P).unwrap().pin_count = 0;
        list.release_all();
    }
}
