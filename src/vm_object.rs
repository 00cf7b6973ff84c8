//! VM Object - paged, copy-on-write memory object.
//!
//! A VmObject owns the physical backing for a byte-addressable, resizable
//! range of memory, independent of any address space that maps it. Objects
//! are shared by reference counting: many regions (in many aspaces) and many
//! COW children can hold one.
//!
//! ## COW model
//!
//! `clone_cow` demotes the source object: a *hidden* node takes ownership of
//! the source's page list, and both the source and the new clone become its
//! children. All content lookups walk child -> parent; neither visible side
//! ever mutates an ancestor's pages, so writes on either side stay private.
//! A hidden node left with a single live child is absorbed into it on a
//! later write fault (chain collapse).
//!
//! ## Lock order
//!
//! 1. object `inner` locks, child before parent along a COW chain, taken
//!    hand-over-hand when walking upward;
//! 2. object `side` locks (mapping listeners, COW children), parent before
//!    child when cascading invalidation downward; a side-lock holder never
//!    acquires an `inner` lock;
//! 3. aspace registry; 4. aspace region lock; 5. aspace arch lock; 6. pmm.
//!
//! A later lock is never held while acquiring an earlier one.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::arch_mmu;
use crate::page_list::{PageList, VmPage};
use crate::pmm::{self, PAGE_SIZE};
use crate::types::{make_name, Name, Paddr, Vaddr, VmError, VmResult};
use crate::user_copy::{self, UserPtr};
use crate::vm_aspace::{self, VmAspace, VmAspaceId};
use crate::vm_region::VmRegion;

// ============================================================================
// Object Types
// ============================================================================

/// VM object ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

static NEXT_VMO_ID: AtomicU64 = AtomicU64::new(1);

/// Backing kind. A closed set: the fault path matches on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmoKind {
    /// Anonymous paged memory, committed lazily.
    Paged,
    /// Physically contiguous run, pre-committed and pinned.
    Contiguous,
    /// Window onto an externally owned physical range (device memory).
    Physical,
}

/// Largest legal object size: one page short of the full 64-bit space.
pub const MAX_VMO_SIZE: u64 = u64::MAX - PAGE_SIZE as u64 + 1;

bitflags! {
    /// Access intent for the fault primitive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageRequest: u32 {
        /// Caller intends to write; a private page is required.
        const WRITE = 1 << 0;
    }
}

bitflags! {
    /// Flags for [`VmObject::lookup`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LookupFlags: u32 {
        /// Fault absent pages in instead of skipping them.
        const COMMIT = 1 << 0;
    }
}

/// Cache maintenance operation classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOpType {
    Clean,
    Invalidate,
    CleanInvalidate,
    Sync,
}

/// Where the fault primitive found the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    /// Already resident in this object's own page list.
    Resident,
    /// Freshly copied from a COW ancestor.
    CowCopy,
    /// Freshly zero-filled.
    ZeroFill,
    /// Served read-only out of an ancestor's page list.
    ReadThrough,
}

/// Result of resolving one page.
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    pub paddr: Paddr,
    /// Page is privately owned; a writable mapping may be installed.
    pub owned: bool,
    pub source: PageSource,
}

// ============================================================================
// Interior state
// ============================================================================

/// Content state, guarded by the object lock.
pub(crate) struct VmoInner {
    size: u64,
    parent: Option<Arc<VmObject>>,
    parent_offset: u64,
    pages: PageList,
}

/// One hardware mapping of this object (a region in some aspace).
pub(crate) struct MappingRef {
    pub aspace_id: VmAspaceId,
    pub region: Weak<VmRegion>,
    pub base: Vaddr,
    pub vmo_offset: u64,
    pub size: u64,
}

/// One COW child and its window into this object's offset space.
struct CowChildRef {
    child: Weak<VmObject>,
    parent_offset: u64,
    window: u64,
}

/// Leaf-class listener lists; never held while acquiring an inner lock.
#[derive(Default)]
struct SideLists {
    mappings: Vec<MappingRef>,
    children: Vec<CowChildRef>,
}

// ============================================================================
// VmObject
// ============================================================================

/// Reference-counted, resizable, copy-on-write byte container.
pub struct VmObject {
    id: VmObjectId,
    name: Name,
    kind: VmoKind,
    read_only: bool,
    resizable: AtomicBool,
    /// Internal COW node; holds snapshot pages, never mapped or exposed.
    hidden: bool,
    inner: Mutex<VmoInner>,
    side: Mutex<SideLists>,
}

impl VmObject {
    #[allow(clippy::too_many_arguments)]
    fn build(
        kind: VmoKind,
        name: Name,
        resizable: bool,
        read_only: bool,
        hidden: bool,
        size: u64,
        parent: Option<Arc<VmObject>>,
        parent_offset: u64,
        pages: PageList,
    ) -> Arc<VmObject> {
        Arc::new(VmObject {
            id: VmObjectId(NEXT_VMO_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            kind,
            read_only,
            resizable: AtomicBool::new(resizable),
            hidden,
            inner: Mutex::new(VmoInner {
                size,
                parent,
                parent_offset,
                pages,
            }),
            side: Mutex::new(SideLists::default()),
        })
    }

    // ------------------------------------------------------------------------
    // Factories
    // ------------------------------------------------------------------------

    /// Create a fresh anonymous object. No pages are committed.
    pub fn create(size: u64, name: &str) -> VmResult<Arc<VmObject>> {
        if size > MAX_VMO_SIZE {
            return Err(VmError::InvalidArgs);
        }
        let size = pmm::round_page(size);
        Ok(Self::build(
            VmoKind::Paged,
            make_name(name),
            true,
            false,
            false,
            size,
            None,
            0,
            PageList::new(),
        ))
    }

    /// Create a read-only object pre-populated with `data`.
    pub fn create_from_ro_data(data: &[u8], name: &str) -> VmResult<Arc<VmObject>> {
        let size = pmm::round_page(data.len() as u64);
        let mut pages = PageList::new();
        let mut copied = 0usize;
        while copied < data.len() {
            let paddr = match pmm::alloc_page() {
                Some(p) => p,
                None => {
                    pages.release_all();
                    return Err(VmError::OutOfMemory);
                }
            };
            let chunk = (data.len() - copied).min(PAGE_SIZE);
            pmm::with_frame(paddr, |bytes| {
                bytes[..chunk].copy_from_slice(&data[copied..copied + chunk])
            });
            pages.insert(copied as u64 & !(PAGE_SIZE as u64 - 1), VmPage::new(paddr));
            copied += chunk;
        }
        Ok(Self::build(
            VmoKind::Paged,
            make_name(name),
            false,
            true,
            false,
            size,
            None,
            0,
            pages,
        ))
    }

    /// Create a physically contiguous, pre-committed, pinned object.
    pub fn create_contiguous(size: u64, align_log2: usize, name: &str) -> VmResult<Arc<VmObject>> {
        if size == 0 || size > MAX_VMO_SIZE {
            return Err(VmError::InvalidArgs);
        }
        let size = pmm::round_page(size);
        let vmo = Self::build(
            VmoKind::Contiguous,
            make_name(name),
            false,
            false,
            false,
            size,
            None,
            0,
            PageList::new(),
        );
        vmo.commit_range_contiguous(0, size, align_log2)?;
        Ok(vmo)
    }

    /// Wrap an externally owned physical range. The frames are borrowed and
    /// never returned to the allocator.
    pub fn create_physical(paddr: Paddr, size: u64, name: &str) -> VmResult<Arc<VmObject>> {
        if !pmm::is_page_aligned(paddr) || size == 0 || size > MAX_VMO_SIZE {
            return Err(VmError::InvalidArgs);
        }
        let size = pmm::round_page(size);
        let mut pages = PageList::new();
        let mut off = 0;
        while off < size {
            pages.insert(off, VmPage::new_borrowed(paddr + off));
            off += PAGE_SIZE as u64;
        }
        Ok(Self::build(
            VmoKind::Physical,
            make_name(name),
            false,
            false,
            false,
            size,
            None,
            0,
            pages,
        ))
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn id(&self) -> VmObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn kind(&self) -> VmoKind {
        self.kind
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_resizable(&self) -> bool {
        self.resizable.load(Ordering::Relaxed)
    }

    /// Current byte length, always page aligned.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Pages resident in this object's own page list.
    pub fn resident_page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Bytes backed by this object's own pages.
    pub fn committed_bytes(&self) -> u64 {
        (self.resident_page_count() * PAGE_SIZE) as u64
    }

    // ------------------------------------------------------------------------
    // Range plumbing
    // ------------------------------------------------------------------------

    /// Expand a byte range to page bounds, checking for overflow.
    fn page_bounds(offset: u64, len: u64) -> VmResult<(u64, u64)> {
        let end = offset.checked_add(len).ok_or(VmError::OutOfRange)?;
        if end > MAX_VMO_SIZE {
            return Err(VmError::OutOfRange);
        }
        Ok((pmm::trunc_page(offset), pmm::round_page(end)))
    }

    /// Walk the parent chain for the page backing `offset` in `node`'s space.
    ///
    /// Each ancestor's lock is acquired while its child's is still held
    /// (child-then-parent), so a concurrent collapse cannot move a page past
    /// the walk.
    fn chain_lookup_node(node: &Arc<VmObject>, offset: u64) -> Option<Paddr> {
        let guard = node.inner.lock();
        if offset >= guard.size {
            return None;
        }
        if let Some(page) = guard.pages.get(pmm::trunc_page(offset)) {
            return Some(page.paddr);
        }
        let parent = guard.parent.clone()?;
        let parent_offset = offset + guard.parent_offset;
        let result = Self::chain_lookup_node(&parent, parent_offset);
        drop(guard);
        result
    }

    /// Chain lookup starting above `inner`.
    fn chain_lookup(inner: &VmoInner, offset: u64) -> Option<Paddr> {
        let parent = inner.parent.as_ref()?;
        Self::chain_lookup_node(parent, offset + inner.parent_offset)
    }

    /// Ensure `offset` is backed by a page this object owns, copying ancestor
    /// content (or zero-filling) as needed. Returns the frame and whether it
    /// was created by this call.
    fn ensure_private_page_locked(
        &self,
        inner: &mut VmoInner,
        offset: u64,
    ) -> VmResult<(Paddr, PageSource)> {
        let offset = pmm::trunc_page(offset);
        if let Some(page) = inner.pages.get(offset) {
            return Ok((page.paddr, PageSource::Resident));
        }
        let paddr = pmm::alloc_page().ok_or(VmError::OutOfMemory)?;
        let source = match Self::chain_lookup(inner, offset) {
            Some(src) => {
                pmm::copy_frame(src, paddr);
                PageSource::CowCopy
            }
            None => PageSource::ZeroFill,
        };
        inner.pages.insert(offset, VmPage::new(paddr));
        if source == PageSource::CowCopy {
            // Read-through translations of the ancestor page are now stale.
            self.range_change_update_from_parent(offset, PAGE_SIZE as u64);
        }
        Ok((paddr, source))
    }

    // ------------------------------------------------------------------------
    // Fault primitive
    // ------------------------------------------------------------------------

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, VmoInner> {
        self.inner.lock()
    }

    /// Resolve the single page backing `offset`, honoring COW semantics.
    ///
    /// The caller holds the object lock and may keep holding it while
    /// installing the returned frame, which keeps a concurrent decommit from
    /// freeing it in between.
    pub(crate) fn get_page_locked(
        self: &Arc<Self>,
        inner: &mut VmoInner,
        offset: u64,
        req: PageRequest,
    ) -> VmResult<PageInfo> {
        if offset >= inner.size {
            return Err(VmError::OutOfRange);
        }
        let offset = pmm::trunc_page(offset);

        if req.contains(PageRequest::WRITE) {
            if self.read_only {
                return Err(VmError::AccessDenied);
            }
            if inner.pages.get(offset).is_none() {
                // A sole-child hidden parent can be absorbed instead of copied.
                self.try_collapse_locked(inner);
            }
            let (paddr, source) = self.ensure_private_page_locked(inner, offset)?;
            Ok(PageInfo {
                paddr,
                owned: true,
                source,
            })
        } else {
            if let Some(page) = inner.pages.get(offset) {
                return Ok(PageInfo {
                    paddr: page.paddr,
                    owned: true,
                    source: PageSource::Resident,
                });
            }
            if let Some(src) = Self::chain_lookup(inner, offset) {
                // Served from the ancestor; must be mapped read-only so a
                // later write still faults and copies.
                return Ok(PageInfo {
                    paddr: src,
                    owned: false,
                    source: PageSource::ReadThrough,
                });
            }
            let (paddr, _) = self.ensure_private_page_locked(inner, offset)?;
            Ok(PageInfo {
                paddr,
                owned: true,
                source: PageSource::ZeroFill,
            })
        }
    }

    /// Fault primitive, self-locking variant.
    pub fn get_page(self: &Arc<Self>, offset: u64, req: PageRequest) -> VmResult<PageInfo> {
        let mut inner = self.inner.lock();
        self.get_page_locked(&mut inner, offset, req)
    }

    /// Absorb a hidden parent that has no other live child.
    fn try_collapse_locked(self: &Arc<Self>, inner: &mut VmoInner) {
        let parent = match &inner.parent {
            Some(p) => p.clone(),
            None => return,
        };
        if !parent.hidden {
            return;
        }
        let mut pinner = parent.inner.lock();
        {
            let mut pside = parent.side.lock();
            pside.children.retain(|c| c.child.strong_count() > 0);
            let sole = pside.children.len() == 1
                && pside.children[0].child.as_ptr() == Arc::as_ptr(self);
            if !sole {
                return;
            }
        }

        // Move pages inside our window down; release the rest.
        let window_start = inner.parent_offset;
        let window_end = window_start.saturating_add(inner.size);
        let old_size = pinner.size;
        for (off, page) in pinner.pages.take_range(0, old_size) {
            if off >= window_start && off < window_end {
                let my_off = off - window_start;
                if inner.pages.get(my_off).is_none() {
                    inner.pages.insert(my_off, page);
                    continue;
                }
            }
            debug_assert!(!page.is_pinned() && !page.borrowed);
            pmm::free_page(page.paddr);
        }

        // Re-parent past the absorbed node.
        inner.parent = pinner.parent.clone();
        inner.parent_offset = window_start + pinner.parent_offset;
        if let Some(gp) = &inner.parent {
            let mut gps = gp.side.lock();
            for c in gps.children.iter_mut() {
                if c.child.as_ptr() == Arc::as_ptr(&parent) {
                    c.child = Arc::downgrade(self);
                }
            }
        }
        log::trace!("vmo {:?}: collapsed hidden parent {:?}", self.id, parent.id);
    }

    // ------------------------------------------------------------------------
    // Commit / decommit
    // ------------------------------------------------------------------------

    /// Ensure every page in `[offset, offset + len)` has physical backing.
    ///
    /// `committed` reports the bytes backed in the range when the call
    /// returns, counting pages that were already resident; a second identical
    /// call therefore allocates nothing and reports the same count. On
    /// allocation failure the pages committed so far stay committed and the
    /// count covers them.
    pub fn commit_range(&self, offset: u64, len: u64, committed: &mut u64) -> VmResult<()> {
        *committed = 0;
        if len == 0 {
            return Ok(());
        }
        let (start, end) = Self::page_bounds(offset, len)?;
        let mut inner = self.inner.lock();
        if end > inner.size {
            return Err(VmError::OutOfRange);
        }
        let mut off = start;
        while off < end {
            if self.ensure_private_page_locked(&mut inner, off).is_err() {
                log::warn!("vmo {:?}: commit stopped at {:#x}, out of memory", self.id, off);
                return Err(VmError::OutOfMemory);
            }
            *committed += PAGE_SIZE as u64;
            off += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Commit `[offset, offset + len)` as one physically contiguous, aligned
    /// run. The range must be fully uncommitted; the pages come back pinned
    /// and the object stops being resizable.
    pub fn commit_range_contiguous(
        &self,
        offset: u64,
        len: u64,
        align_log2: usize,
    ) -> VmResult<()> {
        let (start, end) = Self::page_bounds(offset, len)?;
        if start == end {
            return Err(VmError::InvalidArgs);
        }
        let mut inner = self.inner.lock();
        if end > inner.size {
            return Err(VmError::OutOfRange);
        }
        if inner.parent.is_some() || inner.pages.iter_range(start, end).next().is_some() {
            return Err(VmError::BadState);
        }
        let count = ((end - start) / PAGE_SIZE as u64) as usize;
        let base = pmm::alloc_contiguous(count, align_log2).ok_or(VmError::OutOfMemory)?;
        let mut off = start;
        while off < end {
            let mut page = VmPage::new(base + (off - start));
            page.pin_count = 1;
            inner.pages.insert(off, page);
            off += PAGE_SIZE as u64;
        }
        self.resizable.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Release physical backing in `[offset, offset + len)`.
    ///
    /// All-or-nothing on pin conflict: if any page in the range is pinned the
    /// call fails with `PagesPinned` and releases nothing. Mappings covering
    /// released pages are invalidated before the frames go back to the
    /// allocator and before the call returns.
    pub fn decommit_range(&self, offset: u64, len: u64, decommitted: &mut u64) -> VmResult<()> {
        *decommitted = 0;
        if self.kind == VmoKind::Physical {
            return Err(VmError::InvalidArgs);
        }
        if len == 0 {
            return Ok(());
        }
        let (start, end) = Self::page_bounds(offset, len)?;
        let mut inner = self.inner.lock();
        if end > inner.size {
            return Err(VmError::OutOfRange);
        }
        if inner.pages.any_pinned_in_range(start, end) {
            return Err(VmError::PagesPinned);
        }
        self.range_change_update_from_parent(start, end - start);
        let released = inner.pages.release_range(start, end);
        *decommitted = (released * PAGE_SIZE) as u64;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Resize
    // ------------------------------------------------------------------------

    /// Change the object's size. Growth is lazy; shrinking releases the
    /// now-out-of-range tail and invalidates every mapping of it first.
    pub fn resize(&self, new_size: u64) -> VmResult<()> {
        if !self.resizable.load(Ordering::Relaxed) {
            return Err(VmError::InvalidArgs);
        }
        if new_size > MAX_VMO_SIZE {
            return Err(VmError::InvalidArgs);
        }
        let new_size = pmm::round_page(new_size);
        let mut inner = self.inner.lock();
        let old_size = inner.size;
        if new_size < old_size {
            if inner.pages.any_pinned_in_range(new_size, old_size) {
                return Err(VmError::PagesPinned);
            }
            self.range_change_update_from_parent(new_size, old_size - new_size);
            inner.pages.release_range(new_size, old_size);
        }
        inner.size = new_size;
        log::trace!("vmo {:?}: resize {:#x} -> {:#x}", self.id, old_size, new_size);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Pin / unpin
    // ------------------------------------------------------------------------

    /// Pin every page in the range, committing absent ones first. Each `pin`
    /// must eventually be matched by exactly one `unpin` of the same range.
    pub fn pin(&self, offset: u64, len: u64) -> VmResult<()> {
        if len == 0 {
            return Ok(());
        }
        let (start, end) = Self::page_bounds(offset, len)?;
        let mut inner = self.inner.lock();
        if end > inner.size {
            return Err(VmError::OutOfRange);
        }
        // Commit first so a failure applies no pins at all.
        let mut off = start;
        while off < end {
            self.ensure_private_page_locked(&mut inner, off)?;
            off += PAGE_SIZE as u64;
        }
        let mut off = start;
        while off < end {
            let page = inner.pages.get_mut(off).expect("committed above");
            assert!(page.pin_count < u32::MAX, "pin count overflow");
            page.pin_count += 1;
            off += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Undo one `pin` of the same range. Unbalanced unpins are caller bugs.
    pub fn unpin(&self, offset: u64, len: u64) -> VmResult<()> {
        if len == 0 {
            return Ok(());
        }
        let (start, end) = Self::page_bounds(offset, len)?;
        let mut inner = self.inner.lock();
        if end > inner.size {
            return Err(VmError::OutOfRange);
        }
        let mut off = start;
        while off < end {
            let page = inner
                .pages
                .get_mut(off)
                .expect("unpin of an uncommitted page");
            assert!(page.pin_count > 0, "unpin without matching pin");
            page.pin_count -= 1;
            off += PAGE_SIZE as u64;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Read / write
    // ------------------------------------------------------------------------

    /// Copy object content into `buf`. Holes read as zeros and are not
    /// committed. Returns bytes copied (clamped at the object's end).
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> VmResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let inner = self.inner.lock();
        if offset >= inner.size {
            return Err(VmError::OutOfRange);
        }
        let n = buf.len().min((inner.size - offset) as usize);
        let mut pos = 0usize;
        while pos < n {
            let cur = offset + pos as u64;
            let page_off = pmm::trunc_page(cur);
            let intra = (cur - page_off) as usize;
            let chunk = (n - pos).min(PAGE_SIZE - intra);
            let dst = &mut buf[pos..pos + chunk];
            let backing = match inner.pages.get(page_off) {
                Some(page) => Some(page.paddr),
                None => Self::chain_lookup(&inner, page_off),
            };
            match backing {
                Some(paddr) => {
                    pmm::with_frame(paddr, |bytes| dst.copy_from_slice(&bytes[intra..intra + chunk]))
                }
                None => dst.fill(0),
            }
            pos += chunk;
        }
        Ok(n)
    }

    /// Copy `buf` into the object, committing pages privately on demand.
    /// Returns bytes copied (clamped at the object's end).
    pub fn write(&self, offset: u64, buf: &[u8]) -> VmResult<usize> {
        if self.read_only {
            return Err(VmError::AccessDenied);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        if offset >= inner.size {
            return Err(VmError::OutOfRange);
        }
        let n = buf.len().min((inner.size - offset) as usize);
        let mut pos = 0usize;
        while pos < n {
            let cur = offset + pos as u64;
            let page_off = pmm::trunc_page(cur);
            let intra = (cur - page_off) as usize;
            let chunk = (n - pos).min(PAGE_SIZE - intra);
            let (paddr, _) = self.ensure_private_page_locked(&mut inner, page_off)?;
            pmm::with_frame(paddr, |bytes| {
                bytes[intra..intra + chunk].copy_from_slice(&buf[pos..pos + chunk])
            });
            pos += chunk;
        }
        Ok(n)
    }

    /// Copy object content out to a user pointer in `aspace`.
    pub fn read_user(
        &self,
        aspace: &Arc<VmAspace>,
        ptr: UserPtr,
        offset: u64,
        len: usize,
    ) -> VmResult<usize> {
        let mut buf = alloc::vec![0u8; len];
        let n = self.read(offset, &mut buf)?;
        user_copy::copy_to_user(aspace, ptr, &buf[..n])?;
        Ok(n)
    }

    /// Copy from a user pointer in `aspace` into the object.
    pub fn write_user(
        &self,
        aspace: &Arc<VmAspace>,
        ptr: UserPtr,
        offset: u64,
        len: usize,
    ) -> VmResult<usize> {
        let mut buf = alloc::vec![0u8; len];
        user_copy::copy_from_user(aspace, ptr, &mut buf)?;
        self.write(offset, &buf)
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Invoke `f(object_offset, paddr)` for each backed page in the range, in
    /// increasing offset order. With `LookupFlags::COMMIT`, absent pages are
    /// faulted in first; otherwise they are skipped.
    pub fn lookup<F>(&self, offset: u64, len: u64, flags: LookupFlags, mut f: F) -> VmResult<()>
    where
        F: FnMut(u64, Paddr) -> VmResult<()>,
    {
        if len == 0 {
            return Ok(());
        }
        let (start, end) = Self::page_bounds(offset, len)?;
        let mut inner = self.inner.lock();
        if end > inner.size {
            return Err(VmError::OutOfRange);
        }
        let mut off = start;
        while off < end {
            if let Some(page) = inner.pages.get(off) {
                f(off, page.paddr)?;
            } else if flags.contains(LookupFlags::COMMIT) {
                let (paddr, _) = self.ensure_private_page_locked(&mut inner, off)?;
                f(off, paddr)?;
            }
            off += PAGE_SIZE as u64;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Cache maintenance
    // ------------------------------------------------------------------------

    /// Perform a cache maintenance class over committed pages in the range.
    /// Unbacked sub-ranges are no-ops.
    pub fn cache_op(&self, offset: u64, len: u64, op: CacheOpType) -> VmResult<()> {
        if len == 0 {
            return Ok(());
        }
        let (start, end) = Self::page_bounds(offset, len)?;
        let inner = self.inner.lock();
        if end > inner.size {
            return Err(VmError::OutOfRange);
        }
        for (_, page) in inner.pages.iter_range(start, end) {
            match op {
                CacheOpType::Clean => arch_mmu::clean_range(page.paddr, PAGE_SIZE),
                CacheOpType::Invalidate => arch_mmu::invalidate_range(page.paddr, PAGE_SIZE),
                CacheOpType::CleanInvalidate => {
                    arch_mmu::clean_invalidate_range(page.paddr, PAGE_SIZE)
                }
                CacheOpType::Sync => arch_mmu::sync_range(page.paddr, PAGE_SIZE),
            }
        }
        Ok(())
    }

    pub fn invalidate_cache(&self, offset: u64, len: u64) -> VmResult<()> {
        self.cache_op(offset, len, CacheOpType::Invalidate)
    }

    pub fn clean_cache(&self, offset: u64, len: u64) -> VmResult<()> {
        self.cache_op(offset, len, CacheOpType::Clean)
    }

    pub fn clean_invalidate_cache(&self, offset: u64, len: u64) -> VmResult<()> {
        self.cache_op(offset, len, CacheOpType::CleanInvalidate)
    }

    pub fn sync_cache(&self, offset: u64, len: u64) -> VmResult<()> {
        self.cache_op(offset, len, CacheOpType::Sync)
    }

    // ------------------------------------------------------------------------
    // COW clone
    // ------------------------------------------------------------------------

    /// Create a copy-on-write child observing this object's content as of
    /// now. Writes to either side afterwards are invisible to the other.
    pub fn clone_cow(
        self: &Arc<Self>,
        offset: u64,
        size: u64,
        copy_name: bool,
    ) -> VmResult<Arc<VmObject>> {
        if self.kind != VmoKind::Paged || self.hidden {
            return Err(VmError::InvalidArgs);
        }
        if !pmm::is_page_aligned(offset) || size == 0 {
            return Err(VmError::InvalidArgs);
        }
        let child_size = pmm::round_page(size);
        let end = offset.checked_add(child_size).ok_or(VmError::InvalidArgs)?;

        let mut inner = self.inner.lock();
        if end > inner.size {
            return Err(VmError::InvalidArgs);
        }
        if inner.pages.any_pinned_in_range(0, inner.size) {
            return Err(VmError::BadState);
        }

        // Demote: a hidden node takes our pages; we and the clone become its
        // children and fault private copies from it.
        let my_size = inner.size;
        let old_parent = inner.parent.take();
        let old_parent_offset = inner.parent_offset;
        let pages = core::mem::take(&mut inner.pages);
        let hidden = Self::build(
            VmoKind::Paged,
            Name::new(),
            false,
            false,
            true,
            my_size,
            old_parent.clone(),
            old_parent_offset,
            pages,
        );
        if let Some(gp) = &old_parent {
            let mut gps = gp.side.lock();
            for c in gps.children.iter_mut() {
                if c.child.as_ptr() == Arc::as_ptr(self) {
                    c.child = Arc::downgrade(&hidden);
                }
            }
        }
        inner.parent = Some(hidden.clone());
        inner.parent_offset = 0;

        let child = Self::build(
            VmoKind::Paged,
            if copy_name {
                self.name.clone()
            } else {
                Name::new()
            },
            true,
            false,
            false,
            child_size,
            Some(hidden.clone()),
            offset,
            PageList::new(),
        );
        {
            let mut hside = hidden.side.lock();
            hside.children.push(CowChildRef {
                child: Arc::downgrade(self),
                parent_offset: 0,
                window: my_size,
            });
            hside.children.push(CowChildRef {
                child: Arc::downgrade(&child),
                parent_offset: offset,
                window: child_size,
            });
        }

        // Our pages changed ownership: writable translations must re-fault so
        // writes copy instead of mutating the now-shared frames.
        self.range_change_update_from_parent(0, my_size);
        drop(inner);

        log::trace!(
            "vmo {:?}: cloned [{:#x}, {:#x}) -> vmo {:?}",
            self.id,
            offset,
            end,
            child.id
        );
        Ok(child)
    }

    // ------------------------------------------------------------------------
    // Range-change propagation
    // ------------------------------------------------------------------------

    /// Invalidate hardware mappings of `[offset, offset + len)` in this
    /// object's space and cascade to COW children windows.
    ///
    /// Touches only side-class locks, so it is safe both from operations
    /// holding this object's lock (resize, decommit, clone) and from a parent
    /// cascading downward.
    pub fn range_change_update_from_parent(&self, offset: u64, len: u64) {
        let mut side = self.side.lock();
        side.mappings.retain(|m| m.region.strong_count() > 0);
        let end = offset.saturating_add(len);
        for m in side.mappings.iter() {
            let s = offset.max(m.vmo_offset);
            let e = end.min(m.vmo_offset + m.size);
            if s >= e {
                continue;
            }
            if let Some(aspace) = vm_aspace::lookup_aspace(m.aspace_id) {
                let vaddr = m.base + (s - m.vmo_offset);
                aspace.unmap_arch_range(vaddr, e - s);
            }
        }
        let children: Vec<(Arc<VmObject>, u64, u64)> = side
            .children
            .iter()
            .filter_map(|c| {
                let child = c.child.upgrade()?;
                let wend = c.parent_offset.saturating_add(c.window);
                let s = offset.max(c.parent_offset);
                let e = end.min(wend);
                if s >= e {
                    return None;
                }
                Some((child, s - c.parent_offset, e - s))
            })
            .collect();
        drop(side);
        for (child, off, len) in children {
            child.range_change_update_from_parent(off, len);
        }
    }

    // ------------------------------------------------------------------------
    // Mapping listeners
    // ------------------------------------------------------------------------

    pub(crate) fn add_mapping(&self, mapping: MappingRef) {
        self.side.lock().mappings.push(mapping);
    }

    pub(crate) fn remove_mapping(&self, aspace_id: VmAspaceId, base: Vaddr) {
        let mut side = self.side.lock();
        side.mappings
            .retain(|m| !(m.aspace_id == aspace_id && m.base == base));
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.pages.release_all();
        if let Some(parent) = inner.parent.take() {
            let me = self as *const VmObject;
            let mut side = parent.side.lock();
            side.children.retain(|c| c.child.as_ptr() != me);
        }
    }
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("name", &self.name.as_str())
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: u64 = PAGE_SIZE as u64;

    fn setup() -> spin::MutexGuard<'static, ()> {
        pmm::init(4096);
        pmm::test_lock()
    }

    fn fill(vmo: &Arc<VmObject>, offset: u64, len: usize, byte: u8) {
        let buf = alloc::vec![byte; len];
        assert_eq!(vmo.write(offset, &buf).unwrap(), len);
    }

    fn read_byte(vmo: &Arc<VmObject>, offset: u64) -> u8 {
        let mut b = [0u8; 1];
        assert_eq!(vmo.read(offset, &mut b).unwrap(), 1);
        b[0]
    }

    #[test]
    fn test_create_basics() {
        let _guard = setup();
        let vmo = VmObject::create(3 * P + 1, "t").unwrap();
        assert_eq!(vmo.size(), 4 * P); // rounded up
        assert_eq!(vmo.resident_page_count(), 0);
        assert!(vmo.is_resizable());
        assert!(VmObject::create(u64::MAX, "big").is_err());
    }

    #[test]
    fn test_commit_idempotent() {
        let _guard = setup();
        let vmo = VmObject::create(3 * P, "t").unwrap();
        let mut committed = 0;
        vmo.commit_range(0, 3 * P, &mut committed).unwrap();
        assert_eq!(committed, 3 * P);
        assert_eq!(vmo.resident_page_count(), 3);

        let free_before = pmm::frame_stats().free;
        vmo.commit_range(0, 3 * P, &mut committed).unwrap();
        assert_eq!(committed, 3 * P);
        assert_eq!(vmo.resident_page_count(), 3);
        assert_eq!(pmm::frame_stats().free, free_before);
    }

    #[test]
    fn test_commit_out_of_range() {
        let _guard = setup();
        let vmo = VmObject::create(2 * P, "t").unwrap();
        let mut committed = 0;
        assert_eq!(
            vmo.commit_range(P, 2 * P, &mut committed),
            Err(VmError::OutOfRange)
        );
    }

    #[test]
    fn test_read_write_roundtrip() {
        let _guard = setup();
        let vmo = VmObject::create(4 * P, "t").unwrap();
        // Pattern crossing a page boundary.
        let data: Vec<u8> = (0..PAGE_SIZE + 64).map(|i| (i % 251) as u8).collect();
        assert_eq!(vmo.write(P - 32, &data).unwrap(), data.len());

        let mut back = alloc::vec![0u8; data.len()];
        assert_eq!(vmo.read(P - 32, &mut back).unwrap(), data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn test_read_hole_zero_without_commit() {
        let _guard = setup();
        let vmo = VmObject::create(2 * P, "t").unwrap();
        let mut buf = [0xFFu8; 64];
        vmo.read(P + 7, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(vmo.resident_page_count(), 0);
    }

    #[test]
    fn test_read_clamps_at_end() {
        let _guard = setup();
        let vmo = VmObject::create(P, "t").unwrap();
        let mut buf = [0u8; 128];
        assert_eq!(vmo.read(P - 16, &mut buf).unwrap(), 16);
        assert_eq!(vmo.read(P, &mut buf), Err(VmError::OutOfRange));
    }

    #[test]
    fn test_resize_truncate_then_grow() {
        let _guard = setup();
        // End-to-end scenario: 3-page object, commit, shrink, regrow.
        let vmo = VmObject::create(3 * P, "t").unwrap();
        let mut committed = 0;
        vmo.commit_range(0, 3 * P, &mut committed).unwrap();
        assert_eq!(committed, 3 * P);

        fill(&vmo, 0, P as usize, 0x11);
        vmo.resize(P).unwrap();
        assert_eq!(vmo.resident_page_count(), 1);

        vmo.resize(3 * P).unwrap();
        // Bytes below the truncation point survive; regrown tail reads zero.
        assert_eq!(read_byte(&vmo, 0), 0x11);
        assert_eq!(read_byte(&vmo, 2 * P), 0);
    }

    #[test]
    fn test_resize_rejects_oversize() {
        let _guard = setup();
        let vmo = VmObject::create(P, "t").unwrap();
        assert_eq!(vmo.resize(u64::MAX), Err(VmError::InvalidArgs));
        assert!(vmo.resize(MAX_VMO_SIZE).is_ok());
    }

    #[test]
    fn test_cow_isolation() {
        let _guard = setup();
        // End-to-end scenario: writes on either side stay invisible to the
        // other; untouched pages stay shared.
        let a = VmObject::create(2 * P, "a").unwrap();
        fill(&a, 0, P as usize, 0xAA);

        let b = a.clone_cow(0, 2 * P, false).unwrap();
        fill(&b, 0, P as usize, 0xBB);

        assert_eq!(read_byte(&a, 0), 0xAA);
        assert_eq!(read_byte(&b, 0), 0xBB);
        assert_eq!(read_byte(&a, P), read_byte(&b, P));

        // Parent writes after the clone stay invisible to the child.
        fill(&a, P, P as usize, 0xCC);
        assert_eq!(read_byte(&a, P), 0xCC);
        assert_eq!(read_byte(&b, P), 0);
    }

    #[test]
    fn test_cow_partial_window() {
        let _guard = setup();
        let a = VmObject::create(4 * P, "a").unwrap();
        fill(&a, 2 * P, P as usize, 0x77);

        let b = a.clone_cow(2 * P, P, false).unwrap();
        assert_eq!(b.size(), P);
        assert_eq!(read_byte(&b, 0), 0x77);

        fill(&a, 2 * P, P as usize, 0x78);
        assert_eq!(read_byte(&b, 0), 0x77);
    }

    #[test]
    fn test_cow_clone_of_clone() {
        let _guard = setup();
        let a = VmObject::create(P, "a").unwrap();
        fill(&a, 0, 16, 0x01);
        let b = a.clone_cow(0, P, false).unwrap();
        fill(&b, 0, 16, 0x02);
        let c = b.clone_cow(0, P, false).unwrap();
        fill(&c, 0, 16, 0x03);

        assert_eq!(read_byte(&a, 0), 0x01);
        assert_eq!(read_byte(&b, 0), 0x02);
        assert_eq!(read_byte(&c, 0), 0x03);
    }

    #[test]
    fn test_clone_bounds_checked() {
        let _guard = setup();
        let a = VmObject::create(2 * P, "a").unwrap();
        assert_eq!(
            a.clone_cow(P, 2 * P, false).map(|_| ()),
            Err(VmError::InvalidArgs)
        );
        assert_eq!(
            a.clone_cow(P + 1, P, false).map(|_| ()),
            Err(VmError::InvalidArgs)
        );
    }

    #[test]
    fn test_clone_copies_name() {
        let _guard = setup();
        let a = VmObject::create(P, "payload").unwrap();
        let b = a.clone_cow(0, P, true).unwrap();
        assert_eq!(b.name(), "payload");
        let c = a.clone_cow(0, P, false).unwrap();
        assert_eq!(c.name(), "");
    }

    #[test]
    fn test_clone_pinned_rejected() {
        let _guard = setup();
        let a = VmObject::create(P, "a").unwrap();
        a.pin(0, P).unwrap();
        assert_eq!(a.clone_cow(0, P, false).map(|_| ()), Err(VmError::BadState));
        a.unpin(0, P).unwrap();
        assert!(a.clone_cow(0, P, false).is_ok());
    }

    #[test]
    fn test_pin_commits_and_conserves() {
        let _guard = setup();
        // End-to-end scenario: decommit is refused while pinned, succeeds
        // fully after the matching unpin.
        let vmo = VmObject::create(4 * P, "t").unwrap();
        vmo.pin(P, 2 * P).unwrap();
        assert_eq!(vmo.resident_page_count(), 2);

        let mut decommitted = 0;
        assert_eq!(
            vmo.decommit_range(0, 4 * P, &mut decommitted),
            Err(VmError::PagesPinned)
        );
        assert_eq!(decommitted, 0);
        assert_eq!(vmo.resident_page_count(), 2);

        vmo.unpin(P, 2 * P).unwrap();
        vmo.decommit_range(0, 4 * P, &mut decommitted).unwrap();
        assert_eq!(decommitted, 2 * P);
        assert_eq!(vmo.resident_page_count(), 0);
    }

    #[test]
    fn test_pin_nesting() {
        let _guard = setup();
        let vmo = VmObject::create(P, "t").unwrap();
        vmo.pin(0, P).unwrap();
        vmo.pin(0, P).unwrap();
        vmo.unpin(0, P).unwrap();

        // Still pinned once.
        let mut decommitted = 0;
        assert_eq!(
            vmo.decommit_range(0, P, &mut decommitted),
            Err(VmError::PagesPinned)
        );
        vmo.unpin(0, P).unwrap();
        assert!(vmo.decommit_range(0, P, &mut decommitted).is_ok());
        assert_eq!(decommitted, P);
    }

    #[test]
    fn test_resize_pinned_tail_rejected() {
        let _guard = setup();
        let vmo = VmObject::create(2 * P, "t").unwrap();
        vmo.pin(P, P).unwrap();
        assert_eq!(vmo.resize(P), Err(VmError::PagesPinned));
        vmo.unpin(P, P).unwrap();
        assert!(vmo.resize(P).is_ok());
    }

    #[test]
    fn test_ro_data_object() {
        let _guard = setup();
        let data: Vec<u8> = (0..PAGE_SIZE + 100).map(|i| (i % 199) as u8).collect();
        let vmo = VmObject::create_from_ro_data(&data, "rodata").unwrap();
        assert_eq!(vmo.size(), 2 * P);
        assert_eq!(vmo.resident_page_count(), 2);

        let mut back = alloc::vec![0u8; data.len()];
        vmo.read(0, &mut back).unwrap();
        assert_eq!(back, data);

        assert_eq!(vmo.write(0, &[1]), Err(VmError::AccessDenied));
        assert_eq!(vmo.resize(P), Err(VmError::InvalidArgs));
    }

    #[test]
    fn test_contiguous_object() {
        let _guard = setup();
        let vmo = VmObject::create_contiguous(4 * P, 14, "dma").unwrap();
        assert_eq!(vmo.resident_page_count(), 4);
        assert!(!vmo.is_resizable());
        assert_eq!(vmo.resize(P), Err(VmError::InvalidArgs));

        // Physically consecutive and aligned.
        let mut paddrs = Vec::new();
        vmo.lookup(0, 4 * P, LookupFlags::empty(), |_, paddr| {
            paddrs.push(paddr);
            Ok(())
        })
        .unwrap();
        assert_eq!(paddrs.len(), 4);
        assert_eq!(paddrs[0] % (1 << 14), 0);
        for w in paddrs.windows(2) {
            assert_eq!(w[1], w[0] + P);
        }

        // Contiguous memory is pinned for its lifetime.
        let mut decommitted = 0;
        assert_eq!(
            vmo.decommit_range(0, P, &mut decommitted),
            Err(VmError::PagesPinned)
        );
    }

    #[test]
    fn test_physical_object() {
        let _guard = setup();
        let base = pmm::alloc_contiguous(2, 12).unwrap();
        let vmo = VmObject::create_physical(base, 2 * P, "mmio").unwrap();
        assert_eq!(vmo.resident_page_count(), 2);

        fill(&vmo, 0, 8, 0x42);
        assert_eq!(read_byte(&vmo, 0), 0x42);

        let mut decommitted = 0;
        assert_eq!(
            vmo.decommit_range(0, P, &mut decommitted),
            Err(VmError::InvalidArgs)
        );

        // The frames outlive the object: it only borrowed them.
        drop(vmo);
        pmm::free_page(base);
        pmm::free_page(base + P);
    }

    #[test]
    fn test_lookup_order_and_commit() {
        let _guard = setup();
        let vmo = VmObject::create(4 * P, "t").unwrap();
        let mut committed = 0;
        vmo.commit_range(0, P, &mut committed).unwrap();
        vmo.commit_range(2 * P, P, &mut committed).unwrap();

        let mut seen = Vec::new();
        vmo.lookup(0, 4 * P, LookupFlags::empty(), |off, _| {
            seen.push(off);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, [0, 2 * P]);

        // COMMIT visits every page and fills the holes.
        let mut seen = Vec::new();
        vmo.lookup(0, 4 * P, LookupFlags::COMMIT, |off, _| {
            seen.push(off);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, [0, P, 2 * P, 3 * P]);
        assert_eq!(vmo.resident_page_count(), 4);
    }

    #[test]
    fn test_cache_ops_skip_holes() {
        let _guard = setup();
        let vmo = VmObject::create(4 * P, "t").unwrap();
        let mut committed = 0;
        vmo.commit_range(P, P, &mut committed).unwrap();

        let before = arch_mmu::cache_stats().clean.load(Ordering::Relaxed);
        vmo.clean_cache(0, 4 * P).unwrap();
        let after = arch_mmu::cache_stats().clean.load(Ordering::Relaxed);
        assert_eq!(after - before, 1);

        vmo.sync_cache(0, 4 * P).unwrap();
        vmo.invalidate_cache(0, 4 * P).unwrap();
        vmo.clean_invalidate_cache(0, 4 * P).unwrap();
    }

    #[test]
    fn test_get_page_semantics() {
        let _guard = setup();
        let a = VmObject::create(2 * P, "a").unwrap();
        fill(&a, 0, 4, 0x5A);
        let b = a.clone_cow(0, 2 * P, false).unwrap();

        // Read resolves to the ancestor frame, not owned.
        let info = b.get_page(0, PageRequest::empty()).unwrap();
        assert!(!info.owned);
        assert_eq!(info.source, PageSource::ReadThrough);
        assert_eq!(b.resident_page_count(), 0);

        // Write forces a private copy.
        let info = b.get_page(0, PageRequest::WRITE).unwrap();
        assert!(info.owned);
        assert_eq!(info.source, PageSource::CowCopy);
        assert_eq!(b.resident_page_count(), 1);

        // Now resident.
        let info = b.get_page(0, PageRequest::WRITE).unwrap();
        assert_eq!(info.source, PageSource::Resident);

        // A hole zero-fills.
        let info = b.get_page(P, PageRequest::WRITE).unwrap();
        assert_eq!(info.source, PageSource::ZeroFill);

        assert!(matches!(
            b.get_page(2 * P, PageRequest::empty()),
            Err(VmError::OutOfRange)
        ));
    }

    #[test]
    fn test_collapse_after_sibling_drop() {
        let _guard = setup();
        let a = VmObject::create(2 * P, "a").unwrap();
        fill(&a, 0, P as usize, 0x99);
        let b = a.clone_cow(0, 2 * P, false).unwrap();
        drop(b);

        // The hidden node has a single live child left; the next write fault
        // absorbs its pages instead of copying them.
        let free_before = pmm::frame_stats().free;
        let info = a.get_page(0, PageRequest::WRITE).unwrap();
        assert_eq!(info.source, PageSource::Resident);
        assert_eq!(a.resident_page_count(), 1);
        assert_eq!(read_byte(&a, 0), 0x99);
        assert_eq!(pmm::frame_stats().free, free_before);
    }

    #[test]
    fn test_decommit_on_clone_reexposes_parent() {
        let _guard = setup();
        let a = VmObject::create(P, "a").unwrap();
        fill(&a, 0, 8, 0x21);
        let b = a.clone_cow(0, P, false).unwrap();
        fill(&b, 0, 8, 0x22);
        assert_eq!(read_byte(&b, 0), 0x22);

        let mut decommitted = 0;
        b.decommit_range(0, P, &mut decommitted).unwrap();
        assert_eq!(decommitted, P);
        // Private copy gone; the snapshot shows through again.
        assert_eq!(read_byte(&b, 0), 0x21);
    }

    #[test]
    fn test_teardown_returns_frames() {
        let _guard = setup();
        let free_before = pmm::frame_stats().free;
        {
            let a = VmObject::create(8 * P, "a").unwrap();
            let mut committed = 0;
            a.commit_range(0, 8 * P, &mut committed).unwrap();
            let b = a.clone_cow(0, 8 * P, false).unwrap();
            fill(&b, 0, PAGE_SIZE, 0xEE);
            drop(a);
            drop(b);
        }
        assert_eq!(pmm::frame_stats().free, free_before);
    }
}
