//! VM Aspace - Address Space Management
//!
//! An aspace owns an ordered collection of non-overlapping regions inside a
//! base/size window, backed by one hardware page-table context. It allocates
//! virtual ranges, inserts and removes regions, and resolves page faults by
//! delegating into the faulting region's VmObject.
//!
//! Process-wide state is the registry of all live aspaces plus the kernel
//! aspace singleton, initialized once during early boot.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::arch_mmu::{ArchVmAspace, MmuFlags};
use crate::pmm::{self, PAGE_SIZE};
use crate::types::{make_name, Name, Paddr, Vaddr, VmError, VmResult};
use crate::vm_object::{MappingRef, PageRequest, PageSource, VmObject};
use crate::vm_region::VmRegion;

// ============================================================================
// Aspace Types
// ============================================================================

/// VM aspace ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmAspaceId(pub u64);

static NEXT_ASPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Which virtual window an aspace manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAspaceType {
    /// Regular user process window.
    User,
    /// The kernel window.
    Kernel,
    /// Low kernel window used during early bring-up.
    LowKernel,
}

/// User window: leaves the null-guard low megabytes unused.
pub const USER_ASPACE_BASE: Vaddr = 0x0000_0000_0100_0000;
pub const USER_ASPACE_SIZE: u64 = 0x0000_7FFE_FF00_0000;

/// Kernel window: canonical upper half.
pub const KERNEL_ASPACE_BASE: Vaddr = 0xFFFF_8000_0000_0000;
pub const KERNEL_ASPACE_SIZE: u64 = 0x0000_7FFF_FFFF_F000;

/// Low kernel window for early bring-up identity ranges.
pub const LOW_KERNEL_ASPACE_BASE: Vaddr = 0x0000_0000_0000_1000;
pub const LOW_KERNEL_ASPACE_SIZE: u64 = 0x0000_0000_3FFF_F000;

impl VmAspaceType {
    fn window(self) -> (Vaddr, u64) {
        match self {
            VmAspaceType::User => (USER_ASPACE_BASE, USER_ASPACE_SIZE),
            VmAspaceType::Kernel => (KERNEL_ASPACE_BASE, KERNEL_ASPACE_SIZE),
            VmAspaceType::LowKernel => (LOW_KERNEL_ASPACE_BASE, LOW_KERNEL_ASPACE_SIZE),
        }
    }
}

/// Aspace lifecycle: Uninitialized -> Active -> Destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VmAspaceState {
    Uninitialized,
    Active,
    Destroyed,
}

bitflags! {
    /// Placement and population flags for mapping operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Place at the caller-supplied address instead of searching.
        const SPECIFIC = 1 << 0;
        /// Commit and map every page eagerly instead of on first fault.
        const COMMIT = 1 << 1;
    }
}

bitflags! {
    /// Access description delivered with a page fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultFlags: u32 {
        /// Fault was a write.
        const WRITE = 1 << 0;
        /// Fault was an instruction fetch.
        const EXECUTE = 1 << 1;
        /// Fault came from user mode.
        const USER = 1 << 2;
    }
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Global fault statistics counters.
pub struct FaultStats {
    /// Total faults dispatched.
    pub total: AtomicU64,
    /// Faults that copied a page from a COW ancestor.
    pub cow: AtomicU64,
    /// Faults satisfied with a fresh zero page.
    pub zero_fill: AtomicU64,
    /// Read faults served out of an ancestor's page.
    pub read_through: AtomicU64,
    /// Faults rejected for insufficient protection.
    pub access_violations: AtomicU64,
    /// Faults with no region or no backing to resolve against.
    pub unresolved: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            cow: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            read_through: AtomicU64::new(0),
            access_violations: AtomicU64::new(0),
            unresolved: AtomicU64::new(0),
        }
    }
}

static FAULT_STATS: FaultStats = FaultStats::new();

/// Get fault statistics.
pub fn fault_stats() -> &'static FaultStats {
    &FAULT_STATS
}

// ============================================================================
// VmAspace
// ============================================================================

/// One address space: a window, its regions, and an arch page-table context.
pub struct VmAspace {
    id: VmAspaceId,
    ty: VmAspaceType,
    name: Name,
    base: Vaddr,
    size: u64,
    state: Mutex<VmAspaceState>,
    /// Regions keyed by base address; non-overlapping, sorted.
    regions: Mutex<BTreeMap<Vaddr, Arc<VmRegion>>>,
    /// Hardware page-table context.
    arch: Mutex<ArchVmAspace>,
}

impl VmAspace {
    /// Create, initialize, and register a new aspace.
    pub fn create(ty: VmAspaceType, name: &str) -> VmResult<Arc<VmAspace>> {
        let (base, size) = ty.window();
        let aspace = Arc::new(VmAspace {
            id: VmAspaceId(NEXT_ASPACE_ID.fetch_add(1, Ordering::Relaxed)),
            ty,
            name: make_name(name),
            base,
            size,
            state: Mutex::new(VmAspaceState::Uninitialized),
            regions: Mutex::new(BTreeMap::new()),
            arch: Mutex::new(ArchVmAspace::new()),
        });
        aspace.init()?;
        registry().lock().aspaces.insert(aspace.id, aspace.clone());
        log::debug!("aspace {:?} '{}' created", aspace.id, aspace.name());
        Ok(aspace)
    }

    /// Uninitialized -> Active. Failure leaves the aspace unusable.
    pub fn init(&self) -> VmResult<()> {
        let mut state = self.state.lock();
        if *state != VmAspaceState::Uninitialized {
            return Err(VmError::BadState);
        }
        *state = VmAspaceState::Active;
        Ok(())
    }

    pub fn id(&self) -> VmAspaceId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn aspace_type(&self) -> VmAspaceType {
        self.ty
    }

    pub fn base(&self) -> Vaddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_destroyed(&self) -> bool {
        *self.state.lock() == VmAspaceState::Destroyed
    }

    fn check_active(&self) -> VmResult<()> {
        match *self.state.lock() {
            VmAspaceState::Active => Ok(()),
            _ => Err(VmError::BadState),
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Visit every region in base order. Read-only.
    pub fn for_each_region(&self, mut f: impl FnMut(&Arc<VmRegion>)) {
        for region in self.regions.lock().values() {
            f(region);
        }
    }

    // ------------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------------

    /// First-fit search for a gap of `size` bytes aligned to
    /// `1 << align_log2`. `None` is the no-space sentinel.
    pub fn alloc_spot(&self, size: u64, align_log2: usize) -> Option<Vaddr> {
        let regions = self.regions.lock();
        self.alloc_spot_locked(&regions, size, align_log2)
    }

    fn alloc_spot_locked(
        &self,
        regions: &BTreeMap<Vaddr, Arc<VmRegion>>,
        size: u64,
        align_log2: usize,
    ) -> Option<Vaddr> {
        let align = (1u64 << align_log2).max(PAGE_SIZE as u64);
        let align_up = |v: Vaddr| v.checked_add(align - 1).map(|x| x & !(align - 1));
        let window_end = self.base + self.size;

        let mut prev_end = self.base;
        for region in regions.values() {
            let candidate = align_up(prev_end)?;
            if candidate.checked_add(size)? <= region.base() {
                return Some(candidate);
            }
            prev_end = prev_end.max(region.end());
        }
        let candidate = align_up(prev_end)?;
        if candidate.checked_add(size)? <= window_end {
            Some(candidate)
        } else {
            None
        }
    }

    /// Check `[vaddr, vaddr + size)` lies in the window and hits no region.
    fn validate_specific_locked(
        &self,
        regions: &BTreeMap<Vaddr, Arc<VmRegion>>,
        vaddr: Vaddr,
        size: u64,
    ) -> VmResult<()> {
        let end = vaddr.checked_add(size).ok_or(VmError::InvalidArgs)?;
        if vaddr < self.base || end > self.base + self.size {
            return Err(VmError::InvalidArgs);
        }
        if let Some((_, prev)) = regions.range(..end).next_back() {
            if prev.end() > vaddr {
                return Err(VmError::NoSpace);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Region insertion / removal
    // ------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn insert_region(
        self: &Arc<Self>,
        name: &str,
        vmo: Option<Arc<VmObject>>,
        vmo_offset: u64,
        size: u64,
        vaddr: Vaddr,
        align_log2: usize,
        flags: MapFlags,
        mmu_flags: MmuFlags,
    ) -> VmResult<Arc<VmRegion>> {
        self.check_active()?;
        if size == 0 {
            return Err(VmError::InvalidArgs);
        }
        let size = pmm::round_page(size);

        let mut regions = self.regions.lock();
        let base = if flags.contains(MapFlags::SPECIFIC) {
            if !pmm::is_page_aligned(vaddr) {
                return Err(VmError::InvalidArgs);
            }
            self.validate_specific_locked(&regions, vaddr, size)?;
            vaddr
        } else {
            self.alloc_spot_locked(&regions, size, align_log2)
                .ok_or(VmError::NoSpace)?
        };
        let region = Arc::new(VmRegion::new(
            make_name(name),
            base,
            size,
            vmo.clone(),
            vmo_offset,
            mmu_flags,
            self.id,
        ));
        regions.insert(base, region.clone());
        drop(regions);

        if let Some(vmo) = &vmo {
            vmo.add_mapping(MappingRef {
                aspace_id: self.id,
                region: Arc::downgrade(&region),
                base,
                vmo_offset,
                size,
            });
        }
        Ok(region)
    }

    /// Map a sub-range of `vmo` into this aspace.
    #[allow(clippy::too_many_arguments)]
    pub fn map_object(
        self: &Arc<Self>,
        vmo: Arc<VmObject>,
        name: &str,
        vmo_offset: u64,
        size: u64,
        vaddr: Vaddr,
        align_log2: usize,
        flags: MapFlags,
        mmu_flags: MmuFlags,
    ) -> VmResult<Arc<VmRegion>> {
        if !pmm::is_page_aligned(vmo_offset) {
            return Err(VmError::InvalidArgs);
        }
        let size = pmm::round_page(size);
        let end = vmo_offset.checked_add(size).ok_or(VmError::InvalidArgs)?;
        if end > vmo.size() {
            return Err(VmError::OutOfRange);
        }
        let region = self.insert_region(
            name,
            Some(vmo),
            vmo_offset,
            size,
            vaddr,
            align_log2,
            flags,
            mmu_flags,
        )?;
        if flags.contains(MapFlags::COMMIT) {
            if let Err(e) = self.populate_region(&region) {
                let _ = self.free_region(region.base());
                return Err(e);
            }
        }
        Ok(region)
    }

    /// Allocate a fresh anonymous object and map it.
    pub fn alloc(
        self: &Arc<Self>,
        name: &str,
        size: u64,
        flags: MapFlags,
        mmu_flags: MmuFlags,
    ) -> VmResult<Arc<VmRegion>> {
        let vmo = VmObject::create(size, name)?;
        self.map_object(
            vmo,
            name,
            0,
            size,
            0,
            pmm::PAGE_SHIFT,
            flags & !MapFlags::SPECIFIC,
            mmu_flags,
        )
    }

    /// Allocate a physically contiguous object and map it eagerly.
    pub fn alloc_contiguous(
        self: &Arc<Self>,
        name: &str,
        size: u64,
        align_log2: usize,
        mmu_flags: MmuFlags,
    ) -> VmResult<Arc<VmRegion>> {
        let vmo = VmObject::create_contiguous(size, align_log2, name)?;
        self.map_object(
            vmo,
            name,
            0,
            size,
            0,
            align_log2,
            MapFlags::COMMIT,
            mmu_flags,
        )
    }

    /// Map an externally owned physical range eagerly (device memory).
    pub fn alloc_physical(
        self: &Arc<Self>,
        name: &str,
        paddr: Paddr,
        size: u64,
        mmu_flags: MmuFlags,
    ) -> VmResult<Arc<VmRegion>> {
        let vmo = VmObject::create_physical(paddr, size, name)?;
        self.map_object(
            vmo,
            name,
            0,
            size,
            0,
            pmm::PAGE_SHIFT,
            MapFlags::COMMIT,
            mmu_flags,
        )
    }

    /// Reserve an address range with no backing object. Faults inside it are
    /// unresolvable.
    pub fn reserve_space(self: &Arc<Self>, name: &str, vaddr: Vaddr, size: u64) -> VmResult<Arc<VmRegion>> {
        self.insert_region(
            name,
            None,
            0,
            size,
            vaddr,
            pmm::PAGE_SHIFT,
            MapFlags::SPECIFIC,
            MmuFlags::empty(),
        )
    }

    /// Commit and install every page of a region up front.
    fn populate_region(self: &Arc<Self>, region: &Arc<VmRegion>) -> VmResult<()> {
        let vmo = region.vmo().ok_or(VmError::BadState)?.clone();
        let write = region.mmu_flags().contains(MmuFlags::WRITE) && !vmo.is_read_only();
        let req = if write {
            PageRequest::WRITE
        } else {
            PageRequest::empty()
        };
        let mut inner = vmo.lock_inner();
        let mut off = 0;
        while off < region.size() {
            let info = vmo.get_page_locked(&mut inner, region.vmo_offset() + off, req)?;
            let mut mmu_flags = region.mmu_flags();
            if !info.owned {
                mmu_flags.remove(MmuFlags::WRITE);
            }
            self.arch
                .lock()
                .map_page(region.base() + off, info.paddr, mmu_flags);
            off += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Find the region containing `vaddr`.
    pub fn find_region(&self, vaddr: Vaddr) -> Option<Arc<VmRegion>> {
        let regions = self.regions.lock();
        let (_, region) = regions.range(..=vaddr).next_back()?;
        if region.contains(vaddr) {
            Some(region.clone())
        } else {
            None
        }
    }

    /// Remove the region containing `vaddr`: hardware mappings are torn down
    /// before the object reference is dropped.
    pub fn free_region(&self, vaddr: Vaddr) -> VmResult<()> {
        self.check_active()?;
        let region = {
            let mut regions = self.regions.lock();
            let (&base, region) = regions
                .range(..=vaddr)
                .next_back()
                .ok_or(VmError::NotFound)?;
            if !region.contains(vaddr) {
                return Err(VmError::NotFound);
            }
            let region = region.clone();
            regions.remove(&base);
            region
        };
        self.arch.lock().unmap_range(region.base(), region.size());
        if let Some(vmo) = region.vmo() {
            vmo.remove_mapping(self.id, region.base());
        }
        log::trace!(
            "aspace {:?}: freed region [{:#x}, {:#x})",
            self.id,
            region.base(),
            region.end()
        );
        Ok(())
    }

    /// Change protection on the region containing the range. Existing
    /// translations are dropped and re-faulted with the new flags, which
    /// keeps COW read-through pages from ever gaining write access directly.
    pub fn protect(&self, vaddr: Vaddr, len: u64, mmu_flags: MmuFlags) -> VmResult<()> {
        self.check_active()?;
        let end = vaddr.checked_add(len).ok_or(VmError::InvalidArgs)?;
        let region = self.find_region(vaddr).ok_or(VmError::NotFound)?;
        if end > region.end() {
            return Err(VmError::OutOfRange);
        }
        region.set_mmu_flags(mmu_flags);
        self.arch.lock().unmap_range(vaddr, len);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Fault handling
    // ------------------------------------------------------------------------

    /// Resolve a page fault at `vaddr`.
    ///
    /// The region is looked up under the aspace lock, which is then dropped;
    /// the object lock is held from page resolution through installation, and
    /// the aspace lock is re-taken inside it to revalidate the region before
    /// installing. A non-OK result is the contract for "not resolvable":
    /// the exception layer decides what that means for the faulting context.
    pub fn page_fault(&self, vaddr: Vaddr, flags: PageFaultFlags) -> VmResult<()> {
        FAULT_STATS.total.fetch_add(1, Ordering::Relaxed);
        self.check_active()?;
        let va = pmm::trunc_page(vaddr);

        let region = match self.find_region(va) {
            Some(r) => r,
            None => {
                FAULT_STATS.unresolved.fetch_add(1, Ordering::Relaxed);
                log::debug!("aspace {:?}: fault at unmapped {:#x}", self.id, vaddr);
                return Err(VmError::NotFound);
            }
        };

        let vmo = match region.vmo() {
            Some(v) => v.clone(),
            None => {
                // Reservation: nothing to fault in.
                FAULT_STATS.unresolved.fetch_add(1, Ordering::Relaxed);
                return Err(VmError::NotFound);
            }
        };

        let region_flags = region.mmu_flags();
        let denied = (flags.contains(PageFaultFlags::WRITE)
            && !region_flags.contains(MmuFlags::WRITE))
            || (flags.contains(PageFaultFlags::EXECUTE)
                && !region_flags.contains(MmuFlags::EXECUTE))
            || (flags.contains(PageFaultFlags::USER) && !region_flags.contains(MmuFlags::USER));
        if denied {
            FAULT_STATS.access_violations.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "aspace {:?}: access violation at {:#x} ({:?} vs {:?})",
                self.id,
                vaddr,
                flags,
                region_flags
            );
            return Err(VmError::AccessDenied);
        }
        let vmo_offset = region.vaddr_to_vmo_offset(va);
        let req = if flags.contains(PageFaultFlags::WRITE) {
            PageRequest::WRITE
        } else {
            PageRequest::empty()
        };

        // Hold the object lock through installation so a concurrent decommit
        // cannot free the frame in between.
        let mut inner = vmo.lock_inner();
        let info = vmo.get_page_locked(&mut inner, vmo_offset, req)?;

        // Revalidate: the region may have been unmapped while we faulted.
        let regions = self.regions.lock();
        match regions.get(&region.base()) {
            Some(current) if Arc::ptr_eq(current, &region) => {}
            _ => return Err(VmError::NotFound),
        }
        let mut mmu_flags = region_flags;
        if !info.owned {
            mmu_flags.remove(MmuFlags::WRITE);
        }
        self.arch.lock().map_page(va, info.paddr, mmu_flags);

        match info.source {
            PageSource::CowCopy => FAULT_STATS.cow.fetch_add(1, Ordering::Relaxed),
            PageSource::ZeroFill => FAULT_STATS.zero_fill.fetch_add(1, Ordering::Relaxed),
            PageSource::ReadThrough => FAULT_STATS.read_through.fetch_add(1, Ordering::Relaxed),
            PageSource::Resident => 0,
        };
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Arch plumbing
    // ------------------------------------------------------------------------

    /// Translate through the hardware context.
    pub(crate) fn query_arch(&self, vaddr: Vaddr) -> Option<(Paddr, MmuFlags)> {
        self.arch.lock().query(vaddr)
    }

    /// Tear down translations for a range. Called from object range-change
    /// propagation; takes only the arch lock.
    pub(crate) fn unmap_arch_range(&self, vaddr: Vaddr, len: u64) {
        self.arch.lock().unmap_range(vaddr, len);
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Active -> Destroyed: unmap and free every region, detach the arch
    /// context, unregister. Using the aspace afterwards yields `BadState`.
    pub fn destroy(&self) -> VmResult<()> {
        {
            let mut state = self.state.lock();
            if *state != VmAspaceState::Active {
                return Err(VmError::BadState);
            }
            *state = VmAspaceState::Destroyed;
        }
        let regions: Vec<Arc<VmRegion>> = {
            let mut regions = self.regions.lock();
            let all = regions.values().cloned().collect();
            regions.clear();
            all
        };
        for region in &regions {
            if let Some(vmo) = region.vmo() {
                vmo.remove_mapping(self.id, region.base());
            }
        }
        self.arch.lock().reset();
        registry().lock().aspaces.remove(&self.id);
        log::debug!("aspace {:?} '{}' destroyed", self.id, self.name());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    /// Log a listing of this aspace's regions. Read-only.
    pub fn dump(&self) {
        log::info!(
            "aspace {:?} '{}' [{:#x}, {:#x}) {:?}",
            self.id,
            self.name(),
            self.base,
            self.base + self.size,
            *self.state.lock()
        );
        for region in self.regions.lock().values() {
            log::info!(
                "  [{:#x}, {:#x}) '{}' flags {:?} vmo {:?} off {:#x}",
                region.base(),
                region.end(),
                region.name(),
                region.mmu_flags(),
                region.vmo().map(|v| v.id()),
                region.vmo_offset()
            );
        }
    }
}

impl core::fmt::Debug for VmAspace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmAspace")
            .field("id", &self.id)
            .field("name", &self.name.as_str())
            .field("type", &self.ty)
            .finish()
    }
}

// ============================================================================
// Global Registry
// ============================================================================

struct AspaceRegistry {
    aspaces: BTreeMap<VmAspaceId, Arc<VmAspace>>,
    kernel: Option<Arc<VmAspace>>,
}

static ASPACE_REGISTRY: spin::Once<Mutex<AspaceRegistry>> = spin::Once::new();

fn registry() -> &'static Mutex<AspaceRegistry> {
    ASPACE_REGISTRY.call_once(|| {
        Mutex::new(AspaceRegistry {
            aspaces: BTreeMap::new(),
            kernel: None,
        })
    })
}

/// Initialize the aspace subsystem: creates the kernel aspace singleton.
/// Called once during early boot; later calls are no-ops.
pub fn init() {
    if registry().lock().kernel.is_some() {
        return;
    }
    let kernel = VmAspace::create(VmAspaceType::Kernel, "kernel")
        .expect("kernel aspace creation cannot fail at boot");
    let mut reg = registry().lock();
    if reg.kernel.is_none() {
        reg.kernel = Some(kernel);
    }
}

/// The distinguished kernel aspace, if `init` has run.
pub fn kernel_aspace() -> Option<Arc<VmAspace>> {
    registry().lock().kernel.clone()
}

/// Look up a live aspace by ID.
pub(crate) fn lookup_aspace(id: VmAspaceId) -> Option<Arc<VmAspace>> {
    registry().lock().aspaces.get(&id).cloned()
}

/// Log a listing of every live aspace. Read-only.
pub fn dump_all_aspaces() {
    let aspaces: Vec<Arc<VmAspace>> = registry().lock().aspaces.values().cloned().collect();
    for aspace in aspaces {
        aspace.dump();
    }
}
