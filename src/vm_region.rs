//! VM Region - one mapping record in an address space.
//!
//! A region binds `[base, base + size)` of one aspace's virtual window to a
//! sub-range of one VmObject (or to nothing, for an address reservation).
//! Regions are created and destroyed only through their owning VmAspace and
//! are guarded by its region lock; the flags cell exists so protection
//! changes need no exclusive access to the whole record.

use alloc::sync::Arc;
use spin::Mutex;

use crate::arch_mmu::MmuFlags;
use crate::types::{Name, Vaddr};
use crate::vm_aspace::VmAspaceId;
use crate::vm_object::VmObject;

/// One entry in an aspace's region collection.
#[derive(Debug)]
pub struct VmRegion {
    name: Name,
    base: Vaddr,
    size: u64,
    vmo: Option<Arc<VmObject>>,
    vmo_offset: u64,
    mmu_flags: Mutex<MmuFlags>,
    aspace_id: VmAspaceId,
}

impl VmRegion {
    pub(crate) fn new(
        name: Name,
        base: Vaddr,
        size: u64,
        vmo: Option<Arc<VmObject>>,
        vmo_offset: u64,
        mmu_flags: MmuFlags,
        aspace_id: VmAspaceId,
    ) -> Self {
        Self {
            name,
            base,
            size,
            vmo,
            vmo_offset,
            mmu_flags: Mutex::new(mmu_flags),
            aspace_id,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn base(&self) -> Vaddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last address covered.
    pub fn end(&self) -> Vaddr {
        self.base + self.size
    }

    /// Backing object, if any.
    pub fn vmo(&self) -> Option<&Arc<VmObject>> {
        self.vmo.as_ref()
    }

    /// Offset into the backing object at which `base` maps.
    pub fn vmo_offset(&self) -> u64 {
        self.vmo_offset
    }

    /// A reservation holds address space without backing.
    pub fn is_reservation(&self) -> bool {
        self.vmo.is_none()
    }

    pub fn mmu_flags(&self) -> MmuFlags {
        *self.mmu_flags.lock()
    }

    pub(crate) fn set_mmu_flags(&self, flags: MmuFlags) {
        *self.mmu_flags.lock() = flags;
    }

    pub fn aspace_id(&self) -> VmAspaceId {
        self.aspace_id
    }

    /// Check if address falls inside this region.
    pub fn contains(&self, vaddr: Vaddr) -> bool {
        vaddr >= self.base && vaddr < self.end()
    }

    /// Check overlap with `[start, end)`.
    pub fn overlaps(&self, start: Vaddr, end: Vaddr) -> bool {
        self.base < end && start < self.end()
    }

    /// Translate an address in this region to a backing-object offset.
    pub fn vaddr_to_vmo_offset(&self, vaddr: Vaddr) -> u64 {
        debug_assert!(self.contains(vaddr));
        vaddr - self.base + self.vmo_offset
    }
}
