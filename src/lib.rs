//! vmm - kernel virtual-memory core
//!
//! This crate provides the pairing of an address-space manager
//! ([`vm_aspace::VmAspace`] / [`vm_region::VmRegion`]) with a paged,
//! copy-on-write memory-object abstraction ([`vm_object::VmObject`]):
//! - vm_object: reference-counted byte containers with commit/decommit,
//!   pin/unpin, COW cloning, and cache maintenance
//! - page_list: sparse offset -> frame mapping owned by each object
//! - vm_aspace: address spaces, region placement, page-fault resolution,
//!   and the global aspace registry
//! - pmm: physical frame allocator (consumed interface + reference model)
//! - arch_mmu: hardware page-table model (consumed interface)
//! - user_copy: user-pointer copy capability

#![cfg_attr(not(test), no_std)]
// Kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

// Core types
pub mod types;

// Leaves first: frames, page lists, the arch model
pub mod arch_mmu;
pub mod page_list;
pub mod pmm;

// The object and aspace layers
pub mod user_copy;
pub mod vm_aspace;
pub mod vm_object;
pub mod vm_region;

pub use arch_mmu::MmuFlags;
pub use pmm::{PAGE_SHIFT, PAGE_SIZE};
pub use types::{Paddr, Vaddr, VmError, VmResult};
pub use user_copy::UserPtr;
pub use vm_aspace::{
    dump_all_aspaces, fault_stats, kernel_aspace, MapFlags, PageFaultFlags, VmAspace, VmAspaceId,
    VmAspaceType,
};
pub use vm_object::{
    CacheOpType, LookupFlags, PageInfo, PageRequest, PageSource, VmObject, VmObjectId, VmoKind,
    MAX_VMO_SIZE,
};
pub use vm_region::VmRegion;

/// Initialize the VM subsystem: the frame allocator first, then the aspace
/// registry with its kernel aspace singleton. Idempotent; called once during
/// early boot.
pub fn init(total_frames: usize) {
    pmm::init(total_frames);
    vm_aspace::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsystem_init() {
        init(4096);
        init(4096); // second call is a no-op
        assert!(kernel_aspace().is_some());
        assert!(pmm::frame_stats().total >= 4096);
    }
}
