//! User-pointer copy primitive.
//!
//! A `UserPtr` names an address in some user aspace; the copy routines move
//! bytes between kernel buffers and that address through the aspace's
//! hardware translations. A missing or under-privileged translation gets one
//! chance to resolve through the fault path, the same retry the hardware
//! would trigger; if the fault is refused the copy reports `VmError::Fault`.

use alloc::sync::Arc;

use crate::arch_mmu::MmuFlags;
use crate::pmm::{self, PAGE_SIZE};
use crate::types::{Paddr, Vaddr, VmError, VmResult};
use crate::vm_aspace::{PageFaultFlags, VmAspace};

/// Capability wrapping a raw user-mode address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPtr {
    addr: Vaddr,
}

impl UserPtr {
    pub const fn new(addr: Vaddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> Vaddr {
        self.addr
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// Pointer `n` bytes further along.
    pub fn byte_offset(&self, n: u64) -> UserPtr {
        UserPtr::new(self.addr.wrapping_add(n))
    }
}

/// Resolve the page under `vaddr` with the needed permissions, faulting once
/// if the current translation is absent or insufficient.
fn resolve_page(aspace: &Arc<VmAspace>, vaddr: Vaddr, write: bool) -> VmResult<Paddr> {
    let mut needed = MmuFlags::READ | MmuFlags::USER;
    if write {
        needed |= MmuFlags::WRITE;
    }
    if let Some((paddr, flags)) = aspace.query_arch(vaddr) {
        if flags.contains(needed) {
            return Ok(paddr);
        }
    }
    let mut fault = PageFaultFlags::USER;
    if write {
        fault |= PageFaultFlags::WRITE;
    }
    aspace.page_fault(vaddr, fault).map_err(|e| {
        log::debug!("user copy fault at {:#x} unresolved: {:?}", vaddr, e);
        VmError::Fault
    })?;
    match aspace.query_arch(vaddr) {
        Some((paddr, flags)) if flags.contains(needed) => Ok(paddr),
        _ => Err(VmError::Fault),
    }
}

/// Copy `src` out to user memory at `ptr`.
pub fn copy_to_user(aspace: &Arc<VmAspace>, ptr: UserPtr, src: &[u8]) -> VmResult<()> {
    let mut pos = 0usize;
    while pos < src.len() {
        let vaddr = ptr
            .addr()
            .checked_add(pos as u64)
            .ok_or(VmError::Fault)?;
        let page_va = pmm::trunc_page(vaddr);
        let intra = (vaddr - page_va) as usize;
        let chunk = (src.len() - pos).min(PAGE_SIZE - intra);
        let paddr = resolve_page(aspace, page_va, true)?;
        pmm::with_frame(paddr, |bytes| {
            bytes[intra..intra + chunk].copy_from_slice(&src[pos..pos + chunk])
        });
        pos += chunk;
    }
    Ok(())
}

/// Copy user memory at `ptr` into `dst`.
pub fn copy_from_user(aspace: &Arc<VmAspace>, ptr: UserPtr, dst: &mut [u8]) -> VmResult<()> {
    let mut pos = 0usize;
    while pos < dst.len() {
        let vaddr = ptr
            .addr()
            .checked_add(pos as u64)
            .ok_or(VmError::Fault)?;
        let page_va = pmm::trunc_page(vaddr);
        let intra = (vaddr - page_va) as usize;
        let chunk = (dst.len() - pos).min(PAGE_SIZE - intra);
        let paddr = resolve_page(aspace, page_va, false)?;
        pmm::with_frame(paddr, |bytes| {
            dst[pos..pos + chunk].copy_from_slice(&bytes[intra..intra + chunk])
        });
        pos += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch_mmu::MmuFlags;
    use crate::vm_aspace::{MapFlags, VmAspaceType};
    use crate::vm_object::VmObject;

    const P: u64 = PAGE_SIZE as u64;

    fn setup() -> (spin::MutexGuard<'static, ()>, Arc<VmAspace>) {
        pmm::init(4096);
        let guard = pmm::test_lock();
        let aspace = VmAspace::create(VmAspaceType::User, "uc").unwrap();
        (guard, aspace)
    }

    #[test]
    fn test_copy_round_trip_across_pages() {
        let (_guard, aspace) = setup();
        let region = aspace
            .alloc("buf", 3 * P, MapFlags::empty(), MmuFlags::USER_DATA)
            .unwrap();

        let data: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i % 241) as u8).collect();
        let ptr = UserPtr::new(region.base() + P - 100);
        copy_to_user(&aspace, ptr, &data).unwrap();

        let mut back = alloc::vec![0u8; data.len()];
        copy_from_user(&aspace, ptr, &mut back).unwrap();
        assert_eq!(back, data);
        aspace.destroy().unwrap();
    }

    #[test]
    fn test_copy_faults_pages_in() {
        let (_guard, aspace) = setup();
        let region = aspace
            .alloc("lazy", 2 * P, MapFlags::empty(), MmuFlags::USER_DATA)
            .unwrap();
        let vmo = region.vmo().unwrap().clone();
        assert_eq!(vmo.resident_page_count(), 0);

        copy_to_user(&aspace, UserPtr::new(region.base()), &[7u8; 8]).unwrap();
        assert_eq!(vmo.resident_page_count(), 1);

        let mut byte = [0u8; 1];
        vmo.read(0, &mut byte).unwrap();
        assert_eq!(byte[0], 7);
        aspace.destroy().unwrap();
    }

    #[test]
    fn test_copy_outside_mappings_faults() {
        let (_guard, aspace) = setup();
        let err = copy_to_user(&aspace, UserPtr::new(aspace.base() + 0x8000), &[1u8; 4]);
        assert_eq!(err, Err(VmError::Fault));
        aspace.destroy().unwrap();
    }

    #[test]
    fn test_vmo_user_io() {
        let (_guard, aspace) = setup();
        let region = aspace
            .alloc("win", P, MapFlags::empty(), MmuFlags::USER_DATA)
            .unwrap();
        let vmo = VmObject::create(P, "io").unwrap();
        vmo.write(0, b"vm object payload").unwrap();

        // VmObject -> user window.
        let ptr = UserPtr::new(region.base());
        let n = vmo.read_user(&aspace, ptr, 0, 17).unwrap();
        assert_eq!(n, 17);

        // User window -> another offset of the object.
        let n = vmo.write_user(&aspace, ptr, 256, 17).unwrap();
        assert_eq!(n, 17);
        let mut back = [0u8; 17];
        vmo.read(256, &mut back).unwrap();
        assert_eq!(&back, b"vm object payload");
        aspace.destroy().unwrap();
    }
}
