//! The boot-time physical page allocator, seen from the hypervisor.
//!
//! No general purpose allocator or paging abstraction can be trusted while a
//! processor is brought into VMX operation, so every page the VMX structures
//! live in comes from this interface. The allocator itself belongs to the boot
//! environment; the bring-up crate binds it to the environment's symbols.

use {
    crate::{error::HypervisorError, utils::addresses::PhysicalAddress},
    x86::bits64::paging::BASE_PAGE_SIZE,
};

/// Source of physical pages and of the physical/linear translation check.
///
/// Calls are made from a single initializing context, one at a time.
pub trait PhysicalMemory {
    /// Allocates one 4-KByte page. `None` when memory is exhausted.
    fn allocate_page(&mut self) -> Option<PhysicalAddress>;

    /// Allocates `count` physically contiguous 4-KByte pages. `None` when memory is exhausted.
    fn allocate_pages(&mut self, count: usize) -> Option<PhysicalAddress>;

    /// Translates `address` the way the boot environment's `pa()` does.
    ///
    /// A page is only usable for VMX structures when this returns `address` unchanged.
    fn translate(&self, address: u64) -> u64;
}

/// Allocates one zero-filled page that VMX instructions can be pointed at.
///
/// VMXON and VMPTRLD take the physical address of their region while this
/// code writes the region through the same value, so the page must be 4-KByte
/// aligned and identity mapped.
pub fn allocate_identity_page<M: PhysicalMemory + ?Sized>(memory: &mut M) -> Result<PhysicalAddress, HypervisorError> {
    let page = memory.allocate_page().ok_or(HypervisorError::AllocationFailure)?;

    if page.is_null() {
        return Err(HypervisorError::AllocationFailure);
    }

    if !page.is_page_aligned() {
        return Err(HypervisorError::UnalignedPhysicalAddress(page.pa()));
    }

    if memory.translate(page.pa()) != page.pa() {
        return Err(HypervisorError::AddressNotIdentityMapped(page.pa()));
    }

    unsafe { page.as_mut_ptr::<u8>().write_bytes(0, BASE_PAGE_SIZE) };

    Ok(page)
}
