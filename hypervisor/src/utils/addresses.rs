//! Abstraction over physical addresses handed out before paging is trusted.
//!
//! This module introduces the `PhysicalAddress` structure. It wraps the raw value
//! returned by the boot-time page allocator and keeps it apart from virtual
//! addresses at the type level: there is no conversion from or arithmetic with
//! a `VAddr`. The only way to touch the memory behind it is `as_mut_ptr`, which
//! is valid while physical and linear addresses still coincide.

use {
    core::fmt,
    x86::bits64::paging::{PAddr, BASE_PAGE_SHIFT, BASE_PAGE_SIZE},
};

/// A representation of physical addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(PAddr);

impl PhysicalAddress {
    /// The null physical address, used for slots nothing has been allocated into.
    pub const NULL: Self = Self(PAddr(0));

    /// Constructs a `PhysicalAddress` from a given physical address.
    pub const fn from_pa(pa: u64) -> Self {
        Self(PAddr(pa))
    }

    /// Constructs a `PhysicalAddress` from a given page frame number (PFN).
    pub const fn from_pfn(pfn: u64) -> Self {
        Self(PAddr(pfn << BASE_PAGE_SHIFT))
    }

    /// Retrieves the physical address.
    pub const fn pa(&self) -> u64 {
        self.0 .0
    }

    /// Retrieves the page frame number (PFN) for the physical address.
    pub const fn pfn(&self) -> u64 {
        self.0 .0 >> BASE_PAGE_SHIFT
    }

    pub const fn is_null(&self) -> bool {
        self.0 .0 == 0
    }

    pub fn is_page_aligned(&self) -> bool {
        self.0.is_base_page_aligned()
    }

    /// The address `pages` 4-KByte pages past this one.
    pub const fn add_pages(&self, pages: usize) -> Self {
        Self(PAddr(self.0 .0 + (pages * BASE_PAGE_SIZE) as u64))
    }

    /// Returns a pointer through which the memory at this address can be accessed.
    ///
    /// # Safety
    ///
    /// Only valid while the address is identity mapped, i.e. before the boot
    /// environment has split physical and linear addressing.
    pub unsafe fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 .0 as *mut T
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.pa(), f)
    }
}
