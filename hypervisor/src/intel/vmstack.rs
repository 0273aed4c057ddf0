//! Module for handling the host execution stack.
//! The processor switches to this stack on every VM exit, before the VM-exit
//! handler runs. It is allocated once per VMCS and never shared.

use {
    crate::{
        error::HypervisorError,
        utils::{addresses::PhysicalAddress, alloc::PhysicalMemory},
    },
    core::mem::size_of,
    static_assertions::const_assert_eq,
    x86::bits64::paging::BASE_PAGE_SIZE,
};

/// Number of 4-KByte pages backing the host stack.
pub const HOST_STACK_PAGES: usize = 6;

/// The size of the host stack in bytes.
pub const HOST_STACK_SIZE: usize = HOST_STACK_PAGES * BASE_PAGE_SIZE;

/// The size reserved for host RSP. This includes space allocated for padding.
pub const STACK_CONTENTS_SIZE: usize = HOST_STACK_SIZE - size_of::<u64>() * 2;

/// Layout of the host stack pages.
#[repr(C, align(4096))]
pub struct VmStack {
    /// The main contents of the stack during VM-exit. VMCS_HOST_RSP points to the end of this array.
    pub stack_contents: [u8; STACK_CONTENTS_SIZE],

    /// Padding to ensure the Host RSP remains 16-byte aligned.
    pub padding_2: u64,

    /// Padding to ensure the Host RSP remains 16-byte aligned.
    pub padding_1: u64,
}
const_assert_eq!(size_of::<VmStack>(), HOST_STACK_SIZE);
const_assert_eq!(STACK_CONTENTS_SIZE % 16, 0);

impl VmStack {
    /// Allocates and zero fills the host stack pages.
    ///
    /// The two padding words above the stack top are filled with ones so an
    /// overrun of the VM-exit handler's frame is recognizable in a dump.
    pub fn allocate<M: PhysicalMemory + ?Sized>(memory: &mut M) -> Result<PhysicalAddress, HypervisorError> {
        log::info!("Setting up VMCS_HOST_RSP region");

        let host_stack = memory
            .allocate_pages(HOST_STACK_PAGES)
            .ok_or(HypervisorError::AllocationFailure)?;

        if host_stack.is_null() {
            return Err(HypervisorError::AllocationFailure);
        }

        if !host_stack.is_page_aligned() {
            return Err(HypervisorError::UnalignedPhysicalAddress(host_stack.pa()));
        }

        unsafe {
            let stack = host_stack.as_mut_ptr::<VmStack>();
            core::ptr::addr_of_mut!((*stack).stack_contents).write_bytes(0, 1);
            core::ptr::addr_of_mut!((*stack).padding_2).write(u64::MAX);
            core::ptr::addr_of_mut!((*stack).padding_1).write(u64::MAX);
        }

        log::info!("VMCS_HOST_RSP Physical Address: {:#x}", host_stack);
        log::info!("VMCS_HOST_RSP setup successful!");

        Ok(host_stack)
    }

    /// The initial host RSP for the stack based at `host_stack`.
    pub const fn top(host_stack: PhysicalAddress) -> u64 {
        host_stack.pa() + STACK_CONTENTS_SIZE as u64
    }
}
