//! Guest-state area of the VMCS: the context the virtual processor observes
//! on its very first VM entry.
//!
//! Every segment is a flat 64-KByte ring 0 window at address 0, paging is off
//! and interrupts are disabled. Setting up anything beyond that is left to
//! the guest itself.

use {
    crate::{
        error::HypervisorError,
        intel::{
            segmentation::SegmentAccessRights,
            support::VmxInstructions,
            vmcs::{CurrentVmcs, HostStateWritten, ReadyForEntry},
        },
    },
    x86::{bits64::rflags::RFlags, controlregs::Cr0, vmx::vmcs::guest},
};

/// Limit of every guest segment and descriptor table.
const SEGMENT_LIMIT: u64 = 0xffff;

/// VMCS link pointer value meaning "no shadow VMCS".
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4.2 Guest Non-Register State
const NO_LINK_POINTER: u64 = u64::MAX;

impl<'a, V: VmxInstructions + ?Sized> CurrentVmcs<'a, V, HostStateWritten> {
    /// Initialize the guest state for the currently loaded VMCS.
    ///
    /// Only reachable once the host state is complete. The first failing
    /// write aborts the batch.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4 GUEST-STATE AREA
    #[rustfmt::skip]
    pub fn write_guest_state(self) -> Result<CurrentVmcs<'a, V, ReadyForEntry>, HypervisorError> {
        log::info!("Setting up Guest Registers State");

        // Selectors
        self.write(guest::ES_SELECTOR, 0u64)?;
        self.write(guest::CS_SELECTOR, 0u64)?;
        self.write(guest::DS_SELECTOR, 0u64)?;
        self.write(guest::FS_SELECTOR, 0u64)?;
        self.write(guest::GS_SELECTOR, 0u64)?;
        self.write(guest::SS_SELECTOR, 0u64)?;
        self.write(guest::TR_SELECTOR, 0u64)?;
        self.write(guest::LDTR_SELECTOR, 0u64)?;

        // Bases
        self.write(guest::CS_BASE, 0u64)?;
        self.write(guest::DS_BASE, 0u64)?;
        self.write(guest::ES_BASE, 0u64)?;
        self.write(guest::FS_BASE, 0u64)?;
        self.write(guest::GS_BASE, 0u64)?;
        self.write(guest::SS_BASE, 0u64)?;
        self.write(guest::LDTR_BASE, 0u64)?;
        self.write(guest::IDTR_BASE, 0u64)?;
        self.write(guest::GDTR_BASE, 0u64)?;
        self.write(guest::TR_BASE, 0u64)?;

        // Limits
        self.write(guest::CS_LIMIT, SEGMENT_LIMIT)?;
        self.write(guest::DS_LIMIT, SEGMENT_LIMIT)?;
        self.write(guest::ES_LIMIT, SEGMENT_LIMIT)?;
        self.write(guest::FS_LIMIT, SEGMENT_LIMIT)?;
        self.write(guest::GS_LIMIT, SEGMENT_LIMIT)?;
        self.write(guest::SS_LIMIT, SEGMENT_LIMIT)?;
        self.write(guest::LDTR_LIMIT, SEGMENT_LIMIT)?;
        self.write(guest::TR_LIMIT, SEGMENT_LIMIT)?;
        self.write(guest::GDTR_LIMIT, SEGMENT_LIMIT)?;
        self.write(guest::IDTR_LIMIT, SEGMENT_LIMIT)?;

        // Access rights
        self.write(guest::CS_ACCESS_RIGHTS, SegmentAccessRights::FLAT_CODE.bits())?;
        self.write(guest::DS_ACCESS_RIGHTS, SegmentAccessRights::FLAT_DATA.bits())?;
        self.write(guest::ES_ACCESS_RIGHTS, SegmentAccessRights::FLAT_DATA.bits())?;
        self.write(guest::FS_ACCESS_RIGHTS, SegmentAccessRights::FLAT_DATA.bits())?;
        self.write(guest::GS_ACCESS_RIGHTS, SegmentAccessRights::FLAT_DATA.bits())?;
        self.write(guest::SS_ACCESS_RIGHTS, SegmentAccessRights::FLAT_DATA.bits())?;
        self.write(guest::LDTR_ACCESS_RIGHTS, SegmentAccessRights::UNUSED_LDT.bits())?;
        self.write(guest::TR_ACCESS_RIGHTS, SegmentAccessRights::ACTIVE_TSS.bits())?;

        // Active, nothing blocked.
        self.write(guest::INTERRUPTIBILITY_STATE, 0u64)?;
        self.write(guest::ACTIVITY_STATE, 0u64)?;

        self.write(guest::CR0, Cr0::CR0_NUMERIC_ERROR.bits() as u64)?;
        self.write(guest::CR3, 0u64)?;
        self.write(guest::CR4, 0u64)?;
        self.write(guest::DR7, 0u64)?;

        self.write(guest::RSP, 0u64)?;
        self.write(guest::RIP, 0u64)?;
        self.write(guest::RFLAGS, RFlags::FLAGS_A1.bits())?;

        self.write(guest::LINK_PTR_FULL, NO_LINK_POINTER)?;
        self.write(guest::LINK_PTR_HIGH, NO_LINK_POINTER as u32)?;

        log::info!("Guest Registers State successful!");

        Ok(self.advance())
    }
}
