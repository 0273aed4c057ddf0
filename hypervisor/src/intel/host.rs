//! Host-state area of the VMCS: where, and in what context, the processor
//! resumes on every VM exit.
//!
//! The host keeps running on the control registers and descriptor tables it
//! already has. Only the stack is private to the hypervisor.

use {
    crate::{
        error::HypervisorError,
        intel::{
            support::VmxInstructions,
            vmcs::{CurrentVmcs, HostStateWritten, Loaded},
        },
        utils::instructions::Processor,
    },
    x86::vmx::vmcs::host,
};

/// Host selectors must have RPL and TI clear.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.2.3 Checks on Host Segment and Descriptor-Table Registers
const SELECTOR_MASK: u16 = !0x7;

/// The flat kernel selectors of the boot GDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSelectors {
    pub code: u16,
    pub data: u16,
    /// Selector of the single active TSS.
    pub tss: u16,
}

impl Default for HostSelectors {
    fn default() -> Self {
        Self {
            code: 0x08,
            data: 0x10,
            tss: 0x18,
        }
    }
}

/// What the host-state area is built from besides live processor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    pub selectors: HostSelectors,
    /// Address of the VM-exit trampoline. Becomes HOST_RIP.
    pub vmexit_entry: u64,
}

impl HostConfig {
    pub fn new(vmexit_entry: u64) -> Self {
        Self {
            selectors: HostSelectors::default(),
            vmexit_entry,
        }
    }
}

impl<'a, V: VmxInstructions + ?Sized> CurrentVmcs<'a, V, Loaded> {
    /// Initialize the host state for the currently loaded VMCS.
    ///
    /// Writes stop at the first failure, which is returned unchanged; a VMCS
    /// with a partial host state must not be entered.
    ///
    /// GS is bound to the kernel data selector. That is only correct for the
    /// bootstrap processor; any other processor needs its own GS.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.5 HOST-STATE AREA
    #[rustfmt::skip]
    pub fn write_host_state<P: Processor + ?Sized>(self, cpu: &P, config: &HostConfig) -> Result<CurrentVmcs<'a, V, HostStateWritten>, HypervisorError> {
        log::info!("Setting up Host Registers State");

        let code = config.selectors.code & SELECTOR_MASK;
        let data = config.selectors.data & SELECTOR_MASK;
        let tss = config.selectors.tss & SELECTOR_MASK;

        self.write(host::CR0, cpu.cr0())?;
        self.write(host::CR3, cpu.cr3())?;
        self.write(host::CR4, cpu.cr4())?;

        self.write(host::ES_SELECTOR, data)?;
        self.write(host::CS_SELECTOR, code)?;
        self.write(host::SS_SELECTOR, data)?;
        self.write(host::DS_SELECTOR, data)?;
        self.write(host::FS_SELECTOR, data)?;
        self.write(host::GS_SELECTOR, data)?;
        self.write(host::TR_SELECTOR, tss)?;

        // The host never uses SYSENTER.
        self.write(host::IA32_SYSENTER_CS, 0u64)?;
        self.write(host::IA32_SYSENTER_ESP, 0u64)?;
        self.write(host::IA32_SYSENTER_EIP, 0u64)?;

        self.write(host::IDTR_BASE, cpu.idtr_base())?;
        self.write(host::GDTR_BASE, cpu.gdtr_base())?;
        self.write(host::FS_BASE, cpu.fs_base())?;
        self.write(host::GS_BASE, cpu.gs_base())?;
        self.write(host::TR_BASE, cpu.tr_base())?;

        let host_rsp = self.blob().host_stack_top();
        self.write(host::RSP, host_rsp)?;
        self.write(host::RIP, config.vmexit_entry)?;

        log::info!("Host RSP: {:#x}, Host RIP: {:#x}", host_rsp, config.vmexit_entry);
        log::info!("Host Registers State successful!");

        Ok(self.advance())
    }
}
