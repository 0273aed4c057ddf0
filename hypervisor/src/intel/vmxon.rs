//! A module responsible for managing the VMXON region and enabling VMX operations.
//!
//! Before a VMCS can be loaded the processor has to be in VMX root operation:
//! CR4.VMXE set, IA32_FEATURE_CONTROL locked with VMXON allowed, CR0 and CR4
//! inside their fixed-bit constraints, and VMXON executed on a region carrying
//! the revision identifier.

use {
    crate::{
        error::HypervisorError,
        intel::support::{vmxon, VmxInstructions},
        utils::{
            addresses::PhysicalAddress,
            alloc::{allocate_identity_page, PhysicalMemory},
            instructions::Processor,
        },
    },
    bitfield::BitMut,
    core::mem::size_of,
    static_assertions::const_assert_eq,
    x86::{bits64::paging::BASE_PAGE_SIZE, controlregs::Cr4, msr},
};

/// Lock bit of IA32_FEATURE_CONTROL.
const FEATURE_CONTROL_LOCK: u64 = 1 << 0;

/// "Enable VMX outside SMX operation" bit of IA32_FEATURE_CONTROL.
const FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;

/// Check to see if CPU is Intel (“GenuineIntel”) and supports VMX.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.6 DISCOVERING SUPPORT FOR VMX
pub fn check_vmx_support<P: Processor + ?Sized>(cpu: &P) -> Result<(), HypervisorError> {
    if !cpu.is_intel() {
        return Err(HypervisorError::CPUUnsupported);
    }
    log::info!("CPU is Intel");

    if !cpu.has_vmx() {
        return Err(HypervisorError::VMXUnsupported);
    }
    log::info!("Virtual Machine Extension (VMX) technology is supported");

    Ok(())
}

/// Enables VMX operation by setting CR4.VMXE, the feature control lock bit
/// and the fixed bits of CR0 and CR4.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.7 ENABLING AND ENTERING VMX OPERATION
pub fn enable_vmx_operation<P: Processor + ?Sized>(cpu: &P) -> Result<(), HypervisorError> {
    log::info!("Enabling Virtual Machine Extensions (VMX)");
    cpu.write_cr4(cpu.cr4() | Cr4::CR4_ENABLE_VMX.bits() as u64);

    log::info!("Setting Lock Bit set via IA32_FEATURE_CONTROL");
    set_lock_bit(cpu)?;

    /* Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.8 RESTRICTIONS ON VMX OPERATION */
    log::info!("Adjusting Control Registers");
    cpu.write_cr0(fixed_bits(cpu, cpu.cr0(), msr::IA32_VMX_CR0_FIXED0, msr::IA32_VMX_CR0_FIXED1));
    cpu.write_cr4(fixed_bits(cpu, cpu.cr4(), msr::IA32_VMX_CR4_FIXED0, msr::IA32_VMX_CR4_FIXED1));

    Ok(())
}

/// Locks IA32_FEATURE_CONTROL with VMXON allowed, unless firmware already locked it.
fn set_lock_bit<P: Processor + ?Sized>(cpu: &P) -> Result<(), HypervisorError> {
    let feature_control = cpu.read_msr(msr::IA32_FEATURE_CONTROL);

    if (feature_control & FEATURE_CONTROL_LOCK) == 0 {
        cpu.write_msr(
            msr::IA32_FEATURE_CONTROL,
            FEATURE_CONTROL_VMXON_OUTSIDE_SMX | FEATURE_CONTROL_LOCK | feature_control,
        );
    } else if (feature_control & FEATURE_CONTROL_VMXON_OUTSIDE_SMX) == 0 {
        return Err(HypervisorError::VMXBIOSLock);
    }

    Ok(())
}

/// Bits set in FIXED0 must be 1, bits clear in FIXED1 must be 0.
fn fixed_bits<P: Processor + ?Sized>(cpu: &P, value: u64, fixed0: u32, fixed1: u32) -> u64 {
    (value | cpu.read_msr(fixed0)) & cpu.read_msr(fixed1)
}

/// Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.11.5 VMXON Region
#[repr(C, align(4096))]
pub struct Vmxon {
    pub revision_id: u32,
    pub data: [u8; BASE_PAGE_SIZE - 4],
}
const_assert_eq!(size_of::<Vmxon>(), BASE_PAGE_SIZE);

/// The VMXON region of a processor that is in VMX root operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxonRegion {
    region: PhysicalAddress,
}

impl VmxonRegion {
    /// Sets up the VMXON region and executes VMXON on it.
    ///
    /// `enable_vmx_operation` must have succeeded on this processor first.
    pub fn enable<V, P, M>(vmx: &V, cpu: &P, memory: &mut M) -> Result<Self, HypervisorError>
    where
        V: VmxInstructions + ?Sized,
        P: Processor + ?Sized,
        M: PhysicalMemory + ?Sized,
    {
        log::info!("Setting up VMXON region");

        let region = allocate_identity_page(memory)?;
        log::info!("VMXON Region Physical Address: {:#x}", region);

        let mut revision_id = cpu.vmcs_revision_id();
        revision_id.set_bit(31, false);

        unsafe {
            let vmxon_region = region.as_mut_ptr::<Vmxon>();
            core::ptr::addr_of_mut!((*vmxon_region).revision_id).write_volatile(revision_id);
        }

        vmxon(vmx, region)?;
        log::info!("VMXON setup successful!");

        Ok(Self { region })
    }

    pub const fn region(&self) -> PhysicalAddress {
        self.region
    }
}
