//! Live processor state consumed while VMX structures are set up.
//!
//! The VMCS initializer copies control registers, descriptor-table bases and
//! MSR values from the processor it runs on. `Processor` is the seam between
//! those reads and the hardware; `NativeProcessor` performs them with the
//! `x86` crate.

use {
    crate::intel::segmentation::descriptor_base,
    x86::{
        controlregs::{Cr0, Cr4},
        cpuid::CpuId,
        dtables::DescriptorTablePointer,
        msr,
    },
};

/// Read-mostly view of the current logical processor.
pub trait Processor {
    /// CPUID vendor string is "GenuineIntel".
    fn is_intel(&self) -> bool;

    /// CPUID.1:ECX.VMX\[bit 5].
    fn has_vmx(&self) -> bool;

    fn cr0(&self) -> u64;
    fn cr3(&self) -> u64;
    fn cr4(&self) -> u64;
    fn write_cr0(&self, value: u64);
    fn write_cr4(&self, value: u64);

    fn read_msr(&self, msr: u32) -> u64;
    fn write_msr(&self, msr: u32, value: u64);

    fn gdtr_base(&self) -> u64;
    fn idtr_base(&self) -> u64;

    /// Base address of the TSS the task register currently names.
    fn tr_base(&self) -> u64;

    fn fs_base(&self) -> u64 {
        self.read_msr(msr::IA32_FS_BASE)
    }

    fn gs_base(&self) -> u64 {
        self.read_msr(msr::IA32_GS_BASE)
    }

    /// Get the Virtual Machine Control Structure revision identifier (VMCS revision ID).
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.1 BASIC VMX INFORMATION
    fn vmcs_revision_id(&self) -> u32 {
        (self.read_msr(msr::IA32_VMX_BASIC) as u32) & 0x7FFF_FFFF
    }
}

/// The processor this code is executing on.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeProcessor;

impl Processor for NativeProcessor {
    fn is_intel(&self) -> bool {
        CpuId::new()
            .get_vendor_info()
            .map_or(false, |vi| vi.as_str() == "GenuineIntel")
    }

    fn has_vmx(&self) -> bool {
        CpuId::new()
            .get_feature_info()
            .map_or(false, |fi| fi.has_vmx())
    }

    fn cr0(&self) -> u64 {
        unsafe { x86::controlregs::cr0() }.bits() as u64
    }

    fn cr3(&self) -> u64 {
        unsafe { x86::controlregs::cr3() }
    }

    fn cr4(&self) -> u64 {
        unsafe { x86::controlregs::cr4() }.bits() as u64
    }

    fn write_cr0(&self, value: u64) {
        unsafe { x86::controlregs::cr0_write(Cr0::from_bits_truncate(value as usize)) };
    }

    fn write_cr4(&self, value: u64) {
        unsafe { x86::controlregs::cr4_write(Cr4::from_bits_truncate(value as usize)) };
    }

    fn read_msr(&self, msr: u32) -> u64 {
        unsafe { msr::rdmsr(msr) }
    }

    fn write_msr(&self, msr: u32, value: u64) {
        unsafe { msr::wrmsr(msr, value) };
    }

    fn gdtr_base(&self) -> u64 {
        sgdt().base as u64
    }

    fn idtr_base(&self) -> u64 {
        sidt().base as u64
    }

    fn tr_base(&self) -> u64 {
        let gdtr = sgdt();
        let entries = (gdtr.limit as usize + 1) / core::mem::size_of::<u64>();
        let gdt = unsafe { core::slice::from_raw_parts(gdtr.base, entries) };

        descriptor_base(gdt, unsafe { x86::task::tr() })
    }
}

/// Reads the IDTR register.
fn sidt() -> DescriptorTablePointer<u64> {
    let mut idtr = DescriptorTablePointer::<u64>::default();
    unsafe { x86::dtables::sidt(&mut idtr) };
    idtr
}

/// Reads the GDTR.
fn sgdt() -> DescriptorTablePointer<u64> {
    let mut gdtr = DescriptorTablePointer::<u64>::default();
    unsafe { x86::dtables::sgdt(&mut gdtr) };
    gdtr
}
