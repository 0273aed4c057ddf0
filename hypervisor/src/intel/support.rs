//! Fallible bindings over the VMX instructions.
//!
//! VMX instructions do not fault on failure. They report it through RFLAGS:
//! CF set is VMfailInvalid (there is no current VMCS), ZF set is VMfailValid
//! (an error number was stored in the current VMCS). Both collapse into
//! `HypervisorError::InvalidOperation` here. The error number is only read,
//! for the log, when ZF says a current VMCS exists to read it from.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 31.2 CONVENTIONS

use {
    crate::{error::HypervisorError, intel::vmerror::VmInstructionError, utils::addresses::PhysicalAddress},
    x86::vmx::{self, vmcs, VmFail},
};

/// Raw VMX instructions, with the RFLAGS status left undecoded.
///
/// `Hardware` executes the real instructions; anything else is a stand-in for
/// a processor that cannot run them.
pub trait VmxInstructions {
    fn vmxon(&self, vmxon_region: PhysicalAddress) -> vmx::Result<()>;
    fn vmclear(&self, vmcs_region: PhysicalAddress) -> vmx::Result<()>;
    fn vmptrld(&self, vmcs_region: PhysicalAddress) -> vmx::Result<()>;
    fn vmread(&self, field: u32) -> vmx::Result<u64>;
    fn vmwrite(&self, field: u32, value: u64) -> vmx::Result<()>;
}

/// The VMX instructions of the processor this code is executing on.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hardware;

impl VmxInstructions for Hardware {
    fn vmxon(&self, vmxon_region: PhysicalAddress) -> vmx::Result<()> {
        unsafe { x86::bits64::vmx::vmxon(vmxon_region.pa()) }
    }

    fn vmclear(&self, vmcs_region: PhysicalAddress) -> vmx::Result<()> {
        unsafe { x86::bits64::vmx::vmclear(vmcs_region.pa()) }
    }

    fn vmptrld(&self, vmcs_region: PhysicalAddress) -> vmx::Result<()> {
        unsafe { x86::bits64::vmx::vmptrld(vmcs_region.pa()) }
    }

    fn vmread(&self, field: u32) -> vmx::Result<u64> {
        unsafe { x86::bits64::vmx::vmread(field) }
    }

    fn vmwrite(&self, field: u32, value: u64) -> vmx::Result<()> {
        unsafe { x86::bits64::vmx::vmwrite(field, value) }
    }
}

/// Enable VMX operation.
pub fn vmxon<V: VmxInstructions + ?Sized>(vmx: &V, vmxon_region: PhysicalAddress) -> Result<(), HypervisorError> {
    succeeded(vmx, "VMXON", vmx.vmxon(vmxon_region))
}

/// Clear VMCS.
pub fn vmclear<V: VmxInstructions + ?Sized>(vmx: &V, vmcs_region: PhysicalAddress) -> Result<(), HypervisorError> {
    succeeded(vmx, "VMCLEAR", vmx.vmclear(vmcs_region))
}

/// Load current VMCS pointer.
pub fn vmptrld<V: VmxInstructions + ?Sized>(vmx: &V, vmcs_region: PhysicalAddress) -> Result<(), HypervisorError> {
    succeeded(vmx, "VMPTRLD", vmx.vmptrld(vmcs_region))
}

/// Read a specified field from a VMCS.
pub fn vmread<V: VmxInstructions + ?Sized>(vmx: &V, field: u32) -> Result<u64, HypervisorError> {
    succeeded(vmx, "VMREAD", vmx.vmread(field))
}

/// Write to a specified field in a VMCS.
///
/// Debug builds, and builds with the `vmwrite-readback` feature, read the
/// field back and fail with `FieldMismatch` when the processor did not keep
/// the value. An encoding the processor silently ignores would otherwise only
/// surface much later as a failed VM entry.
pub fn vmwrite<V, T>(vmx: &V, field: u32, value: T) -> Result<(), HypervisorError>
where
    V: VmxInstructions + ?Sized,
    T: Into<u64>,
{
    let value = value.into();
    log::debug!("VMWRITE {:#x} = {:#x}", field, value);
    succeeded(vmx, "VMWRITE", vmx.vmwrite(field, value))?;

    #[cfg(any(debug_assertions, feature = "vmwrite-readback"))]
    {
        let read = vmread(vmx, field)?;
        if read != value {
            log::error!("VMCS field {:#x} read back {:#x} after writing {:#x}", field, read, value);
            return Err(HypervisorError::FieldMismatch { field, written: value, read });
        }
    }

    Ok(())
}

/// Translates the RFLAGS status of `instruction` into a `Result`.
fn succeeded<V, T>(vmx: &V, instruction: &str, result: vmx::Result<T>) -> Result<T, HypervisorError>
where
    V: VmxInstructions + ?Sized,
{
    result.map_err(|fail| {
        match fail {
            VmFail::VmFailInvalid => log::error!("{} failed: VMfailInvalid, no current VMCS", instruction),
            // The error number is only meaningful with a current VMCS, which ZF guarantees.
            VmFail::VmFailValid => match vmx.vmread(vmcs::ro::VM_INSTRUCTION_ERROR) {
                Ok(number) => match VmInstructionError::from_u32(number as u32) {
                    Some(error) => log::error!("{} failed: {}", instruction, error),
                    None => log::error!("{} failed: unknown VM instruction error {:#x}", instruction, number),
                },
                Err(_) => log::error!("{} failed: VMfailValid", instruction),
            },
        }

        HypervisorError::InvalidOperation
    })
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testing::{MockVmx, TestMemory, VmxEvent},
        crate::utils::alloc::PhysicalMemory,
        x86::vmx::vmcs::{guest, host},
    };

    fn loaded(memory: &mut TestMemory) -> MockVmx {
        let vmx = MockVmx::new(0x1A);
        let region = memory.allocate_page().unwrap();
        unsafe { region.as_mut_ptr::<u32>().write(0x1A) };
        vmptrld(&vmx, region).unwrap();
        vmx
    }

    #[test]
    fn written_fields_read_back() {
        let mut memory = TestMemory::new();
        let vmx = loaded(&mut memory);

        let pairs = [
            (host::CR3, 0x0010_0000u64),
            (host::CS_SELECTOR, 0x08),
            (guest::CS_LIMIT, 0xffff),
            (guest::LINK_PTR_FULL, 0xffff_ffff),
            (guest::RFLAGS, 0x2),
        ];

        for (field, value) in pairs {
            vmwrite(&vmx, field, value).unwrap();
            assert_eq!(vmread(&vmx, field).unwrap(), value);
        }
    }

    #[test]
    fn write_without_current_vmcs_is_invalid_operation() {
        let vmx = MockVmx::new(0x1A);

        assert_eq!(vmwrite(&vmx, host::CR0, 0u64), Err(HypervisorError::InvalidOperation));
        assert_eq!(vmread(&vmx, host::CR0), Err(HypervisorError::InvalidOperation));
        // VMfailInvalid: nothing to read the error number from.
        assert!(!vmx.events().contains(&VmxEvent::Read(vmcs::ro::VM_INSTRUCTION_ERROR)));
    }

    #[test]
    fn fail_valid_reads_error_number_but_returns_same_kind() {
        let mut memory = TestMemory::new();
        let vmx = loaded(&mut memory);

        let result = vmwrite(&vmx, vmcs::ro::VM_INSTRUCTION_ERROR, 1u64);

        assert_eq!(result, Err(HypervisorError::InvalidOperation));
        assert!(vmx.events().contains(&VmxEvent::Read(vmcs::ro::VM_INSTRUCTION_ERROR)));
    }

    #[test]
    #[cfg(any(debug_assertions, feature = "vmwrite-readback"))]
    fn readback_mismatch_is_reported() {
        let mut memory = TestMemory::new();
        let vmx = loaded(&mut memory);
        vmx.corrupt_reads_of(guest::DR7);

        assert_eq!(
            vmwrite(&vmx, guest::DR7, 0x400u64),
            Err(HypervisorError::FieldMismatch { field: guest::DR7, written: 0x400, read: 0x401 })
        );
    }

    #[test]
    fn failed_load_is_invalid_operation() {
        let mut memory = TestMemory::new();
        let vmx = MockVmx::new(0x1A);
        let region = memory.allocate_page().unwrap();
        unsafe { region.as_mut_ptr::<u32>().write(0x2B) };

        assert_eq!(vmptrld(&vmx, region), Err(HypervisorError::InvalidOperation));
        assert_eq!(vmx.current(), None);
    }
}
