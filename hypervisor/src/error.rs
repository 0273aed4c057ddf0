use thiserror_no_std::Error;

/// Every way bringing a logical processor into VMX operation can fail.
///
/// None of these are recoverable: the bring-up path must stop before any
/// guest code can run on an inconsistent VMCS.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Intel CPU not found")]
    CPUUnsupported,
    #[error("VMX is not supported")]
    VMXUnsupported,
    #[error("VMX locked off in BIOS")]
    VMXBIOSLock,
    #[error("Failed to allocate physical memory")]
    AllocationFailure,
    #[error("Physical address {0:#x} is not page aligned")]
    UnalignedPhysicalAddress(u64),
    #[error("Physical address {0:#x} is not identity mapped")]
    AddressNotIdentityMapped(u64),
    #[error("VMCS region has not been prepared")]
    RegionNotPrepared,
    #[error("VMX instruction failed")]
    InvalidOperation,
    #[error("VMCS field {field:#x} read back {read:#x} after writing {written:#x}")]
    FieldMismatch { field: u32, written: u64, read: u64 },
}
