//! A module responsible for managing the VMCS region for VMX operations.
//!
//! `prepare` reserves the memory a VMCS needs, `activate` stamps the revision
//! identifier and makes the region the processor's current VMCS. What comes
//! back from `activate` is the only handle through which fields are written;
//! its type records how far initialization has progressed, so guest state
//! cannot be written before host state.

use {
    crate::{
        error::HypervisorError,
        intel::{
            support::{vmclear, vmptrld, vmread, vmwrite, VmxInstructions},
            vmstack::VmStack,
        },
        utils::{
            addresses::PhysicalAddress,
            alloc::{allocate_identity_page, PhysicalMemory},
            instructions::Processor,
        },
    },
    bitfield::BitMut,
    core::{fmt, marker::PhantomData, mem::size_of},
    static_assertions::const_assert_eq,
    x86::{
        bits64::paging::BASE_PAGE_SIZE,
        vmx::vmcs::{guest, host},
    },
};

/// Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.2 FORMAT OF THE VMCS REGION
#[repr(C, align(4096))]
pub struct VmcsRegion {
    pub revision_id: u32,
    pub abort_indicator: u32,
    pub reserved: [u8; BASE_PAGE_SIZE - 8],
}
const_assert_eq!(size_of::<VmcsRegion>(), BASE_PAGE_SIZE);

/// The memory behind one logical processor's VMCS.
///
/// Both addresses are null until `prepare` succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmcsBlob {
    region: PhysicalAddress,
    host_stack: PhysicalAddress,
}

impl VmcsBlob {
    pub const fn new() -> Self {
        Self {
            region: PhysicalAddress::NULL,
            host_stack: PhysicalAddress::NULL,
        }
    }

    pub const fn region(&self) -> PhysicalAddress {
        self.region
    }

    pub const fn host_stack(&self) -> PhysicalAddress {
        self.host_stack
    }

    /// The value HOST_RSP is loaded with.
    pub const fn host_stack_top(&self) -> u64 {
        VmStack::top(self.host_stack)
    }

    pub const fn is_prepared(&self) -> bool {
        !self.region.is_null() && !self.host_stack.is_null()
    }
}

impl Default for VmcsBlob {
    fn default() -> Self {
        Self::new()
    }
}

/// Reserves and zero fills the VMCS region and the host stack.
///
/// No VMX instruction is executed. If either allocation fails the blob is
/// left in its all-null state.
pub fn prepare<M: PhysicalMemory + ?Sized>(blob: &mut VmcsBlob, memory: &mut M) -> Result<(), HypervisorError> {
    log::info!("Setting up VMCS region");

    *blob = VmcsBlob::new();

    let region = allocate_identity_page(memory)?;
    log::info!("VMCS Region Physical Address: {:#x}", region);

    let host_stack = VmStack::allocate(memory)?;

    blob.region = region;
    blob.host_stack = host_stack;

    Ok(())
}

/// Stamps the revision identifier into the region and makes it the current VMCS.
///
/// The region is cleared first so its launch state is "clear", then loaded.
/// The returned handle borrows the blob and the instruction backend for as
/// long as fields are being written.
pub fn activate<'a, V, P>(blob: &'a mut VmcsBlob, vmx: &'a V, cpu: &P) -> Result<CurrentVmcs<'a, V, Loaded>, HypervisorError>
where
    V: VmxInstructions + ?Sized,
    P: Processor + ?Sized,
{
    if !blob.is_prepared() {
        log::error!("VMCS region has not been allocated");
        return Err(HypervisorError::RegionNotPrepared);
    }

    let region = blob.region;

    let mut revision_id = cpu.vmcs_revision_id();
    revision_id.set_bit(31, false);

    unsafe {
        let vmcs_region = region.as_mut_ptr::<VmcsRegion>();
        core::ptr::addr_of_mut!((*vmcs_region).revision_id).write_volatile(revision_id);
    }

    let result = vmclear(vmx, region);
    log::info!("VMCLEAR {:#x} {}", region, outcome(&result));
    result?;

    let result = vmptrld(vmx, region);
    log::info!("VMPTRLD {:#x} {}", region, outcome(&result));
    result?;

    Ok(CurrentVmcs {
        blob,
        vmx,
        state: PhantomData,
    })
}

fn outcome<T>(result: &Result<T, HypervisorError>) -> &'static str {
    if result.is_ok() {
        "successful"
    } else {
        "unsuccessful"
    }
}

/// Active and current, not launched. No field has been written yet.
#[derive(Debug)]
pub struct Loaded;

/// Every host-state field has been written.
#[derive(Debug)]
pub struct HostStateWritten;

/// Host and guest state are complete; the VMCS can be entered.
#[derive(Debug)]
pub struct ReadyForEntry;

/// The processor's current VMCS, in initialization state `S`.
pub struct CurrentVmcs<'a, V: VmxInstructions + ?Sized, S> {
    blob: &'a mut VmcsBlob,
    vmx: &'a V,
    state: PhantomData<S>,
}

impl<'a, V: VmxInstructions + ?Sized, S> CurrentVmcs<'a, V, S> {
    pub fn blob(&self) -> &VmcsBlob {
        self.blob
    }

    pub fn region(&self) -> PhysicalAddress {
        self.blob.region
    }

    pub fn read(&self, field: u32) -> Result<u64, HypervisorError> {
        vmread(self.vmx, field)
    }

    pub(crate) fn write<T: Into<u64>>(&self, field: u32, value: T) -> Result<(), HypervisorError> {
        vmwrite(self.vmx, field, value)
    }

    pub(crate) fn advance<T>(self) -> CurrentVmcs<'a, V, T> {
        CurrentVmcs {
            blob: self.blob,
            vmx: self.vmx,
            state: PhantomData,
        }
    }
}

/// Debug implementation to dump the VMCS fields written during initialization.
///
/// Fields that cannot be read show as `None`.
impl<V: VmxInstructions + ?Sized, S> fmt::Debug for CurrentVmcs<'_, V, S> {
    #[rustfmt::skip]
    fn fmt(&self, format: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = |encoding: u32| self.read(encoding).ok();

        format.debug_struct("CurrentVmcs")
            .field("Region: ", &self.blob.region)
            .field("Host Stack: ", &self.blob.host_stack)
            .field("State: ", &core::any::type_name::<S>())

            /* VMCS Host state fields */
            .field("Host CR0: ", &field(host::CR0))
            .field("Host CR3: ", &field(host::CR3))
            .field("Host CR4: ", &field(host::CR4))
            .field("Host RSP: ", &field(host::RSP))
            .field("Host RIP: ", &field(host::RIP))
            .field("Host CS Selector: ", &field(host::CS_SELECTOR))
            .field("Host SS Selector: ", &field(host::SS_SELECTOR))
            .field("Host DS Selector: ", &field(host::DS_SELECTOR))
            .field("Host ES Selector: ", &field(host::ES_SELECTOR))
            .field("Host FS Selector: ", &field(host::FS_SELECTOR))
            .field("Host GS Selector: ", &field(host::GS_SELECTOR))
            .field("Host TR Selector: ", &field(host::TR_SELECTOR))
            .field("Host FS Base: ", &field(host::FS_BASE))
            .field("Host GS Base: ", &field(host::GS_BASE))
            .field("Host TR Base: ", &field(host::TR_BASE))
            .field("Host GDTR Base: ", &field(host::GDTR_BASE))
            .field("Host IDTR Base: ", &field(host::IDTR_BASE))

            /* VMCS Guest state fields */
            .field("Guest CR0: ", &field(guest::CR0))
            .field("Guest CR3: ", &field(guest::CR3))
            .field("Guest CR4: ", &field(guest::CR4))
            .field("Guest DR7: ", &field(guest::DR7))
            .field("Guest RSP: ", &field(guest::RSP))
            .field("Guest RIP: ", &field(guest::RIP))
            .field("Guest RFLAGS: ", &field(guest::RFLAGS))
            .field("Guest CS Access Rights: ", &field(guest::CS_ACCESS_RIGHTS))
            .field("Guest SS Access Rights: ", &field(guest::SS_ACCESS_RIGHTS))
            .field("Guest TR Access Rights: ", &field(guest::TR_ACCESS_RIGHTS))
            .field("Guest LDTR Access Rights: ", &field(guest::LDTR_ACCESS_RIGHTS))
            .field("Guest Interruptibility State: ", &field(guest::INTERRUPTIBILITY_STATE))
            .field("Guest Activity State: ", &field(guest::ACTIVITY_STATE))
            .field("Guest VMCS Link Pointer: ", &field(guest::LINK_PTR_FULL))
            .finish_non_exhaustive()
    }
}
