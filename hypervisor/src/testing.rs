//! Stand-ins for the processor, the VMX instructions and the boot allocator.

use {
    crate::{
        intel::support::VmxInstructions,
        utils::{addresses::PhysicalAddress, alloc::PhysicalMemory, instructions::Processor},
    },
    std::{
        alloc::Layout,
        cell::{Cell, RefCell},
        collections::BTreeMap,
        vec::Vec,
    },
    x86::{
        msr,
        vmx::{self, vmcs, VmFail},
    },
};

const PAGE_SIZE: usize = 0x1000;

/// Byte pattern fresh test pages are filled with, so zero filling is observable.
pub const DIRTY: u8 = 0xA5;

/// Hands out real, page aligned heap memory so code under test can write through the addresses.
pub struct TestMemory {
    allocations: Vec<(*mut u8, Layout)>,
    /// Allocation calls after which every further call returns `None`.
    pub fail_after: Option<usize>,
    /// Added to every address `translate` returns.
    pub translation_skew: u64,
    /// Added to the address `allocate_page` returns.
    pub page_offset: u64,
    /// Added to the address `allocate_pages` returns.
    pub pages_offset: u64,
    calls: usize,
}

impl TestMemory {
    pub fn new() -> Self {
        Self {
            allocations: Vec::new(),
            fail_after: None,
            translation_skew: 0,
            page_offset: 0,
            pages_offset: 0,
            calls: 0,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    fn allocate(&mut self, count: usize) -> Option<PhysicalAddress> {
        self.calls += 1;
        if self.fail_after.is_some_and(|limit| self.calls > limit) {
            return None;
        }

        // One spare page keeps `page_offset` inside the allocation.
        let layout = Layout::from_size_align((count + 1) * PAGE_SIZE, PAGE_SIZE).unwrap();
        let memory = unsafe { std::alloc::alloc(layout) };
        assert!(!memory.is_null());
        unsafe { memory.write_bytes(DIRTY, layout.size()) };
        self.allocations.push((memory, layout));

        Some(PhysicalAddress::from_pa(memory as u64))
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        for (memory, layout) in self.allocations.drain(..) {
            unsafe { std::alloc::dealloc(memory, layout) };
        }
    }
}

impl PhysicalMemory for TestMemory {
    fn allocate_page(&mut self) -> Option<PhysicalAddress> {
        self.allocate(1)
            .map(|page| PhysicalAddress::from_pa(page.pa() + self.page_offset))
    }

    fn allocate_pages(&mut self, count: usize) -> Option<PhysicalAddress> {
        self.allocate(count)
            .map(|pages| PhysicalAddress::from_pa(pages.pa() + self.pages_offset))
    }

    fn translate(&self, address: u64) -> u64 {
        address + self.translation_skew
    }
}

/// Everything a `MockVmx` was asked to do, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxEvent {
    Vmxon(u64),
    Vmclear(u64),
    /// `revision` is the dword at offset 0 of the region when the load ran.
    Vmptrld { region: u64, revision: u32 },
    Read(u32),
    Write(u32, u64),
}

/// A VMCS field store that follows the VMX success/failure conventions.
pub struct MockVmx {
    revision_id: u32,
    fields: RefCell<BTreeMap<u32, u64>>,
    events: RefCell<Vec<VmxEvent>>,
    current: Cell<Option<u64>>,
    fail_write: Cell<Option<u32>>,
    fail_clear: Cell<bool>,
    corrupt_read: Cell<Option<u32>>,
}

impl MockVmx {
    /// A processor whose VMCS revision identifier is `revision_id`.
    pub fn new(revision_id: u32) -> Self {
        Self {
            revision_id,
            fields: RefCell::new(BTreeMap::new()),
            events: RefCell::new(Vec::new()),
            current: Cell::new(None),
            fail_write: Cell::new(None),
            fail_clear: Cell::new(false),
            corrupt_read: Cell::new(None),
        }
    }

    /// Makes the next VMWRITE to `field` fail with VMfailInvalid (CF=1).
    pub fn fail_write_to(&self, field: u32) {
        self.fail_write.set(Some(field));
    }

    /// Makes the next VMCLEAR fail with VMfailInvalid (CF=1).
    pub fn fail_next_clear(&self) {
        self.fail_clear.set(true);
    }

    /// Makes VMREAD of `field` return the stored value with bit 0 flipped.
    pub fn corrupt_reads_of(&self, field: u32) {
        self.corrupt_read.set(Some(field));
    }

    pub fn current(&self) -> Option<u64> {
        self.current.get()
    }

    pub fn events(&self) -> Vec<VmxEvent> {
        self.events.borrow().clone()
    }

    /// Fields in the order they were written, failed attempts included.
    pub fn writes(&self) -> Vec<(u32, u64)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match *event {
                VmxEvent::Write(field, value) => Some((field, value)),
                _ => None,
            })
            .collect()
    }

    pub fn field(&self, field: u32) -> Option<u64> {
        self.fields.borrow().get(&field).copied()
    }

    fn record(&self, event: VmxEvent) {
        self.events.borrow_mut().push(event);
    }

    fn fail_valid(&self, error_number: u64) -> VmFail {
        self.fields
            .borrow_mut()
            .insert(vmcs::ro::VM_INSTRUCTION_ERROR, error_number);
        VmFail::VmFailValid
    }

    /// VMfailValid needs a current VMCS to store the error number in.
    fn fail(&self, error_number: u64) -> VmFail {
        match self.current.get() {
            Some(_) => self.fail_valid(error_number),
            None => VmFail::VmFailInvalid,
        }
    }
}

impl VmxInstructions for MockVmx {
    fn vmxon(&self, vmxon_region: PhysicalAddress) -> vmx::Result<()> {
        self.record(VmxEvent::Vmxon(vmxon_region.pa()));

        let revision = unsafe { vmxon_region.as_mut_ptr::<u32>().read() };
        if !vmxon_region.is_page_aligned() || revision != self.revision_id {
            return Err(VmFail::VmFailInvalid);
        }

        Ok(())
    }

    fn vmclear(&self, vmcs_region: PhysicalAddress) -> vmx::Result<()> {
        self.record(VmxEvent::Vmclear(vmcs_region.pa()));

        if vmcs_region.is_null() || !vmcs_region.is_page_aligned() {
            return Err(self.fail(2));
        }

        if self.fail_clear.replace(false) {
            return Err(VmFail::VmFailInvalid);
        }

        if self.current.get() == Some(vmcs_region.pa()) {
            self.current.set(None);
        }

        Ok(())
    }

    fn vmptrld(&self, vmcs_region: PhysicalAddress) -> vmx::Result<()> {
        if vmcs_region.is_null() || !vmcs_region.is_page_aligned() {
            return Err(self.fail(9));
        }

        let revision = unsafe { vmcs_region.as_mut_ptr::<u32>().read() };
        self.record(VmxEvent::Vmptrld { region: vmcs_region.pa(), revision });

        if revision != self.revision_id {
            return Err(self.fail(11));
        }

        self.current.set(Some(vmcs_region.pa()));
        Ok(())
    }

    fn vmread(&self, field: u32) -> vmx::Result<u64> {
        self.record(VmxEvent::Read(field));

        if self.current.get().is_none() {
            return Err(VmFail::VmFailInvalid);
        }

        let value = self.field(field).unwrap_or(0);
        match self.corrupt_read.get() {
            Some(corrupt) if corrupt == field => Ok(value ^ 1),
            _ => Ok(value),
        }
    }

    fn vmwrite(&self, field: u32, value: u64) -> vmx::Result<()> {
        self.record(VmxEvent::Write(field, value));

        if self.current.get().is_none() {
            return Err(VmFail::VmFailInvalid);
        }

        if self.fail_write.get() == Some(field) {
            self.fail_write.set(None);
            return Err(VmFail::VmFailInvalid);
        }

        // Bits 11:10 of the encoding select the field type; 1 is read-only data.
        if (field >> 10) & 0x3 == 1 {
            return Err(self.fail_valid(13));
        }

        self.fields.borrow_mut().insert(field, value);
        Ok(())
    }
}

/// A bootstrap processor with recognizable register values.
pub struct MockProcessor {
    pub intel: bool,
    pub vmx: bool,
    cr0: Cell<u64>,
    cr4: Cell<u64>,
    msrs: RefCell<BTreeMap<u32, u64>>,
}

impl MockProcessor {
    pub const CR3: u64 = 0x0010_0000;
    pub const GDTR_BASE: u64 = 0xffff_8000_0000_1000;
    pub const IDTR_BASE: u64 = 0xffff_8000_0000_2000;
    pub const TR_BASE: u64 = 0xffff_8000_0000_3000;
    pub const FS_BASE: u64 = 0x7000;
    pub const GS_BASE: u64 = 0x8000;

    /// A processor reporting `revision_id` in IA32_VMX_BASIC.
    pub fn new(revision_id: u32) -> Self {
        let msrs = BTreeMap::from([
            (msr::IA32_VMX_BASIC, 0x00da_0400_0000_0000 | revision_id as u64),
            (msr::IA32_FEATURE_CONTROL, 0),
            (msr::IA32_FS_BASE, Self::FS_BASE),
            (msr::IA32_GS_BASE, Self::GS_BASE),
            (msr::IA32_VMX_CR0_FIXED0, 0x8000_0021),
            (msr::IA32_VMX_CR0_FIXED1, 0xffff_ffff),
            (msr::IA32_VMX_CR4_FIXED0, 0x0000_2000),
            (msr::IA32_VMX_CR4_FIXED1, 0x003f_ffff),
        ]);

        Self {
            intel: true,
            vmx: true,
            cr0: Cell::new(0x8000_0011),
            cr4: Cell::new(0x0000_0020),
            msrs: RefCell::new(msrs),
        }
    }

    pub fn set_msr(&self, msr: u32, value: u64) {
        self.msrs.borrow_mut().insert(msr, value);
    }
}

impl Processor for MockProcessor {
    fn is_intel(&self) -> bool {
        self.intel
    }

    fn has_vmx(&self) -> bool {
        self.vmx
    }

    fn cr0(&self) -> u64 {
        self.cr0.get()
    }

    fn cr3(&self) -> u64 {
        Self::CR3
    }

    fn cr4(&self) -> u64 {
        self.cr4.get()
    }

    fn write_cr0(&self, value: u64) {
        self.cr0.set(value);
    }

    fn write_cr4(&self, value: u64) {
        self.cr4.set(value);
    }

    fn read_msr(&self, msr: u32) -> u64 {
        self.msrs.borrow().get(&msr).copied().unwrap_or(0)
    }

    fn write_msr(&self, msr: u32, value: u64) {
        self.set_msr(msr, value);
    }

    fn gdtr_base(&self) -> u64 {
        Self::GDTR_BASE
    }

    fn idtr_base(&self) -> u64 {
        Self::IDTR_BASE
    }

    fn tr_base(&self) -> u64 {
        Self::TR_BASE
    }
}
