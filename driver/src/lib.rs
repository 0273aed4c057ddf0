//! VMX bring-up entry for the boot path.
//!
//! The boot code links this static library and calls [`vmx_bringup`] once, on
//! the bootstrap processor, after its page allocator is up and before any
//! guest code exists. The physical page allocator, the `pa()` translation and
//! the VM-exit trampoline all belong to the boot code and are bound here as
//! `extern "C"` symbols.

#![cfg_attr(not(test), no_std)]

use {
    log::LevelFilter,
    vmx_monitor::{
        check_vmx_support, enable_vmx_operation, initialize, prepare, Hardware, HostConfig, HypervisorError,
        NativeProcessor, PhysicalAddress, PhysicalMemory, VmcsBlob, VmxonRegion,
    },
};

/// I/O base of the serial port the log goes to (COM1).
const SERIAL_PORT_BASE: u16 = 0x3f8;

/// Maximum level written to the serial log.
const LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// `vmx_bringup` status codes.
pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_UNSUCCESSFUL: i32 = -1;

extern "C" {
    /// Returns one 4-KByte page, 0 when memory is exhausted.
    fn get_physical_page() -> u64;

    /// Returns `count` physically contiguous 4-KByte pages, 0 when memory is exhausted.
    fn get_physical_pages(count: u64) -> u64;

    /// Physical address of `address` under the boot page tables.
    fn pa(address: u64) -> u64;

    /// Assembly entry point every VM exit lands on.
    fn vm_exit_handler();
}

/// The boot environment's page allocator.
struct BootAllocator;

impl PhysicalMemory for BootAllocator {
    fn allocate_page(&mut self) -> Option<PhysicalAddress> {
        match unsafe { get_physical_page() } {
            0 => None,
            page => Some(PhysicalAddress::from_pa(page)),
        }
    }

    fn allocate_pages(&mut self, count: usize) -> Option<PhysicalAddress> {
        match unsafe { get_physical_pages(count as u64) } {
            0 => None,
            pages => Some(PhysicalAddress::from_pa(pages)),
        }
    }

    fn translate(&self, address: u64) -> u64 {
        unsafe { pa(address) }
    }
}

/// The single VMCS of the bootstrap processor.
static mut VMCS: VmcsBlob = VmcsBlob::new();

/// Brings the bootstrap processor into VMX operation and prepares its VMCS.
///
/// Returns `STATUS_SUCCESS` when the VMCS is current and ready for VMLAUNCH.
/// Any other value means the processor state is inconsistent and the caller
/// must halt.
#[no_mangle]
pub extern "C" fn vmx_bringup() -> i32 {
    com_logger::builder()
        .base(SERIAL_PORT_BASE)
        .filter(LOG_LEVEL)
        .setup();

    log::info!("VMX bring-up called");

    match virtualize() {
        Ok(()) => {
            log::info!("VMCS ready for entry");
            STATUS_SUCCESS
        }
        Err(error) => {
            log::error!("Failed to virtualize processor: {}", error);
            STATUS_UNSUCCESSFUL
        }
    }
}

fn virtualize() -> Result<(), HypervisorError> {
    let cpu = NativeProcessor;
    let vmx = Hardware;
    let mut memory = BootAllocator;

    /* Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.6 DISCOVERING SUPPORT FOR VMX */
    check_vmx_support(&cpu)?;

    enable_vmx_operation(&cpu)?;
    VmxonRegion::enable(&vmx, &cpu, &mut memory)?;

    // Only ever reached once, from the single bring-up context.
    let blob = unsafe { &mut *core::ptr::addr_of_mut!(VMCS) };
    prepare(blob, &mut memory)?;

    let config = HostConfig::new(vm_exit_handler as usize as u64);
    initialize(blob, &vmx, &cpu, &config)?;

    Ok(())
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("{}", info);

    loop {
        unsafe { x86::halt() };
    }
}
