//! VMX control-structure core of a bare-metal type-1 hypervisor.
//!
//! Brings one logical processor into VMX root operation and prepares the VMCS
//! that governs every transition between host and guest. The boot path calls
//! [`prepare`] once to reserve memory, then [`initialize`] to activate the
//! VMCS and write its host and guest state. VM entry itself is left to the
//! caller.

#![cfg_attr(not(test), no_std)]

pub mod error;
pub mod intel;
pub mod utils;

#[cfg(test)]
mod testing;

pub use {
    error::HypervisorError,
    intel::{
        host::{HostConfig, HostSelectors},
        support::{Hardware, VmxInstructions},
        vmcs::{activate, prepare, CurrentVmcs, HostStateWritten, Loaded, ReadyForEntry, VmcsBlob},
        vmxon::{check_vmx_support, enable_vmx_operation, VmxonRegion},
    },
    utils::{
        addresses::PhysicalAddress,
        alloc::PhysicalMemory,
        instructions::{NativeProcessor, Processor},
    },
};

/// Activates the VMCS in `blob` and writes its host state, then its guest state.
///
/// `blob` must have been through [`prepare`] and the processor must be in VMX
/// root operation. On success the VMCS is current and ready for VMLAUNCH. On
/// failure it may be current with partial state and must not be entered.
pub fn initialize<'a, V, P>(
    blob: &'a mut VmcsBlob,
    vmx: &'a V,
    cpu: &P,
    config: &HostConfig,
) -> Result<CurrentVmcs<'a, V, ReadyForEntry>, HypervisorError>
where
    V: VmxInstructions + ?Sized,
    P: Processor + ?Sized,
{
    log::info!("Setting up VMCS");

    let vmcs = activate(blob, vmx, cpu)?
        .write_host_state(cpu, config)?
        .write_guest_state()?;

    log::info!("VMCS setup successful!");
    log::trace!("{:#?}", vmcs);

    Ok(vmcs)
}
