//! Decoding of the VM-instruction error field.
//!
//! After a VMX instruction fails with VMfailValid the processor records an
//! error number in the current VMCS. This module turns that number into
//! something a log line can explain.

macro_rules! vm_instruction_errors {
    ($($name:ident = $number:literal => $description:literal,)*) => {
        /// Represents the VM instruction error numbers.
        ///
        /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 31.4 VM INSTRUCTION ERROR NUMBERS
        /// and Table 31-1. VM-Instruction Error Numbers
        #[repr(u32)]
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub enum VmInstructionError {
            $($name = $number,)*
        }

        impl VmInstructionError {
            /// Converts the raw value of `VM_INSTRUCTION_ERROR` into a known error number.
            pub fn from_u32(value: u32) -> Option<Self> {
                match value {
                    $($number => Some(Self::$name),)*
                    _ => None,
                }
            }

            pub fn description(&self) -> &'static str {
                match self {
                    $(Self::$name => $description,)*
                }
            }
        }
    };
}

vm_instruction_errors! {
    VmcallInRoot = 1 => "VMCALL executed in VMX root operation",
    VmclearInvalidAddress = 2 => "VMCLEAR with invalid physical address",
    VmclearWithVmxonPointer = 3 => "VMCLEAR with VMXON pointer",
    VmlaunchNonClearVmcs = 4 => "VMLAUNCH with non-clear VMCS",
    VmresumeNonLaunchedVmcs = 5 => "VMRESUME with non-launched VMCS",
    VmresumeAfterVmxoff = 6 => "VMRESUME after VMXOFF",
    VmEntryInvalidControlFields = 7 => "VM entry with invalid control field(s)",
    VmEntryInvalidHostState = 8 => "VM entry with invalid host-state field(s)",
    VmptrldInvalidAddress = 9 => "VMPTRLD with invalid physical address",
    VmptrldWithVmxonPointer = 10 => "VMPTRLD with VMXON pointer",
    VmptrldIncorrectVmcsRevision = 11 => "VMPTRLD with incorrect VMCS revision identifier",
    VmreadVmwriteUnsupportedVmcsComponent = 12 => "VMREAD/VMWRITE from/to unsupported VMCS component",
    VmwriteReadonlyVmcsComponent = 13 => "VMWRITE to read-only VMCS component",
    VmxonInRoot = 15 => "VMXON executed in VMX root operation",
    VmEntryInvalidExecutiveVmcsPointer = 16 => "VM entry with invalid executive-VMCS pointer",
    VmEntryNonLaunchedExecutiveVmcs = 17 => "VM entry with non-launched executive VMCS",
    VmEntryExecutiveVmcsPointerNotVmxonPointer = 18 => "VM entry with executive-VMCS pointer not VMXON pointer",
    VmcallNonClearVmcs = 19 => "VMCALL with non-clear VMCS",
    VmcallInvalidVmExitControlFields = 20 => "VMCALL with invalid VM-exit control fields",
    VmcallIncorrectMsegRevision = 22 => "VMCALL with incorrect MSEG revision identifier",
    VmxoffUnderDualMonitorTreatment = 23 => "VMXOFF under dual-monitor treatment of SMIs and SMM",
    VmcallInvalidSmmMonitorFeatures = 24 => "VMCALL with invalid SMM-monitor features",
    VmEntryInvalidVmExecutionControlFieldsExecutiveVmcs = 25 => "VM entry with invalid VM-execution control fields in executive VMCS",
    VmEntryEventsBlockedByMovSs = 26 => "VM entry with events blocked by MOV SS",
    InvalidOperandToInveptInvvpid = 28 => "Invalid operand to INVEPT/INVVPID",
}

impl core::fmt::Display for VmInstructionError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}: {}", *self as u32, self.description())
    }
}
