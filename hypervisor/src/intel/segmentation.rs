//! This module provides the segment access-rights encoding used by the VMCS
//! guest-state area and the GDT decoding needed to locate the host's TSS.

use {
    bit_field::BitField,
    bitflags::bitflags,
    x86::segmentation::SegmentSelector,
    x86_64::structures::gdt::DescriptorFlags,
};

bitflags! {
    /// Access rights for VMCS guest register states.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4.1 Guest Register State
    /// and Table 25-2. Format of Access Rights.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentAccessRights: u32 {
        /// Accessed flag.
        /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5.1 Code- and Data-Segment Descriptor Types
        const ACCESSED = 1 << 0;

        /// Readable (for code segments) or Writable (for data segments).
        /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5.1 Code- and Data-Segment Descriptor Types
        const RW = 1 << 1;

        /// Conforming bit for code segments.
        const CONFORMING = 1 << 2;

        /// Executable bit. Must be set for code segments.
        /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5.1 Code- and Data-Segment Descriptor Types
        const EXECUTABLE = 1 << 3;

        /// Descriptor type (0 = system; 1 = code or data).
        /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5 Segment Descriptors
        const CODE_DATA = 1 << 4;

        /// Privilege level mask (bits 5-6).
        const DPL_MASK = 3 << 5;

        /// Segment present.
        const PRESENT = 1 << 7;

        /// Long mode active (for CS only).
        const LONG_MODE = 1 << 13;

        /// Default operation size (0 = 16-bit segment; 1 = 32-bit segment).
        const DB = 1 << 14;

        /// Granularity.
        const GRANULARITY = 1 << 15;

        /// Segment unusable (0 = usable; 1 = unusable).
        /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4.1 Guest Register State
        const UNUSABLE = 1 << 16;
    }
}

/// System-descriptor type for an LDT.
const SYSTEM_TYPE_LDT: u32 = 0x2;

/// System-descriptor type for a busy 32/64-bit TSS.
const SYSTEM_TYPE_BUSY_TSS: u32 = 0xb;

impl SegmentAccessRights {
    /// Ring 0, 16-bit, byte granular execute/read code segment. Type 0xB.
    pub const FLAT_CODE: Self = Self::ACCESSED
        .union(Self::RW)
        .union(Self::EXECUTABLE)
        .union(Self::CODE_DATA)
        .union(Self::PRESENT);

    /// Ring 0, 16-bit, byte granular read/write data segment. Type 0x3.
    pub const FLAT_DATA: Self = Self::ACCESSED
        .union(Self::RW)
        .union(Self::CODE_DATA)
        .union(Self::PRESENT);

    /// Present LDT with no descriptors in use.
    pub const UNUSED_LDT: Self = Self::from_bits_retain(SYSTEM_TYPE_LDT).union(Self::PRESENT);

    /// Present busy TSS. VM entry requires TR to be usable even when the guest never switches tasks.
    pub const ACTIVE_TSS: Self = Self::from_bits_retain(SYSTEM_TYPE_BUSY_TSS).union(Self::PRESENT);

    /// Descriptor privilege level encoded in bits 5-6.
    pub const fn dpl(&self) -> u8 {
        ((self.bits() & Self::DPL_MASK.bits()) >> 5) as u8
    }
}

/// Reads the base address of the descriptor `selector` names in `gdt`.
///
/// System descriptors (TSS, LDT) are 16 bytes wide in IA-32e mode; the upper
/// 32 bits of their base live in the following GDT slot. A selector outside
/// the table or naming a non-present descriptor yields 0.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5 Segment Descriptors
/// and 8.2.3 TSS Descriptor in 64-bit mode
pub fn descriptor_base(gdt: &[u64], selector: SegmentSelector) -> u64 {
    let index = selector.index() as usize;

    let Some(&entry_value) = gdt.get(index) else {
        return 0;
    };

    let entry = DescriptorFlags::from_bits_truncate(entry_value);
    if !entry.contains(DescriptorFlags::PRESENT) {
        return 0;
    }

    let base_low = entry_value.get_bits(16..40);
    let base_high = entry_value.get_bits(56..64) << 24;
    let mut base_address = base_low | base_high;

    if !entry.contains(DescriptorFlags::USER_SEGMENT) {
        if let Some(&upper) = gdt.get(index + 1) {
            base_address |= upper.get_bits(0..32) << 32;
        }
    }

    base_address
}
