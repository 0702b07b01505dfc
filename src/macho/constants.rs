//! Mach-O and fat container constants.

use bitflags::bitflags;
use serde::Serialize;

// =============================================================================
// Magic Numbers
// =============================================================================
//
// Values are given as they read when the first four bytes of a file are
// interpreted big-endian, so the `CIGAM` forms identify little-endian files.

/// 32-bit Mach-O, big-endian file
pub const MH_MAGIC: u32 = 0xFEED_FACE;
/// 32-bit Mach-O, little-endian file
pub const MH_CIGAM: u32 = 0xCEFA_EDFE;
/// 64-bit Mach-O, big-endian file
pub const MH_MAGIC_64: u32 = 0xFEED_FACF;
/// 64-bit Mach-O, little-endian file
pub const MH_CIGAM_64: u32 = 0xCFFA_EDFE;

/// Fat container with 32-bit architecture entries
pub const FAT_MAGIC: u32 = 0xCAFE_BABE;
/// Byte-swapped fat container with 32-bit entries
pub const FAT_CIGAM: u32 = 0xBEBA_FECA;
/// Fat container with 64-bit architecture entries
pub const FAT_MAGIC_64: u32 = 0xCAFE_BABF;
/// Byte-swapped fat container with 64-bit entries
pub const FAT_CIGAM_64: u32 = 0xBFBA_FECA;

// =============================================================================
// File Types
// =============================================================================

/// Object file
pub const MH_OBJECT: u32 = 0x1;
/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// Bundle
pub const MH_BUNDLE: u32 = 0x8;

/// Returns a short name for a Mach-O file type.
pub fn filetype_name(filetype: u32) -> &'static str {
    match filetype {
        MH_OBJECT => "object",
        MH_EXECUTE => "execute",
        MH_DYLIB => "dylib",
        MH_BUNDLE => "bundle",
        _ => "other",
    }
}

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
/// ILP32 on a 64-bit architecture (arm64_32)
pub const CPU_ARCH_ABI64_32: u32 = 0x0200_0000;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
/// arm64_32 CPU type
pub const CPU_TYPE_ARM64_32: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64_32;
/// PowerPC CPU type
pub const CPU_TYPE_POWERPC: u32 = 18;
/// PowerPC 64 CPU type
pub const CPU_TYPE_POWERPC64: u32 = CPU_TYPE_POWERPC | CPU_ARCH_ABI64;

/// Mask selecting the subtype proper, without capability bits
pub const CPU_SUBTYPE_MASK: u32 = 0x00FF_FFFF;
/// ARM64e (pointer authentication)
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

/// CPU type of the machine this crate was compiled for, if it has a Mach-O name.
pub const HOST_CPU_TYPE: Option<u32> = if cfg!(target_arch = "aarch64") {
    Some(CPU_TYPE_ARM64)
} else if cfg!(target_arch = "x86_64") {
    Some(CPU_TYPE_X86_64)
} else {
    None
};

/// Returns the conventional architecture name for a CPU type/subtype pair.
pub fn arch_name(cputype: u32, cpusubtype: u32) -> &'static str {
    match cputype {
        CPU_TYPE_ARM64 if cpusubtype & CPU_SUBTYPE_MASK == CPU_SUBTYPE_ARM64E => "arm64e",
        CPU_TYPE_ARM64 => "arm64",
        CPU_TYPE_ARM64_32 => "arm64_32",
        CPU_TYPE_ARM => "arm",
        CPU_TYPE_X86_64 => "x86_64",
        CPU_TYPE_X86 => "i386",
        CPU_TYPE_POWERPC64 => "ppc64",
        CPU_TYPE_POWERPC => "ppc",
        _ => "unknown",
    }
}

/// Maps an architecture name back to its CPU type.
///
/// `arm64e` maps to the arm64 CPU type; subtypes do not take part in slice
/// selection.
pub fn cpu_type_from_name(name: &str) -> Option<u32> {
    match name {
        "arm64" | "arm64e" | "aarch64" => Some(CPU_TYPE_ARM64),
        "arm64_32" => Some(CPU_TYPE_ARM64_32),
        "arm" | "armv7" | "armv7s" => Some(CPU_TYPE_ARM),
        "x86_64" | "amd64" => Some(CPU_TYPE_X86_64),
        "i386" | "x86" => Some(CPU_TYPE_X86),
        "ppc64" => Some(CPU_TYPE_POWERPC64),
        "ppc" => Some(CPU_TYPE_POWERPC),
        _ => None,
    }
}

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Dynamically linked shared library identification
pub const LC_ID_DYLIB: u32 = 0xD;
/// Load a weak dynamically linked shared library
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// Runpath additions
pub const LC_RPATH: u32 = 0x1C | LC_REQ_DYLD;
/// Load and re-export dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Delay load of dylib
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
/// Load upward dylib
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags relevant when inspecting an executable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(transparent)]
    pub struct MachOFlags: u32 {
        /// No undefined references
        const NOUNDEFS = 0x1;
        /// Input for the dynamic linker
        const DYLDLINK = 0x4;
        /// Undefined references bound at load time
        const BINDATLOAD = 0x8;
        /// Dynamic undefined references are prebound
        const PREBOUND = 0x10;
        /// Two-level namespace bindings
        const TWOLEVEL = 0x80;
        /// Flat namespace forced for all images
        const FORCE_FLAT = 0x100;
        /// Contains external weak symbols
        const WEAK_DEFINES = 0x8000;
        /// Uses weak symbols
        const BINDS_TO_WEAK = 0x10000;
        /// Stacks are executable
        const ALLOW_STACK_EXECUTION = 0x20000;
        /// Loaded at a random address
        const PIE = 0x200000;
        /// Has thread-local variable descriptors
        const HAS_TLV_DESCRIPTORS = 0x800000;
        /// Heap is non-executable
        const NO_HEAP_EXECUTION = 0x1000000;
        /// Linked for use in an application extension
        const APP_EXTENSION_SAFE = 0x2000000;
        /// Part of the dyld shared cache
        const DYLIB_IN_CACHE = 0x80000000;
    }
}
