//! On-disk Mach-O and fat container structures.
//!
//! The structures are generic over the byte order of the file so one
//! definition serves little- and big-endian images. All fields are
//! unaligned, so they can be read from any offset of a byte slice.

use zerocopy::byteorder::{ByteOrder, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::error::BinaryFormatError;

/// Reads a structure at `offset`, failing instead of reading past the slice.
pub(crate) fn read_struct<T>(data: &[u8], offset: usize) -> Result<T, BinaryFormatError>
where
    T: FromBytes + KnownLayout + Immutable,
{
    let needed = size_of::<T>();
    let tail = data
        .get(offset..)
        .ok_or_else(|| BinaryFormatError::truncated(offset, needed, 0))?;
    T::read_from_prefix(tail)
        .map(|(value, _)| value)
        .map_err(|_| BinaryFormatError::truncated(offset, needed, tail.len()))
}

// =============================================================================
// Fat Container
// =============================================================================

/// Fat container header.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FatHeader<O: ByteOrder> {
    /// FAT_MAGIC or FAT_MAGIC_64
    pub magic: U32<O>,
    /// Number of architecture entries that follow
    pub nfat_arch: U32<O>,
}

impl<O: ByteOrder> FatHeader<O> {
    /// Size of the header in bytes.
    pub const SIZE: usize = 8;
}

/// Architecture entry of a fat container with 32-bit offsets.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FatArch<O: ByteOrder> {
    /// CPU type
    pub cputype: U32<O>,
    /// CPU subtype
    pub cpusubtype: U32<O>,
    /// File offset of the slice
    pub offset: U32<O>,
    /// Size of the slice
    pub size: U32<O>,
    /// Alignment as a power of 2
    pub align: U32<O>,
}

impl<O: ByteOrder> FatArch<O> {
    /// Size of an entry in bytes.
    pub const SIZE: usize = 20;
}

/// Architecture entry of a fat container with 64-bit offsets.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FatArch64<O: ByteOrder> {
    /// CPU type
    pub cputype: U32<O>,
    /// CPU subtype
    pub cpusubtype: U32<O>,
    /// File offset of the slice
    pub offset: U64<O>,
    /// Size of the slice
    pub size: U64<O>,
    /// Alignment as a power of 2
    pub align: U32<O>,
    /// Reserved
    pub reserved: U32<O>,
}

impl<O: ByteOrder> FatArch64<O> {
    /// Size of an entry in bytes.
    pub const SIZE: usize = 32;
}

// =============================================================================
// Header Structures
// =============================================================================

/// 32-bit Mach-O header.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MachHeader<O: ByteOrder> {
    /// Magic number (MH_MAGIC)
    pub magic: U32<O>,
    /// CPU type
    pub cputype: U32<O>,
    /// CPU subtype
    pub cpusubtype: U32<O>,
    /// File type
    pub filetype: U32<O>,
    /// Number of load commands
    pub ncmds: U32<O>,
    /// Size of load commands
    pub sizeofcmds: U32<O>,
    /// Flags
    pub flags: U32<O>,
}

impl<O: ByteOrder> MachHeader<O> {
    /// Size of the header in bytes.
    pub const SIZE: usize = 28;
}

/// 64-bit Mach-O header.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MachHeader64<O: ByteOrder> {
    /// Magic number (MH_MAGIC_64)
    pub magic: U32<O>,
    /// CPU type
    pub cputype: U32<O>,
    /// CPU subtype
    pub cpusubtype: U32<O>,
    /// File type
    pub filetype: U32<O>,
    /// Number of load commands
    pub ncmds: U32<O>,
    /// Size of load commands
    pub sizeofcmds: U32<O>,
    /// Flags
    pub flags: U32<O>,
    /// Reserved
    pub reserved: U32<O>,
}

impl<O: ByteOrder> MachHeader64<O> {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;
}

// =============================================================================
// Load Commands
// =============================================================================

/// Generic load command header.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct LoadCommand<O: ByteOrder> {
    /// Type of load command
    pub cmd: U32<O>,
    /// Size of load command
    pub cmdsize: U32<O>,
}

impl<O: ByteOrder> LoadCommand<O> {
    /// Size of the load command header.
    pub const SIZE: usize = 8;
}

/// Dylib reference command (LC_LOAD_DYLIB and friends).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DylibCommand<O: ByteOrder> {
    /// LC_LOAD_DYLIB, LC_LOAD_WEAK_DYLIB, etc.
    pub cmd: U32<O>,
    /// Total size (includes path string)
    pub cmdsize: U32<O>,
    /// Offset of the path string from the start of the command
    pub name_offset: U32<O>,
    /// Build timestamp
    pub timestamp: U32<O>,
    /// Current version
    pub current_version: U32<O>,
    /// Compatibility version
    pub compatibility_version: U32<O>,
}

impl<O: ByteOrder> DylibCommand<O> {
    /// Minimum size of this command (without path string).
    pub const SIZE: usize = 24;
}

/// Runpath command (LC_RPATH).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RpathCommand<O: ByteOrder> {
    /// LC_RPATH
    pub cmd: U32<O>,
    /// Total size (includes path string)
    pub cmdsize: U32<O>,
    /// Offset of the path string from the start of the command
    pub path_offset: U32<O>,
}

impl<O: ByteOrder> RpathCommand<O> {
    /// Minimum size of this command (without path string).
    pub const SIZE: usize = 12;
}
