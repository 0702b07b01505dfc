//! Container detection and architecture slice selection.

use serde::Serialize;
use tracing::debug;
use zerocopy::byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::constants::*;
use super::structs::*;
use crate::error::BinaryFormatError;
use crate::util::{checked_range, read_u32_be_at};

// =============================================================================
// Container Kind
// =============================================================================

/// Byte order of a Mach-O image or fat table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    /// Little-endian (arm64, x86_64)
    Little,
    /// Big-endian (PowerPC, fat tables)
    Big,
}

/// Kind of file identified by the leading magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    /// A single-architecture Mach-O image
    Thin { is_64: bool, endian: Endian },
    /// A multi-architecture container
    Fat { is_64: bool, endian: Endian },
}

impl Container {
    /// Identifies the container from the first four bytes of `data`.
    pub fn probe(data: &[u8]) -> Result<Self, BinaryFormatError> {
        let magic =
            read_u32_be_at(data, 0).ok_or_else(|| BinaryFormatError::truncated(0, 4, data.len()))?;

        let container = match magic {
            MH_MAGIC => Container::Thin { is_64: false, endian: Endian::Big },
            MH_CIGAM => Container::Thin { is_64: false, endian: Endian::Little },
            MH_MAGIC_64 => Container::Thin { is_64: true, endian: Endian::Big },
            MH_CIGAM_64 => Container::Thin { is_64: true, endian: Endian::Little },
            FAT_MAGIC => Container::Fat { is_64: false, endian: Endian::Big },
            FAT_CIGAM => Container::Fat { is_64: false, endian: Endian::Little },
            FAT_MAGIC_64 => Container::Fat { is_64: true, endian: Endian::Big },
            FAT_CIGAM_64 => Container::Fat { is_64: true, endian: Endian::Little },
            _ => return Err(BinaryFormatError::UnknownMagic(magic)),
        };

        Ok(container)
    }

    /// Returns true for multi-architecture containers.
    #[inline]
    pub fn is_fat(&self) -> bool {
        matches!(self, Container::Fat { .. })
    }
}

// =============================================================================
// Architecture Slice
// =============================================================================

/// The byte range of one architecture's image within a file.
///
/// A thin file is described by a single slice covering the whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ArchitectureSlice {
    /// File offset of the image
    pub offset: u64,
    /// Size of the image in bytes
    pub size: u64,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
}

impl ArchitectureSlice {
    /// Returns true if the slice targets a 64-bit architecture.
    #[inline]
    pub fn is_64bit(&self) -> bool {
        self.cputype & CPU_ARCH_ABI64 != 0
    }

    /// Returns the architecture name (e.g. "arm64").
    pub fn arch_name(&self) -> &'static str {
        arch_name(self.cputype, self.cpusubtype)
    }

    /// Returns the slice's bytes, or `None` if it is not inside `data`.
    pub fn bytes<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        data.get(checked_range(self.offset, self.size, data.len() as u64)?)
    }
}

// =============================================================================
// Fat Table
// =============================================================================

/// Reads and validates every entry of a fat container's architecture table.
///
/// Every slice must lie inside the file; the first one that does not fails
/// the whole table.
pub fn read_fat_slices(
    data: &[u8],
    is_64: bool,
    endian: Endian,
) -> Result<Vec<ArchitectureSlice>, BinaryFormatError> {
    match endian {
        Endian::Big => read_fat_slices_with::<BigEndian>(data, is_64),
        Endian::Little => read_fat_slices_with::<LittleEndian>(data, is_64),
    }
}

fn read_fat_slices_with<O: ByteOrder>(
    data: &[u8],
    is_64: bool,
) -> Result<Vec<ArchitectureSlice>, BinaryFormatError> {
    let header: FatHeader<O> = read_struct(data, 0)?;
    let count = header.nfat_arch.get();
    if count == 0 {
        return Err(BinaryFormatError::NoArchitectures);
    }

    let entry_size = if is_64 {
        FatArch64::<O>::SIZE
    } else {
        FatArch::<O>::SIZE
    };

    // The whole table has to be present before any entry is trusted.
    let file_size = data.len() as u64;
    let table_len = u64::from(count) * entry_size as u64;
    if checked_range(FatHeader::<O>::SIZE as u64, table_len, file_size).is_none() {
        return Err(BinaryFormatError::truncated(
            FatHeader::<O>::SIZE,
            usize::try_from(table_len).unwrap_or(usize::MAX),
            data.len().saturating_sub(FatHeader::<O>::SIZE),
        ));
    }

    let mut slices = Vec::with_capacity(count as usize);
    for index in 0..count {
        let at = FatHeader::<O>::SIZE + index as usize * entry_size;
        let slice = if is_64 {
            let arch: FatArch64<O> = read_struct(data, at)?;
            ArchitectureSlice {
                offset: arch.offset.get(),
                size: arch.size.get(),
                cputype: arch.cputype.get(),
                cpusubtype: arch.cpusubtype.get(),
            }
        } else {
            let arch: FatArch<O> = read_struct(data, at)?;
            ArchitectureSlice {
                offset: u64::from(arch.offset.get()),
                size: u64::from(arch.size.get()),
                cputype: arch.cputype.get(),
                cpusubtype: arch.cpusubtype.get(),
            }
        };

        if checked_range(slice.offset, slice.size, file_size).is_none() {
            return Err(BinaryFormatError::SliceOutOfBounds {
                index,
                offset: slice.offset,
                size: slice.size,
                file_size,
            });
        }

        debug!(
            "fat slice {}: {} at {:#x} ({:#x} bytes)",
            index,
            slice.arch_name(),
            slice.offset,
            slice.size
        );
        slices.push(slice);
    }

    Ok(slices)
}

/// Picks the slice to parse.
///
/// Order of preference: a 64-bit slice of the preferred CPU type, any slice
/// of the preferred CPU type, then the first listed slice.
pub fn select_slice(slices: &[ArchitectureSlice], preferred_cpu: Option<u32>) -> Option<usize> {
    if slices.is_empty() {
        return None;
    }

    let preferred = preferred_cpu.and_then(|cpu| {
        slices
            .iter()
            .position(|s| s.is_64bit() && s.cputype == cpu)
            .or_else(|| slices.iter().position(|s| s.cputype == cpu))
    });

    Some(preferred.unwrap_or(0))
}
