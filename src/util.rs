//! Bounds-checked primitives for reading untrusted binary data.
//!
//! Every reader returns `None` instead of panicking when the requested bytes
//! are not fully inside the slice.

use std::ops::Range;

use byteorder::{BigEndian, ByteOrder};

// =============================================================================
// Checked Reads
// =============================================================================

/// Returns `offset..offset + len` if the whole range lies inside `total` bytes.
#[inline]
pub fn checked_range(offset: u64, len: u64, total: u64) -> Option<Range<usize>> {
    let end = offset.checked_add(len)?;
    if end > total {
        return None;
    }
    Some(usize::try_from(offset).ok()?..usize::try_from(end).ok()?)
}

/// Returns `len` bytes at `offset`, or `None` if they run past the slice.
#[inline]
pub fn bytes_at(data: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    data.get(offset..offset.checked_add(len)?)
}

/// Reads a big-endian u32 at the given offset.
#[inline]
pub fn read_u32_be_at(data: &[u8], offset: usize) -> Option<u32> {
    bytes_at(data, offset, 4).map(BigEndian::read_u32)
}

// =============================================================================
// Strings
// =============================================================================

/// Finds the position of the first null byte in a slice.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> Option<usize> {
    memchr::memchr(0, data)
}

/// Returns the NUL-terminated byte string starting at `offset`, without the
/// terminator. `None` if the offset is out of range or no terminator follows.
#[inline]
pub fn cstr_at(data: &[u8], offset: usize) -> Option<&[u8]> {
    let tail = data.get(offset..)?;
    let end = memchr_null(tail)?;
    Some(&tail[..end])
}

// =============================================================================
// Formatting
// =============================================================================

/// Renders a byte count with a binary unit suffix.
pub fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1}G", size as f64 / 1024.0 / 1024.0 / 1024.0)
    } else if size >= 1024 * 1024 {
        format!("{:.1}M", size as f64 / 1024.0 / 1024.0)
    } else if size >= 1024 {
        format!("{:.1}K", size as f64 / 1024.0)
    } else {
        format!("{}B", size)
    }
}
