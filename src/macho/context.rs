//! Load-command walker for a single-architecture Mach-O image.

use std::fmt;

use serde::Serialize;
use tracing::{debug, trace};
use zerocopy::byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::constants::*;
use super::fat::Endian;
use super::structs::*;
use crate::error::BinaryFormatError;
use crate::util::cstr_at;

// =============================================================================
// Dylib References
// =============================================================================

/// The closed set of load commands that reference a dynamic library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DylibKind {
    /// LC_LOAD_DYLIB
    Load,
    /// LC_LOAD_WEAK_DYLIB
    Weak,
    /// LC_REEXPORT_DYLIB
    Reexport,
    /// LC_LAZY_LOAD_DYLIB
    Lazy,
    /// LC_LOAD_UPWARD_DYLIB
    Upward,
}

impl DylibKind {
    /// Maps a raw command tag to a dylib reference kind.
    pub fn from_cmd(cmd: u32) -> Option<Self> {
        match cmd {
            LC_LOAD_DYLIB => Some(DylibKind::Load),
            LC_LOAD_WEAK_DYLIB => Some(DylibKind::Weak),
            LC_REEXPORT_DYLIB => Some(DylibKind::Reexport),
            LC_LAZY_LOAD_DYLIB => Some(DylibKind::Lazy),
            LC_LOAD_UPWARD_DYLIB => Some(DylibKind::Upward),
            _ => None,
        }
    }

    /// Returns the raw command tag.
    pub fn cmd(self) -> u32 {
        match self {
            DylibKind::Load => LC_LOAD_DYLIB,
            DylibKind::Weak => LC_LOAD_WEAK_DYLIB,
            DylibKind::Reexport => LC_REEXPORT_DYLIB,
            DylibKind::Lazy => LC_LAZY_LOAD_DYLIB,
            DylibKind::Upward => LC_LOAD_UPWARD_DYLIB,
        }
    }

    /// Returns the command's conventional name.
    pub fn command_name(self) -> &'static str {
        match self {
            DylibKind::Load => "LC_LOAD_DYLIB",
            DylibKind::Weak => "LC_LOAD_WEAK_DYLIB",
            DylibKind::Reexport => "LC_REEXPORT_DYLIB",
            DylibKind::Lazy => "LC_LAZY_LOAD_DYLIB",
            DylibKind::Upward => "LC_LOAD_UPWARD_DYLIB",
        }
    }
}

/// A packed `xxxx.yy.zz` dylib version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct DylibVersion(pub u32);

impl fmt::Display for DylibVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.0 >> 16,
            (self.0 >> 8) & 0xFF,
            self.0 & 0xFF
        )
    }
}

/// A dynamic library reference parsed from the load-command table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadCommandEntry {
    /// Path as embedded in the binary (never empty)
    pub path: String,
    /// Which dylib command referenced it
    pub kind: DylibKind,
    /// Index of the command in the load-command table
    pub index: u32,
    /// Current version recorded at link time
    pub current_version: DylibVersion,
    /// Compatibility version recorded at link time
    pub compatibility_version: DylibVersion,
}

impl LoadCommandEntry {
    /// Returns the last path component of the recorded path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

// =============================================================================
// Image Header
// =============================================================================

/// Header fields of a parsed Mach-O image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageHeader {
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type (MH_EXECUTE, MH_DYLIB, ...)
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of the load-command table
    pub sizeofcmds: u32,
    /// Header flags
    pub flags: MachOFlags,
    /// 64-bit image
    pub is_64: bool,
    /// Byte order of the image
    pub endian: Endian,
}

impl ImageHeader {
    /// Returns the architecture name (e.g. "arm64e").
    pub fn arch_name(&self) -> &'static str {
        arch_name(self.cputype, self.cpusubtype)
    }

    /// Returns the size of the header preceding the load commands.
    pub fn header_size(&self) -> usize {
        if self.is_64 {
            MachHeader64::<LittleEndian>::SIZE
        } else {
            MachHeader::<LittleEndian>::SIZE
        }
    }
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// The dylib-related contents of one Mach-O image.
#[derive(Debug, Clone)]
pub struct MachOContext {
    /// The image header
    pub header: ImageHeader,
    /// Dylib references, in declaration order
    pub dylibs: Vec<LoadCommandEntry>,
    /// LC_RPATH search paths, in declaration order
    pub rpaths: Vec<String>,
    /// Install name from LC_ID_DYLIB, if the image is a library
    pub install_name: Option<String>,
}

impl MachOContext {
    /// Parses the header and load-command table of a thin image.
    ///
    /// `data` must start at the image's header and end at the end of its
    /// slice; nothing outside it is read.
    pub fn parse(data: &[u8], is_64: bool, endian: Endian) -> Result<Self, BinaryFormatError> {
        match endian {
            Endian::Little => Self::parse_with::<LittleEndian>(data, is_64, endian),
            Endian::Big => Self::parse_with::<BigEndian>(data, is_64, endian),
        }
    }

    fn parse_with<O: ByteOrder>(
        data: &[u8],
        is_64: bool,
        endian: Endian,
    ) -> Result<Self, BinaryFormatError> {
        let header = if is_64 {
            let raw: MachHeader64<O> = read_struct(data, 0)?;
            ImageHeader {
                cputype: raw.cputype.get(),
                cpusubtype: raw.cpusubtype.get(),
                filetype: raw.filetype.get(),
                ncmds: raw.ncmds.get(),
                sizeofcmds: raw.sizeofcmds.get(),
                flags: MachOFlags::from_bits_retain(raw.flags.get()),
                is_64,
                endian,
            }
        } else {
            let raw: MachHeader<O> = read_struct(data, 0)?;
            ImageHeader {
                cputype: raw.cputype.get(),
                cpusubtype: raw.cpusubtype.get(),
                filetype: raw.filetype.get(),
                ncmds: raw.ncmds.get(),
                sizeofcmds: raw.sizeofcmds.get(),
                flags: MachOFlags::from_bits_retain(raw.flags.get()),
                is_64,
                endian,
            }
        };

        let header_size = header.header_size();
        let available = data.len().saturating_sub(header_size);
        if header.sizeofcmds as usize > available {
            return Err(BinaryFormatError::CommandTableOutOfBounds {
                size: u64::from(header.sizeofcmds),
                available: available as u64,
            });
        }
        let table_end = header_size + header.sizeofcmds as usize;

        let mut ctx = Self {
            header,
            dylibs: Vec::new(),
            rpaths: Vec::new(),
            install_name: None,
        };

        let mut offset = header_size;
        for index in 0..header.ncmds {
            if offset + LoadCommand::<O>::SIZE > table_end {
                return Err(BinaryFormatError::CommandOverflow { index, offset });
            }

            let lc: LoadCommand<O> = read_struct(data, offset)?;
            let cmd = lc.cmd.get();
            let cmdsize = lc.cmdsize.get();

            if (cmdsize as usize) < LoadCommand::<O>::SIZE {
                return Err(BinaryFormatError::CommandSizeTooSmall {
                    index,
                    offset,
                    cmdsize,
                    minimum: LoadCommand::<O>::SIZE,
                });
            }

            let end = offset
                .checked_add(cmdsize as usize)
                .filter(|&end| end <= table_end)
                .ok_or(BinaryFormatError::CommandOverflow { index, offset })?;
            let cmd_data = &data[offset..end];

            trace!("load command {} at {:#x}: cmd={:#x} size={}", index, offset, cmd, cmdsize);

            if let Some(kind) = DylibKind::from_cmd(cmd) {
                let entry = Self::parse_dylib::<O>(cmd_data, kind, index, offset)?;
                debug!("{} {}", kind.command_name(), entry.path);
                ctx.dylibs.push(entry);
            } else if cmd == LC_RPATH {
                let path = Self::parse_rpath::<O>(cmd_data, index, offset)?;
                debug!("LC_RPATH {}", path);
                ctx.rpaths.push(path);
            } else if cmd == LC_ID_DYLIB {
                let entry = Self::parse_dylib::<O>(cmd_data, DylibKind::Load, index, offset)?;
                ctx.install_name = Some(entry.path);
            }

            offset = end;
        }

        Ok(ctx)
    }

    fn parse_dylib<O: ByteOrder>(
        cmd_data: &[u8],
        kind: DylibKind,
        index: u32,
        offset: usize,
    ) -> Result<LoadCommandEntry, BinaryFormatError> {
        let command: DylibCommand<O> =
            Self::read_command(cmd_data, index, offset, DylibCommand::<O>::SIZE)?;
        let path = Self::read_command_string(
            cmd_data,
            command.name_offset.get(),
            DylibCommand::<O>::SIZE,
            index,
        )?;

        Ok(LoadCommandEntry {
            path,
            kind,
            index,
            current_version: DylibVersion(command.current_version.get()),
            compatibility_version: DylibVersion(command.compatibility_version.get()),
        })
    }

    fn parse_rpath<O: ByteOrder>(
        cmd_data: &[u8],
        index: u32,
        offset: usize,
    ) -> Result<String, BinaryFormatError> {
        let command: RpathCommand<O> =
            Self::read_command(cmd_data, index, offset, RpathCommand::<O>::SIZE)?;
        Self::read_command_string(
            cmd_data,
            command.path_offset.get(),
            RpathCommand::<O>::SIZE,
            index,
        )
    }

    /// Reads a fixed-size command structure, requiring the declared size to cover it.
    fn read_command<T>(
        cmd_data: &[u8],
        index: u32,
        offset: usize,
        minimum: usize,
    ) -> Result<T, BinaryFormatError>
    where
        T: zerocopy::FromBytes + zerocopy::KnownLayout + zerocopy::Immutable,
    {
        if cmd_data.len() < minimum {
            return Err(BinaryFormatError::CommandSizeTooSmall {
                index,
                offset,
                cmdsize: cmd_data.len() as u32,
                minimum,
            });
        }
        read_struct(cmd_data, 0)
    }

    /// Reads the NUL-terminated string a command points at.
    ///
    /// The string must start after the fixed part of the command and end
    /// before the command's declared size.
    fn read_command_string(
        cmd_data: &[u8],
        string_offset: u32,
        fixed_size: usize,
        index: u32,
    ) -> Result<String, BinaryFormatError> {
        let start = string_offset as usize;
        if start < fixed_size || start >= cmd_data.len() {
            return Err(BinaryFormatError::StringOffsetOutOfBounds {
                index,
                string_offset,
                cmdsize: cmd_data.len() as u32,
            });
        }

        let bytes =
            cstr_at(cmd_data, start).ok_or(BinaryFormatError::UnterminatedString { index })?;
        if bytes.is_empty() {
            return Err(BinaryFormatError::EmptyPath { index });
        }

        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Returns the dylib references in declaration order.
    pub fn dylibs(&self) -> &[LoadCommandEntry] {
        &self.dylibs
    }

    /// Returns the runpath search list in declaration order.
    pub fn rpaths(&self) -> &[String] {
        &self.rpaths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MachOBuilder;

    fn parse_le64(data: &[u8]) -> Result<MachOContext, BinaryFormatError> {
        MachOContext::parse(data, true, Endian::Little)
    }

    #[test]
    fn test_parse_dylibs_in_order() {
        let data = MachOBuilder::new64()
            .dylib(LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib")
            .raw(0x19, &[0u8; 64])
            .dylib(LC_LOAD_WEAK_DYLIB, "@rpath/Weak.framework/Weak")
            .dylib(LC_REEXPORT_DYLIB, "@executable_path/Frameworks/Re.dylib")
            .dylib(LC_LAZY_LOAD_DYLIB, "@loader_path/Lazy.dylib")
            .dylib(LC_LOAD_UPWARD_DYLIB, "Up.dylib")
            .build();

        let ctx = parse_le64(&data).unwrap();
        let kinds: Vec<_> = ctx.dylibs().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [
                DylibKind::Load,
                DylibKind::Weak,
                DylibKind::Reexport,
                DylibKind::Lazy,
                DylibKind::Upward
            ]
        );
        assert_eq!(ctx.dylibs()[0].path, "/usr/lib/libSystem.B.dylib");
        assert_eq!(ctx.dylibs()[0].index, 0);
        assert_eq!(ctx.dylibs()[1].index, 2);
        assert_eq!(ctx.dylibs()[1].basename(), "Weak");
        assert_eq!(ctx.dylibs()[0].current_version.to_string(), "1.0.0");
        assert_eq!(ctx.header.ncmds, 6);
    }

    #[test]
    fn test_parse_without_dylibs() {
        let data = MachOBuilder::new64().raw(0x19, &[0u8; 64]).build();
        let ctx = parse_le64(&data).unwrap();
        assert!(ctx.dylibs().is_empty());
        assert!(ctx.rpaths().is_empty());
    }

    #[test]
    fn test_parse_rpaths_and_install_name() {
        let data = MachOBuilder::new64()
            .dylib(LC_ID_DYLIB, "@rpath/Self.dylib")
            .rpath("@executable_path/Frameworks")
            .rpath("/usr/lib/swift")
            .build();

        let ctx = parse_le64(&data).unwrap();
        assert_eq!(ctx.rpaths(), ["@executable_path/Frameworks", "/usr/lib/swift"]);
        assert_eq!(ctx.install_name.as_deref(), Some("@rpath/Self.dylib"));
        assert!(ctx.dylibs().is_empty());
    }

    #[test]
    fn test_parse_big_endian_32bit() {
        let data = MachOBuilder::new32()
            .big_endian()
            .cpu(CPU_TYPE_POWERPC, 0)
            .dylib(LC_LOAD_DYLIB, "/usr/lib/libgcc_s.1.dylib")
            .build();

        let ctx = MachOContext::parse(&data, false, Endian::Big).unwrap();
        assert_eq!(ctx.header.arch_name(), "ppc");
        assert_eq!(ctx.dylibs()[0].path, "/usr/lib/libgcc_s.1.dylib");
    }

    #[test]
    fn test_command_size_below_header() {
        let mut data = MachOBuilder::new64().dylib(LC_LOAD_DYLIB, "/a").build();
        data[32 + 4..32 + 8].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            parse_le64(&data),
            Err(BinaryFormatError::CommandSizeTooSmall { index: 0, cmdsize: 4, .. })
        ));
    }

    #[test]
    fn test_zero_command_size_does_not_loop() {
        let mut data = MachOBuilder::new64().dylib(LC_LOAD_DYLIB, "/a").build();
        data[32 + 4..32 + 8].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            parse_le64(&data),
            Err(BinaryFormatError::CommandSizeTooSmall { cmdsize: 0, .. })
        ));
    }

    #[test]
    fn test_command_runs_past_table() {
        let mut data = MachOBuilder::new64().dylib(LC_LOAD_DYLIB, "/a").build();
        data[32 + 4..32 + 8].copy_from_slice(&0x1000u32.to_le_bytes());
        assert!(matches!(
            parse_le64(&data),
            Err(BinaryFormatError::CommandOverflow { index: 0, .. })
        ));
    }

    #[test]
    fn test_more_commands_than_table_holds() {
        let mut data = MachOBuilder::new64().dylib(LC_LOAD_DYLIB, "/a").build();
        data[16..20].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            parse_le64(&data),
            Err(BinaryFormatError::CommandOverflow { index: 1, .. })
        ));
    }

    #[test]
    fn test_table_larger_than_image() {
        let mut data = MachOBuilder::new64().dylib(LC_LOAD_DYLIB, "/a").build();
        data[20..24].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        assert!(matches!(
            parse_le64(&data),
            Err(BinaryFormatError::CommandTableOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_name_offset_outside_command() {
        let mut data = MachOBuilder::new64().dylib(LC_LOAD_DYLIB, "/a").build();
        data[32 + 8..32 + 12].copy_from_slice(&200u32.to_le_bytes());
        assert!(matches!(
            parse_le64(&data),
            Err(BinaryFormatError::StringOffsetOutOfBounds { string_offset: 200, .. })
        ));

        data[32 + 8..32 + 12].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            parse_le64(&data),
            Err(BinaryFormatError::StringOffsetOutOfBounds { string_offset: 4, .. })
        ));
    }

    #[test]
    fn test_unterminated_name() {
        let mut data = MachOBuilder::new64().dylib(LC_LOAD_DYLIB, "/abcd").build();
        let cmdsize = u32::from_le_bytes(data[36..40].try_into().unwrap()) as usize;
        for byte in &mut data[32 + 24..32 + cmdsize] {
            *byte = b'x';
        }
        assert!(matches!(
            parse_le64(&data),
            Err(BinaryFormatError::UnterminatedString { index: 0 })
        ));
    }

    #[test]
    fn test_empty_name() {
        let data = MachOBuilder::new64().dylib(LC_LOAD_DYLIB, "").build();
        assert!(matches!(
            parse_le64(&data),
            Err(BinaryFormatError::EmptyPath { index: 0 })
        ));
    }

    #[test]
    fn test_dylib_command_shorter_than_fixed_part() {
        let data = MachOBuilder::new64().raw(LC_LOAD_DYLIB, &[0u8; 8]).build();
        assert!(matches!(
            parse_le64(&data),
            Err(BinaryFormatError::CommandSizeTooSmall { minimum: 24, .. })
        ));
    }

    #[test]
    fn test_dylib_version_display() {
        assert_eq!(DylibVersion(0x0501_0203).to_string(), "1281.2.3");
        assert_eq!(DylibVersion(0x0001_0000).to_string(), "1.0.0");
    }
}
