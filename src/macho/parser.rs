//! Executable parsing: container handling plus the load-command walk.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use serde::Serialize;
use tracing::debug;

use super::constants::HOST_CPU_TYPE;
use super::context::{ImageHeader, LoadCommandEntry, MachOContext};
use super::fat::{read_fat_slices, select_slice, ArchitectureSlice, Container};
use crate::error::BinaryFormatError;

/// Everything the extraction pipeline needs from an executable.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedExecutable {
    /// Size of the whole file
    pub file_size: u64,
    /// True if the file is a multi-architecture container
    pub is_fat: bool,
    /// Every slice of the file (a single whole-file slice when thin)
    pub slices: Vec<ArchitectureSlice>,
    /// The slice whose load commands were parsed
    pub slice: ArchitectureSlice,
    /// Header of the parsed image
    pub header: ImageHeader,
    /// Dylib references, in declaration order
    pub entries: Vec<LoadCommandEntry>,
    /// LC_RPATH search paths, in declaration order
    pub rpaths: Vec<String>,
    /// LC_ID_DYLIB install name, if present
    pub install_name: Option<String>,
}

/// Parses executables into their dylib references.
#[derive(Debug, Clone)]
pub struct LoadCommandParser {
    preferred_cpu: Option<u32>,
}

impl Default for LoadCommandParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadCommandParser {
    /// Creates a parser that prefers the host's native architecture in fat files.
    pub fn new() -> Self {
        Self {
            preferred_cpu: HOST_CPU_TYPE,
        }
    }

    /// Sets the CPU type preferred when selecting a fat slice.
    ///
    /// `None` always selects the first listed slice.
    pub fn with_preferred_cpu(mut self, cpu: Option<u32>) -> Self {
        self.preferred_cpu = cpu;
        self
    }

    /// Maps `path` and parses it.
    pub fn parse_file<P: AsRef<Path>>(&self, path: P) -> Result<ParsedExecutable, BinaryFormatError> {
        let path = path.as_ref();
        let io_err = |source| BinaryFormatError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        if len < 4 {
            return Err(BinaryFormatError::truncated(0, 4, len as usize));
        }

        // The mapping is read-only and only lives for the duration of the parse.
        let mmap = unsafe { Mmap::map(&file) }.map_err(io_err)?;

        debug!("Parsing {} ({} bytes)", path.display(), len);
        self.parse_bytes(&mmap)
    }

    /// Parses an in-memory executable.
    pub fn parse_bytes(&self, data: &[u8]) -> Result<ParsedExecutable, BinaryFormatError> {
        let file_size = data.len() as u64;

        let (slices, selected) = match Container::probe(data)? {
            Container::Thin { is_64, endian } => {
                let ctx = MachOContext::parse(data, is_64, endian)?;
                let slice = ArchitectureSlice {
                    offset: 0,
                    size: file_size,
                    cputype: ctx.header.cputype,
                    cpusubtype: ctx.header.cpusubtype,
                };
                return Ok(Self::assemble(file_size, false, vec![slice], slice, ctx));
            }
            Container::Fat { is_64, endian } => {
                let slices = read_fat_slices(data, is_64, endian)?;
                let selected = select_slice(&slices, self.preferred_cpu)
                    .ok_or(BinaryFormatError::NoArchitectures)?;
                (slices, selected)
            }
        };

        let slice = slices[selected];
        debug!(
            "Selected {} slice at {:#x} of {}",
            slice.arch_name(),
            slice.offset,
            slices.len()
        );

        let image = slice
            .bytes(data)
            .ok_or(BinaryFormatError::SliceOutOfBounds {
                index: selected as u32,
                offset: slice.offset,
                size: slice.size,
                file_size,
            })?;

        let ctx = match Container::probe(image)? {
            Container::Thin { is_64, endian } => MachOContext::parse(image, is_64, endian)?,
            Container::Fat { .. } => {
                return Err(BinaryFormatError::NestedFat {
                    offset: slice.offset,
                })
            }
        };

        Ok(Self::assemble(file_size, true, slices, slice, ctx))
    }

    fn assemble(
        file_size: u64,
        is_fat: bool,
        slices: Vec<ArchitectureSlice>,
        slice: ArchitectureSlice,
        ctx: MachOContext,
    ) -> ParsedExecutable {
        ParsedExecutable {
            file_size,
            is_fat,
            slices,
            slice,
            header: ctx.header,
            entries: ctx.dylibs,
            rpaths: ctx.rpaths,
            install_name: ctx.install_name,
        }
    }
}

/// Parses the executable at `path` with the default slice preference.
pub fn parse_executable<P: AsRef<Path>>(path: P) -> Result<ParsedExecutable, BinaryFormatError> {
    LoadCommandParser::new().parse_file(path)
}

/// Parses the dylib references of the executable at `path`.
///
/// Fat files are parsed through the host's native slice when present.
pub fn parse_load_commands<P: AsRef<Path>>(
    path: P,
) -> Result<Vec<LoadCommandEntry>, BinaryFormatError> {
    Ok(parse_executable(path)?.entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::constants::*;
    use crate::testing::{fat, MachOBuilder};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn two_slice_fat() -> Vec<u8> {
        let x86 = MachOBuilder::new64()
            .cpu(CPU_TYPE_X86_64, 3)
            .dylib(LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib")
            .dylib(LC_LOAD_DYLIB, "@executable_path/x86Only.dylib")
            .build();
        let arm64 = MachOBuilder::new64()
            .dylib(LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib")
            .dylib(LC_LOAD_DYLIB, "@executable_path/Frameworks/Tweak.dylib")
            .dylib(LC_LOAD_WEAK_DYLIB, "@rpath/armOnly.dylib")
            .build();
        fat(&[(CPU_TYPE_X86_64, 3, x86), (CPU_TYPE_ARM64, 0, arm64)])
    }

    fn paths(parsed: &ParsedExecutable) -> Vec<&str> {
        parsed.entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_thin_executable() {
        let data = MachOBuilder::new64()
            .dylib(LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib")
            .rpath("@executable_path/Frameworks")
            .build();

        let parsed = LoadCommandParser::new().parse_bytes(&data).unwrap();
        assert!(!parsed.is_fat);
        assert_eq!(parsed.slices.len(), 1);
        assert_eq!(parsed.slice.size, data.len() as u64);
        assert_eq!(parsed.slice.arch_name(), "arm64");
        assert_eq!(paths(&parsed), ["/usr/lib/libSystem.B.dylib"]);
        assert_eq!(parsed.rpaths, ["@executable_path/Frameworks"]);
    }

    #[test]
    fn test_fat_parses_exactly_one_slice() {
        let data = two_slice_fat();

        let arm = LoadCommandParser::new()
            .with_preferred_cpu(Some(CPU_TYPE_ARM64))
            .parse_bytes(&data)
            .unwrap();
        assert!(arm.is_fat);
        assert_eq!(arm.slice.arch_name(), "arm64");
        assert_eq!(
            paths(&arm),
            [
                "/usr/lib/libSystem.B.dylib",
                "@executable_path/Frameworks/Tweak.dylib",
                "@rpath/armOnly.dylib"
            ]
        );

        let first = LoadCommandParser::new()
            .with_preferred_cpu(None)
            .parse_bytes(&data)
            .unwrap();
        assert_eq!(first.slice.arch_name(), "x86_64");
        assert_eq!(
            paths(&first),
            ["/usr/lib/libSystem.B.dylib", "@executable_path/x86Only.dylib"]
        );
    }

    #[test]
    fn test_unknown_preference_uses_first_slice() {
        let data = two_slice_fat();
        let parsed = LoadCommandParser::new()
            .with_preferred_cpu(Some(CPU_TYPE_POWERPC64))
            .parse_bytes(&data)
            .unwrap();
        assert_eq!(parsed.slice.cputype, CPU_TYPE_X86_64);
    }

    #[test]
    fn test_nested_fat_rejected() {
        let inner = fat(&[(CPU_TYPE_ARM64, 0, MachOBuilder::new64().build())]);
        let data = fat(&[(CPU_TYPE_ARM64, 0, inner)]);
        assert!(matches!(
            LoadCommandParser::new().parse_bytes(&data),
            Err(BinaryFormatError::NestedFat { .. })
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let mut data = MachOBuilder::new64().build();
        data[..4].copy_from_slice(b"\xDE\xAD\xBE\xEF");
        assert!(matches!(
            LoadCommandParser::new().parse_bytes(&data),
            Err(BinaryFormatError::UnknownMagic(0xDEAD_BEEF))
        ));
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("App");
        let data = MachOBuilder::new64()
            .dylib(LC_LOAD_DYLIB, "@rpath/Foo.dylib")
            .build();
        std::fs::write(&path, &data).unwrap();

        let entries = parse_load_commands(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "@rpath/Foo.dylib");
    }

    #[test]
    fn test_parse_empty_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();

        assert!(matches!(
            parse_load_commands(&empty),
            Err(BinaryFormatError::Truncated { available: 0, .. })
        ));
        assert!(matches!(
            parse_load_commands(dir.path().join("missing")),
            Err(BinaryFormatError::Io { .. })
        ));
    }

    #[test]
    fn test_truncation_never_panics() {
        let thin = MachOBuilder::new64()
            .dylib(LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib")
            .rpath("@executable_path/Frameworks")
            .dylib(LC_LOAD_DYLIB, "@rpath/Tweak.dylib")
            .build();
        let parser = LoadCommandParser::new().with_preferred_cpu(None);

        for data in [thin, two_slice_fat()] {
            assert!(parser.parse_bytes(&data).is_ok());
            for len in 0..data.len() {
                let _ = parser.parse_bytes(&data[..len]);
            }
        }
    }

    #[test]
    fn test_corrupted_tables_never_read_out_of_bounds() {
        let original = two_slice_fat();
        let parser = LoadCommandParser::new().with_preferred_cpu(Some(CPU_TYPE_ARM64));
        let mut rng = StdRng::seed_from_u64(0x5EED_1234);

        for _ in 0..4000 {
            let mut data = original.clone();
            for _ in 0..rng.gen_range(1..=6) {
                // Fat table, then the arm64 slice's header and commands.
                let at = if rng.gen_ratio(1, 3) {
                    rng.gen_range(0..48)
                } else {
                    0x2000 + rng.gen_range(0..160)
                };
                data[at] = rng.gen();
            }

            if let Ok(parsed) = parser.parse_bytes(&data) {
                let table_end =
                    parsed.header.header_size() as u64 + u64::from(parsed.header.sizeofcmds);
                assert!(parsed.slice.offset + parsed.slice.size <= data.len() as u64);
                assert!(table_end <= parsed.slice.size);
                for entry in &parsed.entries {
                    assert!(!entry.path.is_empty());
                    assert!(entry.index < parsed.header.ncmds);
                }
            }
        }
    }
}
