//! Fixtures shared by the unit tests: synthetic Mach-O images, fat
//! containers and on-disk bundles.

use std::fs;
use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};

use crate::macho::{
    CPU_TYPE_ARM, CPU_TYPE_ARM64, FAT_MAGIC, FAT_MAGIC_64, LC_RPATH, MH_EXECUTE, MH_MAGIC,
    MH_MAGIC_64,
};

// =============================================================================
// Mach-O Images
// =============================================================================

enum Command {
    Dylib(u32, String),
    Rpath(String),
    Raw(u32, Vec<u8>),
}

/// Builds a minimal thin Mach-O image.
///
/// Dylib commands carry their name at offset 24 and version 1.0.0. Every
/// command is padded to the word size and the header declares exactly the
/// bytes written.
pub(crate) struct MachOBuilder {
    is_64: bool,
    big_endian: bool,
    cputype: u32,
    cpusubtype: u32,
    commands: Vec<Command>,
}

impl MachOBuilder {
    /// A little-endian arm64 image.
    pub fn new64() -> Self {
        Self {
            is_64: true,
            big_endian: false,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            commands: Vec::new(),
        }
    }

    /// A little-endian armv7 image.
    pub fn new32() -> Self {
        Self {
            is_64: false,
            big_endian: false,
            cputype: CPU_TYPE_ARM,
            cpusubtype: 9,
            commands: Vec::new(),
        }
    }

    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    pub fn cpu(mut self, cputype: u32, cpusubtype: u32) -> Self {
        self.cputype = cputype;
        self.cpusubtype = cpusubtype;
        self
    }

    pub fn dylib(mut self, cmd: u32, path: &str) -> Self {
        self.commands.push(Command::Dylib(cmd, path.to_string()));
        self
    }

    pub fn rpath(mut self, path: &str) -> Self {
        self.commands.push(Command::Rpath(path.to_string()));
        self
    }

    /// Appends a command with an arbitrary payload after its 8-byte header.
    pub fn raw(mut self, cmd: u32, payload: &[u8]) -> Self {
        self.commands.push(Command::Raw(cmd, payload.to_vec()));
        self
    }

    fn put(&self, out: &mut Vec<u8>, value: u32) {
        if self.big_endian {
            out.extend_from_slice(&value.to_be_bytes());
        } else {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    fn align(&self) -> usize {
        if self.is_64 {
            8
        } else {
            4
        }
    }

    fn encode(&self, command: &Command) -> Vec<u8> {
        let (cmd, fixed, tail) = match command {
            Command::Dylib(cmd, path) => {
                let mut fixed = Vec::new();
                self.put(&mut fixed, 24);
                self.put(&mut fixed, 2);
                self.put(&mut fixed, 0x1_0000);
                self.put(&mut fixed, 0x1_0000);
                let mut tail = path.as_bytes().to_vec();
                tail.push(0);
                (*cmd, fixed, tail)
            }
            Command::Rpath(path) => {
                let mut fixed = Vec::new();
                self.put(&mut fixed, 12);
                let mut tail = path.as_bytes().to_vec();
                tail.push(0);
                (LC_RPATH, fixed, tail)
            }
            Command::Raw(cmd, payload) => (*cmd, Vec::new(), payload.clone()),
        };

        let unpadded = 8 + fixed.len() + tail.len();
        let cmdsize = unpadded.div_ceil(self.align()) * self.align();

        let mut out = Vec::with_capacity(cmdsize);
        self.put(&mut out, cmd);
        self.put(&mut out, cmdsize as u32);
        out.extend_from_slice(&fixed);
        out.extend_from_slice(&tail);
        out.resize(cmdsize, 0);
        out
    }

    pub fn build(&self) -> Vec<u8> {
        let table: Vec<u8> = self
            .commands
            .iter()
            .flat_map(|command| self.encode(command))
            .collect();

        let mut out = Vec::new();
        self.put(&mut out, if self.is_64 { MH_MAGIC_64 } else { MH_MAGIC });
        self.put(&mut out, self.cputype);
        self.put(&mut out, self.cpusubtype);
        self.put(&mut out, MH_EXECUTE);
        self.put(&mut out, self.commands.len() as u32);
        self.put(&mut out, table.len() as u32);
        self.put(&mut out, 0x0020_0085);
        if self.is_64 {
            self.put(&mut out, 0);
        }
        out.extend_from_slice(&table);
        out
    }
}

// =============================================================================
// Fat Containers
// =============================================================================

const SLICE_ALIGN: usize = 0x1000;

fn slice_offsets(slices: &[(u32, u32, Vec<u8>)]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(slices.len());
    let mut next = SLICE_ALIGN;
    for (_, _, image) in slices {
        offsets.push(next);
        next = (next + image.len()).div_ceil(SLICE_ALIGN) * SLICE_ALIGN;
    }
    offsets
}

fn place_slices(mut out: Vec<u8>, slices: &[(u32, u32, Vec<u8>)], offsets: &[usize]) -> Vec<u8> {
    for ((_, _, image), &offset) in slices.iter().zip(offsets) {
        out.resize(offset, 0);
        out.extend_from_slice(image);
    }
    out
}

/// Wraps images in a big-endian fat container with 32-bit offsets.
///
/// Slices start at 0x1000 and are page aligned.
pub(crate) fn fat(slices: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    let offsets = slice_offsets(slices);
    let mut out = Vec::new();
    out.extend_from_slice(&FAT_MAGIC.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());
    for ((cputype, cpusubtype, image), &offset) in slices.iter().zip(&offsets) {
        out.extend_from_slice(&cputype.to_be_bytes());
        out.extend_from_slice(&cpusubtype.to_be_bytes());
        out.extend_from_slice(&(offset as u32).to_be_bytes());
        out.extend_from_slice(&(image.len() as u32).to_be_bytes());
        out.extend_from_slice(&12u32.to_be_bytes());
    }
    place_slices(out, slices, &offsets)
}

/// Wraps images in a big-endian fat container with 64-bit offsets.
pub(crate) fn fat64(slices: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    let offsets = slice_offsets(slices);
    let mut out = Vec::new();
    out.extend_from_slice(&FAT_MAGIC_64.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());
    for ((cputype, cpusubtype, image), &offset) in slices.iter().zip(&offsets) {
        out.extend_from_slice(&cputype.to_be_bytes());
        out.extend_from_slice(&cpusubtype.to_be_bytes());
        out.extend_from_slice(&(offset as u64).to_be_bytes());
        out.extend_from_slice(&(image.len() as u64).to_be_bytes());
        out.extend_from_slice(&12u32.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
    }
    place_slices(out, slices, &offsets)
}

// =============================================================================
// Bundles
// =============================================================================

/// Writes `contents` to `path`, creating parent directories.
pub(crate) fn write_file(path: impl AsRef<Path>, contents: &[u8]) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

/// Writes an Info.plist holding string `entries`.
pub(crate) fn write_info_plist(path: impl AsRef<Path>, entries: &[(&str, &str)], binary: bool) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }

    let mut dict = Dictionary::new();
    for (key, value) in entries {
        dict.insert(key.to_string(), Value::String(value.to_string()));
    }
    let value = Value::Dictionary(dict);
    if binary {
        value.to_file_binary(path).unwrap();
    } else {
        value.to_file_xml(path).unwrap();
    }
}

/// Creates `<parent>/<name>.app` as a flat bundle whose manifest names
/// `name` as the executable, and writes `executable` there.
pub(crate) fn ios_bundle(parent: &Path, name: &str, executable: &[u8]) -> PathBuf {
    let root = parent.join(format!("{}.app", name));
    write_info_plist(
        root.join("Info.plist"),
        &[
            ("CFBundleExecutable", name),
            ("CFBundleIdentifier", "com.example.app"),
        ],
        false,
    );
    write_file(root.join(name), executable);
    root
}
