//! Error types for dylib discovery and extraction.
//!
//! Failures fall into two tiers. Request-level errors ([`BundleStructureError`],
//! [`BinaryFormatError`], cancellation) abort an extraction request and are
//! returned through [`Error`]. Item-level problems ([`CopyFailedError`],
//! [`UnresolvedReferenceWarning`]) are recorded on the affected entry and
//! never abort sibling work.

use std::io;
use std::path::PathBuf;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// The main error type for extraction requests.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    BundleStructure(#[from] BundleStructureError),

    #[error(transparent)]
    BinaryFormat(#[from] BinaryFormatError),

    #[error("extraction cancelled")]
    Cancelled,

    #[error("staging root '{staging}' lies inside bundle '{bundle}'")]
    StagingInsideBundle { staging: PathBuf, bundle: PathBuf },

    #[error("extraction task failed: {0}")]
    TaskFailed(String),
}

/// A specialized Result type for extraction requests.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if the request stopped because its cancellation flag was raised.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

// =============================================================================
// Bundle Errors
// =============================================================================

/// The bundle has no resolvable main executable.
#[derive(Error, Debug)]
pub enum BundleStructureError {
    #[error("bundle root '{path}' is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("no Info.plist and no default executable candidate in '{root}'")]
    NoExecutable { root: PathBuf },

    #[error("Info.plist names an invalid executable: {name:?}")]
    InvalidExecutableName { name: String },

    #[error("main executable '{path}' does not exist")]
    ExecutableMissing { path: PathBuf },

    #[error("main executable '{path}' is not a regular file")]
    NotARegularFile { path: PathBuf },

    #[error("main executable '{path}' resolves outside the bundle")]
    OutsideBundle { path: PathBuf },

    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// =============================================================================
// Binary Format Errors
// =============================================================================

/// The executable is malformed, truncated or not a supported container.
#[derive(Error, Debug)]
pub enum BinaryFormatError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("truncated input: need {needed} bytes at offset {offset:#x}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unknown magic number {0:#010x}")]
    UnknownMagic(u32),

    #[error("fat container lists no architectures")]
    NoArchitectures,

    #[error("architecture slice {index} ({offset:#x}+{size:#x}) exceeds file size {file_size:#x}")]
    SliceOutOfBounds {
        index: u32,
        offset: u64,
        size: u64,
        file_size: u64,
    },

    #[error("fat container nested inside slice at offset {offset:#x}")]
    NestedFat { offset: u64 },

    #[error("load command table of {size:#x} bytes exceeds the {available:#x} bytes after the header")]
    CommandTableOutOfBounds { size: u64, available: u64 },

    #[error("load command {index} at offset {offset:#x} declares size {cmdsize}, minimum is {minimum}")]
    CommandSizeTooSmall {
        index: u32,
        offset: usize,
        cmdsize: u32,
        minimum: usize,
    },

    #[error("load command {index} at offset {offset:#x} runs past the command table")]
    CommandOverflow { index: u32, offset: usize },

    #[error("string offset {string_offset} lies outside load command {index} ({cmdsize} bytes)")]
    StringOffsetOutOfBounds {
        index: u32,
        string_offset: u32,
        cmdsize: u32,
    },

    #[error("unterminated path string in load command {index}")]
    UnterminatedString { index: u32 },

    #[error("empty path string in load command {index}")]
    EmptyPath { index: u32 },
}

impl BinaryFormatError {
    /// Creates a truncation error.
    #[inline]
    pub fn truncated(offset: usize, needed: usize, available: usize) -> Self {
        BinaryFormatError::Truncated {
            offset,
            needed,
            available,
        }
    }
}

// =============================================================================
// Item-Level Errors
// =============================================================================

/// A single injected dylib could not be copied to the staging area.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("failed to copy '{source_path}': {message}")]
pub struct CopyFailedError {
    /// File that was being copied
    pub source_path: PathBuf,
    /// Kind of the underlying I/O failure
    #[serde(serialize_with = "serialize_error_kind")]
    pub kind: io::ErrorKind,
    /// Rendered I/O error
    pub message: String,
}

impl CopyFailedError {
    /// Captures an I/O error raised while copying `source_path`.
    pub fn from_io(source_path: impl Into<PathBuf>, err: &io::Error) -> Self {
        Self {
            source_path: source_path.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

fn serialize_error_kind<S: Serializer>(
    kind: &io::ErrorKind,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(kind)
}

/// Why a load-command path could not be mapped to a file in the bundle.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    #[error("no file exists at the resolved location")]
    MissingFile,

    #[error("resolved location is outside the bundle")]
    OutsideBundle,

    #[error("unknown dynamic loader placeholder")]
    UnknownPlaceholder,

    #[error("no runpath entry yields an existing file")]
    NoMatchingRpath,

    #[error("resolved location is not a regular file")]
    NotAFile,
}

/// A load-command path that could not be mapped to an existing file.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("unresolved dylib reference '{path}': {reason}")]
pub struct UnresolvedReferenceWarning {
    /// Path as recorded in the load command
    pub path: String,
    /// Resolution failure
    pub reason: UnresolvedReason,
}
