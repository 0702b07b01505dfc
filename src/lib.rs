//! tweakex - Locate and extract injected dylibs from application bundles.
//!
//! Given the root of an iOS or macOS application bundle, this library finds
//! the main executable, walks its Mach-O load commands, classifies every
//! referenced dynamic library and copies the injected ones into a
//! request-scoped staging directory.
//!
//! # Features
//!
//! - Thin and fat (32- and 64-bit offset) Mach-O, either byte order
//! - Bounds-checked parsing of untrusted executables
//! - `@executable_path`, `@loader_path` and `@rpath` resolution confined to the bundle
//! - Collision-free copies with cooperative cancellation
//! - Blocking and tokio-based entry points
//!
//! # Example
//!
//! ```no_run
//! use tweakex::{ExtractionConfig, ExtractionCoordinator};
//!
//! fn main() -> tweakex::Result<()> {
//!     let coordinator = ExtractionCoordinator::new(
//!         ExtractionConfig::default().with_staging_root("/tmp/export"),
//!     );
//!
//!     let report = coordinator.extract_injected_dylibs("Payload/Demo.app")?;
//!     for dylib in &report.extracted {
//!         println!("{} -> {:?}", dylib.recorded_path, dylib.destination);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bundle;
pub mod cancel;
pub mod coordinator;
pub mod dylib;
pub mod error;
pub mod macho;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use bundle::{locate_main_executable, open_bundle, BundleDescriptor, BundleInfo, BundleLayout};
pub use cancel::CancellationFlag;
pub use coordinator::{
    extract_injected_dylibs, ExtractionConfig, ExtractionCoordinator, ExtractionReport, Inspection,
};
pub use dylib::{
    classify, ClassifierConfig, DylibCandidate, DylibClass, DylibClassifier, DylibExtractor,
    ExtractedDylib, ExtractionStatus,
};
pub use error::{
    BinaryFormatError, BundleStructureError, CopyFailedError, Error, Result, UnresolvedReason,
    UnresolvedReferenceWarning,
};
pub use macho::{
    parse_executable, parse_load_commands, ArchitectureSlice, DylibKind, LoadCommandEntry,
    LoadCommandParser, ParsedExecutable,
};
