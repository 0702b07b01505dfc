//! Copying injected dylibs into a staging directory.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::classifier::{DylibCandidate, DylibClass};
use crate::cancel::CancellationFlag;
use crate::error::{CopyFailedError, Error, Result, UnresolvedReferenceWarning};
use crate::util::format_size;

/// Size of the buffer used for copying; cancellation is checked between chunks.
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on `<stem>-N` suffixes tried for one destination.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Called after every attempted copy.
pub type ProgressCallback = dyn Fn(&ExtractedDylib) + Send + Sync;

/// Result of one copy attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    /// The file was copied completely
    Extracted,
    /// The copy failed; nothing is left at the destination
    Failed(CopyFailedError),
}

/// One injected dylib and what happened to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedDylib {
    /// Path as recorded in the load command
    pub recorded_path: String,
    /// Canonical source path inside the bundle
    pub source: PathBuf,
    /// Staging path of the copy
    pub destination: Option<PathBuf>,
    /// Bytes copied
    pub size: u64,
    /// Outcome
    pub status: ExtractionStatus,
}

impl ExtractedDylib {
    /// Returns true if the copy succeeded.
    #[inline]
    pub fn is_extracted(&self) -> bool {
        self.status == ExtractionStatus::Extracted
    }
}

/// Everything produced by one extraction pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionBatch {
    /// One record per distinct injected source, in candidate order
    pub extracted: Vec<ExtractedDylib>,
    /// References that could not be resolved
    pub unresolved: Vec<UnresolvedReferenceWarning>,
}

enum CopyError {
    Cancelled,
    Io(io::Error),
}

impl From<io::Error> for CopyError {
    fn from(e: io::Error) -> Self {
        CopyError::Io(e)
    }
}

/// Copies injected dylibs into a staging directory.
///
/// The directory is created on the first copy. Existing files in it are
/// never overwritten.
#[derive(Clone)]
pub struct DylibExtractor {
    staging_dir: PathBuf,
    progress: Option<Arc<ProgressCallback>>,
}

impl std::fmt::Debug for DylibExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DylibExtractor")
            .field("staging_dir", &self.staging_dir)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl DylibExtractor {
    /// Creates an extractor writing into `staging_dir`.
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            progress: None,
        }
    }

    /// Sets a callback invoked after every attempted copy.
    pub fn with_progress(mut self, progress: Arc<ProgressCallback>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Returns the staging directory.
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Copies every injected candidate and collects unresolved warnings.
    ///
    /// Copy failures are recorded per item. Only cancellation aborts the
    /// pass, after removing the partial file.
    pub fn extract(
        &self,
        candidates: &[DylibCandidate],
        cancel: &CancellationFlag,
    ) -> Result<ExtractionBatch> {
        let mut batch = ExtractionBatch::default();
        let mut seen = HashSet::new();

        for candidate in candidates {
            if let Some(warning) = candidate.unresolved_warning() {
                warn!("{}", warning);
                batch.unresolved.push(warning);
                continue;
            }
            if candidate.class != DylibClass::Injected {
                continue;
            }
            let Some(source) = candidate.resolved.as_deref() else {
                continue;
            };
            if !seen.insert(source.to_path_buf()) {
                debug!("{} already copied", source.display());
                continue;
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let record = match self.copy_one(source, cancel) {
                Ok((destination, size)) => {
                    info!(
                        "Extracted {} -> {} ({})",
                        candidate.entry.path,
                        destination.display(),
                        format_size(size)
                    );
                    ExtractedDylib {
                        recorded_path: candidate.entry.path.clone(),
                        source: source.to_path_buf(),
                        destination: Some(destination),
                        size,
                        status: ExtractionStatus::Extracted,
                    }
                }
                Err(CopyError::Cancelled) => return Err(Error::Cancelled),
                Err(CopyError::Io(e)) => {
                    let failure = CopyFailedError::from_io(source, &e);
                    warn!("{}", failure);
                    ExtractedDylib {
                        recorded_path: candidate.entry.path.clone(),
                        source: source.to_path_buf(),
                        destination: None,
                        size: 0,
                        status: ExtractionStatus::Failed(failure),
                    }
                }
            };

            if let Some(progress) = &self.progress {
                progress(&record);
            }
            batch.extracted.push(record);
        }

        Ok(batch)
    }

    fn copy_one(
        &self,
        source: &Path,
        cancel: &CancellationFlag,
    ) -> std::result::Result<(PathBuf, u64), CopyError> {
        let mut input = File::open(source)?;
        fs::create_dir_all(&self.staging_dir)?;

        let file_name = source
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
        let (destination, mut output) = self.create_destination(Path::new(file_name))?;

        match copy_chunks(&mut input, &mut output, cancel) {
            Ok(size) => Ok((destination, size)),
            Err(e) => {
                drop(output);
                if let Err(remove) = fs::remove_file(&destination) {
                    warn!("Failed to remove partial {}: {}", destination.display(), remove);
                }
                Err(e)
            }
        }
    }

    /// Opens a fresh destination, appending `-1`, `-2`, ... to the stem on collision.
    fn create_destination(&self, file_name: &Path) -> io::Result<(PathBuf, File)> {
        let stem = file_name
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = file_name
            .extension()
            .map(|e| e.to_string_lossy().into_owned());

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = match (attempt, &extension) {
                (0, _) => file_name.to_path_buf(),
                (n, Some(ext)) => PathBuf::from(format!("{}-{}.{}", stem, n, ext)),
                (n, None) => PathBuf::from(format!("{}-{}", stem, n)),
            };
            let path = self.staging_dir.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("{} exists", path.display());
                }
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free destination name for {}", file_name.display()),
        ))
    }
}

fn copy_chunks(
    input: &mut impl Read,
    output: &mut impl Write,
    cancel: &CancellationFlag,
) -> std::result::Result<u64, CopyError> {
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        output.write_all(&buf[..n])?;
        total += n as u64;
    }

    output.flush()?;
    Ok(total)
}
