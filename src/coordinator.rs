//! Request orchestration: locate, parse, classify, extract.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bundle::{open_bundle, BundleDescriptor};
use crate::cancel::{CancelOnDrop, CancellationFlag};
use crate::dylib::resolve::normalize_lexically;
use crate::dylib::{
    ClassifierConfig, DylibCandidate, DylibClass, DylibClassifier, DylibExtractor,
    ExtractedDylib, ProgressCallback,
};
use crate::error::{Error, Result, UnresolvedReferenceWarning};
use crate::macho::{ArchitectureSlice, LoadCommandParser, ParsedExecutable, HOST_CPU_TYPE};

// =============================================================================
// Configuration
// =============================================================================

/// Settings shared by every request of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionConfig {
    /// Directory under which each request creates its own staging directory
    pub staging_root: PathBuf,
    /// CPU type preferred when selecting a fat slice
    pub preferred_cpu: Option<u32>,
    /// Classification policy
    pub classifier: ClassifierConfig,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            staging_root: env::temp_dir().join("tweakex"),
            preferred_cpu: HOST_CPU_TYPE,
            classifier: ClassifierConfig::default(),
        }
    }
}

impl ExtractionConfig {
    /// Sets the directory request staging directories are created under.
    pub fn with_staging_root(mut self, staging_root: impl Into<PathBuf>) -> Self {
        self.staging_root = staging_root.into();
        self
    }

    /// Sets the CPU type preferred in fat executables.
    pub fn with_preferred_cpu(mut self, cpu: Option<u32>) -> Self {
        self.preferred_cpu = cpu;
        self
    }

    /// Replaces the classification policy.
    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }
}

// =============================================================================
// Results
// =============================================================================

/// Classification of a bundle without copying anything.
#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    /// The located bundle
    pub bundle: BundleDescriptor,
    /// The parsed main executable
    pub executable: ParsedExecutable,
    /// Every dylib reference with its classification, in declaration order
    pub candidates: Vec<DylibCandidate>,
}

/// Outcome of a successful extraction request.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    /// The located bundle
    pub bundle: BundleDescriptor,
    /// Slice whose load commands were used
    pub slice: ArchitectureSlice,
    /// Every dylib reference with its classification, in declaration order
    pub candidates: Vec<DylibCandidate>,
    /// One record per injected dylib
    pub extracted: Vec<ExtractedDylib>,
    /// References that could not be resolved
    pub unresolved: Vec<UnresolvedReferenceWarning>,
    /// Request-scoped staging directory (exists only if something was copied)
    pub staging_dir: PathBuf,
}

impl ExtractionReport {
    /// Number of successful copies.
    pub fn extracted_count(&self) -> usize {
        self.extracted.iter().filter(|d| d.is_extracted()).count()
    }

    /// Number of failed copies.
    pub fn failed_count(&self) -> usize {
        self.extracted.len() - self.extracted_count()
    }

    /// Number of references classified as `class`.
    pub fn count_class(&self, class: DylibClass) -> usize {
        self.candidates.iter().filter(|c| c.class == class).count()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Runs extraction requests.
///
/// Requests share no mutable state; each writes into its own
/// `<staging root>/<bundle stem>-<uuid>` directory.
#[derive(Clone, Default)]
pub struct ExtractionCoordinator {
    config: Arc<ExtractionConfig>,
    progress: Option<Arc<ProgressCallback>>,
}

impl std::fmt::Debug for ExtractionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionCoordinator")
            .field("config", &self.config)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl ExtractionCoordinator {
    /// Creates a coordinator with the given configuration.
    pub fn new(config: ExtractionConfig) -> Self {
        Self {
            config: Arc::new(config),
            progress: None,
        }
    }

    /// Sets a callback invoked after every attempted copy.
    pub fn with_progress(mut self, progress: Arc<ProgressCallback>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Locates, parses and classifies without copying.
    pub fn inspect<P: AsRef<Path>>(&self, bundle_root: P) -> Result<Inspection> {
        let bundle = open_bundle(bundle_root)?;
        info!("Bundle {} -> {}", bundle.root.display(), bundle.executable.display());

        let executable = LoadCommandParser::new()
            .with_preferred_cpu(self.config.preferred_cpu)
            .parse_file(&bundle.executable)?;
        info!(
            "Parsed {} slice: {} dylib references, {} search paths",
            executable.slice.arch_name(),
            executable.entries.len(),
            executable.rpaths.len()
        );

        let candidates = DylibClassifier::new(&bundle, self.config.classifier.clone())
            .with_rpaths(executable.rpaths.iter().cloned())
            .classify(&executable.entries);

        Ok(Inspection {
            bundle,
            executable,
            candidates,
        })
    }

    /// Extracts the injected dylibs of the bundle at `bundle_root`.
    pub fn extract_injected_dylibs<P: AsRef<Path>>(&self, bundle_root: P) -> Result<ExtractionReport> {
        self.extract_with_cancel(bundle_root, &CancellationFlag::new())
    }

    /// Like [`extract_injected_dylibs`](Self::extract_injected_dylibs), stopping
    /// with [`Error::Cancelled`] once `cancel` is raised.
    pub fn extract_with_cancel<P: AsRef<Path>>(
        &self,
        bundle_root: P,
        cancel: &CancellationFlag,
    ) -> Result<ExtractionReport> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let Inspection {
            bundle,
            executable,
            candidates,
        } = self.inspect(bundle_root)?;

        let staging_root = absolute_staging_root(&self.config.staging_root);
        if staging_root.starts_with(&bundle.root) {
            return Err(Error::StagingInsideBundle {
                staging: staging_root,
                bundle: bundle.root,
            });
        }

        let staging_dir = staging_root.join(format!("{}-{}", bundle.stem(), Uuid::new_v4()));
        debug!("Staging into {}", staging_dir.display());

        let mut extractor = DylibExtractor::new(&staging_dir);
        if let Some(progress) = &self.progress {
            extractor = extractor.with_progress(Arc::clone(progress));
        }
        let batch = extractor.extract(&candidates, cancel)?;

        info!(
            "{}: {} extracted, {} unresolved",
            bundle.stem(),
            batch.extracted.iter().filter(|d| d.is_extracted()).count(),
            batch.unresolved.len()
        );

        Ok(ExtractionReport {
            bundle,
            slice: executable.slice,
            candidates,
            extracted: batch.extracted,
            unresolved: batch.unresolved,
            staging_dir,
        })
    }

    /// Runs the request on the blocking pool.
    ///
    /// Dropping the returned future raises `cancel`, which stops the request
    /// at its next cancellation check.
    pub async fn extract_async(
        &self,
        bundle_root: impl Into<PathBuf>,
        cancel: CancellationFlag,
    ) -> Result<ExtractionReport> {
        let this = self.clone();
        let bundle_root = bundle_root.into();
        let mut guard = CancelOnDrop::new(cancel.clone());

        let joined =
            tokio::task::spawn_blocking(move || this.extract_with_cancel(&bundle_root, &cancel))
                .await;
        guard.disarm();

        joined.map_err(|e| Error::TaskFailed(e.to_string()))?
    }
}

/// Makes the staging root absolute and resolves symlinks in its existing part.
fn absolute_staging_root(staging_root: &Path) -> PathBuf {
    let absolute = if staging_root.is_absolute() {
        staging_root.to_path_buf()
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(staging_root))
            .unwrap_or_else(|_| staging_root.to_path_buf())
    };
    let absolute = normalize_lexically(&absolute);

    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return missing
                .iter()
                .rev()
                .fold(canonical, |path, part| path.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

/// Extracts the injected dylibs of the bundle at `bundle_root` into a new
/// directory under `staging_root`, with the default policy.
pub fn extract_injected_dylibs<P: AsRef<Path>, S: Into<PathBuf>>(
    bundle_root: P,
    staging_root: S,
) -> Result<ExtractionReport> {
    ExtractionCoordinator::new(ExtractionConfig::default().with_staging_root(staging_root))
        .extract_injected_dylibs(bundle_root)
}
