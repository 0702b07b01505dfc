//! Classification of dylib references as system, injected or first-party.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use super::resolve::{expand, is_under_any, normalize_lexically, to_slash, Expanded, SYSTEM_PREFIXES};
use crate::bundle::BundleDescriptor;
use crate::error::{UnresolvedReason, UnresolvedReferenceWarning};
use crate::macho::LoadCommandEntry;

// =============================================================================
// Outcomes
// =============================================================================

/// Classification of one dylib reference. Exactly one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "class", content = "reason", rename_all = "snake_case")]
pub enum DylibClass {
    /// Provided by the operating system
    System,
    /// Added to the bundle after the fact; extracted
    Injected,
    /// Shipped with the application; reported, never extracted
    FirstParty,
    /// Could not be mapped to a file inside the bundle
    Unresolved(UnresolvedReason),
}

/// A load-command entry together with its classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DylibCandidate {
    /// The parsed reference
    pub entry: LoadCommandEntry,
    /// Its classification
    pub class: DylibClass,
    /// Canonical on-disk path, for references resolved inside the bundle
    pub resolved: Option<PathBuf>,
}

impl DylibCandidate {
    /// Returns true if the candidate should be extracted.
    #[inline]
    pub fn is_injected(&self) -> bool {
        self.class == DylibClass::Injected
    }

    /// Returns the warning for an unresolved candidate.
    pub fn unresolved_warning(&self) -> Option<UnresolvedReferenceWarning> {
        match self.class {
            DylibClass::Unresolved(reason) => Some(UnresolvedReferenceWarning {
                path: self.entry.path.clone(),
                reason,
            }),
            _ => None,
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Classification policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// Absolute prefixes whose libraries belong to the operating system
    pub system_prefixes: Vec<PathBuf>,
    /// Subtrees of the content directory whose libraries count as injected
    pub injection_subtrees: Vec<PathBuf>,
    /// Whether files directly inside the executable's directory count as injected
    pub executable_dir_is_injection_dir: bool,
    /// Content-relative path prefixes of libraries shipped with the application
    pub first_party_prefixes: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            system_prefixes: SYSTEM_PREFIXES.iter().map(PathBuf::from).collect(),
            injection_subtrees: vec![PathBuf::from("Frameworks"), PathBuf::from("PlugIns")],
            executable_dir_is_injection_dir: true,
            first_party_prefixes: vec!["Frameworks/libswift".to_string()],
        }
    }
}

impl ClassifierConfig {
    /// Adds a system install-name prefix.
    pub fn with_system_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.system_prefixes.push(prefix.into());
        self
    }

    /// Adds a content-relative injection subtree.
    pub fn with_injection_subtree(mut self, subtree: impl Into<PathBuf>) -> Self {
        self.injection_subtrees.push(subtree.into());
        self
    }

    /// Adds a content-relative first-party prefix.
    pub fn with_first_party_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.first_party_prefixes.push(prefix.into());
        self
    }

    /// Sets whether the executable's own directory is an injection directory.
    pub fn with_executable_dir(mut self, enabled: bool) -> Self {
        self.executable_dir_is_injection_dir = enabled;
        self
    }
}

// =============================================================================
// Classifier
// =============================================================================

enum Resolution {
    System,
    Found(PathBuf),
    Unresolved(UnresolvedReason),
}

/// Classifies the dylib references of one bundle's executable.
///
/// Only reads the filesystem; classifying the same entries twice against
/// unchanged files gives identical results.
#[derive(Debug, Clone)]
pub struct DylibClassifier<'a> {
    bundle: &'a BundleDescriptor,
    config: ClassifierConfig,
    rpaths: Vec<String>,
}

impl<'a> DylibClassifier<'a> {
    /// Creates a classifier for `bundle`.
    pub fn new(bundle: &'a BundleDescriptor, config: ClassifierConfig) -> Self {
        Self {
            bundle,
            config,
            rpaths: Vec::new(),
        }
    }

    /// Sets the LC_RPATH search list used for `@rpath/` references.
    pub fn with_rpaths(mut self, rpaths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.rpaths = rpaths.into_iter().map(Into::into).collect();
        self
    }

    /// Classifies every entry, preserving order.
    pub fn classify(&self, entries: &[LoadCommandEntry]) -> Vec<DylibCandidate> {
        entries.iter().map(|entry| self.classify_entry(entry)).collect()
    }

    /// Classifies a single entry.
    pub fn classify_entry(&self, entry: &LoadCommandEntry) -> DylibCandidate {
        let (class, resolved) = match self.resolve(&entry.path) {
            Resolution::System => (DylibClass::System, None),
            Resolution::Unresolved(reason) => (DylibClass::Unresolved(reason), None),
            Resolution::Found(path) => (self.place(&path), Some(path)),
        };

        debug!("{} -> {:?}", entry.path, class);
        DylibCandidate {
            entry: entry.clone(),
            class,
            resolved,
        }
    }

    fn resolve(&self, recorded: &str) -> Resolution {
        match expand(recorded, self.bundle.executable_dir()) {
            Expanded::Path(path) => self.resolve_path(&path),
            Expanded::Rpath(rest) => self.resolve_rpath(rest),
            Expanded::Unknown => Resolution::Unresolved(UnresolvedReason::UnknownPlaceholder),
        }
    }

    /// Tries each search path in declaration order.
    ///
    /// An in-bundle file wins over any earlier system expansion; `System` is
    /// only returned when no search path leads to a file in the bundle.
    fn resolve_rpath(&self, rest: &str) -> Resolution {
        let mut system = false;
        for rpath in &self.rpaths {
            let base = match expand(rpath, self.bundle.executable_dir()) {
                Expanded::Path(base) => base,
                _ => {
                    debug!("Skipping unusable search path {}", rpath);
                    continue;
                }
            };

            match self.resolve_path(&base.join(rest)) {
                Resolution::System => system = true,
                Resolution::Unresolved(reason) => {
                    debug!("@rpath/{} not under {}: {}", rest, rpath, reason);
                }
                found @ Resolution::Found(_) => return found,
            }
        }

        if system {
            Resolution::System
        } else {
            Resolution::Unresolved(UnresolvedReason::NoMatchingRpath)
        }
    }

    fn resolve_path(&self, path: &Path) -> Resolution {
        let normalized = normalize_lexically(path);
        if !normalized.starts_with(&self.bundle.root) {
            return if is_under_any(&normalized, &self.config.system_prefixes) {
                Resolution::System
            } else {
                Resolution::Unresolved(UnresolvedReason::OutsideBundle)
            };
        }

        // Symlinks inside the bundle may still point elsewhere.
        let canonical = match fs::canonicalize(&normalized) {
            Ok(canonical) => canonical,
            Err(e) => {
                debug!("Cannot resolve {}: {}", normalized.display(), e);
                return Resolution::Unresolved(UnresolvedReason::MissingFile);
            }
        };
        if !canonical.starts_with(&self.bundle.root) {
            return Resolution::Unresolved(UnresolvedReason::OutsideBundle);
        }
        if !canonical.is_file() {
            return Resolution::Unresolved(UnresolvedReason::NotAFile);
        }

        Resolution::Found(canonical)
    }

    /// Decides between injected and first-party for a resolved file.
    fn place(&self, path: &Path) -> DylibClass {
        let content_dir = self.bundle.content_dir();

        if let Ok(relative) = path.strip_prefix(&content_dir) {
            let relative = to_slash(relative);
            if self
                .config
                .first_party_prefixes
                .iter()
                .any(|prefix| relative.starts_with(prefix.as_str()))
            {
                return DylibClass::FirstParty;
            }
        }

        let in_executable_dir = self.config.executable_dir_is_injection_dir
            && path.parent() == Some(self.bundle.executable_dir());
        let in_subtree = self
            .config
            .injection_subtrees
            .iter()
            .any(|subtree| path.starts_with(content_dir.join(subtree)));

        if in_executable_dir || in_subtree {
            DylibClass::Injected
        } else {
            DylibClass::FirstParty
        }
    }
}

/// Classifies `entries` against `bundle` with the default policy and no
/// search paths.
pub fn classify(entries: &[LoadCommandEntry], bundle: &BundleDescriptor) -> Vec<DylibCandidate> {
    DylibClassifier::new(bundle, ClassifierConfig::default()).classify(entries)
}
