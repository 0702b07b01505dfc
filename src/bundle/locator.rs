//! Main executable discovery.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use super::info::{read_bundle_info, BundleInfo};
use crate::error::BundleStructureError;

/// Name of the bundle manifest.
pub const INFO_PLIST: &str = "Info.plist";

/// Directory layout of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleLayout {
    /// iOS style: manifest and executable at the root
    Flat,
    /// macOS style: `Contents/Info.plist` and `Contents/MacOS/<name>`
    Contents,
}

impl BundleLayout {
    /// Detects the layout of the bundle at `root`.
    pub fn detect(root: &Path) -> Self {
        let contents = root.join("Contents");
        if contents.join(INFO_PLIST).is_file() || contents.join("MacOS").is_dir() {
            BundleLayout::Contents
        } else {
            BundleLayout::Flat
        }
    }

    /// Directory holding the manifest and the `Frameworks`/`PlugIns` trees.
    pub fn content_dir(self, root: &Path) -> PathBuf {
        match self {
            BundleLayout::Flat => root.to_path_buf(),
            BundleLayout::Contents => root.join("Contents"),
        }
    }

    /// Directory holding the main executable.
    pub fn executable_dir(self, root: &Path) -> PathBuf {
        match self {
            BundleLayout::Flat => root.to_path_buf(),
            BundleLayout::Contents => root.join("Contents").join("MacOS"),
        }
    }
}

/// A located bundle. Paths are canonical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleDescriptor {
    /// Canonical bundle root
    pub root: PathBuf,
    /// Canonical path of the main executable, inside `root`
    pub executable: PathBuf,
    /// Detected layout
    pub layout: BundleLayout,
    /// Manifest metadata, if a readable manifest exists
    pub info: Option<BundleInfo>,
}

impl BundleDescriptor {
    /// Directory holding the manifest and the `Frameworks`/`PlugIns` trees.
    pub fn content_dir(&self) -> PathBuf {
        self.layout.content_dir(&self.root)
    }

    /// Directory the `@executable_path` placeholder refers to.
    pub fn executable_dir(&self) -> &Path {
        self.executable.parent().unwrap_or(&self.root)
    }

    /// Returns `path` relative to the bundle root, if it lies inside it.
    pub fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.root).ok()
    }

    /// File stem of the bundle directory (`Demo` for `Demo.app`).
    pub fn stem(&self) -> String {
        bundle_stem(&self.root).unwrap_or_else(|| "bundle".to_string())
    }
}

/// The bundle directory name without its `.app` extension.
fn bundle_stem(root: &Path) -> Option<String> {
    let name = root.file_name()?.to_str()?;
    let stem = name.strip_suffix(".app").unwrap_or(name);
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Manifest executable names must name a single file in the executable directory.
fn is_valid_executable_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !name.contains(['/', '\\', '\0'])
}

fn read_manifest(content_dir: &Path) -> Option<BundleInfo> {
    let manifest = content_dir.join(INFO_PLIST);
    if !manifest.is_file() {
        debug!("No manifest at {}", manifest.display());
        return None;
    }

    match read_bundle_info(&manifest) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!("Ignoring unreadable manifest {}: {}", manifest.display(), e);
            None
        }
    }
}

/// Locates the bundle at `bundle_root` and its main executable.
pub fn open_bundle<P: AsRef<Path>>(bundle_root: P) -> Result<BundleDescriptor, BundleStructureError> {
    let given = bundle_root.as_ref();
    let io_err = |path: &Path, source: io::Error| BundleStructureError::Io {
        path: path.to_path_buf(),
        source,
    };

    match fs::metadata(given) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(BundleStructureError::NotADirectory { path: given.to_path_buf() }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BundleStructureError::NotADirectory { path: given.to_path_buf() })
        }
        Err(e) => return Err(io_err(given, e)),
    }

    let root = fs::canonicalize(given).map_err(|e| io_err(given, e))?;
    let layout = BundleLayout::detect(&root);
    let info = read_manifest(&layout.content_dir(&root));

    let declared = info.as_ref().and_then(BundleInfo::executable_name);
    let name = match declared {
        Some(name) if !is_valid_executable_name(name) => {
            return Err(BundleStructureError::InvalidExecutableName {
                name: name.to_string(),
            })
        }
        Some(name) => name.to_string(),
        None => bundle_stem(&root).ok_or_else(|| BundleStructureError::NoExecutable {
            root: root.clone(),
        })?,
    };

    let candidate = layout.executable_dir(&root).join(&name);
    debug!("Main executable candidate: {}", candidate.display());

    let meta = match fs::metadata(&candidate) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(if declared.is_some() {
                BundleStructureError::ExecutableMissing { path: candidate }
            } else {
                BundleStructureError::NoExecutable { root }
            });
        }
        Err(e) => return Err(io_err(&candidate, e)),
    };
    if !meta.is_file() {
        return Err(BundleStructureError::NotARegularFile { path: candidate });
    }

    let executable = fs::canonicalize(&candidate).map_err(|e| io_err(&candidate, e))?;
    if !executable.starts_with(&root) {
        return Err(BundleStructureError::OutsideBundle { path: candidate });
    }

    Ok(BundleDescriptor {
        root,
        executable,
        layout,
        info,
    })
}

/// Returns the canonical path of the main executable of the bundle at `bundle_root`.
pub fn locate_main_executable<P: AsRef<Path>>(
    bundle_root: P,
) -> Result<PathBuf, BundleStructureError> {
    open_bundle(bundle_root).map(|bundle| bundle.executable)
}
