//! Path handling for load-command references.

use std::path::{Component, Path, PathBuf};

/// Install-name prefixes owned by the operating system.
pub const SYSTEM_PREFIXES: &[&str] = &["/usr/lib", "/System", "/usr/libexec", "/Library/Apple"];

/// A load-command path after placeholder substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expanded<'a> {
    /// A concrete path
    Path(PathBuf),
    /// An `@rpath/` reference; holds the part after the placeholder
    Rpath(&'a str),
    /// A placeholder the engine does not know
    Unknown,
}

/// Strips `token` when it is followed by a separator or ends the path.
fn strip_token<'a>(path: &'a str, token: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(token)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest.trim_start_matches('/'))
    } else {
        None
    }
}

/// Substitutes `@executable_path` and `@loader_path` with `executable_dir`.
///
/// Relative paths are taken relative to `executable_dir`.
pub fn expand<'a>(path: &'a str, executable_dir: &Path) -> Expanded<'a> {
    if let Some(rest) = strip_token(path, "@rpath") {
        return Expanded::Rpath(rest);
    }
    if let Some(rest) =
        strip_token(path, "@executable_path").or_else(|| strip_token(path, "@loader_path"))
    {
        return Expanded::Path(executable_dir.join(rest));
    }
    if path.starts_with('@') {
        return Expanded::Unknown;
    }
    Expanded::Path(executable_dir.join(path))
}

/// Resolves `.` and `..` components without touching the filesystem.
///
/// `..` at the root stays at the root.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Returns true if `path` (already normalised) lies under one of `prefixes`.
///
/// Prefixes match whole components, so `/usr/library` is not under `/usr/lib`.
pub fn is_under_any<P: AsRef<Path>>(path: &Path, prefixes: &[P]) -> bool {
    path.is_absolute() && prefixes.iter().any(|prefix| path.starts_with(prefix))
}

/// Joins the components of a relative path with `/`.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
