//! Bundle manifest (Info.plist) metadata.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// The manifest keys the engine cares about.
///
/// Unknown keys are ignored; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BundleInfo {
    /// CFBundleExecutable
    #[serde(rename(deserialize = "CFBundleExecutable"))]
    pub executable: Option<String>,
    /// CFBundleIdentifier
    #[serde(rename(deserialize = "CFBundleIdentifier"))]
    pub identifier: Option<String>,
    /// CFBundleName
    #[serde(rename(deserialize = "CFBundleName"))]
    pub name: Option<String>,
    /// CFBundleShortVersionString
    #[serde(rename(deserialize = "CFBundleShortVersionString"))]
    pub short_version: Option<String>,
}

impl BundleInfo {
    /// Returns the executable name, treating an empty value as missing.
    pub fn executable_name(&self) -> Option<&str> {
        self.executable.as_deref().filter(|name| !name.is_empty())
    }
}

/// Reads a manifest in either the XML or the binary property-list format.
pub fn read_bundle_info<P: AsRef<Path>>(manifest: P) -> Result<BundleInfo, plist::Error> {
    plist::from_file(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_file, write_info_plist};

    #[test]
    fn test_read_xml_and_binary() {
        let dir = tempfile::tempdir().unwrap();
        let entries = [
            ("CFBundleExecutable", "Demo"),
            ("CFBundleIdentifier", "com.example.demo"),
            ("CFBundleShortVersionString", "2.1"),
            ("UIDeviceFamily", "ignored"),
        ];

        for binary in [false, true] {
            let path = dir.path().join(format!("Info-{}.plist", binary));
            write_info_plist(&path, &entries, binary);

            let info = read_bundle_info(&path).unwrap();
            assert_eq!(info.executable_name(), Some("Demo"));
            assert_eq!(info.identifier.as_deref(), Some("com.example.demo"));
            assert_eq!(info.short_version.as_deref(), Some("2.1"));
            assert_eq!(info.name, None);
        }
    }

    #[test]
    fn test_empty_executable_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Info.plist");
        write_info_plist(&path, &[("CFBundleExecutable", "")], false);
        assert_eq!(read_bundle_info(&path).unwrap().executable_name(), None);
    }

    #[test]
    fn test_garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Info.plist");
        write_file(&path, b"<?xml version=\"1.0\"?><plist><dict><key>CFBundleExecutable</key>");
        assert!(read_bundle_info(&path).is_err());
    }
}
