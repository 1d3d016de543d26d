//! Small sysfs text-attribute helpers
//!
//! Kernel attributes are newline-terminated text; every reader here trims
//! before parsing. Readers are best-effort: a missing or unreadable
//! attribute becomes `None` and the caller decides whether to log and skip.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::status::Status;

/// Read a sysfs attribute as trimmed text.
pub fn read_text(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(s) => Some(s.trim().to_string()),
        Err(_) => None,
    }
}

/// Read a sysfs attribute as a decimal integer.
pub fn read_u64(path: &Path) -> Option<u64> {
    read_text(path)?.parse().ok()
}

/// Read a sysfs attribute as a signed decimal integer.
///
/// md exposes "none" for an unassigned slave slot; callers map `None`
/// accordingly.
pub fn read_i64(path: &Path) -> Option<i64> {
    read_text(path)?.parse().ok()
}

/// Read a sysfs attribute as a hexadecimal integer (with or without `0x`).
pub fn read_hex(path: &Path) -> Option<u64> {
    let text = read_text(path)?;
    let text = text.strip_prefix("0x").unwrap_or(&text);
    u64::from_str_radix(text, 16).ok()
}

/// Write text to a sysfs attribute.
pub fn write_text(path: &Path, value: &str) -> Result<(), Status> {
    fs::write(path, value).map_err(|source| Status::FileWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve a path to its canonical sysfs form.
///
/// Canonical paths are the device identity: two scans that resolve to the
/// same canonical path are looking at the same device even if the short
/// name changed in between.
pub fn canonicalize(path: &Path) -> Option<PathBuf> {
    match fs::canonicalize(path) {
        Ok(p) => Some(p),
        Err(err) => {
            warn!("cannot canonicalize '{}': {}", path.display(), err);
            None
        }
    }
}

/// List a directory's entries, returning an empty list when unreadable.
pub fn list_dir(path: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = match fs::read_dir(path) {
        Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    };
    entries.sort();
    entries
}

/// True when `path` starts with at least one prefix from `prefixes`.
pub fn matches_prefix(path: &Path, prefixes: &[String]) -> bool {
    let text = path.to_string_lossy();
    prefixes.iter().any(|p| text.starts_with(p.as_str()))
}

/// Final component of a path as text.
pub fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn test_read_text_trims_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "active").unwrap();
        assert_eq!(read_text(&path).as_deref(), Some("active"));
    }

    #[test]
    fn test_read_hex_accepts_both_forms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sas_address");
        fs::write(&path, "0x5001b4d5123400ff\n").unwrap();
        assert_eq!(read_hex(&path), Some(0x5001b4d5_123400ff));
        fs::write(&path, "5001b4d5123400ff\n").unwrap();
        assert_eq!(read_hex(&path), Some(0x5001b4d5_123400ff));
    }

    #[test]
    fn test_matches_prefix() {
        let prefixes = vec!["/sys/devices/pci0000:00/0000:00:17.0".to_string()];
        assert!(matches_prefix(
            Path::new("/sys/devices/pci0000:00/0000:00:17.0/ata1"),
            &prefixes
        ));
        assert!(!matches_prefix(Path::new("/sys/devices/platform"), &prefixes));
    }

    #[test]
    fn test_missing_attribute_is_none() {
        assert_eq!(read_u64(Path::new("/nonexistent/attr")), None);
    }
}
