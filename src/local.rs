//! Local file snapshots.
//!
//! [`LocalFileInfo`] is the watcher's view of one regular file under a
//! binding's local root: enough metadata to detect writes, pair renames
//! and drive uploads.

use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// Snapshot of one local file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub mod_time: SystemTime,
    pub mode: u32,
    pub is_dir: bool,
    /// Reserved for content-based dedup; never computed by the watcher.
    pub etag: Option<String>,
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
}

impl LocalFileInfo {
    pub fn from_metadata(path: impl Into<PathBuf>, meta: &Metadata) -> Self {
        Self {
            path: path.into(),
            size: meta.len(),
            mod_time: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            #[cfg(unix)]
            mode: meta.mode(),
            #[cfg(not(unix))]
            mode: 0,
            is_dir: meta.is_dir(),
            etag: None,
            #[cfg(unix)]
            dev: meta.dev(),
            #[cfg(unix)]
            ino: meta.ino(),
        }
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new(""))
    }

    pub fn file_name(&self) -> &str {
        self.path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
    }
}

impl fmt::Display for LocalFileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "path:{}, modTime:{:?}, size:{}, isDir:{}",
            self.path.display(),
            self.mod_time,
            self.size,
            self.is_dir
        )
    }
}

/// Whether two snapshots refer to the same underlying file.
///
/// Device and inode identity on unix. Elsewhere the comparison degrades to
/// a (size, mode, type, mtime) tuple, which can pair two distinct files
/// that happen to match; rename detection is best-effort there.
#[cfg(unix)]
pub fn same_file(a: &LocalFileInfo, b: &LocalFileInfo) -> bool {
    a.dev == b.dev && a.ino == b.ino
}

#[cfg(not(unix))]
pub fn same_file(a: &LocalFileInfo, b: &LocalFileInfo) -> bool {
    a.size == b.size && a.mode == b.mode && a.is_dir == b.is_dir && a.mod_time == b.mod_time
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_keeps_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("a.txt");
        std::fs::write(&old, b"payload").expect("write");
        let before = LocalFileInfo::from_metadata(&old, &std::fs::metadata(&old).expect("stat"));

        let new = dir.path().join("b.txt");
        std::fs::rename(&old, &new).expect("rename");
        let after = LocalFileInfo::from_metadata(&new, &std::fs::metadata(&new).expect("stat"));

        assert!(same_file(&before, &after));
        assert!(!before.is_dir);
        assert_eq!(after.file_name(), "b.txt");
    }
}
