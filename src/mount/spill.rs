//! Write spill files.
//!
//! Writes through the mounted view buffer into a local temp file until
//! flush uploads it. Spill paths are deterministic (the md5 of the
//! mount-scoped node path under `<tmp>/osssync/`), so a reopened handle
//! finds the bytes an earlier writer left behind.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::config::APP_ID;
use crate::error::Result;

/// Root of the spill area.
pub fn spill_dir() -> PathBuf {
    std::env::temp_dir().join(APP_ID)
}

/// Deterministic spill path for one node of one mount.
pub fn spill_path(mount_id: &str, key: &str) -> PathBuf {
    let digest = md5::compute(format!("{mount_id}/{key}").as_bytes());
    spill_dir().join(format!("{digest:x}"))
}

/// Best-effort removal of spill files a previous process left behind.
/// Runs once per process, before the first mount is live; spill files of
/// a running process are each bound to a node mutex.
pub fn cleanup_spill_dir() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = std::fs::remove_dir_all(spill_dir());
    });
}

/// One open spill file.
#[derive(Debug)]
pub struct Spill {
    path: PathBuf,
    file: File,
}

impl Spill {
    /// Open the spill for this node, seeding it with `initial` when no
    /// earlier writer left bytes at the deterministic path.
    pub async fn open(path: PathBuf, initial: Option<&[u8]>) -> Result<Self> {
        tokio::fs::create_dir_all(spill_dir()).await?;
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        let mut file =
            OpenOptions::new().read(true).write(true).create(true).open(&path).await?;
        if !exists {
            if let Some(bytes) = initial {
                file.write_all(bytes).await?;
                file.seek(SeekFrom::Start(0)).await?;
            }
        }
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    pub async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = self.file.seek(SeekFrom::End(0)).await?;
        if offset >= end {
            return Ok(Vec::new());
        }
        let len = len.min((end - offset) as usize);
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Flush buffered writes and report (size, mtime) of the spill.
    pub async fn finish(&mut self) -> Result<(u64, std::time::SystemTime)> {
        self.file.flush().await?;
        let meta = self.file.metadata().await?;
        let mtime = meta.modified().unwrap_or_else(|_| std::time::SystemTime::now());
        Ok((meta.len(), mtime))
    }

    /// Close the handle and delete the file.
    pub async fn discard(self) -> Result<()> {
        drop(self.file);
        tokio::fs::remove_file(&self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spill_round_trips_offset_writes() {
        let path = spill_path("test-mount", "u/p/a.txt");
        let _ = tokio::fs::remove_file(&path).await;

        let mut spill = Spill::open(path.clone(), Some(b"0123456789")).await.expect("open");
        spill.write_at(3, b"XYZ").await.expect("write");
        let read = spill.read_at(0, 10).await.expect("read");
        assert_eq!(read, b"012XYZ6789");

        let (size, _) = spill.finish().await.expect("finish");
        assert_eq!(size, 10);
        spill.discard().await.expect("discard");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn reopened_spill_keeps_earlier_bytes() {
        let path = spill_path("test-mount", "u/p/b.txt");
        let _ = tokio::fs::remove_file(&path).await;

        let mut first = Spill::open(path.clone(), Some(b"seed")).await.expect("open");
        first.write_at(0, b"live").await.expect("write");
        drop(first);

        let mut second = Spill::open(path.clone(), Some(b"ignored")).await.expect("reopen");
        let read = second.read_at(0, 8).await.expect("read");
        assert_eq!(read, b"live");
        second.discard().await.expect("discard");
    }
}
