//! Remote filesystem adapter.
//!
//! [`RemoteFs`] translates between local path conventions and the object
//! store's key space, executes all remote I/O for one binding, and
//! multiplexes transfer progress onto a single bounded channel. It holds
//! no state beyond the binding's root/prefix mapping; one instance is
//! owned by each handler and shared read-only with that binding's mounted
//! view.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::local::LocalFileInfo;
use crate::progress::{ProgressEvent, ProgressSink, TransferOp, PROGRESS_BUFFER};
use crate::store::{ListPage, ListRequest, MultipartSpec, ObjectStore, RemoteObject};

/// Files at or above this size upload as resumable multipart.
pub const BIG_FILE_THRESHOLD: u64 = 500 << 20;
/// Baseline multipart part size.
pub const DEFAULT_PART_SIZE: u64 = 500 << 10;
/// Hard limit on parts per upload.
pub const MAX_PARTS: u64 = 10_000;
/// Part count the size-derived part size aims for.
pub const MIN_PARTS: u64 = 1000;
/// Listing page size for unbounded iteration.
pub const MAX_KEYS: usize = 1000;
/// Parts uploaded concurrently within one multipart upload.
pub const MULTIPART_PARALLEL: usize = 3;
/// Sidecar directory for resumable upload state.
pub const UPLOAD_CHECKPOINT_DIR: &str = ".osssync-upload";
/// Sidecar directory for resumable download state.
pub const DOWNLOAD_CHECKPOINT_DIR: &str = ".osssync-download";

/// Remote namespace of one binding.
pub struct RemoteFs {
    store: Arc<dyn ObjectStore>,
    local_root: PathBuf,
    /// Normalized as `clean(prefix) + "/"`, or empty for the bucket root.
    prefix: String,
    progress_tx: async_channel::Sender<ProgressEvent>,
    progress_rx: async_channel::Receiver<ProgressEvent>,
}

impl std::fmt::Debug for RemoteFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFs")
            .field("local_root", &self.local_root)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RemoteFs {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        local_root: impl Into<PathBuf>,
        prefix: &str,
    ) -> Self {
        let (progress_tx, progress_rx) = async_channel::bounded(PROGRESS_BUFFER);
        Self {
            store,
            local_root: local_root.into(),
            prefix: normalize_prefix(prefix),
            progress_tx,
            progress_rx,
        }
    }

    /// Transfer progress of every operation issued through this instance.
    /// Consumers must keep draining; the channel is bounded.
    pub fn events(&self) -> async_channel::Receiver<ProgressEvent> {
        self.progress_rx.clone()
    }

    /// Close the progress channel. Callers stop submitting operations
    /// before closing.
    pub fn close(&self) {
        self.progress_tx.close();
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn sink(&self, op: TransferOp, src: &str, dst: &str) -> ProgressSink {
        ProgressSink::new(self.progress_tx.clone(), op, src, dst)
    }

    /// Metadata of one key.
    pub async fn open(&self, key: &str, cancel: &CancellationToken) -> Result<RemoteObject> {
        self.store.head(key, cancel).await
    }

    /// Conditional metadata fetch; `Error::NotModified` when `etag` still
    /// matches.
    pub async fn open_if_changed(
        &self,
        key: &str,
        etag: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteObject> {
        if etag.is_empty() {
            return self.store.head(key, cancel).await;
        }
        self.store.head_if_none_match(key, etag, cancel).await
    }

    /// Full object read.
    pub async fn read_all(&self, key: &str, cancel: &CancellationToken) -> Result<Bytes> {
        self.store.get(key, cancel).await
    }

    /// Ranged read. `size` is the caller's last known object size, used to
    /// clamp tail reads before they reach the store.
    pub async fn read_at(
        &self,
        key: &str,
        size: u64,
        offset: u64,
        len: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if offset >= size {
            return Ok(Bytes::new());
        }
        let len = len.min(size - offset);
        self.store.get_range(key, offset, len, cancel).await
    }

    /// Single-shot write from memory.
    pub async fn upload_bytes(
        &self,
        key: &str,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let sink = self.sink(TransferOp::Upload, "", key);
        match self.store.put(key, data, &sink, cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                sink.failed().await;
                Err(e)
            }
        }
    }

    /// Single-shot write from a local file. Used by the mounted view to
    /// flush write spills.
    pub async fn upload_from_path(
        &self,
        key: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let sink = self.sink(TransferOp::Upload, &path.to_string_lossy(), key);
        match self.store.put_from_file(key, path, &sink, cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                sink.failed().await;
                Err(e)
            }
        }
    }

    /// Mirror one watched local file to its remote key.
    ///
    /// A remote copy newer than the local snapshot makes this a no-op.
    /// Large files switch to resumable multipart with the checkpoint
    /// sidecar next to the source, so an interrupted upload resumes on the
    /// next tick instead of restarting from byte zero.
    pub async fn upload_file(
        &self,
        info: &LocalFileInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = self.remote_key_for(&info.path)?;
        if let Ok(remote) = self.open(&key, cancel).await {
            if remote.last_modified > info.mod_time {
                debug!(%key, "remote newer than local, skipping upload");
                return Ok(());
            }
        }

        let src = info.path.to_string_lossy().into_owned();
        let sink = self.sink(TransferOp::Upload, &src, &key);
        let result = if info.size >= BIG_FILE_THRESHOLD {
            let spec = MultipartSpec {
                part_size: part_size(info.size),
                parallel: MULTIPART_PARALLEL,
                checkpoint_dir: upload_checkpoint_dir(&info.path),
            };
            self.store.put_multipart(&key, &info.path, &spec, &sink, cancel).await
        } else {
            self.store.put_from_file(&key, &info.path, &sink, cancel).await
        };
        if result.is_err() {
            sink.failed().await;
        }
        result
    }

    /// Batch delete. Progress reports Completed for keys the store
    /// deleted and Failed for requested keys it did not hold.
    pub async fn remove(
        &self,
        keys: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let deleted = self.store.delete(keys, cancel).await?;
        for key in &deleted {
            self.sink(TransferOp::Remove, key, "").completed(0).await;
        }
        for key in keys {
            if !deleted.contains(key) {
                self.sink(TransferOp::Remove, key, "").failed().await;
            }
        }
        Ok(deleted)
    }

    /// Delete every key under `prefix/`, page by page.
    pub async fn remove_all(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        let mut pager = self.read_dir(prefix, false);
        while !pager.completed() {
            let entries = pager.next_page(MAX_KEYS, cancel).await?;
            if entries.is_empty() {
                break;
            }
            let keys: Vec<String> = entries.into_iter().map(|e| e.key).collect();
            removed.extend(self.remove(&keys, cancel).await?);
        }
        Ok(removed)
    }

    /// Server-side copy.
    pub async fn copy(&self, src: &str, dst: &str, cancel: &CancellationToken) -> Result<()> {
        let sink = self.sink(TransferOp::Copy, src, dst);
        match self.store.copy(src, dst, &sink, cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                sink.failed().await;
                Err(e)
            }
        }
    }

    /// Copy then delete. The source is untouched when the copy fails;
    /// after a successful copy the destination is authoritative and a
    /// failed delete should be retried against the source only.
    pub async fn rename(&self, src: &str, dst: &str, cancel: &CancellationToken) -> Result<()> {
        self.copy(src, dst, cancel).await?;
        self.remove(std::slice::from_ref(&src.to_owned()), cancel).await?;
        Ok(())
    }

    /// Rename a directory subtree: the source object itself when present,
    /// then every key under `src/` with its suffix re-rooted onto `dst`.
    pub async fn rename_dir(
        &self,
        src: &str,
        dst: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.open(src, cancel).await.is_ok() {
            self.copy(src, dst, cancel).await?;
        }
        let src_dir = dir_key(src);
        let dst_dir = dir_key(dst);
        let mut moved = Vec::new();
        let mut pager = self.read_dir(src, false);
        while !pager.completed() {
            let entries = pager.next_page(MAX_KEYS, cancel).await?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                let suffix = &entry.key[src_dir.len()..];
                self.copy(&entry.key, &format!("{dst_dir}{suffix}"), cancel).await?;
                moved.push(entry.key);
            }
        }
        if self.open(src, cancel).await.is_ok() {
            moved.push(src.to_owned());
        }
        if !moved.is_empty() {
            self.remove(&moved, cancel).await?;
        }
        Ok(())
    }

    /// Checkpointed download of one object into `local_dir`.
    pub async fn download(
        &self,
        key: &str,
        local_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let name = key.trim_end_matches('/').rsplit('/').next().unwrap_or(key);
        let target = local_dir.join(name);
        let checkpoint = local_dir.join(DOWNLOAD_CHECKPOINT_DIR).join(name);
        let sink = self.sink(TransferOp::Download, key, &target.to_string_lossy());
        match self.store.get_to_file(key, &target, &checkpoint, &sink, cancel).await {
            Ok(()) => Ok(target),
            Err(e) => {
                sink.failed().await;
                Err(e)
            }
        }
    }

    /// Page cursor over the children of `prefix`. With `delimited`, only
    /// immediate children are returned and sub-directories surface as
    /// synthetic directory entries.
    pub fn read_dir(&self, prefix: &str, delimited: bool) -> DirPager {
        DirPager {
            store: Arc::clone(&self.store),
            prefix: dir_key(prefix),
            delimiter: delimited.then(|| "/".to_owned()),
            token: None,
            completed: false,
        }
    }

    /// Map an absolute local path under the binding's root to its remote
    /// key.
    pub fn remote_key_for(&self, path: &Path) -> Result<String> {
        let relative = path.strip_prefix(&self.local_root).map_err(|_| Error::OutsideRoot {
            path: path.to_owned(),
            root: self.local_root.clone(),
        })?;
        Ok(self.add_prefix(&path_to_key(relative)))
    }

    /// Strip the configured prefix from a full key.
    pub fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.prefix).unwrap_or(key)
    }

    /// Join the configured prefix onto a relative key.
    pub fn add_prefix(&self, relative: &str) -> String {
        let relative = relative.trim_start_matches('/');
        format!("{}{relative}", self.prefix)
    }
}

/// Page cursor over one listed prefix.
///
/// The continuation token is retained only while the store reports the
/// listing as truncated; a page with `is_truncated=false` completes the
/// cursor and clears the token.
pub struct DirPager {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    delimiter: Option<String>,
    token: Option<String>,
    completed: bool,
}

impl DirPager {
    /// Fetch up to `n` entries. Synthetic directory entries follow the
    /// file entries of the page.
    pub async fn next_page(
        &mut self,
        n: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteObject>> {
        if self.completed {
            return Ok(Vec::new());
        }
        let request = ListRequest {
            prefix: self.prefix.clone(),
            delimiter: self.delimiter.clone(),
            continuation_token: self.token.take(),
            start_after: None,
            max_keys: n,
        };
        let page: ListPage = self.store.list(&request, cancel).await?;
        if page.is_truncated {
            self.token = page.next_continuation_token.clone();
        } else {
            self.token = None;
            self.completed = true;
        }
        let mut entries = page.objects;
        entries.extend(page.common_prefixes.into_iter().map(RemoteObject::dir));
        Ok(entries)
    }

    /// True once the listing has been exhausted.
    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Restart the cursor from the first page.
    pub fn reset(&mut self) {
        self.token = None;
        self.completed = false;
    }
}

/// Multipart part size for one upload: the baseline, grown once the part
/// count would exceed the store's limit.
pub fn part_size(size: u64) -> u64 {
    if size / DEFAULT_PART_SIZE > MAX_PARTS {
        size / MIN_PARTS
    } else {
        DEFAULT_PART_SIZE
    }
}

/// Resume-state directory for one local file's multipart upload.
pub fn upload_checkpoint_dir(local: &Path) -> PathBuf {
    let parent = local.parent().unwrap_or(Path::new(""));
    let name = local.file_name().map(|n| n.to_owned()).unwrap_or_default();
    parent.join(UPLOAD_CHECKPOINT_DIR).join(name)
}

/// Normalize a configured prefix to `clean/` form without a leading
/// slash; empty input maps to the bucket root.
fn normalize_prefix(prefix: &str) -> String {
    let cleaned = clean_key(prefix);
    if cleaned.is_empty() {
        String::new()
    } else {
        format!("{cleaned}/")
    }
}

/// Directory form of a key: cleaned, with exactly one trailing slash.
pub fn dir_key(key: &str) -> String {
    let cleaned = clean_key(key);
    if cleaned.is_empty() {
        String::new()
    } else {
        format!("{cleaned}/")
    }
}

/// Clean a key: forward slashes only, `.`/`..` segments resolved, no
/// leading or trailing slash.
pub fn clean_key(key: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    let normalized = key.replace('\\', "/");
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

/// Relative local path rendered as a key fragment.
fn path_to_key(path: &Path) -> String {
    clean_key(&path.to_string_lossy())
}
