//! Object store capability.
//!
//! The sync and mount pipelines consume object storage through the
//! [`ObjectStore`] trait; any S3-compatible backend satisfies it. The
//! trait mirrors the minimal client surface the pipelines need: object
//! head/get/put/copy/delete, resumable multipart upload, and
//! ListObjectsV2-style keyed listing with continuation tokens. Every call
//! takes a cancellation token so a closing supervisor can abort in-flight
//! requests.
//!
//! [`memory::MemoryStore`] is the in-crate backend used by tests and
//! demos.

pub mod memory;

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::progress::ProgressSink;

/// Metadata of one stored object, or of a directory synthesized from a
/// listing's common-prefix result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Full key, prefix included. Directory keys end with `/`.
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
    pub etag: Option<String>,
    /// True only for synthesized directory placeholders.
    pub is_dir: bool,
}

impl RemoteObject {
    pub fn file(key: impl Into<String>, size: u64, last_modified: SystemTime) -> Self {
        Self { key: key.into(), size, last_modified, etag: None, is_dir: false }
    }

    /// A directory placeholder derived from a common prefix.
    pub fn dir(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            last_modified: SystemTime::UNIX_EPOCH,
            etag: None,
            is_dir: true,
        }
    }

    /// Final path segment of the key.
    pub fn name(&self) -> &str {
        self.key.trim_end_matches('/').rsplit('/').next().unwrap_or(&self.key)
    }
}

/// One keyed listing request with ListObjectsV2 semantics.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    /// Keys must start with this prefix.
    pub prefix: String,
    /// With `Some("/")`, keys containing the delimiter past the prefix are
    /// rolled up into `common_prefixes` and only immediate children are
    /// returned as objects.
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
    pub max_keys: usize,
}

/// One page of a keyed listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<RemoteObject>,
    pub common_prefixes: Vec<String>,
    /// Token to pass back for the next page. Set only while truncated.
    pub next_continuation_token: Option<String>,
    pub is_truncated: bool,
}

/// Layout of one resumable multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartSpec {
    pub part_size: u64,
    /// Parts uploaded concurrently.
    pub parallel: usize,
    /// Directory holding the resume state. Survives process restarts;
    /// removed by the store once the upload completes.
    pub checkpoint_dir: PathBuf,
}

/// Minimal object-store client the pipelines are written against.
///
/// Objects written through `put*` are private to the credentials in use.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch metadata for one key.
    async fn head(&self, key: &str, cancel: &CancellationToken) -> Result<RemoteObject>;

    /// Conditional head. Returns [`crate::error::Error::NotModified`] when
    /// the stored etag still matches `etag`.
    async fn head_if_none_match(
        &self,
        key: &str,
        etag: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteObject>;

    /// Full object read.
    async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Bytes>;

    /// Ranged read of `len` bytes starting at `offset`. Short reads at the
    /// object tail are not an error.
    async fn get_range(
        &self,
        key: &str,
        offset: u64,
        len: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes>;

    /// Single-shot write from memory.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Single-shot write streamed from a local file.
    async fn put_from_file(
        &self,
        key: &str,
        path: &Path,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Multipart write with resumable checkpoint. A rerun against an
    /// existing checkpoint directory must skip parts recorded there.
    async fn put_multipart(
        &self,
        key: &str,
        path: &Path,
        spec: &MultipartSpec,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Checkpointed read of a whole object into a local file.
    async fn get_to_file(
        &self,
        key: &str,
        path: &Path,
        checkpoint_dir: &Path,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Server-side copy within the bucket.
    async fn copy(
        &self,
        src: &str,
        dst: &str,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Batch delete. Returns the keys actually deleted; requested keys the
    /// store did not hold are simply absent from the result.
    async fn delete(&self, keys: &[String], cancel: &CancellationToken) -> Result<Vec<String>>;

    /// One page of a keyed listing.
    async fn list(&self, request: &ListRequest, cancel: &CancellationToken) -> Result<ListPage>;
}
