//! In-memory object store backend.
//!
//! Backs tests and demos with the full [`ObjectStore`] contract: ordered
//! keys, content etags, delimiter listings with continuation tokens, and
//! multipart uploads that resume from a checkpoint directory. Part payloads
//! live in process memory; a checkpoint whose upload id is no longer known
//! simply restarts from the first part.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::progress::ProgressSink;
use crate::store::{ListPage, ListRequest, MultipartSpec, ObjectStore, RemoteObject};

const DEFAULT_MAX_KEYS: usize = 1000;
const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: SystemTime,
    etag: String,
}

/// Resume state persisted under the checkpoint directory.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    upload_id: u64,
    part_size: u64,
    completed: Vec<u64>,
}

#[derive(Debug, Default)]
struct MultipartState {
    next_upload_id: u64,
    /// upload id -> part index -> payload
    parts: HashMap<u64, BTreeMap<u64, Bytes>>,
}

/// Object store held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: Mutex<MultipartState>,
    put_calls: AtomicU64,
    part_puts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing the PUT counters.
    pub fn seed(&self, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let etag = content_etag(&data);
        self.objects.lock().unwrap().insert(
            key.to_owned(),
            StoredObject { data, last_modified: SystemTime::now(), etag },
        );
    }

    /// Current bytes of one key, if present.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).map(|o| o.data.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    /// All keys in order. Test helper.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Number of whole-object PUTs served (single-shot and assembled
    /// multipart completions).
    pub fn put_count(&self) -> u64 {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Number of individual multipart part uploads served.
    pub fn part_put_count(&self) -> u64 {
        self.part_puts.load(Ordering::SeqCst)
    }

    fn insert(&self, key: &str, data: Bytes) {
        let etag = content_etag(&data);
        self.objects.lock().unwrap().insert(
            key.to_owned(),
            StoredObject { data, last_modified: SystemTime::now(), etag },
        );
        self.put_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn meta(&self, key: &str) -> Result<RemoteObject> {
        let objects = self.objects.lock().unwrap();
        let stored = objects.get(key).ok_or_else(|| Error::NotFound(key.to_owned()))?;
        Ok(RemoteObject {
            key: key.to_owned(),
            size: stored.data.len() as u64,
            last_modified: stored.last_modified,
            etag: Some(stored.etag.clone()),
            is_dir: false,
        })
    }
}

fn content_etag(data: &Bytes) -> String {
    format!("{:x}", md5::compute(data))
}

fn cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Io(io::Error::new(io::ErrorKind::Interrupted, "cancelled")));
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(&self, key: &str, cancel: &CancellationToken) -> Result<RemoteObject> {
        cancelled(cancel)?;
        self.meta(key)
    }

    async fn head_if_none_match(
        &self,
        key: &str,
        etag: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteObject> {
        cancelled(cancel)?;
        let meta = self.meta(key)?;
        if meta.etag.as_deref() == Some(etag) {
            return Err(Error::NotModified(key.to_owned()));
        }
        Ok(meta)
    }

    async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Bytes> {
        cancelled(cancel)?;
        self.object(key).ok_or_else(|| Error::NotFound(key.to_owned()))
    }

    async fn get_range(
        &self,
        key: &str,
        offset: u64,
        len: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        cancelled(cancel)?;
        let data = self.object(key).ok_or_else(|| Error::NotFound(key.to_owned()))?;
        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(len) as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        cancelled(cancel)?;
        let total = data.len() as u64;
        progress.started(total).await;
        self.insert(key, data);
        progress.completed(total).await;
        Ok(())
    }

    async fn put_from_file(
        &self,
        key: &str,
        path: &Path,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        cancelled(cancel)?;
        let data = tokio::fs::read(path).await?;
        self.put(key, Bytes::from(data), progress, cancel).await
    }

    async fn put_multipart(
        &self,
        key: &str,
        path: &Path,
        spec: &MultipartSpec,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        cancelled(cancel)?;
        let data = Bytes::from(tokio::fs::read(path).await?);
        let total = data.len() as u64;
        let part_count = total.div_ceil(spec.part_size).max(1);
        progress.started(total).await;

        let checkpoint_path = spec.checkpoint_dir.join(CHECKPOINT_FILE);
        let loaded = load_checkpoint(&checkpoint_path, spec.part_size);
        let resumable = loaded
            .as_ref()
            .map(|cp| cp.upload_id)
            .filter(|id| self.uploads.lock().unwrap().parts.contains_key(id));
        let (upload_id, checkpoint) = match (resumable, loaded) {
            (Some(id), Some(checkpoint)) => (id, checkpoint),
            // No usable resume state: open a fresh upload.
            _ => {
                let mut uploads = self.uploads.lock().unwrap();
                uploads.next_upload_id += 1;
                let id = uploads.next_upload_id;
                uploads.parts.insert(id, BTreeMap::new());
                (id, Checkpoint { upload_id: id, part_size: spec.part_size, completed: vec![] })
            }
        };

        tokio::fs::create_dir_all(&spec.checkpoint_dir).await?;
        let missing: Vec<u64> =
            (0..part_count).filter(|i| !checkpoint.completed.contains(i)).collect();
        let checkpoint = Arc::new(tokio::sync::Mutex::new(checkpoint));
        let mut parts = futures::stream::iter(missing.into_iter().map(|index| {
            let data = data.clone();
            let checkpoint = Arc::clone(&checkpoint);
            let checkpoint_path = checkpoint_path.clone();
            async move {
                cancelled(cancel)?;
                let start = (index * spec.part_size) as usize;
                let end = ((index + 1) * spec.part_size).min(total) as usize;
                // Part data and resume record move together under the
                // checkpoint lock; an aborted task leaves either a fully
                // recorded part or none at all.
                let mut checkpoint = checkpoint.lock().await;
                self.uploads
                    .lock()
                    .unwrap()
                    .parts
                    .get_mut(&upload_id)
                    .expect("upload registered")
                    .insert(index, data.slice(start..end));
                checkpoint.completed.push(index);
                store_checkpoint(&checkpoint_path, &checkpoint).await?;
                self.part_puts.fetch_add(1, Ordering::SeqCst);
                progress.transferring(end as u64, total).await;
                Ok::<(), Error>(())
            }
        }))
        .buffer_unordered(spec.parallel.max(1));
        while let Some(part) = parts.next().await {
            part?;
        }
        drop(parts);

        let assembled: Vec<u8> = {
            let mut uploads = self.uploads.lock().unwrap();
            let parts = uploads.parts.remove(&upload_id).expect("upload registered");
            parts.into_values().flatten().collect()
        };
        self.insert(key, Bytes::from(assembled));
        tokio::fs::remove_dir_all(&spec.checkpoint_dir).await.ok();
        progress.completed(total).await;
        Ok(())
    }

    async fn get_to_file(
        &self,
        key: &str,
        path: &Path,
        _checkpoint_dir: &Path,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        cancelled(cancel)?;
        let data = self.object(key).ok_or_else(|| Error::NotFound(key.to_owned()))?;
        let total = data.len() as u64;
        progress.started(total).await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &data).await?;
        progress.completed(total).await;
        Ok(())
    }

    async fn copy(
        &self,
        src: &str,
        dst: &str,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        cancelled(cancel)?;
        let stored = {
            let objects = self.objects.lock().unwrap();
            objects.get(src).cloned()
        };
        let stored = stored.ok_or_else(|| Error::NotFound(src.to_owned()))?;
        let total = stored.data.len() as u64;
        progress.started(total).await;
        self.objects.lock().unwrap().insert(
            dst.to_owned(),
            StoredObject { last_modified: SystemTime::now(), ..stored },
        );
        progress.completed(total).await;
        Ok(())
    }

    async fn delete(&self, keys: &[String], cancel: &CancellationToken) -> Result<Vec<String>> {
        cancelled(cancel)?;
        let mut objects = self.objects.lock().unwrap();
        let mut deleted = Vec::with_capacity(keys.len());
        for key in keys {
            if objects.remove(key).is_some() {
                deleted.push(key.clone());
            }
        }
        Ok(deleted)
    }

    async fn list(&self, request: &ListRequest, cancel: &CancellationToken) -> Result<ListPage> {
        cancelled(cancel)?;
        let max_keys = if request.max_keys == 0 { DEFAULT_MAX_KEYS } else { request.max_keys };
        let after = request
            .continuation_token
            .clone()
            .or_else(|| request.start_after.clone())
            .unwrap_or_default();

        let objects = self.objects.lock().unwrap();
        let mut page = ListPage::default();
        let mut seen_prefixes = BTreeSet::new();
        let mut included = 0usize;
        let mut last_key = String::new();

        for (key, stored) in objects.range(request.prefix.clone()..) {
            if !key.starts_with(&request.prefix) {
                break;
            }
            if !after.is_empty() && key.as_str() <= after.as_str() {
                continue;
            }
            if included == max_keys {
                page.is_truncated = true;
                page.next_continuation_token = Some(last_key);
                return Ok(page);
            }

            let rest = &key[request.prefix.len()..];
            let rolled_up = request
                .delimiter
                .as_deref()
                .and_then(|d| rest.find(d).map(|i| (d, i)))
                .map(|(d, i)| format!("{}{}{}", request.prefix, &rest[..i], d));
            match rolled_up {
                Some(common) => {
                    if seen_prefixes.insert(common.clone()) {
                        page.common_prefixes.push(common);
                        included += 1;
                    }
                }
                None => {
                    page.objects.push(RemoteObject {
                        key: key.clone(),
                        size: stored.data.len() as u64,
                        last_modified: stored.last_modified,
                        etag: Some(stored.etag.clone()),
                        is_dir: false,
                    });
                    included += 1;
                }
            }
            last_key = key.clone();
        }
        Ok(page)
    }
}

fn load_checkpoint(path: &Path, part_size: u64) -> Option<Checkpoint> {
    let raw = std::fs::read(path).ok()?;
    let checkpoint: Checkpoint = serde_json::from_slice(&raw).ok()?;
    // A different part size invalidates recorded offsets.
    (checkpoint.part_size == part_size).then_some(checkpoint)
}

async fn store_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let raw = serde_json::to_vec(checkpoint).map_err(|e| Error::Remote(e.to_string()))?;
    tokio::fs::write(path, raw).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::TransferOp;

    fn sink() -> ProgressSink {
        let (tx, _rx) = async_channel::bounded(64);
        ProgressSink::new(tx, TransferOp::Upload, "src", "dst")
    }

    #[tokio::test]
    async fn conditional_head_reports_not_modified() {
        let store = MemoryStore::new();
        store.seed("p/a.txt", &b"hello"[..]);
        let cancel = CancellationToken::new();

        let meta = store.head("p/a.txt", &cancel).await.expect("head");
        let etag = meta.etag.expect("etag set");
        let err = store.head_if_none_match("p/a.txt", &etag, &cancel).await.expect_err("matches");
        assert!(err.is_not_modified());

        let changed =
            store.head_if_none_match("p/a.txt", "other", &cancel).await.expect("mismatch");
        assert_eq!(changed.size, 5);
    }

    #[tokio::test]
    async fn delimiter_listing_rolls_up_children() {
        let store = MemoryStore::new();
        store.seed("p/a.txt", &b"a"[..]);
        store.seed("p/sub/b.txt", &b"b"[..]);
        store.seed("p/sub/c.txt", &b"c"[..]);
        let cancel = CancellationToken::new();

        let page = store
            .list(
                &ListRequest {
                    prefix: "p/".to_owned(),
                    delimiter: Some("/".to_owned()),
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .expect("list");
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].key, "p/a.txt");
        assert_eq!(page.common_prefixes, vec!["p/sub/".to_owned()]);
        assert!(!page.is_truncated);
        assert!(page.next_continuation_token.is_none());
    }

    #[tokio::test]
    async fn listing_pages_with_continuation_token() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.seed(&format!("p/{i}.txt"), &b"x"[..]);
        }
        let cancel = CancellationToken::new();

        let request = ListRequest { prefix: "p/".to_owned(), max_keys: 2, ..Default::default() };
        let first = store.list(&request, &cancel).await.expect("first page");
        assert_eq!(first.objects.len(), 2);
        assert!(first.is_truncated);

        let second = store
            .list(
                &ListRequest {
                    continuation_token: first.next_continuation_token.clone(),
                    ..request.clone()
                },
                &cancel,
            )
            .await
            .expect("second page");
        assert_eq!(second.objects[0].key, "p/2.txt");
    }

    #[tokio::test]
    async fn multipart_resumes_from_checkpoint() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("big.bin");
        let payload: Vec<u8> = (0..10_000u32).flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(&file, &payload).expect("write payload");

        let spec = MultipartSpec {
            part_size: 1024,
            parallel: 3,
            checkpoint_dir: dir.path().join(".osssync-upload").join("big.bin"),
        };
        std::fs::create_dir_all(&spec.checkpoint_dir).expect("checkpoint dir");

        // First attempt: a lockstep progress channel lets the observer
        // cancel after a few parts have gone out.
        let cancel = CancellationToken::new();
        let (tx, rx) = async_channel::bounded(1);
        let observer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut seen = 0;
                while rx.recv().await.is_ok() {
                    seen += 1;
                    if seen == 4 {
                        cancel.cancel();
                    }
                }
            })
        };
        let lockstep = ProgressSink::new(tx, TransferOp::Upload, "src", "dst");
        let interrupted =
            store.put_multipart("p/big.bin", &file, &spec, &lockstep, &cancel).await;
        drop(lockstep);
        observer.await.expect("observer");
        assert!(interrupted.is_err());
        let uploaded_before_resume = store.part_put_count();
        assert!(uploaded_before_resume > 0);
        assert!(spec.checkpoint_dir.join("checkpoint.json").exists());

        let cancel = CancellationToken::new();
        store
            .put_multipart("p/big.bin", &file, &spec, &sink(), &cancel)
            .await
            .expect("resumed upload");
        // Completed parts were not re-sent: the two runs add up to exactly
        // one pass over the payload.
        let part_count = (payload.len() as u64).div_ceil(spec.part_size);
        assert_eq!(store.part_put_count(), part_count);
        assert_eq!(store.object("p/big.bin").expect("stored").len(), payload.len());
        // Etag equals a single-shot upload of the same content.
        let meta = store.head("p/big.bin", &cancel).await.expect("head");
        assert_eq!(meta.etag, Some(format!("{:x}", md5::compute(&payload))));
        assert!(!spec.checkpoint_dir.exists());
    }
}
