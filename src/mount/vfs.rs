//! Filesystem operation core of the mounted view.
//!
//! [`Vfs`] translates every node-level operation into remote calls on the
//! binding's [`RemoteFs`], buffering writes through per-node spill files.
//! Operations are async and return raw errnos; the FUSE shim in
//! [`crate::mount::bridge`] forwards kernel requests here and never sees
//! crate errors.
//!
//! Locking: at most one node state lock is held at a time. Tree edits
//! (rename, unlink) lock the nodes involved in sequence, and lookup
//! releases the parent's lock before reading a child's attributes, which
//! leaves a narrow window in which a sibling edit can reorder with the
//! attribute read. The kernel retries through its attr timeout, so the
//! window only ever yields a momentarily stale entry.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::mount::node::{ChildRef, Node, NodeState, NodeTable, ROOT_INO};
use crate::mount::spill::{spill_path, Spill};
use crate::remote::{dir_key, RemoteFs};
use crate::store::RemoteObject;

/// Kernel attribute cache lifetime.
pub const ATTR_TTL: Duration = Duration::from_secs(5);
/// Kernel directory entry lifetime, also applied to negative lookups.
pub const ENTRY_TTL: Duration = Duration::from_secs(1);
/// Remote listing page size for directory enumeration.
pub const READDIR_PAGE: usize = 100;

/// Advertised pseudo-capacity.
pub const BLOCK_SIZE: u32 = 4096;
const TOTAL_BYTES: u64 = 1 << 50;
const TOTAL_INODES: u64 = 1_000_000_000;

/// Entries cached for conditional HEADs on open.
const ATTR_CACHE_CAPACITY: u64 = 10_000;

/// Operation outcome carried back to the kernel.
pub type OpResult<T> = std::result::Result<T, libc::c_int>;

/// Attributes the shim renders into a kernel attr struct.
#[derive(Debug, Copy, Clone)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub mtime: SystemTime,
    pub is_dir: bool,
}

/// One directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntryOut {
    pub ino: u64,
    pub name: String,
    pub is_dir: bool,
}

/// Fixed pseudo-capacity advertised by statfs.
#[derive(Debug, Copy, Clone)]
pub struct FsCapacity {
    pub blocks: u64,
    pub blocks_free: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_len: u32,
}

fn errno(e: &Error) -> libc::c_int {
    match e {
        Error::NotFound(_) | Error::LocalNotFound(_) => libc::ENOENT,
        _ => libc::EIO,
    }
}

/// Mounted view of one binding's remote prefix.
pub struct Vfs {
    remote: Arc<RemoteFs>,
    nodes: NodeTable,
    /// Last known object per key, feeding the if-none-match open path.
    attr_cache: moka::sync::Cache<String, RemoteObject>,
    mount_id: String,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("mount_id", &self.mount_id)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl Vfs {
    pub fn new(remote: Arc<RemoteFs>, mount_id: &str, cancel: CancellationToken) -> Self {
        let root_key = remote.prefix().trim_end_matches('/').to_owned();
        Self {
            remote,
            nodes: NodeTable::new(RemoteObject::dir(root_key)),
            attr_cache: moka::sync::Cache::new(ATTR_CACHE_CAPACITY),
            mount_id: mount_id.to_owned(),
            cancel,
        }
    }

    fn node(&self, ino: u64) -> OpResult<Arc<Node>> {
        self.nodes.get(ino).ok_or(libc::ENOENT)
    }

    fn attr_of(ino: u64, entry: &RemoteObject) -> Attr {
        Attr { ino, size: entry.size, mtime: entry.last_modified, is_dir: entry.is_dir }
    }

    pub async fn getattr(&self, ino: u64) -> OpResult<Attr> {
        let node = self.node(ino)?;
        let state = node.state.lock().await;
        Ok(Self::attr_of(ino, &state.entry))
    }

    /// The store has no attribute storage; accepted values are echoed
    /// back without persistence.
    pub async fn setattr(
        &self,
        ino: u64,
        size: Option<u64>,
        mtime: Option<SystemTime>,
    ) -> OpResult<Attr> {
        let mut attr = self.getattr(ino).await?;
        if let Some(size) = size {
            attr.size = size;
        }
        if let Some(mtime) = mtime {
            attr.mtime = mtime;
        }
        Ok(attr)
    }

    pub async fn lookup(&self, parent: u64, name: &str) -> OpResult<Attr> {
        let parent_node = self.node(parent)?;
        let (known, parent_key) = {
            let state = parent_node.state.lock().await;
            (state.children.get(name).copied(), state.entry.key.clone())
        };
        // The parent's lock is released before the child attribute read;
        // see the module doc for the resulting window.
        if let Some(child) = known {
            return self.getattr(child.ino).await;
        }

        let child_key = format!("{}{}", dir_key(&parent_key), name);
        match self.remote.open(&child_key, &self.cancel).await {
            Ok(object) => {
                let attr = self.adopt(parent, name, object).await?;
                Ok(attr)
            }
            Err(e) if e.is_not_found() => {
                // No object at the key: a non-empty listing under it still
                // makes it a directory.
                let mut pager = self.remote.read_dir(&child_key, true);
                let page = pager
                    .next_page(1, &self.cancel)
                    .await
                    .map_err(|e| errno(&e))?;
                if page.is_empty() {
                    return Err(libc::ENOENT);
                }
                let attr = self.adopt(parent, name, RemoteObject::dir(child_key)).await?;
                Ok(attr)
            }
            Err(e) => Err(errno(&e)),
        }
    }

    /// Insert a freshly discovered object under `parent`, tolerating a
    /// concurrent lookup having adopted the same name first.
    async fn adopt(&self, parent: u64, name: &str, object: RemoteObject) -> OpResult<Attr> {
        let parent_node = self.node(parent)?;
        let mut state = parent_node.state.lock().await;
        if let Some(existing) = state.children.get(name) {
            let ino = existing.ino;
            drop(state);
            return self.getattr(ino).await;
        }
        let is_dir = object.is_dir;
        let attr_entry = object.clone();
        let node = self.nodes.insert(parent, name, object);
        state.children.insert(name.to_owned(), ChildRef { ino: node.ino, is_dir });
        Ok(Self::attr_of(node.ino, &attr_entry))
    }

    /// Open a regular file: conditional HEAD against the last known etag,
    /// reusing the cached object on NotModified.
    pub async fn open_file(&self, ino: u64) -> OpResult<Attr> {
        let node = self.node(ino)?;
        let mut state = node.state.lock().await;
        if state.entry.is_dir {
            return Err(libc::EISDIR);
        }
        let key = state.entry.key.clone();
        let etag = state
            .entry
            .etag
            .clone()
            .or_else(|| self.attr_cache.get(&key).and_then(|o| o.etag))
            .unwrap_or_default();
        match self.remote.open_if_changed(&key, &etag, &self.cancel).await {
            Ok(object) => {
                self.attr_cache.insert(key, object.clone());
                state.entry = object;
                Ok(Self::attr_of(ino, &state.entry))
            }
            Err(e) if e.is_not_modified() => Ok(Self::attr_of(ino, &state.entry)),
            Err(e) => Err(errno(&e)),
        }
    }

    pub async fn read(&self, ino: u64, offset: u64, len: u32) -> OpResult<Bytes> {
        let node = self.node(ino)?;
        let state = node.state.lock().await;
        if state.entry.is_dir {
            return Err(libc::EISDIR);
        }
        self.remote
            .read_at(&state.entry.key, state.entry.size, offset, len as u64, &self.cancel)
            .await
            .map_err(|e| errno(&e))
    }

    pub async fn write(&self, ino: u64, offset: u64, data: &[u8]) -> OpResult<u32> {
        let node = self.node(ino)?;
        let mut state = node.state.lock().await;
        if state.entry.is_dir {
            return Err(libc::EISDIR);
        }
        self.ensure_spill(&mut state).await?;
        let spill = state.spill.as_mut().expect("spill ensured above");
        spill.write_at(offset, data).await.map_err(|e| errno(&e))?;
        state.entry.last_modified = SystemTime::now();
        Ok(data.len() as u32)
    }

    /// Copy bytes between two nodes of this mount through the target's
    /// spill file.
    pub async fn copy_file_range(
        &self,
        src_ino: u64,
        src_offset: u64,
        dst_ino: u64,
        dst_offset: u64,
        len: u64,
    ) -> OpResult<u64> {
        let data = {
            let src = self.node(src_ino)?;
            let mut state = src.state.lock().await;
            if state.entry.is_dir {
                return Err(libc::EISDIR);
            }
            match state.spill.as_mut() {
                Some(spill) => Bytes::from(
                    spill.read_at(src_offset, len as usize).await.map_err(|e| errno(&e))?,
                ),
                None => self
                    .remote
                    .read_at(&state.entry.key, state.entry.size, src_offset, len, &self.cancel)
                    .await
                    .map_err(|e| errno(&e))?,
            }
        };
        let written = self.write(dst_ino, dst_offset, &data).await?;
        Ok(written as u64)
    }

    /// Upload the spill, refresh size and mtime from its stat, drop the
    /// tempfile and invalidate the cached etag. A node without a spill
    /// flushes as a no-op.
    pub async fn flush(&self, ino: u64) -> OpResult<()> {
        let node = self.node(ino)?;
        let mut state = node.state.lock().await;
        let Some(mut spill) = state.spill.take() else {
            return Ok(());
        };
        let (size, mtime) = match spill.finish().await {
            Ok(stat) => stat,
            Err(e) => {
                state.spill = Some(spill);
                return Err(errno(&e));
            }
        };
        let key = state.entry.key.clone();
        if let Err(e) = self.remote.upload_from_path(&key, spill.path(), &self.cancel).await {
            // Keep the buffered bytes; the writer may retry the flush.
            state.spill = Some(spill);
            return Err(errno(&e));
        }
        state.entry.size = size;
        state.entry.last_modified = mtime;
        state.entry.etag = None;
        self.attr_cache.invalidate(&key);
        if let Err(e) = spill.discard().await {
            warn!(error = %e, "drop spill file");
        }
        drop(state);

        self.materialize_ancestors(&node);
        Ok(())
    }

    /// Drop the spill without uploading. Runs after flush on normal close
    /// paths, so discarding here only abandons aborted writers.
    pub async fn release(&self, ino: u64) -> OpResult<()> {
        let node = self.node(ino)?;
        let mut state = node.state.lock().await;
        if let Some(spill) = state.spill.take() {
            if let Err(e) = spill.discard().await {
                warn!(error = %e, "drop spill file");
            }
        }
        Ok(())
    }

    pub async fn create(&self, parent: u64, name: &str) -> OpResult<Attr> {
        let parent_node = self.node(parent)?;
        let mut state = parent_node.state.lock().await;
        if !state.entry.is_dir {
            return Err(libc::ENOTDIR);
        }
        if state.children.contains_key(name) {
            return Err(libc::EEXIST);
        }
        let key = format!("{}{}", dir_key(&state.entry.key), name);
        let entry = RemoteObject::file(key, 0, SystemTime::now());
        let attr_entry = entry.clone();
        let node = self.nodes.insert(parent, name, entry);
        state.children.insert(name.to_owned(), ChildRef { ino: node.ino, is_dir: false });
        Ok(Self::attr_of(node.ino, &attr_entry))
    }

    pub async fn mkdir(&self, parent: u64, name: &str) -> OpResult<Attr> {
        let parent_node = self.node(parent)?;
        let mut state = parent_node.state.lock().await;
        if !state.entry.is_dir {
            return Err(libc::ENOTDIR);
        }
        if state.children.contains_key(name) {
            return Err(libc::EEXIST);
        }
        let key = format!("{}{}", dir_key(&state.entry.key), name);
        let entry = RemoteObject::dir(key);
        let attr_entry = entry.clone();
        let node = self.nodes.insert(parent, name, entry);
        state.children.insert(name.to_owned(), ChildRef { ino: node.ino, is_dir: true });
        drop(state);
        // The directory exists only in memory until a descendant flush.
        let mut child_state = node.state.lock().await;
        child_state.newly_created_dir = true;
        Ok(Self::attr_of(node.ino, &attr_entry))
    }

    /// Remove one name: a whole subtree for directories, a single object
    /// otherwise. rmdir routes here too.
    pub async fn unlink(&self, parent: u64, name: &str) -> OpResult<()> {
        let parent_node = self.node(parent)?;
        let child = {
            let state = parent_node.state.lock().await;
            state.children.get(name).copied().ok_or(libc::ENOENT)?
        };

        let child_node = self.node(child.ino)?;
        {
            let state = child_node.state.lock().await;
            let key = state.entry.key.clone();
            let result = if child.is_dir {
                self.remote.remove_all(&key, &self.cancel).await.map(|_| ())
            } else {
                self.remote
                    .remove(std::slice::from_ref(&key), &self.cancel)
                    .await
                    .map(|_| ())
            };
            if let Err(e) = result {
                return Err(errno(&e));
            }
            self.attr_cache.invalidate(&key);
        }

        let mut state = parent_node.state.lock().await;
        state.children.remove(name);
        drop(state);
        self.forget_subtree(child.ino).await;
        Ok(())
    }

    pub async fn rename(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> OpResult<()> {
        let parent_node = self.node(parent)?;
        let child = {
            let state = parent_node.state.lock().await;
            state.children.get(name).copied().ok_or(libc::ENOENT)?
        };
        let new_parent_node = self.node(new_parent)?;
        let new_parent_key = {
            let state = new_parent_node.state.lock().await;
            if !state.entry.is_dir {
                return Err(libc::ENOTDIR);
            }
            state.entry.key.clone()
        };

        let child_node = self.node(child.ino)?;
        let src_key;
        let dst_key = format!("{}{}", dir_key(&new_parent_key), new_name);
        {
            let mut state = child_node.state.lock().await;
            src_key = state.entry.key.clone();
            if child.is_dir {
                if self.dir_has_remote_content(&state).await.map_err(|e| errno(&e))? {
                    self.remote
                        .rename_dir(&src_key, &dst_key, &self.cancel)
                        .await
                        .map_err(|e| errno(&e))?;
                }
                // A directory that exists only in memory moves without
                // any remote traffic.
            } else {
                self.remote.rename(&src_key, &dst_key, &self.cancel).await.map_err(|e| errno(&e))?;
            }
            state.entry.key = dst_key.clone();
            self.attr_cache.invalidate(&src_key);
        }

        // Relocate the inode in the tree.
        {
            let mut state = parent_node.state.lock().await;
            state.children.remove(name);
        }
        let displaced = {
            let mut state = new_parent_node.state.lock().await;
            state.children.insert(new_name.to_owned(), child)
        };
        if let Some(old) = displaced {
            self.forget_subtree(old.ino).await;
        }
        child_node.parent.store(new_parent, std::sync::atomic::Ordering::SeqCst);
        *child_node.name.lock().unwrap() = new_name.to_owned();

        if child.is_dir {
            self.rewrite_descendants(child.ino, &dir_key(&src_key), &dir_key(&dst_key)).await;
        }
        Ok(())
    }

    pub async fn readdir(&self, ino: u64) -> OpResult<Vec<DirEntryOut>> {
        let node = self.node(ino)?;
        let mut state = node.state.lock().await;
        if !state.entry.is_dir {
            return Err(libc::ENOTDIR);
        }
        if !state.populated {
            if state.newly_created_dir {
                state.populated = true;
            } else {
                self.populate(ino, &mut state).await.map_err(|e| errno(&e))?;
            }
        }
        let mut entries: Vec<DirEntryOut> = state
            .children
            .iter()
            .map(|(name, child)| DirEntryOut {
                ino: child.ino,
                name: name.clone(),
                is_dir: child.is_dir,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Parent inode, for `..` entries.
    pub fn parent_ino(&self, ino: u64) -> Option<u64> {
        self.nodes.get(ino).map(|n| n.parent_ino())
    }

    pub fn statfs(&self) -> FsCapacity {
        FsCapacity {
            blocks: TOTAL_BYTES / BLOCK_SIZE as u64,
            blocks_free: TOTAL_BYTES / BLOCK_SIZE as u64,
            files: TOTAL_INODES,
            files_free: TOTAL_INODES,
            block_size: BLOCK_SIZE,
            name_len: 255,
        }
    }

    /// Fill `children` from the remote listing, one delimited page at a
    /// time.
    async fn populate(&self, ino: u64, state: &mut NodeState) -> crate::error::Result<()> {
        let mut pager = self.remote.read_dir(&state.entry.key, true);
        while !pager.completed() {
            let page = pager.next_page(READDIR_PAGE, &self.cancel).await?;
            for mut object in page {
                let name = object.name().to_owned();
                if name.is_empty() || state.children.contains_key(&name) {
                    continue;
                }
                // Directory keys are kept in trimmed form; listings hand
                // common prefixes back with the delimiter attached.
                if object.is_dir {
                    object.key = object.key.trim_end_matches('/').to_owned();
                }
                let is_dir = object.is_dir;
                let node = self.nodes.insert(ino, &name, object);
                state.children.insert(name, ChildRef { ino: node.ino, is_dir });
            }
        }
        state.populated = true;
        Ok(())
    }

    async fn ensure_spill(&self, state: &mut NodeState) -> OpResult<()> {
        if state.spill.is_some() {
            return Ok(());
        }
        let key = state.entry.key.clone();
        let path = spill_path(&self.mount_id, &key);
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        let initial = if exists {
            None
        } else {
            match self.remote.read_all(&key, &self.cancel).await {
                Ok(bytes) => Some(bytes),
                // A never-flushed create has nothing remote yet.
                Err(e) if e.is_not_found() => Some(Bytes::new()),
                Err(e) => return Err(errno(&e)),
            }
        };
        let spill =
            Spill::open(path, initial.as_deref()).await.map_err(|e| errno(&e))?;
        state.spill = Some(spill);
        Ok(())
    }

    /// Whether a directory holds anything remotely. In-memory knowledge
    /// answers without traffic where it can.
    async fn dir_has_remote_content(&self, state: &NodeState) -> crate::error::Result<bool> {
        if state.newly_created_dir {
            return Ok(false);
        }
        if state.populated {
            return Ok(!state.children.is_empty());
        }
        let mut pager = self.remote.read_dir(&state.entry.key, true);
        let page = pager.next_page(1, &self.cancel).await?;
        Ok(!page.is_empty())
    }

    /// Clear the in-memory-only flag up the parent chain once a
    /// descendant file has materialized remotely.
    fn materialize_ancestors(&self, node: &Arc<Node>) {
        let nodes = &self.nodes;
        let mut ino = node.parent_ino();
        loop {
            let Some(ancestor) = nodes.get(ino) else { break };
            {
                // Flag flips are cheap; a try_lock miss means another op
                // is active on the ancestor and will observe remote state
                // anyway.
                if let Ok(mut state) = ancestor.state.try_lock() {
                    if !state.newly_created_dir {
                        break;
                    }
                    state.newly_created_dir = false;
                }
            }
            if ino == ROOT_INO {
                break;
            }
            ino = ancestor.parent_ino();
        }
    }

    /// Rewrite every descendant's key, re-rooting the old directory
    /// prefix onto the new one. Prefixes are compared at path-segment
    /// granularity: `dir_key` always ends the prefix at a `/` boundary.
    async fn rewrite_descendants(&self, ino: u64, src_dir: &str, dst_dir: &str) {
        let mut stack = vec![ino];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(current) else { continue };
            let mut state = node.state.lock().await;
            if current != ino {
                if let Some(suffix) = state.entry.key.strip_prefix(src_dir) {
                    let new_key = format!("{dst_dir}{suffix}");
                    self.attr_cache.invalidate(&state.entry.key);
                    state.entry.key = new_key;
                } else {
                    debug!(key = %state.entry.key, src_dir, "descendant outside renamed prefix");
                }
            }
            stack.extend(state.children.values().map(|c| c.ino));
        }
    }

    async fn forget_subtree(&self, ino: u64) {
        let mut stack = vec![ino];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(current) else { continue };
            {
                let state = node.state.lock().await;
                stack.extend(state.children.values().map(|c| c.ino));
            }
            self.nodes.forget(current);
        }
    }
}
