//! Per-binding sync pipeline.
//!
//! A [`Handler`] absorbs high-frequency watch events into a keyed map
//! where the latest event per path wins, and applies the surviving
//! intents to the remote store on a fixed tick. Each path contributes at
//! most one remote call per flush: one upload, one rename, or inclusion
//! in the batch delete.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Setting;
use crate::local::LocalFileInfo;
use crate::remote::RemoteFs;
use crate::store::ObjectStore;
use crate::watcher::{WatchEvent, WatchOp};

/// Flush period.
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);
/// Concurrent upload/rename tasks per flush.
pub const WORKER_PERMITS: usize = 10;

/// Batch lifecycle marker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Start,
    Complete,
}

/// Announces a non-empty flush of one handler on the shared status
/// channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatusEvent {
    /// The handler's bucket key.
    pub handler: String,
    pub status: SyncStatus,
}

/// Upload/rename/delete pipeline for one binding.
pub struct Handler {
    setting: Setting,
    remote: Arc<RemoteFs>,
    pending: DashMap<PathBuf, WatchEvent>,
    status_tx: mpsc::Sender<SyncStatusEvent>,
    /// Aborts in-flight remote calls; derived from the supervisor's root
    /// token.
    cancel: CancellationToken,
    /// Stops the tick loop without touching in-flight remote calls.
    stop: CancellationToken,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("bucket_key", &self.setting.bucket_key())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Handler {
    /// Build the handler and start its tick loop. `cancel` is derived
    /// from the supervisor's root token, so a closing supervisor aborts
    /// in-flight remote calls.
    pub fn new(
        setting: Setting,
        store: Arc<dyn ObjectStore>,
        status_tx: mpsc::Sender<SyncStatusEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let remote = Arc::new(RemoteFs::new(store, setting.local.clone(), &setting.prefix));
        let handler = Arc::new(Self {
            setting,
            remote,
            pending: DashMap::new(),
            status_tx,
            cancel,
            stop: CancellationToken::new(),
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
        });

        // Drain the progress channel so transfers never stall on it.
        let progress = handler.remote.events();
        tokio::spawn(async move {
            while let Ok(event) = progress.recv().await {
                info!(%event, "transfer");
            }
        });

        let looper = Arc::clone(&handler);
        *handler.task.lock().unwrap() =
            Some(tokio::spawn(async move { looper.run().await }));
        handler
    }

    /// Identity of the remote target this handler serves.
    pub fn key(&self) -> String {
        self.setting.bucket_key()
    }

    pub fn setting(&self) -> &Setting {
        &self.setting
    }

    /// The binding's remote namespace, shared with its mounted view.
    pub fn remote(&self) -> Arc<RemoteFs> {
        Arc::clone(&self.remote)
    }

    /// True when `new_setting` differs in a way that requires a rebuild.
    pub fn has_change(&self, new_setting: &Setting) -> bool {
        self.setting.has_change(new_setting)
    }

    /// Record the latest intent for the event's path. Never blocks on a
    /// running flush; events landing mid-flush are handled next tick.
    pub fn receive(&self, event: WatchEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.pending.insert(event.file.path.clone(), event);
    }

    /// Stop the tick loop after the in-flight flush, then close the
    /// progress channel. Remote calls already running are left to finish;
    /// only the supervisor's root cancellation aborts them.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.remote.close();
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => self.flush().await,
            }
        }
    }

    /// One tick: drain the pending map and apply the batch.
    async fn flush(&self) {
        let keys: Vec<PathBuf> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut batch = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, event)) = self.pending.remove(&key) {
                batch.push(event);
            }
        }
        if batch.is_empty() {
            return;
        }

        self.publish(SyncStatus::Start).await;
        self.apply(batch).await;
        self.publish(SyncStatus::Complete).await;
    }

    async fn apply(&self, batch: Vec<WatchEvent>) {
        let semaphore = Arc::new(Semaphore::new(WORKER_PERMITS));
        let mut workers = JoinSet::new();
        let mut deletes: Vec<String> = Vec::new();

        for event in batch {
            debug!(op = ?event.op, file = %event.file, "flush");
            match event.op {
                WatchOp::Create | WatchOp::Write => {
                    let remote = self.remote();
                    let cancel = self.cancel.clone();
                    let semaphore = Arc::clone(&semaphore);
                    workers.spawn(async move {
                        let _permit = semaphore.acquire().await;
                        upload(&remote, event.file.path.clone(), &cancel).await;
                    });
                }
                WatchOp::Rename => {
                    let remote = self.remote();
                    let cancel = self.cancel.clone();
                    let semaphore = Arc::clone(&semaphore);
                    workers.spawn(async move {
                        let _permit = semaphore.acquire().await;
                        rename(&remote, &event, &cancel).await;
                    });
                }
                WatchOp::Remove => {
                    if !self.setting.delete {
                        continue;
                    }
                    match self.remote.remote_key_for(&event.file.path) {
                        Ok(key) => deletes.push(key),
                        Err(e) => {
                            error!(file = %event.file, error = %e, "map delete target")
                        }
                    }
                }
            }
        }

        if !deletes.is_empty() {
            let remote = self.remote();
            let cancel = self.cancel.clone();
            workers.spawn(async move {
                if let Err(e) = remote.remove(&deletes, &cancel).await {
                    error!(error = %e, "batch delete");
                }
            });
        }

        while workers.join_next().await.is_some() {}
    }

    async fn publish(&self, status: SyncStatus) {
        let event = SyncStatusEvent { handler: self.key(), status };
        if self.status_tx.send(event).await.is_err() {
            debug!("status channel closed");
        }
    }
}

/// Upload one local path, re-statting it first: the event may have raced
/// with a local delete.
async fn upload(remote: &RemoteFs, path: PathBuf, cancel: &CancellationToken) {
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "local file vanished before upload");
            return;
        }
    };
    let info = LocalFileInfo::from_metadata(&path, &meta);
    if let Err(e) = remote.upload_file(&info, cancel).await {
        error!(path = %path.display(), error = %e, "upload");
    }
}

/// Apply one rename pair remotely, choosing the subtree variant when the
/// source was a directory.
async fn rename(remote: &RemoteFs, event: &WatchEvent, cancel: &CancellationToken) {
    let Some(ori) = event.ori.as_ref() else {
        warn!(file = %event.file, "rename event without origin");
        return;
    };
    let src = match remote.remote_key_for(&ori.path) {
        Ok(key) => key,
        Err(e) => {
            error!(file = %ori, error = %e, "map rename source");
            return;
        }
    };
    let dst = match remote.remote_key_for(&event.file.path) {
        Ok(key) => key,
        Err(e) => {
            error!(file = %event.file, error = %e, "map rename target");
            return;
        }
    };
    let result = if ori.is_dir {
        remote.rename_dir(&src, &dst, cancel).await
    } else {
        remote.rename(&src, &dst, cancel).await
    };
    if let Err(e) = result {
        error!(%src, %dst, error = %e, "rename");
    }
}
