//! Supervisor for the watcher and handler fleet.
//!
//! The [`Syncer`] owns every watcher and handler, reconciles them against
//! configuration snapshots, and routes explicit sync and mount requests.
//! All commands travel over a bounded channel into one loop, so callers
//! never race the supervisor's state.
//!
//! Invariants: one handler per distinct bucket key, one watcher per
//! distinct local root, and a handler survives a reload untouched when
//! [`crate::config::Setting::has_change`] is false for its key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, Setting};
use crate::error::{Error, Result};
use crate::handler::{Handler, SyncStatusEvent};
use crate::store::ObjectStore;
use crate::watcher::{Watcher, WatcherOptions};

#[cfg(unix)]
use crate::mount::Mounter;

/// Buffer for sync status events consumed by UI layers.
const STATUS_BUFFER: usize = 1000;
const COMMAND_BUFFER: usize = 16;

/// Builds the object-store client for one binding's credentials.
pub type StoreFactory = dyn Fn(&Setting) -> Arc<dyn ObjectStore> + Send + Sync;

enum Command {
    Reload(Config, oneshot::Sender<Result<()>>),
    Sync(Setting, oneshot::Sender<Result<()>>),
    SyncAll(oneshot::Sender<Result<()>>),
    #[cfg(unix)]
    Mount(Setting, oneshot::Sender<Result<PathBuf>>),
    #[cfg(unix)]
    Unmount(Setting, oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<()>),
}

/// Supervisor owning all per-binding pipelines.
pub struct Syncer {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: Mutex<Option<mpsc::Receiver<SyncStatusEvent>>>,
    reconfigured: Arc<Notify>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Syncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer").finish()
    }
}

impl Syncer {
    /// Start the supervisor with no bindings. `store_factory` turns one
    /// binding's credentials into an object-store client.
    pub fn new(store_factory: Arc<StoreFactory>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) = mpsc::channel(STATUS_BUFFER);
        let reconfigured = Arc::new(Notify::new());

        let state = State {
            store_factory,
            status_tx,
            reconfigured: Arc::clone(&reconfigured),
            cancel: CancellationToken::new(),
            watchers: HashMap::new(),
            handlers: HashMap::new(),
            #[cfg(unix)]
            mounters: HashMap::new(),
        };
        let task = tokio::spawn(run(state, cmd_rx));
        Self {
            cmd_tx,
            status_rx: Mutex::new(Some(status_rx)),
            reconfigured,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }
    }

    /// Sync-start/complete stream. Taken once by the consuming layer.
    pub fn events(&self) -> Option<mpsc::Receiver<SyncStatusEvent>> {
        self.status_rx.lock().unwrap().take()
    }

    /// Signalled after every successful reconfiguration.
    pub fn reconfigured(&self) -> Arc<Notify> {
        Arc::clone(&self.reconfigured)
    }

    /// Reconcile the fleet against a configuration snapshot.
    pub async fn reload(&self, config: Config) -> Result<()> {
        self.command(|ack| Command::Reload(config, ack)).await?
    }

    /// Rescan one binding's local root, scoped to its handler.
    pub async fn sync(&self, setting: Setting) -> Result<()> {
        self.command(|ack| Command::Sync(setting, ack)).await?
    }

    /// Rescan every watched root for every handler.
    pub async fn sync_all(&self) -> Result<()> {
        self.command(|ack| Command::SyncAll(ack)).await?
    }

    /// Mount one binding's remote prefix; returns the mount point.
    #[cfg(unix)]
    pub async fn mount(&self, setting: Setting) -> Result<PathBuf> {
        self.command(|ack| Command::Mount(setting, ack)).await?
    }

    /// Tear down one binding's mount.
    #[cfg(unix)]
    pub async fn unmount(&self, setting: Setting) -> Result<()> {
        self.command(|ack| Command::Unmount(setting, ack)).await?
    }

    /// Drain in-flight flushes and stop everything. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<Result<T>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx.send(build(ack_tx)).await.map_err(|_| Error::Closed)?;
        ack_rx.await.map_err(|_| Error::Closed)
    }
}

/// One watched local root and its event fan-out.
struct WatcherEntry {
    watcher: Arc<Watcher>,
    tasks: Vec<JoinHandle<()>>,
}

struct State {
    store_factory: Arc<StoreFactory>,
    status_tx: mpsc::Sender<SyncStatusEvent>,
    reconfigured: Arc<Notify>,
    cancel: CancellationToken,
    /// local root -> watcher
    watchers: HashMap<String, WatcherEntry>,
    /// bucket key -> handler
    handlers: HashMap<String, Arc<Handler>>,
    /// mount id -> (mounter, bucket key)
    #[cfg(unix)]
    mounters: HashMap<String, (Arc<Mounter>, String)>,
}

async fn run(mut state: State, mut cmd_rx: mpsc::Receiver<Command>) {
    while let Some(command) = cmd_rx.recv().await {
        match command {
            Command::Reload(config, ack) => {
                let result = reload(&mut state, config).await;
                if let Err(e) = &result {
                    error!(error = %e, "reload failed, keeping previous state");
                }
                let _ = ack.send(result);
            }
            Command::Sync(setting, ack) => {
                let result = match state.watchers.get(&setting.local) {
                    Some(entry) => entry.watcher.rescan(&setting.bucket_key()),
                    None => Err(Error::NotFound(setting.local.clone())),
                };
                let _ = ack.send(result);
            }
            Command::SyncAll(ack) => {
                for entry in state.watchers.values() {
                    if let Err(e) = entry.watcher.rescan("") {
                        warn!(error = %e, "rescan");
                    }
                }
                let _ = ack.send(Ok(()));
            }
            #[cfg(unix)]
            Command::Mount(setting, ack) => {
                let _ = ack.send(mount(&mut state, &setting));
            }
            #[cfg(unix)]
            Command::Unmount(setting, ack) => {
                let mount_id = setting.mount_id();
                if let Some((mounter, _)) = state.mounters.remove(&mount_id) {
                    mounter.unmount();
                }
                let _ = ack.send(Ok(()));
            }
            Command::Close(ack) => {
                shutdown(&mut state).await;
                let _ = ack.send(());
                return;
            }
        }
    }
    shutdown(&mut state).await;
}

/// Rebuild the fleet for a new configuration. Fallible construction runs
/// before any teardown, so a failed reload leaves the previous fleet
/// running.
async fn reload(state: &mut State, config: Config) -> Result<()> {
    config.validate()?;

    // One handler per distinct bucket key: first binding wins, as the
    // configuration is ordered.
    let mut desired: HashMap<String, Setting> = HashMap::new();
    for setting in &config.settings {
        desired.entry(setting.bucket_key()).or_insert_with(|| setting.clone());
    }

    // Build the new watchers before touching the running fleet.
    let mut roots: HashMap<String, Vec<Setting>> = HashMap::new();
    for setting in desired.values() {
        roots.entry(setting.local.clone()).or_default().push(setting.clone());
    }
    let mut new_watchers: HashMap<String, Arc<Watcher>> = HashMap::new();
    for (root, bindings) in &roots {
        let options = WatcherOptions {
            // Hidden files are filtered at the watcher only when every
            // binding on this root wants them filtered.
            ignore_hidden: bindings.iter().all(|s| s.ignore_hidden_files),
            ops: Default::default(),
        };
        new_watchers.insert(root.clone(), Arc::new(Watcher::new(options)?));
    }

    // Stop the old watchers and their dispatchers.
    for (_, entry) in state.watchers.drain() {
        entry.watcher.close().await;
        for task in entry.tasks {
            task.abort();
        }
    }

    // Close handlers whose key disappeared or whose settings changed;
    // keep the identical instance otherwise.
    let mut kept: HashMap<String, Arc<Handler>> = HashMap::new();
    let previous: Vec<(String, Arc<Handler>)> = state.handlers.drain().collect();
    for (key, handler) in previous {
        match desired.get(&key) {
            Some(setting) if !handler.has_change(setting) => {
                kept.insert(key, handler);
            }
            _ => {
                #[cfg(unix)]
                drop_mounters_for(state, &key);
                handler.close().await;
            }
        }
    }
    for (key, setting) in &desired {
        if !kept.contains_key(key) {
            let store = (state.store_factory)(setting);
            kept.insert(
                key.clone(),
                Handler::new(
                    setting.clone(),
                    store,
                    state.status_tx.clone(),
                    state.cancel.child_token(),
                ),
            );
        }
    }
    state.handlers = kept;

    // Wire each watcher to the handlers bound to its root and start it.
    for (root, watcher) in new_watchers {
        let handlers: Vec<Arc<Handler>> = state
            .handlers
            .values()
            .filter(|h| h.setting().local == root)
            .cloned()
            .collect();
        if let Err(e) = watcher.start(std::path::Path::new(&root)).await {
            error!(%root, error = %e, "start watcher");
        }
        let mut tasks = Vec::with_capacity(2);
        let events = watcher.events();
        let fan_out = handlers.clone();
        tasks.push(tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                for handler in &fan_out {
                    if event.handler_key.is_empty() || event.handler_key == handler.key() {
                        handler.receive(event.clone());
                    }
                }
            }
        }));
        let errors = watcher.errors();
        let watched_root = root.clone();
        tasks.push(tokio::spawn(async move {
            while let Ok(e) = errors.recv().await {
                error!(root = %watched_root, error = %e, "watch");
            }
        }));
        state.watchers.insert(root, WatcherEntry { watcher, tasks });
    }

    info!(
        watchers = state.watchers.len(),
        handlers = state.handlers.len(),
        "configuration applied"
    );
    state.reconfigured.notify_waiters();
    Ok(())
}

#[cfg(unix)]
fn mount(state: &mut State, setting: &Setting) -> Result<PathBuf> {
    let key = setting.bucket_key();
    let handler =
        state.handlers.get(&key).ok_or_else(|| Error::NotFound(key.clone()))?;
    let mount_id = setting.mount_id();
    let existing = state.mounters.get(&mount_id).map(|(mounter, _)| Arc::clone(mounter));
    let mounter = match existing {
        Some(mounter) => mounter,
        None => {
            let mounter = Arc::new(Mounter::new(
                handler.remote(),
                setting,
                state.cancel.child_token(),
            )?);
            state.mounters.insert(mount_id, (Arc::clone(&mounter), key));
            mounter
        }
    };
    mounter.mount()?;
    Ok(mounter.mountpoint().to_owned())
}

/// Unmount every view served by the given handler before it closes.
#[cfg(unix)]
fn drop_mounters_for(state: &mut State, bucket_key: &str) {
    let doomed: Vec<String> = state
        .mounters
        .iter()
        .filter(|(_, (_, key))| key == bucket_key)
        .map(|(id, _)| id.clone())
        .collect();
    for id in doomed {
        if let Some((mounter, _)) = state.mounters.remove(&id) {
            mounter.unmount();
        }
    }
}

async fn shutdown(state: &mut State) {
    state.cancel.cancel();
    #[cfg(unix)]
    for (_, (mounter, _)) in state.mounters.drain() {
        mounter.unmount();
    }
    for (_, handler) in state.handlers.drain() {
        handler.close().await;
    }
    for (_, entry) in state.watchers.drain() {
        entry.watcher.close().await;
        for task in entry.tasks {
            task.abort();
        }
    }
    info!("syncer closed");
}
