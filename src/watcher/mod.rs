//! Recursive local filesystem watcher.
//!
//! One watcher observes one local root. Raw OS notifications only trigger
//! reconciliation: the watcher walks the tree, diffs it against its cached
//! snapshot, and emits semantic [`WatchEvent`]s: rename pairs detected by
//! file identity, then writes, creates and removes. The same
//! reconciliation runs on an explicit [`Watcher::rescan`], optionally
//! scoped to a single handler key.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashSet;
use notify::{RecommendedWatcher, RecursiveMode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::local::{same_file, LocalFileInfo};

/// Buffered semantic events awaiting the dispatcher.
const EVENT_BUFFER: usize = 1024;
const ERROR_BUFFER: usize = 64;

/// Semantic operation carried by a [`WatchEvent`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WatchOp {
    Create,
    Write,
    Rename,
    Remove,
}

/// Filter over which operations a watcher emits. The default passes all.
#[derive(Debug, Copy, Clone, Default)]
pub struct OpMask(u8);

impl OpMask {
    pub const ALL: OpMask = OpMask(0);

    pub fn only(ops: &[WatchOp]) -> Self {
        let mut bits = 0;
        for op in ops {
            bits |= Self::bit(*op);
        }
        OpMask(bits)
    }

    pub fn allows(&self, op: WatchOp) -> bool {
        self.0 == 0 || self.0 & Self::bit(op) != 0
    }

    fn bit(op: WatchOp) -> u8 {
        match op {
            WatchOp::Create => 1,
            WatchOp::Write => 2,
            WatchOp::Rename => 4,
            WatchOp::Remove => 8,
        }
    }
}

/// One semantic filesystem event.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub op: WatchOp,
    pub file: LocalFileInfo,
    /// Original snapshot; set only for rename pairs.
    pub ori: Option<LocalFileInfo>,
    /// Scopes the event to one handler; empty means every handler bound
    /// to this root.
    pub handler_key: String,
}

/// Watcher construction options.
#[derive(Debug, Copy, Clone, Default)]
pub struct WatcherOptions {
    /// Skip files and directories whose basename starts with a dot.
    pub ignore_hidden: bool,
    pub ops: OpMask,
}

enum Command {
    /// Register the tree and seed the cache before any raw event can
    /// fire; replies once watching is live.
    Start { root: PathBuf, ack: tokio::sync::oneshot::Sender<Result<()>> },
    Reconcile { handler_key: String },
}

struct Inner {
    options: WatcherOptions,
    fs_watcher: Mutex<Option<RecommendedWatcher>>,
    root: Mutex<Option<PathBuf>>,
    watched: Mutex<HashSet<PathBuf>>,
    pending_rescans: DashSet<String>,
    events_tx: async_channel::Sender<WatchEvent>,
    errors_tx: async_channel::Sender<Error>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

/// Recursive watcher over one local root.
pub struct Watcher {
    inner: Arc<Inner>,
    cmd_tx: mpsc::Sender<Command>,
    events_rx: async_channel::Receiver<WatchEvent>,
    errors_rx: async_channel::Receiver<Error>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").field("root", &self.inner.root.lock().unwrap()).finish()
    }
}

impl Watcher {
    pub fn new(options: WatcherOptions) -> Result<Self> {
        let (events_tx, events_rx) = async_channel::bounded(EVENT_BUFFER);
        let (errors_tx, errors_rx) = async_channel::bounded(ERROR_BUFFER);
        let (raw_tx, raw_rx) = async_channel::bounded::<notify::Event>(EVENT_BUFFER);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let forward = move |result: notify::Result<notify::Event>| match result {
            // The callback runs on the notify thread; blocking on a full
            // queue backpressures the OS event stream instead of losing
            // the wakeup that should trigger the next reconciliation.
            Ok(event) => {
                let _ = raw_tx.send_blocking(event);
            }
            Err(e) => warn!(error = %e, "filesystem notification error"),
        };
        let fs_watcher =
            notify::recommended_watcher(forward).map_err(|e| Error::Watch(e.to_string()))?;

        let inner = Arc::new(Inner {
            options,
            fs_watcher: Mutex::new(Some(fs_watcher)),
            root: Mutex::new(None),
            watched: Mutex::new(HashSet::new()),
            pending_rescans: DashSet::new(),
            events_tx,
            errors_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let task = tokio::spawn(event_loop(Arc::clone(&inner), raw_rx, cmd_rx));
        Ok(Self { inner, cmd_tx, events_rx, errors_rx, task: Mutex::new(Some(task)) })
    }

    /// Begin watching `root`: register the whole tree and seed the cache
    /// with its current state so the next reconciliation only reports
    /// changes.
    pub async fn start(&self, root: &Path) -> Result<()> {
        self.ensure_open()?;
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        self.cmd_tx
            .send(Command::Start { root: root.to_owned(), ack: ack_tx })
            .await
            .map_err(|_| Error::Closed)?;
        ack_rx.await.map_err(|_| Error::Closed)?
    }

    /// Register `path` and every directory below it.
    pub fn add_recursive(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        register_tree(&self.inner, path)
    }

    /// Drop the watch on `path` and every registered directory below it.
    pub fn remove_recursive(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        unregister_tree(&self.inner, path);
        Ok(())
    }

    /// Force a reconciliation pass. Synthesized events carry
    /// `handler_key`; an empty key broadcasts to every handler on this
    /// root. Returns [`Error::Busy`] while an identical request is queued.
    pub fn rescan(&self, handler_key: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.inner.pending_rescans.insert(handler_key.to_owned()) {
            return Err(Error::Busy);
        }
        self.cmd_tx
            .try_send(Command::Reconcile { handler_key: handler_key.to_owned() })
            .map_err(|_| {
                self.inner.pending_rescans.remove(handler_key);
                Error::Closed
            })?;
        Ok(())
    }

    /// Semantic event stream.
    pub fn events(&self) -> async_channel::Receiver<WatchEvent> {
        self.events_rx.clone()
    }

    /// Walk and notification errors.
    pub fn errors(&self) -> async_channel::Receiver<Error> {
        self.errors_rx.clone()
    }

    /// Token cancelled once the watcher has shut down.
    pub fn closed(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Stop the loop and close the event and error channels. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

async fn event_loop(
    inner: Arc<Inner>,
    raw_rx: async_channel::Receiver<notify::Event>,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    let mut cache: HashMap<PathBuf, LocalFileInfo> = HashMap::new();
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            raw = raw_rx.recv() => {
                let Ok(event) = raw else { break };
                handle_raw(&inner, &event);
                // Drain the burst before walking the tree once.
                while let Ok(event) = raw_rx.try_recv() {
                    handle_raw(&inner, &event);
                }
                reconcile_and_emit(&inner, &mut cache, "").await;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Start { root, ack }) => {
                        *inner.root.lock().unwrap() = Some(root.clone());
                        let result = register_tree(&inner, &root).map(|()| {
                            cache = scan(&inner).unwrap_or_default();
                        });
                        let _ = ack.send(result);
                    }
                    Some(Command::Reconcile { handler_key }) => {
                        inner.pending_rescans.remove(&handler_key);
                        reconcile_and_emit(&inner, &mut cache, &handler_key).await;
                    }
                    None => break,
                }
            }
        }
    }
    inner.events_tx.close();
    inner.errors_tx.close();
    *inner.fs_watcher.lock().unwrap() = None;
    inner.cancel.cancel();
}

/// Keep the OS watch registrations in step with raw structural events.
fn handle_raw(inner: &Inner, event: &notify::Event) {
    use notify::EventKind;
    for path in &event.paths {
        if is_hidden(inner, path) {
            continue;
        }
        match event.kind {
            EventKind::Create(_) => {
                if path.is_dir() {
                    if let Err(e) = register_tree(inner, path) {
                        debug!(path = %path.display(), error = %e, "register subtree");
                    }
                }
            }
            // A removed or renamed-away path cannot be statted; drop any
            // registrations at or below it so the dead subtree stops
            // producing wakeups.
            EventKind::Remove(_) | EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
                unregister_tree(inner, path);
            }
            _ => {}
        }
    }
}

async fn reconcile_and_emit(
    inner: &Inner,
    cache: &mut HashMap<PathBuf, LocalFileInfo>,
    handler_key: &str,
) {
    let disk = match scan(inner) {
        Ok(disk) => disk,
        Err(e) => {
            let _ = inner.errors_tx.send(e).await;
            return;
        }
    };
    let events = reconcile(cache, disk, handler_key);
    for event in events {
        if !inner.options.ops.allows(event.op) {
            continue;
        }
        // Emission must stay interruptible: a stalled consumer cannot be
        // allowed to wedge shutdown.
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            sent = inner.events_tx.send(event) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Diff the cached snapshot against the on-disk state, pairing renames by
/// file identity. Emission order within one cycle: renames, writes,
/// creates, removes. The cache is replaced by the on-disk snapshot.
fn reconcile(
    cache: &mut HashMap<PathBuf, LocalFileInfo>,
    disk: HashMap<PathBuf, LocalFileInfo>,
    handler_key: &str,
) -> Vec<WatchEvent> {
    let mut created: Vec<&LocalFileInfo> =
        disk.values().filter(|info| !cache.contains_key(&info.path)).collect();
    let mut removed: Vec<&LocalFileInfo> =
        cache.values().filter(|info| !disk.contains_key(&info.path)).collect();
    created.sort_by(|a, b| a.path.cmp(&b.path));
    removed.sort_by(|a, b| a.path.cmp(&b.path));

    let mut events = Vec::new();

    // Rename pairs first: a (removed, created) pair backed by the same
    // file is one move, not a delete plus a create.
    let mut paired_created = vec![false; created.len()];
    let mut remaining_removed = Vec::new();
    for old in removed {
        let mut matched = false;
        for (i, new) in created.iter().enumerate() {
            if !paired_created[i] && same_file(old, new) {
                paired_created[i] = true;
                matched = true;
                events.push(WatchEvent {
                    op: WatchOp::Rename,
                    file: (*new).clone(),
                    ori: Some(old.clone()),
                    handler_key: handler_key.to_owned(),
                });
                break;
            }
        }
        if !matched {
            remaining_removed.push(old.clone());
        }
    }

    for info in disk.values() {
        if let Some(cached) = cache.get(&info.path) {
            if info.mod_time > cached.mod_time {
                events.push(WatchEvent {
                    op: WatchOp::Write,
                    file: info.clone(),
                    ori: None,
                    handler_key: handler_key.to_owned(),
                });
            }
        }
    }

    for (i, new) in created.iter().enumerate() {
        if !paired_created[i] {
            events.push(WatchEvent {
                op: WatchOp::Create,
                file: (*new).clone(),
                ori: None,
                handler_key: handler_key.to_owned(),
            });
        }
    }

    for old in remaining_removed {
        events.push(WatchEvent {
            op: WatchOp::Remove,
            file: old,
            ori: None,
            handler_key: handler_key.to_owned(),
        });
    }

    events.sort_by_key(|e| match e.op {
        WatchOp::Rename => 0,
        WatchOp::Write => 1,
        WatchOp::Create => 2,
        WatchOp::Remove => 3,
    });
    *cache = disk;
    events
}

/// Walk the root, returning the snapshot of every regular file. Keeps the
/// directory registrations in sync as a side effect.
fn scan(inner: &Inner) -> Result<HashMap<PathBuf, LocalFileInfo>> {
    let Some(root) = inner.root.lock().unwrap().clone() else {
        return Ok(HashMap::new());
    };
    let mut files = HashMap::new();
    let mut dirs = HashSet::new();
    let ignore_hidden = inner.options.ignore_hidden;
    let walker = WalkDir::new(&root).into_iter().filter_entry(move |entry| {
        entry.depth() == 0 || !ignore_hidden || !file_name_hidden(entry.path())
    });
    for entry in walker {
        let entry = entry.map_err(|e| Error::Watch(e.to_string()))?;
        let meta = entry.metadata().map_err(|e| Error::Watch(e.to_string()))?;
        if meta.is_dir() {
            dirs.insert(entry.path().to_owned());
        } else if meta.is_file() {
            files.insert(
                entry.path().to_owned(),
                LocalFileInfo::from_metadata(entry.path(), &meta),
            );
        }
    }

    // Register newly appeared directories, drop vanished ones.
    let stale: Vec<PathBuf> = {
        let watched = inner.watched.lock().unwrap();
        watched.iter().filter(|d| !dirs.contains(*d)).cloned().collect()
    };
    for dir in stale {
        unregister_tree(inner, &dir);
    }
    for dir in dirs {
        if let Err(e) = register_dir(inner, &dir) {
            debug!(dir = %dir.display(), error = %e, "register directory");
        }
    }
    Ok(files)
}

fn register_tree(inner: &Inner, path: &Path) -> Result<()> {
    let ignore_hidden = inner.options.ignore_hidden;
    let walker = WalkDir::new(path).into_iter().filter_entry(move |entry| {
        entry.depth() == 0 || !ignore_hidden || !file_name_hidden(entry.path())
    });
    for entry in walker {
        let entry = entry.map_err(|e| Error::Watch(e.to_string()))?;
        if entry.file_type().is_dir() {
            register_dir(inner, entry.path())?;
        }
    }
    Ok(())
}

fn register_dir(inner: &Inner, dir: &Path) -> Result<()> {
    if !inner.watched.lock().unwrap().insert(dir.to_owned()) {
        return Ok(());
    }
    let mut guard = inner.fs_watcher.lock().unwrap();
    let Some(fs_watcher) = guard.as_mut() else {
        return Err(Error::Closed);
    };
    notify::Watcher::watch(fs_watcher, dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Watch(e.to_string()))
}

fn unregister_tree(inner: &Inner, path: &Path) {
    let doomed: Vec<PathBuf> = {
        let mut watched = inner.watched.lock().unwrap();
        let doomed: Vec<PathBuf> = watched.iter().filter(|d| d.starts_with(path)).cloned().collect();
        for dir in &doomed {
            watched.remove(dir);
        }
        doomed
    };
    let mut guard = inner.fs_watcher.lock().unwrap();
    let Some(fs_watcher) = guard.as_mut() else { return };
    for dir in doomed {
        // Unwatching a path the OS already forgot is not an error.
        let _ = notify::Watcher::unwatch(fs_watcher, &dir);
    }
}

fn is_hidden(inner: &Inner, path: &Path) -> bool {
    inner.options.ignore_hidden && file_name_hidden(path)
}

fn file_name_hidden(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()).map(|n| n.starts_with('.')).unwrap_or(false)
}
