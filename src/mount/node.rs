//! Inode bookkeeping for the mounted view.
//!
//! Every kernel-visible inode wraps one [`RemoteObject`]. Directory
//! membership lives in the parent's [`NodeState`]; identity fields the
//! tree walks need without taking the state lock (parent ino, name) live
//! on the [`Node`] itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::mount::spill::Spill;
use crate::store::RemoteObject;

/// Kernel root inode number.
pub const ROOT_INO: u64 = 1;

/// Directory membership record. The kind is duplicated here so listing a
/// directory never has to take a child's state lock while holding the
/// parent's.
#[derive(Debug, Copy, Clone)]
pub struct ChildRef {
    pub ino: u64,
    pub is_dir: bool,
}

/// Mutable per-node state, guarded by one async mutex held across any
/// operation that consults or mutates the remote namespace or the spill
/// file for this node.
#[derive(Debug)]
pub struct NodeState {
    /// The node's remote object, or a synthetic directory entry.
    pub entry: RemoteObject,
    /// Membership by child name. Meaningful for directories only.
    pub children: HashMap<String, ChildRef>,
    /// True once `children` reflects a full remote listing.
    pub populated: bool,
    /// Directory exists only in memory until a descendant file is
    /// flushed.
    pub newly_created_dir: bool,
    /// Pending write buffer backing this file, when a writer is active.
    pub spill: Option<Spill>,
}

#[derive(Debug)]
pub struct Node {
    pub ino: u64,
    pub parent: AtomicU64,
    pub name: std::sync::Mutex<String>,
    pub state: tokio::sync::Mutex<NodeState>,
}

impl Node {
    pub fn parent_ino(&self) -> u64 {
        self.parent.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }
}

/// Allocation table of live inodes.
#[derive(Debug)]
pub struct NodeTable {
    nodes: DashMap<u64, Arc<Node>>,
    next_ino: AtomicU64,
}

impl NodeTable {
    /// Build the table with the root directory pre-allocated at
    /// [`ROOT_INO`].
    pub fn new(root_entry: RemoteObject) -> Self {
        let table = Self { nodes: DashMap::new(), next_ino: AtomicU64::new(ROOT_INO + 1) };
        table.nodes.insert(
            ROOT_INO,
            Arc::new(Node {
                ino: ROOT_INO,
                parent: AtomicU64::new(ROOT_INO),
                name: std::sync::Mutex::new(String::new()),
                state: tokio::sync::Mutex::new(NodeState {
                    entry: root_entry,
                    children: HashMap::new(),
                    populated: false,
                    newly_created_dir: false,
                    spill: None,
                }),
            }),
        );
        table
    }

    pub fn get(&self, ino: u64) -> Option<Arc<Node>> {
        self.nodes.get(&ino).map(|n| Arc::clone(n.value()))
    }

    /// Allocate a fresh inode under `parent`.
    pub fn insert(&self, parent: u64, name: &str, entry: RemoteObject) -> Arc<Node> {
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        let node = Arc::new(Node {
            ino,
            parent: AtomicU64::new(parent),
            name: std::sync::Mutex::new(name.to_owned()),
            state: tokio::sync::Mutex::new(NodeState {
                entry,
                children: HashMap::new(),
                populated: false,
                newly_created_dir: false,
                spill: None,
            }),
        });
        self.nodes.insert(ino, Arc::clone(&node));
        node
    }

    /// Drop `ino` from the table. Children are forgotten by the caller,
    /// which owns the parent's membership map.
    pub fn forget(&self, ino: u64) {
        self.nodes.remove(&ino);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
