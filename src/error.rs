//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the sync and mount pipelines returns
//! [`Result`]. The variants distinguish the cases callers branch on:
//! conditional HEADs ([`Error::NotModified`]), races with local deletes
//! ([`Error::LocalNotFound`]), and operations on torn-down instances
//! ([`Error::Closed`]).

use std::path::PathBuf;

/// Convenient result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HEAD or GET of a key the store does not hold.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Conditional HEAD matched the supplied etag.
    #[error("object not modified: {0}")]
    NotModified(String),

    /// Credentials rejected by the store. Surfaced, never retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A local path handed to the key mapper lies outside the binding's
    /// local root.
    #[error("path {path:?} is outside the local root {root:?}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    /// An upload raced with a local delete; the file vanished between the
    /// event and the stat.
    #[error("local file vanished: {0:?}")]
    LocalNotFound(PathBuf),

    /// A rescan for the same scope is already queued; the request was
    /// coalesced into it.
    #[error("rescan already pending")]
    Busy,

    /// The watcher, handler or syncer has been closed.
    #[error("instance already closed")]
    Closed,

    /// A configuration snapshot that cannot be applied.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem watch registration or tree walk failure.
    #[error("watch: {0}")]
    Watch(String),

    /// Local filesystem or network transport failure. Multipart uploads
    /// recover through their checkpoint directory on the next tick.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The store reported a failure that is none of the above.
    #[error("remote: {0}")]
    Remote(String),
}

impl Error {
    /// True for the conditional-HEAD outcome callers treat as success.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Error::NotModified(_))
    }

    /// True when the key simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
