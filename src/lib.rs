//! osssync - mirrors local directory trees into an S3-compatible object
//! store and presents the remote prefix back as a mountable userspace
//! filesystem.
//!
//! One [`config::Setting`] binds a local root to a remote target; a
//! [`syncer::Syncer`] runs any number of bindings concurrently, watching
//! each root ([`watcher::Watcher`]), debouncing events into per-binding
//! pipelines ([`handler::Handler`]) and serving mounted views
//! ([`mount::Mounter`]) over the shared [`remote::RemoteFs`] adapter.
//! The object store itself is a capability ([`store::ObjectStore`]); any
//! S3-compatible backend satisfies it.

pub mod config;
pub mod error;
pub mod handler;
pub mod local;
#[cfg(unix)]
pub mod mount;
pub mod progress;
pub mod remote;
pub mod store;
pub mod syncer;
pub mod watcher;

pub use config::{Config, Setting};
pub use error::{Error, Result};
pub use syncer::Syncer;
