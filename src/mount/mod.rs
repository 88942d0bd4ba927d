//! Userspace filesystem surface.
//!
//! A [`Mounter`] presents one binding's remote prefix as a directory tree
//! under `<dataHome>/osssync/mnt/<mountId>`. The async [`vfs::Vfs`] core
//! does the work; [`bridge::MountFs`] adapts it to the kernel's FUSE
//! protocol.

pub mod bridge;
pub mod node;
pub mod spill;
pub mod vfs;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fuser::MountOption;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Setting, APP_ID};
use crate::error::{Error, Result};
use crate::mount::bridge::MountFs;
use crate::mount::vfs::Vfs;
use crate::remote::RemoteFs;

/// FUSE server for one binding.
pub struct Mounter {
    vfs: Arc<Vfs>,
    mountpoint: PathBuf,
    mount_id: String,
    session: Mutex<Option<fuser::BackgroundSession>>,
}

impl std::fmt::Debug for Mounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mounter")
            .field("mountpoint", &self.mountpoint)
            .field("mount_id", &self.mount_id)
            .finish()
    }
}

impl Mounter {
    /// Prepare the mount point directory and the filesystem core. Nothing
    /// is mounted until [`Mounter::mount`].
    pub fn new(
        remote: Arc<RemoteFs>,
        setting: &Setting,
        cancel: CancellationToken,
    ) -> Result<Self> {
        crate::mount::spill::cleanup_spill_dir();
        let mount_id = setting.mount_id();
        let data_dir = dirs::data_dir()
            .ok_or_else(|| Error::InvalidConfig("no data directory for this user".to_owned()))?;
        let mountpoint = data_dir.join(APP_ID).join("mnt").join(&mount_id);
        std::fs::create_dir_all(&mountpoint)?;
        let vfs = Arc::new(Vfs::new(remote, &mount_id, cancel));
        Ok(Self { vfs, mountpoint, mount_id, session: Mutex::new(None) })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// The filesystem core, for driving operations without a kernel
    /// mount.
    pub fn vfs(&self) -> Arc<Vfs> {
        Arc::clone(&self.vfs)
    }

    /// Serve the filesystem in the background. Idempotent while mounted.
    pub fn mount(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        if session.is_some() {
            return Ok(());
        }
        let options = [
            MountOption::FSName(format!("ossfs/{}", self.mount_id)),
            MountOption::NoAtime,
            MountOption::AutoUnmount,
        ];
        let fs = MountFs::new(self.vfs(), Handle::current());
        let background = fuser::spawn_mount2(fs, &self.mountpoint, &options)?;
        info!(mountpoint = %self.mountpoint.display(), "mounted");
        *session = Some(background);
        Ok(())
    }

    /// Unmount and join the background session. Idempotent.
    pub fn unmount(&self) {
        if let Some(session) = self.session.lock().unwrap().take() {
            session.join();
            info!(mountpoint = %self.mountpoint.display(), "unmounted");
        }
    }
}

impl Drop for Mounter {
    fn drop(&mut self) {
        self.unmount();
    }
}
