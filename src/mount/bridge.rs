//! FUSE dispatch shim.
//!
//! [`MountFs`] implements the synchronous `fuser::Filesystem` trait by
//! spawning every request onto the tokio runtime and letting the async
//! [`Vfs`] core reply when the remote work finishes. Kernel threads never
//! block on object-store I/O.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::SystemTime;

use fuser::consts::FOPEN_DIRECT_IO;
use fuser::{
    FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tokio::runtime::Handle;

use crate::mount::node::ROOT_INO;
use crate::mount::vfs::{Attr, Vfs, ATTR_TTL, BLOCK_SIZE, ENTRY_TTL};

pub struct MountFs {
    vfs: Arc<Vfs>,
    handle: Handle,
}

impl MountFs {
    pub fn new(vfs: Arc<Vfs>, handle: Handle) -> Self {
        Self { vfs, handle }
    }
}

fn render_attr(attr: &Attr, uid: u32, gid: u32) -> fuser::FileAttr {
    let (kind, perm) = if attr.is_dir {
        (FileType::Directory, 0o777)
    } else {
        (FileType::RegularFile, 0o644)
    };
    fuser::FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.size.div_ceil(BLOCK_SIZE as u64),
        atime: attr.mtime,
        mtime: attr.mtime,
        ctime: attr.mtime,
        crtime: attr.mtime,
        kind,
        perm,
        nlink: 1,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn utf8_name(name: &OsStr) -> Result<String, libc::c_int> {
    name.to_str().map(str::to_owned).ok_or(libc::EINVAL)
}

impl fuser::Filesystem for MountFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let (uid, gid) = (req.uid(), req.gid());
        let name = match utf8_name(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            match vfs.lookup(parent, &name).await {
                Ok(attr) => reply.entry(&ENTRY_TTL, &render_attr(&attr, uid, gid), 0),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let (uid, gid) = (req.uid(), req.gid());
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            match vfs.getattr(ino).await {
                Ok(attr) => reply.attr(&ATTR_TTL, &render_attr(&attr, uid, gid)),
                Err(errno) => reply.error(errno),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let (uid, gid) = (req.uid(), req.gid());
        let mtime = mtime.map(|t| match t {
            TimeOrNow::SpecificTime(t) => t,
            TimeOrNow::Now => SystemTime::now(),
        });
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            match vfs.setattr(ino, size, mtime).await {
                Ok(attr) => reply.attr(&ATTR_TTL, &render_attr(&attr, uid, gid)),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let (uid, gid) = (req.uid(), req.gid());
        let name = match utf8_name(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            match vfs.mkdir(parent, &name).await {
                Ok(attr) => reply.entry(&ENTRY_TTL, &render_attr(&attr, uid, gid), 0),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match utf8_name(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            match vfs.unlink(parent, &name).await {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match utf8_name(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            match vfs.unlink(parent, &name).await {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (utf8_name(name), utf8_name(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return reply.error(libc::EINVAL),
        };
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            match vfs.rename(parent, &name, newparent, &newname).await {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            match vfs.open_file(ino).await {
                Ok(_) => reply.opened(0, FOPEN_DIRECT_IO),
                Err(errno) => reply.error(errno),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            match vfs.read(ino, offset.max(0) as u64, size).await {
                Ok(data) => reply.data(&data),
                Err(errno) => reply.error(errno),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            match vfs.write(ino, offset.max(0) as u64, &data).await {
                Ok(written) => reply.written(written),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            match vfs.flush(ino).await {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            let _ = vfs.release(ino).await;
            reply.ok();
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            let children = match vfs.readdir(ino).await {
                Ok(children) => children,
                Err(errno) => return reply.error(errno),
            };
            let parent = vfs.parent_ino(ino).unwrap_or(ROOT_INO);
            let mut entries: Vec<(u64, FileType, String)> = vec![
                (ino, FileType::Directory, ".".to_owned()),
                (parent, FileType::Directory, "..".to_owned()),
            ];
            entries.extend(children.into_iter().map(|c| {
                let kind = if c.is_dir { FileType::Directory } else { FileType::RegularFile };
                (c.ino, kind, c.name)
            }));
            for (i, (ino, kind, name)) in
                entries.into_iter().enumerate().skip(offset.max(0) as usize)
            {
                if reply.add(ino, (i + 1) as i64, kind, &name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let capacity = self.vfs.statfs();
        reply.statfs(
            capacity.blocks,
            capacity.blocks_free,
            capacity.blocks_free,
            capacity.files,
            capacity.files_free,
            capacity.block_size,
            capacity.name_len,
            capacity.block_size,
        );
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let (uid, gid) = (req.uid(), req.gid());
        let name = match utf8_name(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            match vfs.create(parent, &name).await {
                Ok(attr) => {
                    reply.created(&ENTRY_TTL, &render_attr(&attr, uid, gid), 0, 0, FOPEN_DIRECT_IO)
                }
                Err(errno) => reply.error(errno),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &mut self,
        _req: &Request<'_>,
        ino_in: u64,
        _fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        _fh_out: u64,
        offset_out: i64,
        len: u64,
        _flags: u32,
        reply: ReplyWrite,
    ) {
        let vfs = Arc::clone(&self.vfs);
        self.handle.spawn(async move {
            let copied = vfs
                .copy_file_range(
                    ino_in,
                    offset_in.max(0) as u64,
                    ino_out,
                    offset_out.max(0) as u64,
                    len,
                )
                .await;
            match copied {
                Ok(n) => reply.written(n as u32),
                Err(errno) => reply.error(errno),
            }
        });
    }
}
