//! FUSE adapter
//!
//! Translates kernel requests into overlay operations. Every request is
//! traced on the `quarantinefs::request` target.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::SystemTime;

use fuser::{
    FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use tracing::warn;

use super::node::NodeId;
use super::overlay::Overlay;
use super::tree::SetAttr;
use crate::error::Error;

macro_rules! request {
    ($($arg:tt)*) => {
        tracing::debug!(target: "quarantinefs::request", $($arg)*)
    };
}

/// Errno for a failed operation, logging unexpected failures
fn errno(op: &str, err: Error) -> c_int {
    match &err {
        Error::NotFound | Error::PermissionDenied(_) | Error::AlreadyExists(_) => {
            request!("{} -> {}", op, err)
        }
        _ => warn!("{} failed: {}", op, err),
    }
    err.errno()
}

fn system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// FUSE filesystem serving an [`Overlay`]
pub struct OverlayFs {
    overlay: Arc<Overlay>,
}

impl OverlayFs {
    pub fn new(overlay: Arc<Overlay>) -> Self {
        Self { overlay }
    }
}

impl Filesystem for OverlayFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        request!("lookup(parent={}, name={:?})", parent, name);

        match self.overlay.lookup(NodeId(parent), name) {
            Ok((node, attrs)) => reply.entry(&attrs.valid, &attrs.to_fuser(node), 0),
            Err(e) => reply.error(errno("lookup", e)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        request!("getattr(ino={})", ino);

        match self.overlay.attr(NodeId(ino)) {
            Ok(attrs) => reply.attr(&attrs.valid, &attrs.to_fuser(NodeId(ino))),
            Err(e) => reply.error(errno("getattr", e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        request!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino,
            mode,
            uid,
            gid,
            size
        );

        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(system_time),
            mtime: mtime.map(system_time),
        };
        match self.overlay.setattr(NodeId(ino), changes) {
            Ok(attrs) => reply.attr(&attrs.valid, &attrs.to_fuser(NodeId(ino))),
            Err(e) => reply.error(errno("setattr", e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        request!("readlink(ino={})", ino);

        match self.overlay.readlink(NodeId(ino)) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(errno("readlink", e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        request!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let perm = (mode & !umask & 0o7777) as u16;
        match self
            .overlay
            .mkdir(NodeId(parent), name, perm, req.uid(), req.gid())
        {
            Ok((node, attrs)) => reply.entry(&attrs.valid, &attrs.to_fuser(node), 0),
            Err(e) => reply.error(errno("mkdir", e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        request!("unlink(parent={}, name={:?})", parent, name);

        match self.overlay.unlink(NodeId(parent), name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("unlink", e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        request!("rmdir(parent={}, name={:?})", parent, name);

        match self.overlay.rmdir(NodeId(parent), name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rmdir", e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        request!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?}, flags={})",
            parent,
            name,
            newparent,
            newname,
            flags
        );

        // RENAME_EXCHANGE and RENAME_NOREPLACE are not supported
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }

        match self
            .overlay
            .rename(NodeId(parent), name, NodeId(newparent), newname)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rename", e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        request!("open(ino={}, flags={:#x})", ino, flags);

        match self.overlay.open(NodeId(ino), flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        request!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.overlay.read(fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        request!(
            "write(ino={}, fh={}, offset={}, len={})",
            ino,
            fh,
            offset,
            data.len()
        );

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.overlay.write(fh, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(errno("write", e)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        request!("flush(ino={}, fh={})", ino, fh);
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        request!("release(ino={}, fh={})", ino, fh);

        match self.overlay.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", e)),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        request!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        request!("readdir(ino={}, offset={})", ino, offset);

        let node = NodeId(ino);
        let (children, parent) = match self
            .overlay
            .list(node)
            .and_then(|children| Ok((children, self.overlay.parent_of(node)?)))
        {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(errno("readdir", e));
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, &OsStr)> = vec![
            (ino, FileType::Directory, OsStr::new(".")),
            (parent.0, FileType::Directory, OsStr::new("..")),
        ];
        entries.extend(
            children
                .iter()
                .map(|entry| (entry.node.0, entry.kind.to_fuser(), entry.name.as_os_str())),
        );

        for (i, (child, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        request!("statfs(ino={})", ino);

        match self.overlay.statfs() {
            Ok(stat) => reply.statfs(
                stat.blocks() as u64,
                stat.blocks_free() as u64,
                stat.blocks_available() as u64,
                stat.files() as u64,
                stat.files_free() as u64,
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(e) => reply.error(errno("statfs", e)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        request!("access(ino={}, mask={})", ino, mask);

        // Permission bits are enforced by the kernel
        match self.overlay.attr(NodeId(ino)) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(errno("access", e)),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        request!(
            "create(parent={}, name={:?}, mode={:o}, flags={:#x})",
            parent,
            name,
            mode,
            flags
        );

        let perm = (mode & !umask & 0o7777) as u16;
        match self
            .overlay
            .create(NodeId(parent), name, perm, req.uid(), req.gid(), flags)
        {
            Ok((node, attrs, fh)) => reply.created(&attrs.valid, &attrs.to_fuser(node), 0, fh, 0),
            Err(e) => reply.error(errno("create", e)),
        }
    }
}
