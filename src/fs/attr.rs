//! Attribute records
//!
//! Per-node metadata kept in the inode registry: kind, permissions,
//! ownership, size, timestamps and the validity window reported to the kernel.

use std::ops::BitOr;
use std::time::{Duration, SystemTime};

use super::node::NodeId;

/// Read permission bits for user, group and other
pub const READ_BITS: u16 = 0o444;

/// File type recorded in an attribute record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
}

impl From<std::fs::FileType> for FileKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::RegularFile
        }
    }
}

impl FileKind {
    pub fn to_fuser(&self) -> fuser::FileType {
        match self {
            FileKind::RegularFile => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::Symlink => fuser::FileType::Symlink,
        }
    }
}

/// Which timestamps a touch updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeUpdate(u8);

impl TimeUpdate {
    pub const ACCESS: TimeUpdate = TimeUpdate(0b100);
    pub const MODIFY: TimeUpdate = TimeUpdate(0b010);
    pub const CHANGE: TimeUpdate = TimeUpdate(0b001);
    pub const ALL: TimeUpdate = TimeUpdate(0b111);

    pub fn contains(self, other: TimeUpdate) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TimeUpdate {
    type Output = TimeUpdate;

    fn bitor(self, rhs: TimeUpdate) -> TimeUpdate {
        TimeUpdate(self.0 | rhs.0)
    }
}

/// Metadata for one node
#[derive(Debug, Clone)]
pub struct Attributes {
    pub kind: FileKind,
    pub perm: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// How long the kernel may cache this record
    pub valid: Duration,
    pub nlink: u32,
}

impl Attributes {
    /// Fresh record with all timestamps set to now
    pub fn new(kind: FileKind, perm: u16, uid: u32, gid: u32, valid: Duration) -> Self {
        let now = SystemTime::now();
        Attributes {
            kind,
            perm: perm & 0o7777,
            uid,
            gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            valid,
            nlink: 1,
        }
    }

    /// Build a record from a backing filesystem stat
    pub fn from_metadata(meta: &std::fs::Metadata, valid: Duration) -> Self {
        use std::os::unix::fs::MetadataExt;

        Attributes {
            kind: FileKind::from(meta.file_type()),
            perm: (meta.mode() & 0o7777) as u16,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len(),
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
            valid,
            nlink: 1,
        }
    }

    /// Copy of this record for a node that just crossed the
    /// owned/passthrough boundary: link count reset and all times now
    pub fn reinit(&self) -> Self {
        let mut attrs = self.clone();
        attrs.nlink = 1;
        attrs.touch(TimeUpdate::ALL);
        attrs
    }

    /// Update the selected timestamps to now
    pub fn touch(&mut self, updates: TimeUpdate) {
        let now = SystemTime::now();

        if updates.contains(TimeUpdate::ACCESS) {
            self.atime = now;
        }
        if updates.contains(TimeUpdate::MODIFY) {
            self.mtime = now;
        }
        if updates.contains(TimeUpdate::CHANGE) {
            self.ctime = now;
        }
    }

    /// Substitute the live size, mode and mtime of the backing entry
    pub fn overlay_live(&mut self, meta: &std::fs::Metadata) {
        use std::os::unix::fs::MetadataExt;

        self.size = meta.len();
        self.kind = FileKind::from(meta.file_type());
        self.perm = (meta.mode() & 0o7777) as u16;
        if let Ok(mtime) = meta.modified() {
            self.mtime = mtime;
        }
    }

    /// Strip every read bit so clients see the file but cannot read it
    pub fn mask_read(&mut self) {
        self.perm &= !READ_BITS;
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Convert to fuser FileAttr
    pub fn to_fuser(&self, node: NodeId) -> fuser::FileAttr {
        fuser::FileAttr {
            ino: node.0,
            size: self.size,
            blocks: (self.size + 511) / 512,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.ctime,
            kind: self.kind.to_fuser(),
            perm: self.perm,
            nlink: if self.is_dir() { 2 } else { self.nlink },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

fn unix_time(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        SystemTime::UNIX_EPOCH
    }
}
