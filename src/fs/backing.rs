//! Backing filesystem access
//!
//! Path-based I/O against the real tree beneath the overlay. Every
//! passthrough operation and every flush goes through here.

use crate::error::Result;
use nix::sys::time::{TimeVal, TimeValLike};
use nix::unistd::{Gid, Uid};
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::io::{self, Write};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::attr::Attributes;

/// Directory entry from the backing filesystem
#[derive(Debug)]
pub struct BackingEntry {
    pub name: OsString,
    pub metadata: Metadata,
}

/// Resolves logical paths against the backing root and performs real I/O
#[derive(Debug, Clone)]
pub struct BackingStore {
    /// Directory that stands in for the overlay root
    root: PathBuf,
}

impl BackingStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_root(&mut self, root: PathBuf) {
        self.root = root;
    }

    /// Join a path relative to the overlay root onto the backing root
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        let relative = relative.strip_prefix("/").unwrap_or(relative);
        if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// False only when the entry is definitely gone
    pub fn exists(&self, path: &Path) -> bool {
        match fs::symlink_metadata(path) {
            Ok(_) => true,
            Err(e) => e.kind() != io::ErrorKind::NotFound,
        }
    }

    pub fn metadata(&self, path: &Path) -> Result<Metadata> {
        Ok(fs::symlink_metadata(path)?)
    }

    /// Read directory entries; `None` when the directory does not exist
    pub fn readdir(&self, path: &Path) -> Result<Option<Vec<BackingEntry>>> {
        let iter = match fs::read_dir(path) {
            Ok(iter) => iter,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for entry in iter {
            let entry = entry?;
            let metadata = match entry.metadata() {
                Ok(meta) => meta,
                // Raced with a removal
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            entries.push(BackingEntry {
                name: entry.file_name(),
                metadata,
            });
        }

        Ok(Some(entries))
    }

    /// Open a backing file for positional reads
    pub fn open_read(&self, path: &Path) -> Result<fs::File> {
        Ok(fs::File::open(path)?)
    }

    /// Read up to `size` bytes at `offset`
    pub fn read_at(&self, file: &fs::File, offset: u64, size: u32) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;

        while filled < buffer.len() {
            match file.read_at(&mut buffer[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        buffer.truncate(filled);
        Ok(buffer)
    }

    pub fn read_link(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(path)?)
    }

    pub fn read_all(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    /// Write `data` to `path` and stamp it with the recorded mode, owner and times
    pub fn write_file(&self, path: &Path, data: &[u8], attrs: &Attributes) -> Result<()> {
        let mut file = fs::File::create(path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        self.set_perm(path, attrs.perm)?;
        self.set_owner(path, Some(attrs.uid), Some(attrs.gid))?;
        self.set_times(path, attrs.atime, attrs.mtime)?;
        Ok(())
    }

    /// Create a directory with the recorded mode and owner
    pub fn create_dir(&self, path: &Path, attrs: &Attributes) -> Result<()> {
        fs::create_dir(path)?;
        self.set_perm(path, attrs.perm)?;
        self.set_owner(path, Some(attrs.uid), Some(attrs.gid))?;
        Ok(())
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fs::rename(from, to)?)
    }

    pub fn remove(&self, path: &Path, is_dir: bool) -> Result<()> {
        if is_dir {
            fs::remove_dir(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn set_perm(&self, path: &Path, perm: u16) -> Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(u32::from(perm)))?;
        Ok(())
    }

    pub fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        nix::unistd::chown(path, uid.map(Uid::from_raw), gid.map(Gid::from_raw))?;
        Ok(())
    }

    pub fn set_times(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        nix::sys::stat::utimes(path, &timeval(atime), &timeval(mtime))?;
        Ok(())
    }
}

fn timeval(time: SystemTime) -> TimeVal {
    let micros = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    TimeVal::microseconds(micros)
}
