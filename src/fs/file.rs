//! File operations
//!
//! An owned file keeps its whole content in memory. It is write-only while
//! staging, readable once inspection marks it cleaned, and becomes a
//! mirrored passthrough file when inspection flushes it to the backing
//! filesystem. Writing to a mirrored file promotes it back to owned staging.

use std::path::PathBuf;

use tracing::{debug, info};

use super::attr::{FileKind, TimeUpdate};
use super::handle::is_writable;
use super::node::{FileState, NodeId};
use super::registry::Provenance;
use super::tree::{Tree, TreeEvent};
use crate::error::{Error, Result};

/// Splice `data` into `buffer` at `offset`, zero-filling any gap.
/// The resulting length is `max(offset + data.len(), buffer.len())`.
pub fn splice(buffer: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if end > buffer.len() {
        buffer.resize(end, 0);
    }
    buffer[offset..end].copy_from_slice(data);
}

impl Tree {
    /// Open a file and return a handle id
    pub fn open(&mut self, id: NodeId, flags: i32) -> Result<u64> {
        self.guard(id)?;
        let state = self.node(id)?.file_state()?;

        if flags & libc::O_TRUNC != 0 && is_writable(flags) {
            self.truncate(id, 0)?;
        }

        let backing = if state == FileState::Mirrored && self.node(id)?.passthrough {
            let path = self.real_path(id)?;
            Some(self.backing.open_read(&path)?)
        } else {
            None
        };

        let fh = self.handles.open(id, flags, backing);
        debug!("open node {:?} ({:?}) -> fh {}", id, state, fh);
        Ok(fh)
    }

    /// Read through a handle
    pub fn read(&mut self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let id = self.handles.get(fh)?.node;
        self.guard(id)?;

        match self.node(id)?.file_state()? {
            FileState::Staging => Err(self.awaiting_inspection(id)),
            FileState::Mirrored => {
                let path = self.real_path(id)?;
                let handle = self.handles.get_mut(fh)?;
                if handle.backing.is_none() {
                    handle.backing = Some(self.backing.open_read(&path)?);
                }
                match &handle.backing {
                    Some(file) => self.backing.read_at(file, offset, size),
                    None => Err(Error::InvalidHandle(fh)),
                }
            }
            FileState::Readable => {
                self.touch(id, TimeUpdate::ACCESS)?;
                let node = self.node(id)?;
                let recorded = self.registry.get(node.inum)?.size;
                let data = &node.file()?.data;

                let len = recorded.min(data.len() as u64);
                if offset >= len {
                    return Ok(Vec::new());
                }
                let end = offset.saturating_add(u64::from(size)).min(len);
                Ok(data[offset as usize..end as usize].to_vec())
            }
        }
    }

    /// Whole content of a file, refused while it awaits inspection
    pub fn read_all(&mut self, id: NodeId) -> Result<Vec<u8>> {
        self.guard(id)?;
        match self.node(id)?.file_state()? {
            FileState::Staging => Err(self.awaiting_inspection(id)),
            _ => self.read_all_unchecked(id),
        }
    }

    /// Whole content of a file regardless of its inspection state
    pub fn read_all_unchecked(&self, id: NodeId) -> Result<Vec<u8>> {
        let node = self.node(id)?;
        if node.passthrough {
            self.backing.read_all(&self.real_path(id)?)
        } else {
            Ok(node.file()?.data.clone())
        }
    }

    /// Target of a mirrored symlink
    pub fn readlink(&mut self, id: NodeId) -> Result<PathBuf> {
        self.guard(id)?;
        let inum = self.node(id)?.inum;
        if self.registry.get(inum)?.kind != FileKind::Symlink {
            return Err(Error::InvalidArgument("not a symlink".into()));
        }
        self.backing.read_link(&self.real_path(id)?)
    }

    fn awaiting_inspection(&self, id: NodeId) -> Error {
        let path = self.relative_path(id).unwrap_or_default();
        Error::PermissionDenied(path.display().to_string())
    }

    /// Write through a handle, promoting a mirrored file first.
    /// Emits [`TreeEvent::Modified`] so the file gets inspected.
    pub fn write(&mut self, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let id = self.handles.get(fh)?.node;
        self.guard(id)?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Error::FileTooLarge(u64::MAX))?;
        let offset = self.check_size(end)? - data.len();

        if self.node(id)?.file_state()? == FileState::Mirrored {
            self.promote_file(id)?;
        }

        let node = self.node_mut(id)?;
        let inum = node.inum;
        let file = node.file_mut()?;
        splice(&mut file.data, offset, data);
        let len = file.data.len() as u64;

        let attrs = self.registry.get_mut(inum)?;
        attrs.size = len;
        attrs.touch(TimeUpdate::ACCESS | TimeUpdate::MODIFY);

        self.emit(TreeEvent::Modified { inum, node: id });
        Ok(data.len() as u32)
    }

    /// Resize a file, promoting a mirrored file first
    pub fn truncate(&mut self, id: NodeId, size: u64) -> Result<()> {
        self.guard(id)?;
        let size = self.check_size(size)?;

        if self.node(id)?.file_state()? == FileState::Mirrored {
            self.promote_file(id)?;
        }

        let node = self.node_mut(id)?;
        let inum = node.inum;
        node.file_mut()?.data.resize(size, 0);

        let attrs = self.registry.get_mut(inum)?;
        attrs.size = size as u64;
        attrs.touch(TimeUpdate::MODIFY | TimeUpdate::CHANGE);

        self.emit(TreeEvent::Modified { inum, node: id });
        Ok(())
    }

    /// Refuse sizes the in-memory buffer may not grow to
    fn check_size(&self, size: u64) -> Result<usize> {
        if size > self.max_file_size {
            return Err(Error::FileTooLarge(size));
        }
        usize::try_from(size).map_err(|_| Error::FileTooLarge(size))
    }

    /// Replace an owned file's content. Mirrored files are left alone.
    pub fn overwrite(&mut self, id: NodeId, data: Vec<u8>) -> Result<()> {
        let node = self.node_mut(id)?;
        if node.passthrough {
            return Ok(());
        }

        let inum = node.inum;
        let len = data.len() as u64;
        node.file_mut()?.data = data;

        let attrs = self.registry.get_mut(inum)?;
        attrs.size = len;
        attrs.touch(TimeUpdate::MODIFY | TimeUpdate::CHANGE);
        Ok(())
    }

    pub fn set_cleaned(&mut self, id: NodeId, cleaned: bool) -> Result<()> {
        self.node_mut(id)?.file_mut()?.cleaned = cleaned;
        Ok(())
    }

    /// Close a handle
    pub fn release_handle(&mut self, fh: u64) -> Result<()> {
        let handle = self.handles.close(fh)?;
        debug!("release fh {} (node {:?})", fh, handle.node);
        Ok(())
    }

    /// Turn a mirrored file into an owned staging file holding a copy of
    /// the backing content
    pub(super) fn promote_file(&mut self, id: NodeId) -> Result<()> {
        let parent = self
            .node(id)?
            .parent
            .ok_or_else(|| Error::Internal("file node without parent".into()))?;
        self.promote(parent)?;

        let path = self.real_path(id)?;
        let meta = self.backing.metadata(&path)?;
        let content = self.backing.read_all(&path)?;

        let old = self.node(id)?.inum;
        let new = self.registry.allocate_owned()?;
        let mut attrs = self.registry.get(old)?.reinit();
        attrs.overlay_live(&meta);
        attrs.size = content.len() as u64;
        self.registry.insert(new, Provenance::Owned, attrs);
        self.registry.remove(old);
        self.emit(TreeEvent::Retired(old));

        let node = self.node_mut(id)?;
        node.inum = new;
        node.passthrough = false;
        let file = node.file_mut()?;
        file.data = content;
        file.cleaned = false;

        self.handles.detach_node(id);
        debug!("promoted file {}: inode {} -> {}", path.display(), old, new);
        Ok(())
    }

    /// Flush an owned file to the backing filesystem and make it mirrored.
    /// Owned ancestors missing on disk are created with their recorded mode.
    pub fn finalize(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        node.file()?;
        if node.passthrough {
            return Ok(());
        }

        let parent = node
            .parent
            .ok_or_else(|| Error::Internal("file node without parent".into()))?;
        self.materialize_dirs(parent)?;

        let new = self.registry.allocate_passthrough()?;
        let old = self.node(id)?.inum;
        let attrs = self.registry.get(old)?.clone();
        let path = self.real_path(id)?;
        self.backing
            .write_file(&path, &self.node(id)?.file()?.data, &attrs)?;

        self.registry.insert(new, Provenance::Passthrough, attrs);
        self.registry.remove(old);
        self.emit(TreeEvent::Retired(old));

        let node = self.node_mut(id)?;
        node.inum = new;
        node.passthrough = true;
        let file = node.file_mut()?;
        file.data = Vec::new();
        file.cleaned = false;

        info!("flushed {} to backing filesystem", path.display());
        Ok(())
    }

    /// Create the backing directories for `dir` and its ancestors that do not exist yet
    pub(super) fn materialize_dirs(&self, dir: NodeId) -> Result<()> {
        let mut chain = Vec::new();
        let mut current = Some(dir);
        while let Some(id) = current {
            let node = self.node(id)?;
            if node.is_root() {
                break;
            }
            chain.push(id);
            current = node.parent;
        }

        for id in chain.into_iter().rev() {
            let path = self.real_path(id)?;
            if self.backing.exists(&path) {
                continue;
            }
            let attrs = self.registry.get(self.node(id)?.inum)?;
            self.backing.create_dir(&path, attrs)?;
            debug!("materialized directory {}", path.display());
        }
        Ok(())
    }
}
