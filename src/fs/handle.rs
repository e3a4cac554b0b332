//! Open file handles
//!
//! A handle is a session over a file node bounded by an open/release pair.
//! When the file is mirrored it carries a read-only descriptor on the
//! backing file; writes always land in the in-memory buffer.

use std::collections::HashMap;
use std::fs;

use super::node::NodeId;
use crate::error::{Error, Result};

/// Check if open flags request write access
pub fn is_writable(flags: i32) -> bool {
    let accmode = flags & libc::O_ACCMODE;
    accmode == libc::O_WRONLY || accmode == libc::O_RDWR
}

/// One open file session
#[derive(Debug)]
pub struct FileHandle {
    pub fh: u64,
    pub node: NodeId,
    /// Open flags
    pub flags: i32,
    /// Backing descriptor while the file is mirrored
    pub backing: Option<fs::File>,
}

impl FileHandle {
    pub fn new(fh: u64, node: NodeId, flags: i32) -> Self {
        Self {
            fh,
            node,
            flags,
            backing: None,
        }
    }

    /// Drop the backing descriptor, closing it
    pub fn detach_backing(&mut self) {
        self.backing = None;
    }
}

/// Table of open handles
pub struct HandleTable {
    next_fh: u64,
    handles: HashMap<u64, FileHandle>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: 1,
            handles: HashMap::new(),
        }
    }

    /// Register a new handle and return its id
    pub fn open(&mut self, node: NodeId, flags: i32, backing: Option<fs::File>) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;

        let mut handle = FileHandle::new(fh, node, flags);
        handle.backing = backing;
        self.handles.insert(fh, handle);
        fh
    }

    pub fn get(&self, fh: u64) -> Result<&FileHandle> {
        self.handles.get(&fh).ok_or(Error::InvalidHandle(fh))
    }

    pub fn get_mut(&mut self, fh: u64) -> Result<&mut FileHandle> {
        self.handles.get_mut(&fh).ok_or(Error::InvalidHandle(fh))
    }

    /// Close handle and return it
    pub fn close(&mut self, fh: u64) -> Result<FileHandle> {
        self.handles.remove(&fh).ok_or(Error::InvalidHandle(fh))
    }

    /// Close the backing descriptors of every handle open on `node`
    pub fn detach_node(&mut self, node: NodeId) {
        for handle in self.handles.values_mut().filter(|h| h.node == node) {
            handle.detach_backing();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
