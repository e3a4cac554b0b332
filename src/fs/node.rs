//! Overlay nodes
//!
//! Nodes live in an arena keyed by [`NodeId`], the id handed to the kernel.
//! A node id is stable for the node's whole lifetime while its [`Inum`]
//! changes whenever the node crosses the owned/passthrough boundary.
//! Parents own children through the name table; the `parent` field is a
//! plain back-reference used for path reconstruction and promotion.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};

use super::attr::FileKind;
use super::registry::Inum;
use crate::error::{Error, Result};

/// Kernel-facing node id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// FUSE root id
    pub const ROOT: NodeId = NodeId(fuser::FUSE_ROOT_ID);
}

/// Content state of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Owned, not yet cleaned: write-only in-memory buffer
    Staging,
    /// Owned and cleaned: readable in-memory buffer
    Readable,
    /// Passthrough: content lives on the backing filesystem
    Mirrored,
}

/// Directory payload
#[derive(Debug, Default)]
pub struct Directory {
    pub children: HashMap<OsString, NodeId>,
}

/// File payload
#[derive(Debug, Default)]
pub struct File {
    /// In-memory content; empty while mirrored
    pub data: Vec<u8>,
    pub cleaned: bool,
}

#[derive(Debug)]
pub enum NodeKind {
    Directory(Directory),
    File(File),
}

/// One entry of the overlay tree
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub inum: Inum,
    pub name: OsString,
    pub parent: Option<NodeId>,
    pub passthrough: bool,
    pub kind: NodeKind,
}

impl Node {
    pub fn new_dir(
        id: NodeId,
        inum: Inum,
        name: &OsStr,
        parent: Option<NodeId>,
        passthrough: bool,
    ) -> Self {
        Node {
            id,
            inum,
            name: name.to_os_string(),
            parent,
            passthrough,
            kind: NodeKind::Directory(Directory::default()),
        }
    }

    pub fn new_file(id: NodeId, inum: Inum, name: &OsStr, parent: NodeId, passthrough: bool) -> Self {
        Node {
            id,
            inum,
            name: name.to_os_string(),
            parent: Some(parent),
            passthrough,
            kind: NodeKind::File(File::default()),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn dir(&self) -> Result<&Directory> {
        match &self.kind {
            NodeKind::Directory(dir) => Ok(dir),
            NodeKind::File(_) => Err(Error::NotADirectory),
        }
    }

    pub fn dir_mut(&mut self) -> Result<&mut Directory> {
        match &mut self.kind {
            NodeKind::Directory(dir) => Ok(dir),
            NodeKind::File(_) => Err(Error::NotADirectory),
        }
    }

    pub fn file(&self) -> Result<&File> {
        match &self.kind {
            NodeKind::File(file) => Ok(file),
            NodeKind::Directory(_) => Err(Error::IsADirectory),
        }
    }

    pub fn file_mut(&mut self) -> Result<&mut File> {
        match &mut self.kind {
            NodeKind::File(file) => Ok(file),
            NodeKind::Directory(_) => Err(Error::IsADirectory),
        }
    }

    /// State of a file node
    pub fn file_state(&self) -> Result<FileState> {
        let file = self.file()?;
        Ok(if self.passthrough {
            FileState::Mirrored
        } else if file.cleaned {
            FileState::Readable
        } else {
            FileState::Staging
        })
    }
}

/// Entry returned by a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub node: NodeId,
    pub inum: Inum,
    pub name: OsString,
    pub kind: FileKind,
    pub passthrough: bool,
}
