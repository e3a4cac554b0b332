//! Overlay engine
//!
//! Wraps the [`Tree`] in the filesystem-wide lock and wires file
//! modifications to the per-inode debouncer. When a file has been quiet for
//! the configured window the inspector receives a [`StagedFile`] on a
//! blocking worker and decides whether to approve, sanitize or keep it.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use nix::sys::statvfs::{statvfs, Statvfs};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::attr::Attributes;
use super::node::{DirEntry, FileState, NodeId};
use super::notifier::Debouncer;
use super::registry::Inum;
use super::tree::{SetAttr, Tree, TreeEvent};
use crate::config::Config;
use crate::error::Result;

/// Receives files that stopped changing and need inspection.
///
/// Runs on a blocking worker thread; it may take as long as it needs.
pub trait Inspector: Send + Sync + 'static {
    fn inspect(&self, file: StagedFile);
}

impl<F> Inspector for F
where
    F: Fn(StagedFile) + Send + Sync + 'static,
{
    fn inspect(&self, file: StagedFile) {
        self(file)
    }
}

/// The overlay: tree state, lock and inspection scheduling
pub struct Overlay {
    tree: Mutex<Tree>,
    notifier: Debouncer<NodeId>,
}

impl Overlay {
    /// Build an overlay over `backing_root`
    pub fn new(
        config: &Config,
        backing_root: PathBuf,
        inspector: Arc<dyn Inspector>,
        runtime: Handle,
    ) -> Result<Arc<Self>> {
        let mut tree = Tree::new(backing_root, config.overlay.attr_ttl())?;
        tree.set_max_file_size(config.overlay.max_file_size);
        let quiet = config.notifier.quiet_window();

        Ok(Arc::new_cyclic(|weak: &Weak<Overlay>| {
            let weak = weak.clone();
            let callback = move |node: NodeId| {
                let Some(overlay) = weak.upgrade() else {
                    return;
                };
                let inspector = inspector.clone();
                tokio::task::spawn_blocking(move || {
                    inspector.inspect(StagedFile::new(overlay, node))
                });
            };

            Overlay {
                tree: Mutex::new(tree),
                notifier: Debouncer::new(quiet, runtime, callback),
            }
        }))
    }

    /// Run `f` under the lock, then dispatch the events it produced
    fn with_tree<R>(&self, f: impl FnOnce(&mut Tree) -> Result<R>) -> Result<R> {
        let (result, events) = {
            let mut tree = self.tree.lock();
            let result = f(&mut tree);
            (result, tree.take_events())
        };

        for event in events {
            match event {
                TreeEvent::Modified { inum, node } => {
                    self.notifier.get_or_create(inum).call(node)
                }
                TreeEvent::Retired(inum) => self.notifier.forget(inum),
            }
        }
        result
    }

    pub fn set_backing_root(&self, root: PathBuf) {
        self.tree.lock().set_backing_root(root);
    }

    pub fn backing_root(&self) -> PathBuf {
        self.tree.lock().backing().root().to_path_buf()
    }

    /// Backing path for a path relative to the mount point
    pub fn real_path(&self, relative: &Path) -> PathBuf {
        self.tree.lock().backing().resolve(relative)
    }

    /// Statistics of the filesystem holding the backing root
    pub fn statfs(&self) -> Result<Statvfs> {
        Ok(statvfs(&self.backing_root())?)
    }

    /// Files written since their last flush, staged or awaiting inspection
    pub fn pending(&self) -> usize {
        self.notifier.len()
    }

    pub fn attr(&self, node: NodeId) -> Result<Attributes> {
        self.with_tree(|tree| tree.attr(node))
    }

    pub fn attr_ttl(&self) -> Duration {
        self.tree.lock().attr_ttl
    }

    pub fn parent_of(&self, node: NodeId) -> Result<NodeId> {
        self.with_tree(|tree| tree.parent_of(node))
    }

    pub fn lookup(&self, parent: NodeId, name: &OsStr) -> Result<(NodeId, Attributes)> {
        self.with_tree(|tree| tree.lookup(parent, name))
    }

    pub fn list(&self, dir: NodeId) -> Result<Vec<DirEntry>> {
        self.with_tree(|tree| tree.list(dir))
    }

    pub fn mkdir(
        &self,
        parent: NodeId,
        name: &OsStr,
        perm: u16,
        uid: u32,
        gid: u32,
    ) -> Result<(NodeId, Attributes)> {
        self.with_tree(|tree| tree.mkdir(parent, name, perm, uid, gid))
    }

    pub fn create(
        &self,
        parent: NodeId,
        name: &OsStr,
        perm: u16,
        uid: u32,
        gid: u32,
        flags: i32,
    ) -> Result<(NodeId, Attributes, u64)> {
        self.with_tree(|tree| tree.create(parent, name, perm, uid, gid, flags))
    }

    pub fn rename(
        &self,
        parent: NodeId,
        name: &OsStr,
        new_parent: NodeId,
        new_name: &OsStr,
    ) -> Result<()> {
        self.with_tree(|tree| tree.rename(parent, name, new_parent, new_name))
    }

    pub fn unlink(&self, parent: NodeId, name: &OsStr) -> Result<()> {
        self.with_tree(|tree| tree.unlink(parent, name))
    }

    pub fn rmdir(&self, parent: NodeId, name: &OsStr) -> Result<()> {
        self.with_tree(|tree| tree.rmdir(parent, name))
    }

    pub fn open(&self, node: NodeId, flags: i32) -> Result<u64> {
        self.with_tree(|tree| tree.open(node, flags))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.with_tree(|tree| tree.read(fh, offset, size))
    }

    pub fn read_all(&self, node: NodeId) -> Result<Vec<u8>> {
        self.with_tree(|tree| tree.read_all(node))
    }

    pub fn readlink(&self, node: NodeId) -> Result<PathBuf> {
        self.with_tree(|tree| tree.readlink(node))
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
        self.with_tree(|tree| tree.write(fh, offset, data))
    }

    pub fn setattr(&self, node: NodeId, changes: SetAttr) -> Result<Attributes> {
        self.with_tree(|tree| tree.setattr(node, changes))
    }

    pub fn release(&self, fh: u64) -> Result<()> {
        self.with_tree(|tree| tree.release_handle(fh))
    }

    /// Inspection view of a file node
    pub fn staged(self: &Arc<Self>, node: NodeId) -> StagedFile {
        StagedFile::new(self.clone(), node)
    }
}

/// A file handed to the inspector.
///
/// Every method takes the filesystem lock, so the inspector can run
/// concurrently with client traffic.
#[derive(Clone)]
pub struct StagedFile {
    overlay: Arc<Overlay>,
    node: NodeId,
}

impl StagedFile {
    fn new(overlay: Arc<Overlay>, node: NodeId) -> Self {
        Self { overlay, node }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn inum(&self) -> Result<Inum> {
        self.overlay
            .with_tree(|tree| Ok(tree.node(self.node)?.inum))
    }

    pub fn name(&self) -> Result<OsString> {
        self.overlay
            .with_tree(|tree| Ok(tree.node(self.node)?.name.clone()))
    }

    /// Path relative to the mount point
    pub fn path(&self) -> Result<PathBuf> {
        self.overlay.with_tree(|tree| tree.relative_path(self.node))
    }

    pub fn state(&self) -> Result<FileState> {
        self.overlay
            .with_tree(|tree| tree.node(self.node)?.file_state())
    }

    /// Full content, readable even while the file is staging
    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.overlay
            .with_tree(|tree| tree.read_all_unchecked(self.node))
    }

    /// Replace the content with a sanitized version
    pub fn overwrite(&self, data: Vec<u8>) -> Result<()> {
        self.overlay.with_tree(|tree| tree.overwrite(self.node, data))
    }

    /// Allow or forbid client reads
    pub fn set_cleaned(&self, cleaned: bool) -> Result<()> {
        self.overlay
            .with_tree(|tree| tree.set_cleaned(self.node, cleaned))
    }

    /// Flush the file to the backing filesystem
    pub fn release(&self) -> Result<()> {
        let result = self.overlay.with_tree(|tree| tree.finalize(self.node));
        match &result {
            Ok(()) => debug!("released node {:?}", self.node),
            Err(e) => warn!("failed to flush node {:?}: {}", self.node, e),
        }
        result
    }
}

impl fmt::Debug for StagedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedFile")
            .field("node", &self.node)
            .finish()
    }
}
