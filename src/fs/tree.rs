//! Overlay tree
//!
//! The state guarded by the filesystem-wide lock: the inode registry, the
//! node arena, the open handle table and the backing store. Directory and
//! file operations are implemented on [`Tree`] in `dir.rs` and `file.rs`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tracing::debug;

use super::attr::{Attributes, FileKind, TimeUpdate};
use super::backing::BackingStore;
use super::handle::HandleTable;
use super::node::{Node, NodeId, NodeKind};
use super::registry::{InodeRegistry, Inum, Provenance};
use crate::config::DEFAULT_MAX_FILE_SIZE;
use crate::error::{Error, Result};

/// Side effects collected under the lock and dispatched after it is released
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    /// File content changed; schedule an inspection
    Modified { inum: Inum, node: NodeId },
    /// Inode left the registry
    Retired(Inum),
}

/// Attribute changes requested through `setattr`
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

pub struct Tree {
    pub(super) registry: InodeRegistry,
    pub(super) nodes: HashMap<NodeId, Node>,
    pub(super) handles: HandleTable,
    pub(super) backing: BackingStore,
    pub(super) attr_ttl: Duration,
    /// Size limit for in-memory file content
    pub(super) max_file_size: u64,
    next_node: u64,
    events: Vec<TreeEvent>,
}

impl Tree {
    /// Create a tree holding only the owned root directory
    pub fn new(backing_root: PathBuf, attr_ttl: Duration) -> Result<Self> {
        Self::with_registry(InodeRegistry::new(), backing_root, attr_ttl)
    }

    pub(crate) fn with_registry(
        mut registry: InodeRegistry,
        backing_root: PathBuf,
        attr_ttl: Duration,
    ) -> Result<Self> {
        let root_inum = registry.allocate_owned()?;

        let attrs = Attributes::new(
            FileKind::Directory,
            0o755,
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
            attr_ttl,
        );
        registry.insert(root_inum, Provenance::Owned, attrs);

        let mut nodes = HashMap::new();
        nodes.insert(
            NodeId::ROOT,
            Node::new_dir(NodeId::ROOT, root_inum, OsStr::new(""), None, false),
        );

        Ok(Self {
            registry,
            nodes,
            handles: HandleTable::new(),
            backing: BackingStore::new(backing_root),
            attr_ttl,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            next_node: NodeId::ROOT.0 + 1,
            events: Vec::new(),
        })
    }

    pub fn backing(&self) -> &BackingStore {
        &self.backing
    }

    pub fn set_backing_root(&mut self, root: PathBuf) {
        self.backing.set_root(root);
    }

    pub fn set_max_file_size(&mut self, bytes: u64) {
        self.max_file_size = bytes;
    }

    pub fn registry(&self) -> &InodeRegistry {
        &self.registry
    }

    /// Drain the events produced since the last call
    pub fn take_events(&mut self) -> Vec<TreeEvent> {
        std::mem::take(&mut self.events)
    }

    pub(super) fn emit(&mut self, event: TreeEvent) {
        self.events.push(event);
    }

    pub(super) fn alloc_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(Error::NotFound)
    }

    pub(super) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(Error::NotFound)
    }

    pub fn parent_of(&self, id: NodeId) -> Result<NodeId> {
        Ok(self.node(id)?.parent.unwrap_or(NodeId::ROOT))
    }

    /// Logical path of a node, relative to the overlay root
    pub fn relative_path(&self, id: NodeId) -> Result<PathBuf> {
        let mut names = Vec::new();
        let mut current = self.node(id)?;

        while let Some(parent) = current.parent {
            names.push(current.name.as_os_str());
            current = self.node(parent)?;
        }

        Ok(names.into_iter().rev().collect())
    }

    /// Backing path of a node
    pub fn real_path(&self, id: NodeId) -> Result<PathBuf> {
        Ok(self.backing.resolve(&self.relative_path(id)?))
    }

    /// Evict `id` when it is a non-root passthrough node whose backing
    /// entry no longer exists. Returns true if the node was evicted.
    pub fn evict_if_stale(&mut self, id: NodeId) -> bool {
        let node = match self.nodes.get(&id) {
            Some(node) => node,
            None => return false,
        };
        if node.is_root() || !node.passthrough {
            return false;
        }

        let path = match self.real_path(id) {
            Ok(path) => path,
            Err(_) => return false,
        };
        if self.backing.exists(&path) {
            return false;
        }

        debug!("evicting stale passthrough node {:?} ({})", id, path.display());
        if let Some(parent) = self.nodes.get(&id).and_then(|n| n.parent) {
            let name = self.nodes[&id].name.clone();
            self.unlink_child(parent, &name);
        }
        self.drop_subtree(id);
        true
    }

    /// Guard run at the top of every node operation
    pub fn guard(&mut self, id: NodeId) -> Result<()> {
        if !self.nodes.contains_key(&id) || self.evict_if_stale(id) {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Attributes as reported to clients
    pub fn attr(&mut self, id: NodeId) -> Result<Attributes> {
        self.guard(id)?;

        let node = self.node(id)?;
        let mut attrs = self.registry.get(node.inum)?.clone();

        if node.passthrough {
            let meta = self.backing.metadata(&self.real_path(id)?)?;
            attrs.overlay_live(&meta);
        }

        if let NodeKind::File(file) = &node.kind {
            if !node.passthrough && !file.cleaned {
                attrs.mask_read();
            }
        }

        Ok(attrs)
    }

    pub(super) fn touch(&mut self, id: NodeId, updates: TimeUpdate) -> Result<()> {
        let inum = self.node(id)?.inum;
        self.registry.get_mut(inum)?.touch(updates);
        Ok(())
    }

    /// Register a new child node and its attribute record
    pub(super) fn insert_child(
        &mut self,
        parent: NodeId,
        node: Node,
        provenance: Provenance,
        attrs: Attributes,
    ) -> Result<()> {
        let id = node.id;
        let name = node.name.clone();

        self.node_mut(parent)?.dir_mut()?.children.insert(name, id);
        self.registry.insert(node.inum, provenance, attrs);
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Remove `name` from a directory's child table without dropping the node
    pub(super) fn unlink_child(&mut self, parent: NodeId, name: &OsStr) -> Option<NodeId> {
        match self.nodes.get_mut(&parent).map(|n| &mut n.kind) {
            Some(NodeKind::Directory(dir)) => dir.children.remove(name),
            _ => None,
        }
    }

    /// Drop a node and all its descendants from the arena and the registry
    pub(super) fn drop_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];

        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.remove(&current) else {
                continue;
            };
            if let NodeKind::Directory(dir) = &node.kind {
                stack.extend(dir.children.values().copied());
            }
            self.registry.remove(node.inum);
            self.emit(TreeEvent::Retired(node.inum));
        }
    }

    /// Promote a passthrough node, and every passthrough ancestor below the
    /// root, to owned. Ancestors are promoted first so an owned node never
    /// sits beneath a passthrough-only directory.
    pub fn promote(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        if !node.passthrough || node.is_root() {
            return Ok(());
        }
        if !node.is_dir() {
            return self.promote_file(id);
        }

        if let Some(parent) = node.parent {
            self.promote(parent)?;
        }

        let old = self.node(id)?.inum;
        let new = self.registry.allocate_owned()?;
        let attrs = self.registry.get(old)?.reinit();
        self.registry.insert(new, Provenance::Owned, attrs);
        self.registry.remove(old);
        self.emit(TreeEvent::Retired(old));

        let node = self.node_mut(id)?;
        node.inum = new;
        node.passthrough = false;

        debug!("promoted directory {:?}: inode {} -> {}", id, old, new);
        Ok(())
    }

    /// Apply a `setattr` request
    pub fn setattr(&mut self, id: NodeId, changes: SetAttr) -> Result<Attributes> {
        self.guard(id)?;

        if let Some(size) = changes.size {
            self.truncate(id, size)?;
        }

        let (passthrough, inum) = {
            let node = self.node(id)?;
            (node.passthrough, node.inum)
        };
        if passthrough {
            let path = self.real_path(id)?;
            if let Some(mode) = changes.mode {
                self.backing.set_perm(&path, (mode & 0o7777) as u16)?;
            }
            if changes.uid.is_some() || changes.gid.is_some() {
                self.backing.set_owner(&path, changes.uid, changes.gid)?;
            }
            if changes.atime.is_some() || changes.mtime.is_some() {
                let meta = self.backing.metadata(&path)?;
                let atime = changes.atime.or_else(|| meta.accessed().ok());
                let mtime = changes.mtime.or_else(|| meta.modified().ok());
                let now = SystemTime::now();
                self.backing
                    .set_times(&path, atime.unwrap_or(now), mtime.unwrap_or(now))?;
            }
        } else {
            let attrs = self.registry.get_mut(inum)?;
            if let Some(mode) = changes.mode {
                attrs.perm = (mode & 0o7777) as u16;
            }
            if let Some(uid) = changes.uid {
                attrs.uid = uid;
            }
            if let Some(gid) = changes.gid {
                attrs.gid = gid;
            }
            if let Some(atime) = changes.atime {
                attrs.atime = atime;
            }
            if let Some(mtime) = changes.mtime {
                attrs.mtime = mtime;
            }
            attrs.touch(TimeUpdate::CHANGE);
        }

        self.attr(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::registry::Provenance;
    use std::ffi::OsString;
    use std::fs;
    use tempfile::tempdir;

    fn tree_at(root: &std::path::Path) -> Tree {
        Tree::new(root.to_path_buf(), Duration::from_secs(1)).unwrap()
    }

    /// Tree whose inode counters are nearly out of room
    fn cramped_tree(root: &std::path::Path, next_passthrough: u64) -> Tree {
        let registry = InodeRegistry::with_counters(1, next_passthrough);
        Tree::with_registry(registry, root.to_path_buf(), Duration::from_secs(1)).unwrap()
    }

    fn child_names(tree: &Tree, dir: NodeId) -> Vec<OsString> {
        let mut names: Vec<_> = tree
            .node(dir)
            .unwrap()
            .dir()
            .unwrap()
            .children
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_exhausted_create_leaves_tree_unchanged() {
        let dir = tempdir().unwrap();
        let mut tree = cramped_tree(dir.path(), 1);
        tree.take_events();

        assert!(matches!(
            tree.mkdir(NodeId::ROOT, OsStr::new("d"), 0o755, 0, 0),
            Err(Error::InodeSpaceExhausted)
        ));
        assert!(matches!(
            tree.create(NodeId::ROOT, OsStr::new("f"), 0o644, 0, 0, 0),
            Err(Error::InodeSpaceExhausted)
        ));

        assert!(child_names(&tree, NodeId::ROOT).is_empty());
        assert_eq!(tree.registry().owned_count(), 1);
        assert_eq!(tree.registry().passthrough_count(), 0);
        assert!(tree.handles.is_empty());
        assert!(tree.take_events().is_empty());
    }

    #[test]
    fn test_exhausted_reconcile_leaves_tree_unchanged() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("real"), b"r").unwrap();
        let mut tree = cramped_tree(dir.path(), 1);

        assert!(matches!(
            tree.list(NodeId::ROOT),
            Err(Error::InodeSpaceExhausted)
        ));
        assert!(child_names(&tree, NodeId::ROOT).is_empty());
        assert_eq!(tree.registry().passthrough_count(), 0);
        assert!(dir.path().join("real").exists());
    }

    #[test]
    fn test_exhausted_promotion_leaves_tree_unchanged() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/f"), b"content").unwrap();
        let mut tree = cramped_tree(dir.path(), 3);

        // Takes the last two passthrough inodes
        let (d, _) = tree.lookup(NodeId::ROOT, OsStr::new("d")).unwrap();
        let (f, _) = tree.lookup(d, OsStr::new("f")).unwrap();
        let d_inum = tree.node(d).unwrap().inum;
        let f_inum = tree.node(f).unwrap().inum;
        let fh = tree.open(f, libc::O_WRONLY).unwrap();
        tree.take_events();

        assert!(matches!(
            tree.mkdir(d, OsStr::new("x"), 0o755, 0, 0),
            Err(Error::InodeSpaceExhausted)
        ));
        assert!(matches!(
            tree.write(fh, 0, b"new"),
            Err(Error::InodeSpaceExhausted)
        ));

        for (id, inum) in [(d, d_inum), (f, f_inum)] {
            let node = tree.node(id).unwrap();
            assert!(node.passthrough);
            assert_eq!(node.inum, inum);
            assert_eq!(
                tree.registry().provenance(inum),
                Some(Provenance::Passthrough)
            );
        }
        assert_eq!(child_names(&tree, d), vec![OsString::from("f")]);
        assert_eq!(tree.registry().owned_count(), 1);
        assert!(tree.take_events().is_empty());
        assert_eq!(fs::read(dir.path().join("d/f")).unwrap(), b"content");
    }

    #[test]
    fn test_root_is_owned_inode_one() {
        let dir = tempdir().unwrap();
        let mut tree = tree_at(dir.path());

        let root = tree.node(NodeId::ROOT).unwrap();
        assert_eq!(root.inum, Inum::ROOT);
        assert!(!root.passthrough);
        assert_eq!(tree.registry().provenance(Inum::ROOT), Some(Provenance::Owned));

        let attrs = tree.attr(NodeId::ROOT).unwrap();
        assert!(attrs.is_dir());
        assert_eq!(attrs.perm, 0o755);
        assert_eq!(tree.real_path(NodeId::ROOT).unwrap(), dir.path());
    }

    #[test]
    fn test_paths_follow_parents() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c.txt"), b"x").unwrap();
        let mut tree = tree_at(dir.path());

        let (a, _) = tree.lookup(NodeId::ROOT, OsStr::new("a")).unwrap();
        let (b, _) = tree.lookup(a, OsStr::new("b")).unwrap();
        let (c, _) = tree.lookup(b, OsStr::new("c.txt")).unwrap();

        assert_eq!(tree.relative_path(c).unwrap(), PathBuf::from("a/b/c.txt"));
        assert_eq!(tree.real_path(c).unwrap(), dir.path().join("a/b/c.txt"));
        assert_eq!(tree.parent_of(c).unwrap(), b);
        assert_eq!(tree.parent_of(NodeId::ROOT).unwrap(), NodeId::ROOT);
    }

    #[test]
    fn test_stale_guard_evicts_subtree() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let mut tree = tree_at(dir.path());

        let (a, _) = tree.lookup(NodeId::ROOT, OsStr::new("a")).unwrap();
        let (b, _) = tree.lookup(a, OsStr::new("b")).unwrap();
        let a_inum = tree.node(a).unwrap().inum;
        let b_inum = tree.node(b).unwrap().inum;
        tree.take_events();

        fs::remove_dir_all(dir.path().join("a")).unwrap();

        assert!(matches!(tree.attr(a), Err(Error::NotFound)));
        assert!(tree.node(a).is_err());
        assert!(tree.node(b).is_err());
        assert!(tree.registry().get(a_inum).is_err());
        assert!(tree.registry().get(b_inum).is_err());
        assert!(!tree
            .node(NodeId::ROOT)
            .unwrap()
            .dir()
            .unwrap()
            .children
            .contains_key(OsStr::new("a")));

        let events = tree.take_events();
        assert!(events.contains(&TreeEvent::Retired(a_inum)));
        assert!(events.contains(&TreeEvent::Retired(b_inum)));
    }

    #[test]
    fn test_root_never_stale() {
        let dir = tempdir().unwrap();
        let mut tree = tree_at(&dir.path().join("does-not-exist"));
        assert!(!tree.evict_if_stale(NodeId::ROOT));
        assert!(tree.guard(NodeId::ROOT).is_ok());
    }

    #[test]
    fn test_promote_directory_chain() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let mut tree = tree_at(dir.path());

        let (a, _) = tree.lookup(NodeId::ROOT, OsStr::new("a")).unwrap();
        let (b, _) = tree.lookup(a, OsStr::new("b")).unwrap();
        let old_a = tree.node(a).unwrap().inum;
        let old_b = tree.node(b).unwrap().inum;

        tree.promote(b).unwrap();

        for (id, old) in [(a, old_a), (b, old_b)] {
            let node = tree.node(id).unwrap();
            assert!(!node.passthrough);
            assert_ne!(node.inum, old);
            assert_eq!(tree.registry().provenance(node.inum), Some(Provenance::Owned));
            assert!(tree.registry().get(old).is_err());
        }

        // Ancestors were promoted first, so they hold the lower owned ids
        assert!(tree.node(a).unwrap().inum < tree.node(b).unwrap().inum);
    }

    #[test]
    fn test_setattr_owned_updates_record() {
        let dir = tempdir().unwrap();
        let mut tree = tree_at(dir.path());
        let (id, _) = tree.mkdir(NodeId::ROOT, OsStr::new("d"), 0o755, 0, 0).unwrap();

        let attrs = tree
            .setattr(
                id,
                SetAttr {
                    mode: Some(0o40700),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(attrs.perm, 0o700);
        assert!(attrs.is_dir());
    }

    #[test]
    fn test_setattr_passthrough_applies_to_backing() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), b"abc").unwrap();
        let mut tree = tree_at(dir.path());
        let (id, _) = tree.lookup(NodeId::ROOT, OsStr::new("f")).unwrap();

        let attrs = tree
            .setattr(
                id,
                SetAttr {
                    mode: Some(0o600),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(attrs.perm, 0o600);
        let meta = fs::metadata(dir.path().join("f")).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o600);
        assert!(tree.node(id).unwrap().passthrough);
    }
}
