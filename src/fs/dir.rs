//! Directory operations
//!
//! Children are reconciled against the backing directory on every lookup
//! and listing: owned children shadow real entries of the same name,
//! passthrough children are created for new real entries and evicted when
//! their real entry is gone.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io;

use tracing::{debug, warn};

use super::attr::{Attributes, FileKind, TimeUpdate};
use super::node::{DirEntry, Node, NodeId};
use super::registry::{Inum, Provenance};
use super::tree::Tree;
use crate::error::{Error, Result};

impl Tree {
    /// Bring a directory's passthrough children in line with its backing directory
    pub(super) fn reconcile(&mut self, dir: NodeId) -> Result<()> {
        let real = self.real_path(dir)?;
        // An owned directory that was never flushed has no backing directory
        let entries = self.backing.readdir(&real)?.unwrap_or_default();

        let mut owned: Vec<OsString> = Vec::new();
        let mut unseen: HashMap<OsString, NodeId> = HashMap::new();
        for (name, child) in &self.node(dir)?.dir()?.children {
            match self.nodes.get(child) {
                Some(node) if node.passthrough => {
                    unseen.insert(name.clone(), *child);
                }
                _ => owned.push(name.clone()),
            }
        }

        for entry in entries {
            if owned.contains(&entry.name) {
                continue;
            }
            if let Some(existing) = unseen.remove(&entry.name) {
                if self.node(existing)?.is_dir() == entry.metadata.is_dir() {
                    continue;
                }
                debug!("real entry {:?} changed type, replacing", entry.name);
                self.unlink_child(dir, &entry.name);
                self.drop_subtree(existing);
            }

            let inum = self.registry.allocate_passthrough()?;
            let id = self.alloc_node_id();
            let attrs = Attributes::from_metadata(&entry.metadata, self.attr_ttl);
            let node = if entry.metadata.is_dir() {
                Node::new_dir(id, inum, &entry.name, Some(dir), true)
            } else {
                Node::new_file(id, inum, &entry.name, dir, true)
            };
            self.insert_child(dir, node, Provenance::Passthrough, attrs)?;
        }

        for (name, child) in unseen {
            debug!("real entry {:?} vanished, evicting", name);
            self.unlink_child(dir, &name);
            self.drop_subtree(child);
        }

        Ok(())
    }

    /// Resolve a child by name
    pub fn lookup(&mut self, parent: NodeId, name: &OsStr) -> Result<(NodeId, Attributes)> {
        self.guard(parent)?;
        self.node(parent)?.dir()?;
        self.reconcile(parent)?;

        let child = *self
            .node(parent)?
            .dir()?
            .children
            .get(name)
            .ok_or(Error::NotFound)?;
        let attrs = self.attr(child)?;
        Ok((child, attrs))
    }

    /// List a directory's children
    pub fn list(&mut self, dir: NodeId) -> Result<Vec<DirEntry>> {
        self.guard(dir)?;
        self.node(dir)?.dir()?;
        self.reconcile(dir)?;
        self.touch(dir, TimeUpdate::ACCESS)?;

        let mut entries = Vec::new();
        for (name, child) in &self.node(dir)?.dir()?.children {
            let node = self.node(*child)?;
            let kind = match self.registry.get(node.inum) {
                Ok(attrs) => attrs.kind,
                Err(_) if node.is_dir() => FileKind::Directory,
                Err(_) => FileKind::RegularFile,
            };
            entries.push(DirEntry {
                node: *child,
                inum: node.inum,
                name: name.clone(),
                kind,
                passthrough: node.passthrough,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Common checks for mkdir and create; returns the new owned inode
    fn prepare_child(&mut self, parent: NodeId, name: &OsStr) -> Result<Inum> {
        self.guard(parent)?;
        if self.node(parent)?.dir()?.children.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string_lossy().into_owned()));
        }

        self.promote(parent)?;
        self.touch(parent, TimeUpdate::ACCESS | TimeUpdate::MODIFY)?;
        self.registry.allocate_owned()
    }

    /// Create an owned directory
    pub fn mkdir(
        &mut self,
        parent: NodeId,
        name: &OsStr,
        perm: u16,
        uid: u32,
        gid: u32,
    ) -> Result<(NodeId, Attributes)> {
        let inum = self.prepare_child(parent, name)?;
        let id = self.alloc_node_id();
        let attrs = Attributes::new(FileKind::Directory, perm, uid, gid, self.attr_ttl);

        self.insert_child(
            parent,
            Node::new_dir(id, inum, name, Some(parent), false),
            Provenance::Owned,
            attrs.clone(),
        )?;

        debug!("mkdir {:?} -> node {:?}, inode {}", name, id, inum);
        Ok((id, attrs))
    }

    /// Create an owned file in the staging state and open a handle on it
    pub fn create(
        &mut self,
        parent: NodeId,
        name: &OsStr,
        perm: u16,
        uid: u32,
        gid: u32,
        flags: i32,
    ) -> Result<(NodeId, Attributes, u64)> {
        let inum = self.prepare_child(parent, name)?;
        let id = self.alloc_node_id();
        let attrs = Attributes::new(FileKind::RegularFile, perm, uid, gid, self.attr_ttl);

        self.insert_child(
            parent,
            Node::new_file(id, inum, name, parent, false),
            Provenance::Owned,
            attrs,
        )?;

        let fh = self.handles.open(id, flags, None);
        debug!("create {:?} -> node {:?}, inode {}, fh {}", name, id, inum, fh);
        Ok((id, self.attr(id)?, fh))
    }

    /// Move a child to a new parent and/or name
    pub fn rename(
        &mut self,
        parent: NodeId,
        name: &OsStr,
        new_parent: NodeId,
        new_name: &OsStr,
    ) -> Result<()> {
        self.guard(parent)?;
        let child = *self
            .node(parent)?
            .dir()?
            .children
            .get(name)
            .ok_or(Error::NotFound)?;
        self.guard(child)?;
        if new_parent != parent {
            self.guard(new_parent)?;
        }
        self.node(new_parent)?.dir()?;

        if parent == new_parent && name == new_name {
            return Ok(());
        }
        if self.is_ancestor_of(child, new_parent)? {
            return Err(Error::InvalidArgument(format!(
                "cannot move {:?} into itself",
                name
            )));
        }

        let child_passthrough = self.node(child)?.passthrough;
        if !child_passthrough && self.node(new_parent)?.passthrough {
            self.promote(new_parent)?;
        }

        // Owned nodes that were flushed or promoted have a real entry too
        let from = self.real_path(child)?;
        if child_passthrough || self.backing.exists(&from) {
            self.materialize_dirs(new_parent)?;
            let to = self.real_path(new_parent)?.join(new_name);
            if let Err(e) = self.backing.rename(&from, &to) {
                warn!("rename {} -> {} failed: {}", from.display(), to.display(), e);
                return Err(e);
            }
        }

        let displaced = self.node(new_parent)?.dir()?.children.get(new_name).copied();
        if let Some(existing) = displaced.filter(|existing| *existing != child) {
            self.unlink_child(new_parent, new_name);
            self.drop_subtree(existing);
        }

        self.unlink_child(parent, name);
        {
            let node = self.node_mut(child)?;
            node.name = new_name.to_os_string();
            node.parent = Some(new_parent);
        }
        self.node_mut(new_parent)?
            .dir_mut()?
            .children
            .insert(new_name.to_os_string(), child);

        self.touch(parent, TimeUpdate::MODIFY | TimeUpdate::CHANGE)?;
        self.touch(new_parent, TimeUpdate::MODIFY | TimeUpdate::CHANGE)?;
        self.touch(child, TimeUpdate::CHANGE)?;
        Ok(())
    }

    fn is_ancestor_of(&self, ancestor: NodeId, node: NodeId) -> Result<bool> {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return Ok(true);
            }
            current = self.node(id)?.parent;
        }
        Ok(false)
    }

    /// Remove a child; a directory must be empty
    pub fn remove(&mut self, parent: NodeId, name: &OsStr) -> Result<()> {
        self.guard(parent)?;
        let child = *self
            .node(parent)?
            .dir()?
            .children
            .get(name)
            .ok_or(Error::NotFound)?;
        self.guard(child)?;

        let is_dir = self.node(child)?.is_dir();
        if is_dir {
            self.reconcile(child)?;
            if !self.node(child)?.dir()?.children.is_empty() {
                return Err(Error::NotEmpty(name.to_string_lossy().into_owned()));
            }
        }

        // Owned nodes may have a real entry too; it goes first
        let path = self.real_path(child)?;
        match self.backing.metadata(&path) {
            Ok(meta) => self.backing.remove(&path, meta.is_dir())?,
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        self.unlink_child(parent, name);
        self.drop_subtree(child);
        self.touch(parent, TimeUpdate::MODIFY | TimeUpdate::CHANGE)?;
        Ok(())
    }

    /// Remove a non-directory child
    pub fn unlink(&mut self, parent: NodeId, name: &OsStr) -> Result<()> {
        let (child, _) = self.lookup(parent, name)?;
        if self.node(child)?.is_dir() {
            return Err(Error::IsADirectory);
        }
        self.remove(parent, name)
    }

    /// Remove an empty directory child
    pub fn rmdir(&mut self, parent: NodeId, name: &OsStr) -> Result<()> {
        let (child, _) = self.lookup(parent, name)?;
        if !self.node(child)?.is_dir() {
            return Err(Error::NotADirectory);
        }
        self.remove(parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn tree_at(root: &Path) -> Tree {
        Tree::new(root.to_path_buf(), Duration::from_secs(1)).unwrap()
    }

    fn names(entries: &[DirEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_listing_keeps_passthrough_inodes_stable() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("one"), b"1").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let mut tree = tree_at(dir.path());

        let first = tree.list(NodeId::ROOT).unwrap();
        let second = tree.list(NodeId::ROOT).unwrap();
        assert_eq!(names(&first), vec!["one", "sub"]);
        assert_eq!(first, second);

        for entry in &first {
            assert!(entry.passthrough);
            assert!(entry.inum > Inum(1 << 63));
        }
        assert_eq!(first[1].kind, FileKind::Directory);
    }

    #[test]
    fn test_listing_picks_up_and_drops_real_entries() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("one"), b"1").unwrap();
        let mut tree = tree_at(dir.path());
        assert_eq!(names(&tree.list(NodeId::ROOT).unwrap()), vec!["one"]);

        fs::write(dir.path().join("two"), b"2").unwrap();
        fs::remove_file(dir.path().join("one")).unwrap();

        assert_eq!(names(&tree.list(NodeId::ROOT).unwrap()), vec!["two"]);
        assert!(matches!(
            tree.lookup(NodeId::ROOT, OsStr::new("one")),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_owned_child_shadows_real_entry() {
        let dir = tempdir().unwrap();
        let mut tree = tree_at(dir.path());
        let (owned, _) = tree.mkdir(NodeId::ROOT, OsStr::new("x"), 0o755, 0, 0).unwrap();

        // A real entry appears under the same name after the owned one
        fs::write(dir.path().join("x"), b"real").unwrap();

        let entries = tree.list(NodeId::ROOT).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node, owned);
        assert!(!entries[0].passthrough);
        assert_eq!(entries[0].kind, FileKind::Directory);
    }

    #[test]
    fn test_owned_directory_without_backing_lists_empty() {
        let dir = tempdir().unwrap();
        let mut tree = tree_at(dir.path());
        let (sub, _) = tree.mkdir(NodeId::ROOT, OsStr::new("new"), 0o755, 0, 0).unwrap();

        assert!(tree.list(sub).unwrap().is_empty());
        assert!(matches!(
            tree.lookup(sub, OsStr::new("missing")),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_mkdir_promotes_parent_and_rejects_duplicates() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("real")).unwrap();
        let mut tree = tree_at(dir.path());
        let (real, _) = tree.lookup(NodeId::ROOT, OsStr::new("real")).unwrap();
        assert!(tree.node(real).unwrap().passthrough);

        let (child, attrs) = tree.mkdir(real, OsStr::new("d"), 0o750, 1000, 1000).unwrap();
        assert!(!tree.node(real).unwrap().passthrough);
        assert!(attrs.is_dir());
        assert_eq!(attrs.perm, 0o750);
        assert_eq!(attrs.uid, 1000);
        assert_eq!(tree.parent_of(child).unwrap(), real);

        assert!(matches!(
            tree.mkdir(real, OsStr::new("d"), 0o755, 0, 0),
            Err(Error::AlreadyExists(_))
        ));
        // Nothing was written to the backing directory
        assert!(!dir.path().join("real/d").exists());
    }

    #[test]
    fn test_create_stages_file() {
        let dir = tempdir().unwrap();
        let mut tree = tree_at(dir.path());

        let (id, attrs, fh) = tree
            .create(NodeId::ROOT, OsStr::new("f"), 0o644, 0, 0, libc::O_WRONLY)
            .unwrap();
        assert_eq!(attrs.perm, 0o200);
        assert_eq!(attrs.size, 0);
        assert_eq!(tree.handles.get(fh).unwrap().node, id);
        assert!(matches!(
            tree.create(NodeId::ROOT, OsStr::new("f"), 0o644, 0, 0, 0),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_rename_passthrough_moves_real_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), b"data").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let mut tree = tree_at(dir.path());
        let (a, _) = tree.lookup(NodeId::ROOT, OsStr::new("a")).unwrap();
        let (sub, _) = tree.lookup(NodeId::ROOT, OsStr::new("sub")).unwrap();

        tree.rename(NodeId::ROOT, OsStr::new("a"), sub, OsStr::new("b"))
            .unwrap();

        assert!(!dir.path().join("a").exists());
        assert_eq!(fs::read(dir.path().join("sub/b")).unwrap(), b"data");
        let (moved, _) = tree.lookup(sub, OsStr::new("b")).unwrap();
        assert_eq!(moved, a);
        assert!(tree.node(a).unwrap().passthrough);
    }

    #[test]
    fn test_rename_failure_leaves_tree_untouched() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), b"data").unwrap();
        fs::create_dir(dir.path().join("full")).unwrap();
        fs::write(dir.path().join("full/inner"), b"i").unwrap();
        let mut tree = tree_at(dir.path());
        let (a, _) = tree.lookup(NodeId::ROOT, OsStr::new("a")).unwrap();
        let (full, _) = tree.lookup(NodeId::ROOT, OsStr::new("full")).unwrap();

        // A file cannot replace a non-empty directory
        assert!(tree
            .rename(NodeId::ROOT, OsStr::new("a"), NodeId::ROOT, OsStr::new("full"))
            .is_err());

        assert_eq!(tree.lookup(NodeId::ROOT, OsStr::new("a")).unwrap().0, a);
        assert_eq!(tree.lookup(NodeId::ROOT, OsStr::new("full")).unwrap().0, full);
        assert_eq!(fs::read(dir.path().join("a")).unwrap(), b"data");
        assert!(dir.path().join("full/inner").exists());
    }

    #[test]
    fn test_rename_into_unflushed_directory_materializes_it() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), b"data").unwrap();
        let mut tree = tree_at(dir.path());
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let (a, _) = tree.lookup(NodeId::ROOT, OsStr::new("a")).unwrap();
        let (owned, _) = tree
            .mkdir(NodeId::ROOT, OsStr::new("owned"), 0o755, uid, gid)
            .unwrap();

        tree.rename(NodeId::ROOT, OsStr::new("a"), owned, OsStr::new("a"))
            .unwrap();

        assert!(!dir.path().join("a").exists());
        assert_eq!(fs::read(dir.path().join("owned/a")).unwrap(), b"data");
        assert_eq!(tree.lookup(owned, OsStr::new("a")).unwrap().0, a);
        assert!(tree.lookup(NodeId::ROOT, OsStr::new("a")).is_err());
    }

    #[test]
    fn test_rename_promoted_file_moves_real_entry() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("old"), b"stale").unwrap();
        let mut tree = tree_at(dir.path());
        let (id, _) = tree.lookup(NodeId::ROOT, OsStr::new("old")).unwrap();
        let fh = tree.open(id, libc::O_WRONLY).unwrap();
        tree.write(fh, 0, b"fresh").unwrap();
        assert!(!tree.node(id).unwrap().passthrough);

        tree.rename(NodeId::ROOT, OsStr::new("old"), NodeId::ROOT, OsStr::new("new"))
            .unwrap();

        // The real entry moved along, so the old name does not come back
        assert!(!dir.path().join("old").exists());
        assert_eq!(names(&tree.list(NodeId::ROOT).unwrap()), vec!["new"]);
        assert_eq!(tree.read_all_unchecked(id).unwrap(), b"fresh");
    }

    #[test]
    fn test_rename_owned_into_passthrough_promotes_destination() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("dest")).unwrap();
        let mut tree = tree_at(dir.path());
        let (dest, _) = tree.lookup(NodeId::ROOT, OsStr::new("dest")).unwrap();
        let (file, _, _) = tree
            .create(NodeId::ROOT, OsStr::new("new"), 0o644, 0, 0, 0)
            .unwrap();

        tree.rename(NodeId::ROOT, OsStr::new("new"), dest, OsStr::new("moved"))
            .unwrap();

        assert!(!tree.node(dest).unwrap().passthrough);
        assert_eq!(tree.relative_path(file).unwrap(), Path::new("dest/moved"));
        assert!(tree.lookup(NodeId::ROOT, OsStr::new("new")).is_err());
    }

    #[test]
    fn test_rename_displaces_existing_entry() {
        let dir = tempdir().unwrap();
        let mut tree = tree_at(dir.path());
        let (a, _, _) = tree.create(NodeId::ROOT, OsStr::new("a"), 0o644, 0, 0, 0).unwrap();
        let (b, _, _) = tree.create(NodeId::ROOT, OsStr::new("b"), 0o644, 0, 0, 0).unwrap();
        let b_inum = tree.node(b).unwrap().inum;

        tree.rename(NodeId::ROOT, OsStr::new("a"), NodeId::ROOT, OsStr::new("b"))
            .unwrap();

        assert_eq!(tree.lookup(NodeId::ROOT, OsStr::new("b")).unwrap().0, a);
        assert!(tree.node(b).is_err());
        assert!(tree.registry().get(b_inum).is_err());
    }

    #[test]
    fn test_rename_into_own_subtree_rejected() {
        let dir = tempdir().unwrap();
        let mut tree = tree_at(dir.path());
        let (outer, _) = tree.mkdir(NodeId::ROOT, OsStr::new("outer"), 0o755, 0, 0).unwrap();
        let (inner, _) = tree.mkdir(outer, OsStr::new("inner"), 0o755, 0, 0).unwrap();

        assert!(matches!(
            tree.rename(NodeId::ROOT, OsStr::new("outer"), inner, OsStr::new("x")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_remove_passthrough_and_owned() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("real"), b"r").unwrap();
        let mut tree = tree_at(dir.path());
        tree.create(NodeId::ROOT, OsStr::new("owned"), 0o644, 0, 0, 0).unwrap();

        tree.unlink(NodeId::ROOT, OsStr::new("real")).unwrap();
        assert!(!dir.path().join("real").exists());

        tree.unlink(NodeId::ROOT, OsStr::new("owned")).unwrap();
        assert!(tree.list(NodeId::ROOT).unwrap().is_empty());
    }

    #[test]
    fn test_remove_flushed_file_and_materialized_directory() {
        let dir = tempdir().unwrap();
        let mut tree = tree_at(dir.path());
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let (sub, _) = tree.mkdir(NodeId::ROOT, OsStr::new("sub"), 0o755, uid, gid).unwrap();
        let (f, _, fh) = tree
            .create(sub, OsStr::new("f"), 0o644, uid, gid, libc::O_WRONLY)
            .unwrap();
        tree.write(fh, 0, b"approved").unwrap();
        tree.release_handle(fh).unwrap();
        tree.finalize(f).unwrap();
        assert!(dir.path().join("sub/f").exists());
        assert!(!tree.node(sub).unwrap().passthrough);

        tree.unlink(sub, OsStr::new("f")).unwrap();
        assert!(!dir.path().join("sub/f").exists());

        // The owned directory has a materialized counterpart on disk
        tree.rmdir(NodeId::ROOT, OsStr::new("sub")).unwrap();
        assert!(!dir.path().join("sub").exists());
        assert!(tree.list(NodeId::ROOT).unwrap().is_empty());
    }

    #[test]
    fn test_remove_promoted_file_deletes_old_content() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("p"), b"old content").unwrap();
        let mut tree = tree_at(dir.path());
        let (id, _) = tree.lookup(NodeId::ROOT, OsStr::new("p")).unwrap();
        let fh = tree.open(id, libc::O_WRONLY).unwrap();
        tree.write(fh, 0, b"new").unwrap();
        assert!(!tree.node(id).unwrap().passthrough);

        tree.unlink(NodeId::ROOT, OsStr::new("p")).unwrap();

        assert!(!dir.path().join("p").exists());
        assert!(tree.list(NodeId::ROOT).unwrap().is_empty());
    }

    #[test]
    fn test_remove_owned_directory_with_real_children_fails() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/keep"), b"k").unwrap();
        let mut tree = tree_at(dir.path());
        let (d, _) = tree.lookup(NodeId::ROOT, OsStr::new("d")).unwrap();
        tree.promote(d).unwrap();

        assert!(matches!(
            tree.rmdir(NodeId::ROOT, OsStr::new("d")),
            Err(Error::NotEmpty(_))
        ));
        assert!(dir.path().join("d/keep").exists());
        assert_eq!(tree.lookup(NodeId::ROOT, OsStr::new("d")).unwrap().0, d);
    }

    #[test]
    fn test_real_entry_changing_type_is_resynthesized() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("x"), b"file").unwrap();
        let mut tree = tree_at(dir.path());
        let (old, _) = tree.lookup(NodeId::ROOT, OsStr::new("x")).unwrap();
        let old_inum = tree.node(old).unwrap().inum;

        fs::remove_file(dir.path().join("x")).unwrap();
        fs::create_dir(dir.path().join("x")).unwrap();
        fs::write(dir.path().join("x/inner"), b"i").unwrap();

        let entries = tree.list(NodeId::ROOT).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, FileKind::Directory);
        assert_ne!(entries[0].node, old);
        assert!(tree.node(old).is_err());
        assert!(tree.registry().get(old_inum).is_err());
        assert_eq!(names(&tree.list(entries[0].node).unwrap()), vec!["inner"]);
    }

    #[test]
    fn test_passthrough_listing_reports_real_size() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), [b'b'; 50]).unwrap();
        let mut tree = tree_at(dir.path());

        let entries = tree.list(NodeId::ROOT).unwrap();
        assert_eq!(names(&entries), vec!["b.txt"]);
        assert!(entries[0].passthrough);
        assert_eq!(tree.attr(entries[0].node).unwrap().size, 50);

        fs::remove_file(dir.path().join("b.txt")).unwrap();
        assert!(tree.list(NodeId::ROOT).unwrap().is_empty());
    }

    #[test]
    fn test_remove_checks_kind_and_emptiness() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("full")).unwrap();
        fs::write(dir.path().join("full/inner"), b"i").unwrap();
        fs::write(dir.path().join("file"), b"f").unwrap();
        let mut tree = tree_at(dir.path());

        assert!(matches!(
            tree.rmdir(NodeId::ROOT, OsStr::new("full")),
            Err(Error::NotEmpty(_))
        ));
        assert!(dir.path().join("full/inner").exists());

        assert!(matches!(
            tree.unlink(NodeId::ROOT, OsStr::new("full")),
            Err(Error::IsADirectory)
        ));
        assert!(matches!(
            tree.rmdir(NodeId::ROOT, OsStr::new("file")),
            Err(Error::NotADirectory)
        ));
        assert!(matches!(
            tree.remove(NodeId::ROOT, OsStr::new("nothing")),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_stale_parent_fails_lookup() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("gone")).unwrap();
        let mut tree = tree_at(dir.path());
        let (gone, _) = tree.lookup(NodeId::ROOT, OsStr::new("gone")).unwrap();

        fs::remove_dir(dir.path().join("gone")).unwrap();
        assert!(matches!(
            tree.lookup(gone, OsStr::new("x")),
            Err(Error::NotFound)
        ));
        assert!(matches!(tree.list(gone), Err(Error::NotFound)));
    }
}
