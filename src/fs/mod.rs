//! Overlay filesystem engine
//!
//! An in-memory overlay on top of a real backing directory. Owned nodes
//! live in memory; passthrough nodes mirror entries of the backing
//! directory. New content stays unreadable until an [`Inspector`] approves
//! it and is then flushed to the backing directory.

mod attr;
mod backing;
mod dir;
mod engine;
mod file;
mod filesystem;
mod handle;
mod node;
mod notifier;
mod overlay;
mod registry;
mod tree;

pub use attr::{Attributes, FileKind, TimeUpdate};
pub use backing::BackingStore;
pub use engine::Engine;
pub use file::splice;
pub use filesystem::OverlayFs;
pub use handle::{FileHandle, HandleTable};
pub use node::{DirEntry, FileState, NodeId};
pub use notifier::{Debounced, Debouncer};
pub use overlay::{Inspector, Overlay, StagedFile};
pub use registry::{InodeRegistry, Inum, Provenance};
pub use tree::{SetAttr, Tree, TreeEvent};
