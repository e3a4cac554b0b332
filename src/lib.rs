//! quarantinefs - Interposing FUSE overlay that quarantines new files
//!
//! The overlay mounts over an existing directory. Files written through it
//! are held in memory, unreadable, until an inspection hook approves them;
//! approved files are flushed to the real directory underneath.

pub mod config;
pub mod error;
pub mod fs;
pub mod inspect;

pub use config::Config;
pub use error::{Error, Result};
pub use fs::{Engine, Inspector, Overlay, StagedFile};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{Engine, FileState, Inspector, NodeId, Overlay, StagedFile};
    pub use crate::inspect::{ApproveAll, CommandInspector};
}
