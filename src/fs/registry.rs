//! Inode registry
//!
//! Two partitioned maps from inode number to attribute record. Owned nodes
//! take ids from an ascending counter starting at 1; passthrough nodes take
//! ids from a descending counter starting at `u64::MAX`. Allocation fails
//! with [`Error::InodeSpaceExhausted`] instead of handing out an id that is
//! live in either map or that crosses the other counter.

use std::collections::HashMap;
use std::fmt;

use super::attr::Attributes;
use crate::error::{Error, Result};

/// Logical inode number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inum(pub u64);

impl Inum {
    /// The root directory's inode
    pub const ROOT: Inum = Inum(1);
}

impl fmt::Display for Inum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which allocation range an inode came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Owned,
    Passthrough,
}

/// Inode allocation and attribute storage
pub struct InodeRegistry {
    next_owned: u64,
    next_passthrough: u64,
    /// Set once either counter has run off the end of its range
    exhausted: bool,
    owned: HashMap<Inum, Attributes>,
    passthrough: HashMap<Inum, Attributes>,
}

impl InodeRegistry {
    pub fn new() -> Self {
        Self::with_counters(1, u64::MAX)
    }

    /// Registry whose counters start at the given values
    pub(crate) fn with_counters(next_owned: u64, next_passthrough: u64) -> Self {
        Self {
            next_owned,
            next_passthrough,
            exhausted: false,
            owned: HashMap::new(),
            passthrough: HashMap::new(),
        }
    }

    /// Next ascending id for an owned node
    pub fn allocate_owned(&mut self) -> Result<Inum> {
        let inum = Inum(self.next_owned);
        self.check_free(inum)?;

        match self.next_owned.checked_add(1) {
            Some(next) => self.next_owned = next,
            None => self.exhausted = true,
        }
        Ok(inum)
    }

    /// Next descending id for a passthrough node
    pub fn allocate_passthrough(&mut self) -> Result<Inum> {
        let inum = Inum(self.next_passthrough);
        self.check_free(inum)?;

        match self.next_passthrough.checked_sub(1) {
            Some(next) if next > 0 => self.next_passthrough = next,
            _ => self.exhausted = true,
        }
        Ok(inum)
    }

    fn check_free(&self, inum: Inum) -> Result<()> {
        if self.exhausted
            || self.next_owned > self.next_passthrough
            || self.owned.contains_key(&inum)
            || self.passthrough.contains_key(&inum)
        {
            return Err(Error::InodeSpaceExhausted);
        }
        Ok(())
    }

    /// Store the record for a freshly allocated inode
    pub fn insert(&mut self, inum: Inum, provenance: Provenance, attrs: Attributes) {
        match provenance {
            Provenance::Owned => self.owned.insert(inum, attrs),
            Provenance::Passthrough => self.passthrough.insert(inum, attrs),
        };
    }

    pub fn get(&self, inum: Inum) -> Result<&Attributes> {
        self.owned
            .get(&inum)
            .or_else(|| self.passthrough.get(&inum))
            .ok_or(Error::NotFound)
    }

    pub fn get_mut(&mut self, inum: Inum) -> Result<&mut Attributes> {
        if let Some(attrs) = self.owned.get_mut(&inum) {
            return Ok(attrs);
        }
        self.passthrough.get_mut(&inum).ok_or(Error::NotFound)
    }

    pub fn remove(&mut self, inum: Inum) -> Option<Attributes> {
        self.owned
            .remove(&inum)
            .or_else(|| self.passthrough.remove(&inum))
    }

    pub fn provenance(&self, inum: Inum) -> Option<Provenance> {
        if self.owned.contains_key(&inum) {
            Some(Provenance::Owned)
        } else if self.passthrough.contains_key(&inum) {
            Some(Provenance::Passthrough)
        } else {
            None
        }
    }

    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    pub fn passthrough_count(&self) -> usize {
        self.passthrough.len()
    }
}

impl Default for InodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
