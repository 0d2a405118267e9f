//! Ordered record of the mounted partitions

use std::path::{Path, PathBuf};

/// A partition device node, and where it's mounted
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mapper {
    node: PathBuf,
    mount_point: PathBuf,
}

impl Mapper {
    /// Creates a new mapper entry
    #[must_use]
    pub fn new(node: &Path, mount_point: &Path) -> Self {
        Self {
            node: node.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
        }
    }

    /// Partition device node
    #[must_use]
    pub fn node(&self) -> &Path {
        &self.node
    }

    /// Absolute mount point
    #[must_use]
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }
}

/// The mounted partitions, in mount order.
///
/// Entries can only be removed from the end, so unmounting always happens in
/// the reverse order of mounting.
#[derive(Debug, Default)]
pub struct MountRegistry {
    entries: Vec<Mapper>,
}

impl MountRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly mounted partition
    pub fn push(&mut self, mapper: Mapper) {
        self.entries.push(mapper);
    }

    /// Removes the most recently mounted partition
    pub fn pop(&mut self) -> Option<Mapper> {
        self.entries.pop()
    }

    /// The first mounted partition
    #[must_use]
    pub fn first(&self) -> Option<&Mapper> {
        self.entries.first()
    }

    /// Number of mounted partitions
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is there any mounted partition left?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the partitions, in mount order
    pub fn iter(&self) -> impl Iterator<Item = &Mapper> {
        self.entries.iter()
    }
}
