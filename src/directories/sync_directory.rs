//! A multithreaded directory of shared memory blocks.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::block::Variable;
use crate::directories::directory::{BlockSummary, DirectoryConfig, VariableLocation};
use crate::directories::Directory;
use crate::error::Result;
use crate::placement::{NodeId, Placement};
use crate::Block;

/// A multithreaded directory of shared memory blocks.
///
/// This is just a `Mutex` wrapper over [`Directory`] so that one directory can be
/// shared between threads. Every call holds the lock for its whole duration,
/// including the remote round trips of [`allocate`](Self::allocate),
/// [`release`](Self::release) and [`clear`](Self::clear).
pub struct SyncDirectory<P: Placement> {
    inner: Mutex<Directory<P>>,
}

impl<P: Placement> SyncDirectory<P> {
    pub fn new(placement: P) -> Self {
        Self::from(Directory::new(placement))
    }

    pub fn with_config(placement: P, config: DirectoryConfig) -> Self {
        Self::from(Directory::with_config(placement, config))
    }

    /// Locks the directory for a sequence of calls that must not interleave with other threads.
    ///
    /// Directory metadata only changes after every fallible step of an operation
    /// has succeeded, so a poisoned lock still guards a consistent directory.
    pub fn lock(&self) -> MutexGuard<'_, Directory<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn into_inner(self) -> Directory<P> {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allocate<N: AsRef<str>>(&self, names: &[N], size: usize) -> Result<()> {
        self.lock().allocate(names, size)
    }

    pub fn insert(&self, name: &str, size: usize) -> Result<usize> {
        self.lock().insert(name, size)
    }

    pub fn remove(&self, name: &str) -> Option<Variable> {
        self.lock().remove(name)
    }

    pub fn find(&self, name: &str) -> Result<(NodeId, String)> {
        self.lock().find(name)
    }

    pub fn find_verbose(&self, name: &str) -> Result<VariableLocation> {
        self.lock().find_verbose(name)
    }

    pub fn list_blocks(&self) -> Vec<(NodeId, String)> {
        self.lock().list_blocks()
    }

    pub fn list_blocks_verbose(&self) -> Vec<BlockSummary> {
        self.lock().list_blocks_verbose()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.lock().nodes()
    }

    pub fn release(&self, name: &str) -> Result<Block> {
        self.lock().release(name)
    }

    pub fn clear(&self) -> Result<()> {
        self.lock().clear()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<P: Placement> From<Directory<P>> for SyncDirectory<P> {
    fn from(directory: Directory<P>) -> Self {
        SyncDirectory {
            inner: Mutex::new(directory),
        }
    }
}
