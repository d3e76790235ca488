//! A directory and slab allocator for named shared memory blocks spread across a cluster.
//!
//! Client code asks for fixed-size memory blocks, the crate has a placement service
//! create each block on some worker node and remembers which node holds it. Smaller
//! named variables are then packed into the free space of those blocks, and can
//! later be looked up or removed by name.
//!
//! Only the metadata is managed here: which bytes of which segment are reserved for
//! which variable. Reading and writing the bytes is up to the callers.
//!
//! # Usage
//! ```
//! use shm_directory::placement::LocalCluster;
//! use shm_directory::segment::InMemorySegments;
//! use shm_directory::Directory;
//!
//! let cluster = LocalCluster::new(2, InMemorySegments::new());
//! let mut directory = Directory::new(cluster);
//!
//! directory.allocate(&["block0", "block1"], 1024).unwrap();
//! assert_eq!(directory.insert("x", 4).unwrap(), 0);
//! assert_eq!(directory.insert("y", 8).unwrap(), 4);
//!
//! let y = directory.find_verbose("y").unwrap();
//! assert_eq!((y.block_used, y.size, y.offset), (12, 8, 4));
//!
//! directory.clear().unwrap();
//! assert!(directory.list_blocks().is_empty());
//! ```
//!
//! # Directories
//! Two directories are exported by this crate - [`Directory`] and [`SyncDirectory`].
//! Use [`Directory`] if one thread drives it, [`SyncDirectory`] is just a `Mutex`
//! wrapper over it to allow for sharing it between threads.
//!
//! # Mode of operation
//! - [`allocate`](Directory::allocate) submits one "create a segment" task per block
//!   name to the placement service in a single batch, waits for all of them, asks the
//!   service which node ran each task and records every block under its node.
//! - [`insert`](Directory::insert) does a first-fit search: nodes are visited in the
//!   order they first received a block, and each node's blocks in allocation order.
//!   The variable goes into the first block with enough room. This, and
//!   [`remove`](Directory::remove) and [`find`](Directory::find), never leave the
//!   current process.
//! - [`clear`](Directory::clear) submits one "destroy these segments" task per node and
//!   then forgets everything. Dropping a directory clears it.
//!
//! Below are the abstractions the directory works with:
//!
//! ## Blocks
//! A [`Block`] mirrors one shared memory segment on one node. It has a fixed capacity,
//! a count of used bytes and the variables packed inside it.
//!
//! ## Variables
//! A variable is a named range of a block. Its offset is handed out by the block's bump
//! cursor, so offsets only grow and a removed variable's range is not handed out again
//! while other variables are live. Variable names are unique across the whole directory.
//!
//! ## Capacity policies
//! A block's [`CapacityPolicy`] decides whether an emptied block can be reused:
//! - [`ReclaimOnRemove`](CapacityPolicy::ReclaimOnRemove) checks requests against the
//!   used bytes, and rewinds the cursor of a block that has been emptied. Space freed
//!   in a block that still holds live variables is not reused.
//! - [`BumpCursor`](CapacityPolicy::BumpCursor) checks requests against the cursor,
//!   which never rewinds.
//!
//! ## Placement
//! The directory reaches its workers only through the [`Placement`] trait, so any task
//! executor that can run a batch, wait for it and tell which worker ran what can be plugged
//! in. [`LocalCluster`] is a ready-made one whose workers are threads.
//!
//! ## Segments
//! Workers create and destroy segments through a [`SegmentBackend`]. [`PosixShm`] uses
//! POSIX shared memory, [`InMemorySegments`] only keeps track of names and is handy for
//! tests.
//!
//! # Known gaps
//! If the placement service fails in the middle of an [`allocate`](Directory::allocate)
//! batch, the segments created by the tasks that did succeed are not recorded and not
//! rolled back. Callers that care should tear them down through their placement service.
//!
//! [`Placement`]: placement::Placement
//! [`LocalCluster`]: placement::LocalCluster
//! [`SegmentBackend`]: segment::SegmentBackend
//! [`PosixShm`]: segment::PosixShm
//! [`InMemorySegments`]: segment::InMemorySegments

pub use crate::block::{Block, CapacityPolicy, Variable};
pub use crate::directories::directory::{BlockSummary, DirectoryConfig, VariableLocation};
pub use crate::directories::{Directory, SyncDirectory};
pub use crate::error::{Error, PlacementError, Result};

mod block;
pub mod directories;
mod error;
pub mod placement;
pub mod segment;

use static_assertions::assert_impl_all;

assert_impl_all!(placement::LocalCluster<segment::PosixShm>: Send);
assert_impl_all!(Directory<placement::LocalCluster<segment::InMemorySegments>>: Send);
assert_impl_all!(SyncDirectory<placement::LocalCluster<segment::PosixShm>>: Send, Sync);
