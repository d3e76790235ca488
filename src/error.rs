//! Error types for the directory and its collaborators.

use std::io;

use thiserror::Error;

use crate::placement::{NodeId, Ticket};

/// Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by [`Block`](crate::Block) and [`Directory`](crate::Directory) operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A single block cannot fit the requested variable.
    /// The directory's first-fit scan recovers from this by moving to the next block.
    #[error("block `{block}` cannot fit {requested} bytes ({free} bytes free)")]
    CapacityExceeded {
        block: String,
        requested: usize,
        free: usize,
    },

    /// No block anywhere in the directory can fit the variable.
    #[error("there is not enough space to insert variable `{variable}` of size {size} bytes")]
    OutOfSpace { variable: String, size: usize },

    /// No variable with this name exists.
    #[error("no variable with name `{0}`")]
    NotFound(String),

    /// No block with this name is held by the directory.
    #[error("no block with name `{0}`")]
    UnknownBlock(String),

    /// Variable names are unique across the whole directory.
    #[error("variable `{0}` already exists")]
    VariableExists(String),

    /// Block names are unique across the whole directory.
    #[error("block `{0}` already exists")]
    DuplicateBlock(String),

    /// Blocks and variables must have a positive size.
    #[error("size must be greater than 0")]
    InvalidSize,

    /// The placement service failed to create, locate or destroy a block.
    #[error("placement failure: {0}")]
    Placement(#[from] PlacementError),
}

/// Failures reported by a [`Placement`](crate::placement::Placement) service or by the
/// [`SegmentBackend`](crate::segment::SegmentBackend) running on a worker.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// The operating system rejected a segment operation.
    #[error("segment `{name}`: {source}")]
    Segment {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A segment with this name is already live.
    #[error("segment `{0}` already exists")]
    AlreadyExists(String),

    /// No worker with this identifier is part of the cluster.
    #[error("no worker `{0}`")]
    UnknownNode(NodeId),

    /// The ticket was never issued, was already awaited, or has not been awaited yet.
    #[error("unknown ticket {0}")]
    UnknownTicket(Ticket),

    /// The worker went away before answering.
    #[error("worker `{0}` stopped before replying")]
    WorkerLost(NodeId),

    /// A task produced an output that does not belong to it.
    #[error("expected output for `{expected}`, got `{actual}`")]
    Mismatch { expected: String, actual: String },
}
