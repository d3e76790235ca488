//! The [`Directory`] and [`SyncDirectory`] coordinators.

pub mod directory;
pub mod sync_directory;

pub use directory::Directory;
pub use sync_directory::SyncDirectory;
