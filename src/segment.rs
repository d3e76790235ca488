//! [`SegmentBackend`] trait and the backends that implement it.
//!
//! A backend is what a worker calls when it is asked to create or destroy a
//! named shared memory segment. The directory itself never calls a backend,
//! it only ships [`Task`](crate::placement::Task)s to the placement service.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, instrument, warn, Level};

use crate::error::PlacementError;

/// The shared memory primitive running on a worker.
pub trait SegmentBackend: Send + Sync {
    /// Creates a segment of `capacity` bytes.
    /// Fails with [`PlacementError::AlreadyExists`] if a segment with that name is live.
    fn create(&self, name: &str, capacity: usize) -> Result<(), PlacementError>;

    /// Destroys a segment. A segment that is already gone is not an error,
    /// so that retried teardowns stay idempotent.
    fn destroy(&self, name: &str) -> Result<(), PlacementError>;
}

impl<T: SegmentBackend + ?Sized> SegmentBackend for std::sync::Arc<T> {
    fn create(&self, name: &str, capacity: usize) -> Result<(), PlacementError> {
        (**self).create(name, capacity)
    }

    fn destroy(&self, name: &str) -> Result<(), PlacementError> {
        (**self).destroy(name)
    }
}

/// POSIX shared memory, created with `shm_open` and removed with `shm_unlink`.
///
/// Segments are only created and sized here, mapping them is left to whoever
/// reads and writes the variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixShm;

impl PosixShm {
    pub const fn new() -> Self {
        PosixShm
    }

    /// `shm_open` names must start with a single slash.
    fn c_name(name: &str) -> Result<CString, PlacementError> {
        let name = format!("/{}", name.trim_start_matches('/'));
        CString::new(name.clone()).map_err(|e| PlacementError::Segment {
            name,
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })
    }
}

impl SegmentBackend for PosixShm {
    #[instrument(level = "debug", skip(self), err(Debug, level = Level::ERROR))]
    fn create(&self, name: &str, capacity: usize) -> Result<(), PlacementError> {
        let c_name = Self::c_name(name)?;
        let segment_err = |source: io::Error| PlacementError::Segment {
            name: name.to_owned(),
            source,
        };
        let len = libc::off_t::try_from(capacity)
            .map_err(|e| segment_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd == -1 {
            let err = io::Error::last_os_error();
            return Err(match err.kind() {
                io::ErrorKind::AlreadyExists => PlacementError::AlreadyExists(name.to_owned()),
                _ => segment_err(err),
            });
        }

        let sized = unsafe { libc::ftruncate(fd, len) };
        let sized_err = (sized == -1).then(io::Error::last_os_error);
        unsafe { libc::close(fd) };

        if let Some(err) = sized_err {
            // Don't leave a zero-sized segment behind.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(segment_err(err));
        }

        debug!(capacity, "Segment created.");
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err(Debug, level = Level::ERROR))]
    fn destroy(&self, name: &str) -> Result<(), PlacementError> {
        let c_name = Self::c_name(name)?;
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                warn!("Segment was already gone.");
                return Ok(());
            }
            return Err(PlacementError::Segment {
                name: name.to_owned(),
                source: err,
            });
        }
        debug!("Segment unlinked.");
        Ok(())
    }
}

/// A process-local stand-in for shared memory that only records which
/// segments are live and how big they are.
#[derive(Debug, Default)]
pub struct InMemorySegments {
    live: Mutex<HashMap<String, usize>>,
}

impl InMemorySegments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the live segments, sorted.
    pub fn live(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn capacity_of(&self, name: &str) -> Option<usize> {
        self.lock().get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SegmentBackend for InMemorySegments {
    fn create(&self, name: &str, capacity: usize) -> Result<(), PlacementError> {
        let mut live = self.lock();
        if live.contains_key(name) {
            return Err(PlacementError::AlreadyExists(name.to_owned()));
        }
        live.insert(name.to_owned(), capacity);
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<(), PlacementError> {
        if self.lock().remove(name).is_none() {
            warn!(name, "Segment was already gone.");
        }
        Ok(())
    }
}
