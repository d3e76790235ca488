//! Defines the [`Block`] struct, the [`Variable`] records packed inside it
//! and the [`CapacityPolicy`] deciding when a block is full.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Error, Result};

/// Decides whether a block can admit a new variable.
///
/// Offsets are always handed out by a bump cursor and freed ranges are never
/// reused while the block holds a live variable. The policies only differ in how
/// the space given back by [`Block::remove`] is accounted for.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum CapacityPolicy {
    /// Admission is checked against the used bytes, but the offset must still fit
    /// behind the cursor. Since the cursor never falls below the used bytes, a
    /// removal only makes room again once the block is empty: then a request the
    /// cursor cannot fit rewinds it to 0 and a new generation begins. Until then
    /// [`Block::free_space`] can report more room than an insert will find.
    #[default]
    ReclaimOnRemove,
    /// Admission is checked against the bump cursor, which never rewinds.
    /// A block can be exhausted before its used bytes reach its capacity.
    BumpCursor,
}

impl FromStr for CapacityPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reclaim" | "reclaim-on-remove" => Ok(CapacityPolicy::ReclaimOnRemove),
            "bump" | "bump-cursor" => Ok(CapacityPolicy::BumpCursor),
            other => Err(format!("unknown capacity policy `{other}`")),
        }
    }
}

impl fmt::Display for CapacityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityPolicy::ReclaimOnRemove => f.write_str("reclaim"),
            CapacityPolicy::BumpCursor => f.write_str("bump"),
        }
    }
}

/// Where a variable lives inside its block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Variable {
    pub size: usize,
    pub offset: usize,
}

impl Variable {
    /// One past the last byte of the variable.
    #[inline(always)]
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Metadata of one shared memory segment living on one worker.
///
/// The bytes of the segment are not touched here, a block only tracks which
/// ranges of it are reserved and by whom.
#[derive(Clone, Debug)]
pub struct Block {
    name: String,
    capacity: usize,
    used: usize,
    cursor: usize,
    policy: CapacityPolicy,
    variables: HashMap<String, Variable>,
}

impl Block {
    /// Creates an empty block mirroring a segment of `capacity` bytes.
    pub fn new(name: impl Into<String>, capacity: usize, policy: CapacityPolicy) -> Self {
        Block {
            name: name.into(),
            capacity,
            used: 0,
            cursor: 0,
            policy,
            variables: HashMap::new(),
        }
    }

    /// Reserves `size` bytes for `name` and returns the offset they start at.
    pub fn insert(&mut self, name: &str, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        if self.variables.contains_key(name) {
            return Err(Error::VariableExists(name.to_owned()));
        }

        let admitted = match self.policy {
            CapacityPolicy::ReclaimOnRemove => self.fits(self.used, size),
            CapacityPolicy::BumpCursor => self.fits(self.cursor, size),
        };
        if !admitted {
            return Err(self.exceeded(size));
        }

        if !self.fits(self.cursor, size) {
            // Only reachable under ReclaimOnRemove, where `used` lags behind the cursor.
            if !self.variables.is_empty() {
                return Err(self.exceeded(size));
            }
            debug!(block = %self.name, cursor = self.cursor, "Block is empty, starting a new generation.");
            self.cursor = 0;
        }

        let offset = self.cursor;
        self.variables.insert(name.to_owned(), Variable { size, offset });
        self.cursor += size;
        self.used += size;
        debug_assert!(self.used <= self.capacity);
        debug_assert!(self.cursor <= self.capacity);

        Ok(offset)
    }

    /// Forgets `name` and gives its bytes back to the used count.
    /// The range itself is not handed out again by the cursor.
    pub fn remove(&mut self, name: &str) -> Result<Variable> {
        let variable = self
            .variables
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;
        self.used -= variable.size;
        Ok(variable)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Result<Variable> {
        self.variables
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity - self.used
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// The offset the next variable will be placed at, unless a new generation starts.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn policy(&self) -> CapacityPolicy {
        self.policy
    }

    /// Number of live variables.
    #[inline]
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Live variables ordered by offset.
    pub fn variables(&self) -> Vec<(&str, Variable)> {
        let mut res: Vec<_> = self
            .variables
            .iter()
            .map(|(name, var)| (name.as_str(), *var))
            .collect();
        res.sort_unstable_by_key(|(_, var)| var.offset);
        res
    }

    #[inline(always)]
    fn fits(&self, start: usize, size: usize) -> bool {
        start
            .checked_add(size)
            .is_some_and(|end| end <= self.capacity)
    }

    fn exceeded(&self, requested: usize) -> Error {
        Error::CapacityExceeded {
            block: self.name.clone(),
            requested,
            free: self.free_space(),
        }
    }
}
