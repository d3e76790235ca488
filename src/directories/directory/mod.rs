//! A singlethreaded directory of shared memory blocks.
//!
// For a general view of the directory's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Arena and indices
// Blocks live in an arena (`arena`) and are referred to by their [`BlockId`],
// which is the slot index. Slots emptied by `release` go on a free list (`free`)
// and are handed to the next recorded block, so the arena never outgrows the
// largest number of blocks held at once.
// Three indices point into the arena:
// - `nodes`: node -> block ids, both in first-seen order. This is the first-fit traversal order.
// - `block_index`: block name -> block id.
// - `variable_index`: variable name -> id of the block holding it.
// Every mutation keeps all three in sync with the arena, and only after the
// fallible (remote) part of an operation has succeeded.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;

use tracing::{debug, error, info, instrument, warn, Level};

use crate::block::{Block, CapacityPolicy, Variable};
use crate::error::{Error, PlacementError, Result};
use crate::placement::{NodeId, Placement, Task, TaskOutput, Ticket};

#[cfg(test)]
mod tests;

/// Construction-time settings of a [`Directory`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryConfig {
    /// Policy given to every block allocated by the directory.
    pub policy: CapacityPolicy,
}

impl DirectoryConfig {
    pub const fn with_policy(policy: CapacityPolicy) -> Self {
        DirectoryConfig { policy }
    }
}

/// Position of a block in the directory's arena.
/// The id of a released block is given to the next block recorded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(usize);

/// A snapshot of one block, as returned by [`Directory::list_blocks_verbose`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSummary {
    pub node: NodeId,
    pub name: String,
    pub capacity: usize,
    pub used: usize,
}

/// A snapshot of where a variable lives, as returned by [`Directory::find_verbose`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariableLocation {
    pub node: NodeId,
    pub block: String,
    pub block_capacity: usize,
    pub block_used: usize,
    pub size: usize,
    pub offset: usize,
}

struct Slot {
    node: NodeId,
    block: Block,
}

struct NodeEntry {
    id: NodeId,
    blocks: Vec<BlockId>,
}

/// A single threaded directory of shared memory blocks.
///
/// The directory is the only owner of its blocks and of their backing segments.
/// Dropping it destroys every segment it still holds.
pub struct Directory<P: Placement> {
    placement: P,
    config: DirectoryConfig,
    arena: Vec<Option<Slot>>,
    free: Vec<BlockId>,
    nodes: Vec<NodeEntry>,
    block_index: HashMap<String, BlockId>,
    variable_index: HashMap<String, BlockId>,
}

impl<P: Placement> Debug for Directory<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("config", &self.config)
            .field("nodes", &self.nodes.len())
            .field("blocks", &self.block_index.len())
            .field("variables", &self.variable_index.len())
            .finish()
    }
}

impl<P: Placement> Directory<P> {
    /// Creates an empty directory that places its blocks through `placement`.
    pub fn new(placement: P) -> Self {
        Self::with_config(placement, DirectoryConfig::default())
    }

    pub fn with_config(placement: P, config: DirectoryConfig) -> Self {
        Directory {
            placement,
            config,
            arena: Vec::new(),
            free: Vec::new(),
            nodes: Vec::new(),
            block_index: HashMap::new(),
            variable_index: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    pub fn placement(&self) -> &P {
        &self.placement
    }

    pub fn placement_mut(&mut self) -> &mut P {
        &mut self.placement
    }

    /// Number of blocks held.
    pub fn len(&self) -> usize {
        self.block_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_index.is_empty()
    }

    /// Metadata of the block called `name`.
    pub fn block(&self, name: &str) -> Option<&Block> {
        let id = self.block_index.get(name)?;
        self.slot(*id).map(|slot| &slot.block)
    }
}

impl<P: Placement> Directory<P> {
    /// Creates one block of `size` bytes for every name in `names`, letting the
    /// placement service pick a worker for each.
    ///
    /// All creation tasks go out as one batch and are awaited together.
    /// If the service fails, nothing is recorded, but segments created by the
    /// tasks that did succeed are left behind on their workers.
    #[instrument(level = "info", skip(self, names), fields(count = names.len()), err(Debug, level = Level::ERROR))]
    pub fn allocate<N: AsRef<str>>(&mut self, names: &[N], size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }

        let mut seen = HashSet::with_capacity(names.len());
        for name in names {
            let name: &str = name.as_ref();
            if self.block_index.contains_key(name) || !seen.insert(name) {
                return Err(Error::DuplicateBlock(name.to_owned()));
            }
        }
        if names.is_empty() {
            return Ok(());
        }

        let tasks = names
            .iter()
            .map(|name: &N| Task::Create {
                name: String::from(name.as_ref()),
                capacity: size,
            })
            .collect();
        let tickets = self.placement.submit_batch(tasks)?;
        let placed = match self.place(names, size, &tickets) {
            Ok(placed) => placed,
            Err(e) => {
                self.placement.discard(&tickets);
                return Err(e);
            }
        };

        for (node, block) in placed {
            debug!(%node, block = block.name(), "Recording block.");
            self.record(node, block);
        }
        Ok(())
    }

    /// Awaits the creation tasks of [`allocate`](Self::allocate) and locates each block.
    fn place<N: AsRef<str>>(
        &mut self,
        names: &[N],
        size: usize,
        tickets: &[Ticket],
    ) -> Result<Vec<(NodeId, Block)>> {
        let outputs = self.placement.await_all(tickets)?;
        debug!(tickets = tickets.len(), "Batch completed.");

        let mut placed = Vec::with_capacity(names.len());
        for ((name, ticket), output) in names.iter().zip(tickets).zip(outputs) {
            let name: &str = name.as_ref();
            match output {
                TaskOutput::Created { name: created, capacity }
                    if created == name && capacity == size =>
                {
                    let node = self.placement.locate(ticket)?;
                    placed.push((node, Block::new(created, capacity, self.config.policy)));
                }
                TaskOutput::Created { name: created, capacity } if created == name => {
                    return Err(PlacementError::Mismatch {
                        expected: format!("`{name}` of {size} bytes"),
                        actual: format!("`{created}` of {capacity} bytes"),
                    }
                    .into());
                }
                TaskOutput::Created { name: created, .. } => {
                    return Err(PlacementError::Mismatch {
                        expected: name.to_owned(),
                        actual: created,
                    }
                    .into());
                }
                other => {
                    return Err(PlacementError::Mismatch {
                        expected: name.to_owned(),
                        actual: format!("{other:?}"),
                    }
                    .into());
                }
            }
        }
        Ok(placed)
    }

    /// Reserves `size` bytes for the variable `name` in the first block that can
    /// hold it and returns the variable's offset inside that block.
    ///
    /// Blocks are visited node by node, in the order they were allocated.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::DEBUG))]
    pub fn insert(&mut self, name: &str, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        if self.variable_index.contains_key(name) {
            return Err(Error::VariableExists(name.to_owned()));
        }

        let Directory {
            nodes,
            arena,
            variable_index,
            ..
        } = self;

        for id in nodes.iter().flat_map(|n| n.blocks.iter().copied()) {
            let Some(slot) = arena.get_mut(id.0).and_then(Option::as_mut) else {
                continue;
            };
            match slot.block.insert(name, size) {
                Ok(offset) => {
                    debug!(node = %slot.node, block = slot.block.name(), offset, "Variable placed.");
                    variable_index.insert(name.to_owned(), id);
                    return Ok(offset);
                }
                Err(Error::CapacityExceeded { block, free, .. }) => {
                    debug!(%block, free, "Block can't fit variable, trying the next one.");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::OutOfSpace {
            variable: name.to_owned(),
            size,
        })
    }

    /// Removes the variable `name` from whichever block holds it.
    /// Returns `None` if there is no such variable.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG))]
    pub fn remove(&mut self, name: &str) -> Option<Variable> {
        let Some(id) = self.variable_index.remove(name) else {
            debug!("No such variable, nothing to remove.");
            return None;
        };
        let slot = self.slot_mut(id)?;
        match slot.block.remove(name) {
            Ok(var) => Some(var),
            Err(e) => {
                error!(error = %e, "Variable index pointed at the wrong block.");
                debug_assert!(false, "variable index out of sync");
                None
            }
        }
    }

    /// Returns the node and the name of the block holding the variable `name`.
    pub fn find(&self, name: &str) -> Result<(NodeId, String)> {
        let slot = self.holder(name)?;
        Ok((slot.node.clone(), slot.block.name().to_owned()))
    }

    /// Like [`find`](Self::find), with the block's and the variable's sizes.
    pub fn find_verbose(&self, name: &str) -> Result<VariableLocation> {
        let slot = self.holder(name)?;
        let var = slot.block.lookup(name)?;
        Ok(VariableLocation {
            node: slot.node.clone(),
            block: slot.block.name().to_owned(),
            block_capacity: slot.block.capacity(),
            block_used: slot.block.used(),
            size: var.size,
            offset: var.offset,
        })
    }

    /// The node and name of every block.
    pub fn list_blocks(&self) -> Vec<(NodeId, String)> {
        self.slots()
            .map(|slot| (slot.node.clone(), slot.block.name().to_owned()))
            .collect()
    }

    /// The node, name, capacity and used bytes of every block.
    pub fn list_blocks_verbose(&self) -> Vec<BlockSummary> {
        self.slots()
            .map(|slot| BlockSummary {
                node: slot.node.clone(),
                name: slot.block.name().to_owned(),
                capacity: slot.block.capacity(),
                used: slot.block.used(),
            })
            .collect()
    }

    /// Nodes holding at least one block.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Destroys the block called `name` on its node and forgets it together
    /// with every variable it holds.
    #[instrument(level = "info", skip(self), err(Debug, level = Level::ERROR))]
    pub fn release(&mut self, name: &str) -> Result<Block> {
        let id = *self
            .block_index
            .get(name)
            .ok_or_else(|| Error::UnknownBlock(name.to_owned()))?;
        let node = match self.slot(id) {
            Some(slot) => slot.node.clone(),
            None => return Err(Error::UnknownBlock(name.to_owned())),
        };

        let ticket = self.placement.submit_to(
            &node,
            Task::Destroy {
                names: vec![name.to_owned()],
            },
        )?;
        self.await_teardown(&[ticket], std::slice::from_ref(&node))?;

        let Some(Slot { block, .. }) = self.arena.get_mut(id.0).and_then(Option::take) else {
            return Err(Error::UnknownBlock(name.to_owned()));
        };
        self.free.push(id);
        self.block_index.remove(name);
        for (var, _) in block.variables() {
            self.variable_index.remove(var);
        }
        if let Some(pos) = self.nodes.iter().position(|n| n.id == node) {
            self.nodes[pos].blocks.retain(|b| *b != id);
            if self.nodes[pos].blocks.is_empty() {
                debug!(%node, "Node holds no more blocks.");
                self.nodes.remove(pos);
            }
        }

        Ok(block)
    }

    /// Destroys every block, one teardown task per node, then forgets all of them.
    ///
    /// Calling this on an empty directory does nothing. If a teardown task fails,
    /// the directory keeps its state so that the call can be retried.
    #[instrument(level = "info", skip(self), err(Debug, level = Level::ERROR))]
    pub fn clear(&mut self) -> Result<()> {
        if self.nodes.is_empty() {
            debug!("Nothing to clear.");
            return Ok(());
        }

        let batches: Vec<(NodeId, Vec<String>)> = self
            .nodes
            .iter()
            .map(|n| {
                let names = n
                    .blocks
                    .iter()
                    .filter_map(|id| self.slot(*id))
                    .map(|slot| slot.block.name().to_owned())
                    .collect();
                (n.id.clone(), names)
            })
            .collect();

        let mut tickets = Vec::with_capacity(batches.len());
        let mut targets = Vec::with_capacity(batches.len());
        for (node, names) in batches {
            match self.placement.submit_to(&node, Task::Destroy { names }) {
                Ok(ticket) => tickets.push(ticket),
                Err(e) => {
                    self.placement.discard(&tickets);
                    return Err(e.into());
                }
            }
            targets.push(node);
        }
        self.await_teardown(&tickets, &targets)?;

        info!(
            nodes = targets.len(),
            blocks = self.block_index.len(),
            "Released every block."
        );
        self.arena.clear();
        self.free.clear();
        self.nodes.clear();
        self.block_index.clear();
        self.variable_index.clear();
        Ok(())
    }

    fn await_teardown(&mut self, tickets: &[Ticket], targets: &[NodeId]) -> Result<()> {
        let res = self.check_teardown(tickets, targets);
        if res.is_err() {
            self.placement.discard(tickets);
        }
        res
    }

    fn check_teardown(&mut self, tickets: &[Ticket], targets: &[NodeId]) -> Result<()> {
        let outputs = self.placement.await_all(tickets)?;
        for ((ticket, target), output) in tickets.iter().zip(targets).zip(outputs) {
            let ran_on = self.placement.locate(ticket)?;
            if &ran_on != target {
                warn!(%target, %ran_on, "Teardown ran on an unexpected node.");
            }
            debug!(node = %ran_on, ?output, "Teardown completed.");
        }
        Ok(())
    }

    fn record(&mut self, node: NodeId, block: Block) {
        let name = block.name().to_owned();
        let slot = Some(Slot {
            node: node.clone(),
            block,
        });
        let id = match self.free.pop() {
            Some(id) => {
                self.arena[id.0] = slot;
                id
            }
            None => {
                self.arena.push(slot);
                BlockId(self.arena.len() - 1)
            }
        };
        self.block_index.insert(name, id);

        match self.nodes.iter_mut().find(|n| n.id == node) {
            Some(entry) => entry.blocks.push(id),
            None => self.nodes.push(NodeEntry {
                id: node,
                blocks: vec![id],
            }),
        }
    }

    fn holder(&self, name: &str) -> Result<&Slot> {
        self.variable_index
            .get(name)
            .and_then(|id| self.slot(*id))
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    /// Live slots in first-fit order.
    fn slots(&self) -> impl Iterator<Item = &Slot> + '_ {
        self.nodes
            .iter()
            .flat_map(|n| n.blocks.iter())
            .filter_map(move |id| self.slot(*id))
    }

    #[inline]
    fn slot(&self, id: BlockId) -> Option<&Slot> {
        self.arena.get(id.0).and_then(Option::as_ref)
    }

    #[inline]
    fn slot_mut(&mut self, id: BlockId) -> Option<&mut Slot> {
        self.arena.get_mut(id.0).and_then(Option::as_mut)
    }
}

impl<P: Placement> Drop for Directory<P> {
    fn drop(&mut self) {
        if let Err(e) = self.clear() {
            error!(error = %e, blocks = self.len(), "Couldn't release every block, segments may leak.");
        }
    }
}
