//! [`Placement`] trait and the [`LocalCluster`] service that implements it.
//!
//! The [`Placement`] trait is the only way the [`Directory`](crate::Directory)
//! reaches its workers. It allows users to plug in whatever executes tasks on their
//! cluster, as long as it can run a batch of tasks, wait for all of them and tell
//! which worker ran each one.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, instrument, Level};

use crate::error::PlacementError;
use crate::segment::SegmentBackend;

/// Identifies a worker node, typically by its address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(id)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A claim on the result of a submitted task.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

impl Ticket {
    pub const fn new(id: u64) -> Self {
        Ticket(id)
    }

    pub const fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Work shipped to a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Task {
    /// Create one segment of `capacity` bytes.
    Create { name: String, capacity: usize },
    /// Destroy every listed segment living on the worker.
    Destroy { names: Vec<String> },
}

/// What a worker reports back for a [`Task`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutput {
    Created { name: String, capacity: usize },
    Destroyed { count: usize },
}

impl Task {
    /// Runs the task against `backend`. This is what a worker does with a task it received.
    pub fn run<S: SegmentBackend + ?Sized>(self, backend: &S) -> Result<TaskOutput, PlacementError> {
        match self {
            Task::Create { name, capacity } => {
                backend.create(&name, capacity)?;
                Ok(TaskOutput::Created { name, capacity })
            }
            Task::Destroy { names } => {
                for name in &names {
                    backend.destroy(name)?;
                }
                Ok(TaskOutput::Destroyed { count: names.len() })
            }
        }
    }
}

/// The task-scheduling and placement service the directory delegates remote work to.
///
/// Every method blocks the calling thread until the service answers.
pub trait Placement {
    /// Submits `tasks` to whichever workers the service picks.
    /// The returned tickets are in the same order as `tasks`.
    fn submit_batch(&mut self, tasks: Vec<Task>) -> Result<Vec<Ticket>, PlacementError>;

    /// Submits `task` to run on `node` specifically.
    fn submit_to(&mut self, node: &NodeId, task: Task) -> Result<Ticket, PlacementError>;

    /// Waits for every ticket and returns their outputs in the same order.
    ///
    /// Every ticket is waited for even after one fails. The first failure is
    /// returned and the results of the whole batch are dropped, so none of its
    /// tickets can be located afterwards.
    fn await_all(&mut self, tickets: &[Ticket]) -> Result<Vec<TaskOutput>, PlacementError>;

    /// Reports which worker produced the result of an awaited ticket.
    fn locate(&mut self, ticket: &Ticket) -> Result<NodeId, PlacementError>;

    /// Forgets whatever the service still holds for `tickets`, awaited or not.
    /// Unknown tickets are ignored.
    fn discard(&mut self, tickets: &[Ticket]);
}

impl<T: Placement + ?Sized> Placement for &mut T {
    fn submit_batch(&mut self, tasks: Vec<Task>) -> Result<Vec<Ticket>, PlacementError> {
        (**self).submit_batch(tasks)
    }

    fn submit_to(&mut self, node: &NodeId, task: Task) -> Result<Ticket, PlacementError> {
        (**self).submit_to(node, task)
    }

    fn await_all(&mut self, tickets: &[Ticket]) -> Result<Vec<TaskOutput>, PlacementError> {
        (**self).await_all(tickets)
    }

    fn locate(&mut self, ticket: &Ticket) -> Result<NodeId, PlacementError> {
        (**self).locate(ticket)
    }

    fn discard(&mut self, tickets: &[Ticket]) {
        (**self).discard(tickets)
    }
}

type Reply = (NodeId, Result<TaskOutput, PlacementError>);

struct Job {
    task: Task,
    reply: Sender<Reply>,
}

struct Worker {
    node: NodeId,
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn<S: SegmentBackend + 'static>(node: NodeId, backend: Arc<S>) -> Self {
        let (jobs, inbox) = mpsc::channel::<Job>();
        let me = node.clone();
        let handle = thread::Builder::new()
            .name(format!("worker-{node}"))
            .spawn(move || {
                for Job { task, reply } in inbox {
                    debug!(node = %me, ?task, "Running task.");
                    let res = task.run(&*backend);
                    // The coordinator may have stopped waiting, that is fine.
                    let _ = reply.send((me.clone(), res));
                }
            });

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                error!(%node, error = %e, "Couldn't spawn worker thread.");
                None
            }
        };

        Worker {
            node,
            jobs: handle.as_ref().map(|_| jobs),
            handle,
        }
    }
}

/// A placement service whose workers are threads of the current process.
///
/// Every worker shares one [`SegmentBackend`]. Batches are spread round-robin
/// over the workers, so consecutive blocks land on different nodes.
pub struct LocalCluster<S: SegmentBackend + 'static> {
    workers: Vec<Worker>,
    backend: Arc<S>,
    next_worker: usize,
    next_ticket: u64,
    pending: HashMap<Ticket, (NodeId, Receiver<Reply>)>,
    finished: HashMap<Ticket, NodeId>,
}

impl<S: SegmentBackend + 'static> fmt::Debug for LocalCluster<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCluster")
            .field("nodes", &self.nodes())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<S: SegmentBackend + 'static> LocalCluster<S> {
    /// Starts `workers` workers named `worker-0`, `worker-1`, ...
    pub fn new(workers: usize, backend: S) -> Self {
        Self::with_nodes((0..workers).map(|i| NodeId::new(format!("worker-{i}"))), backend)
    }

    /// Starts one worker per node identifier.
    pub fn with_nodes(nodes: impl IntoIterator<Item = NodeId>, backend: S) -> Self {
        let backend = Arc::new(backend);
        let workers = nodes
            .into_iter()
            .map(|node| Worker::spawn(node, Arc::clone(&backend)))
            .collect();
        LocalCluster {
            workers,
            backend,
            next_worker: 0,
            next_ticket: 0,
            pending: HashMap::new(),
            finished: HashMap::new(),
        }
    }

    pub fn nodes(&self) -> Vec<&NodeId> {
        self.workers.iter().map(|w| &w.node).collect()
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// Number of tickets that were submitted but not awaited, or awaited but not located.
    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.finished.len()
    }

    fn dispatch(&mut self, worker: usize, task: Task) -> Result<Ticket, PlacementError> {
        let worker = &self.workers[worker];
        let jobs = worker
            .jobs
            .as_ref()
            .ok_or_else(|| PlacementError::WorkerLost(worker.node.clone()))?;

        let (reply, rx) = mpsc::channel();
        jobs.send(Job { task, reply })
            .map_err(|_| PlacementError::WorkerLost(worker.node.clone()))?;

        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        self.pending.insert(ticket, (worker.node.clone(), rx));
        Ok(ticket)
    }
}

impl<S: SegmentBackend + 'static> Placement for LocalCluster<S> {
    #[instrument(level = "debug", skip_all, fields(tasks = tasks.len()), err(Debug, level = Level::ERROR))]
    fn submit_batch(&mut self, tasks: Vec<Task>) -> Result<Vec<Ticket>, PlacementError> {
        if self.workers.is_empty() {
            return Err(PlacementError::UnknownNode(NodeId::new("<no workers>")));
        }
        let mut tickets = Vec::with_capacity(tasks.len());
        for task in tasks {
            let worker = self.next_worker;
            self.next_worker = (self.next_worker + 1) % self.workers.len();
            match self.dispatch(worker, task) {
                Ok(ticket) => tickets.push(ticket),
                Err(e) => {
                    self.discard(&tickets);
                    return Err(e);
                }
            }
        }
        Ok(tickets)
    }

    #[instrument(level = "debug", skip(self, task), err(Debug, level = Level::ERROR))]
    fn submit_to(&mut self, node: &NodeId, task: Task) -> Result<Ticket, PlacementError> {
        let worker = self
            .workers
            .iter()
            .position(|w| &w.node == node)
            .ok_or_else(|| PlacementError::UnknownNode(node.clone()))?;
        self.dispatch(worker, task)
    }

    #[instrument(level = "debug", skip_all, fields(tickets = tickets.len()), err(Debug, level = Level::ERROR))]
    fn await_all(&mut self, tickets: &[Ticket]) -> Result<Vec<TaskOutput>, PlacementError> {
        let mut outputs = Vec::with_capacity(tickets.len());
        let mut awaited = Vec::with_capacity(tickets.len());
        let mut failure = None;

        for ticket in tickets {
            let res = match self.pending.remove(ticket) {
                Some((node, rx)) => match rx.recv() {
                    Ok((reporter, res)) => {
                        self.finished.insert(*ticket, reporter);
                        awaited.push(*ticket);
                        res
                    }
                    Err(_) => Err(PlacementError::WorkerLost(node)),
                },
                None => Err(PlacementError::UnknownTicket(*ticket)),
            };
            match res {
                Ok(output) if failure.is_none() => outputs.push(output),
                Ok(_) => {}
                Err(e) if failure.is_none() => failure = Some(e),
                Err(e) => debug!(%ticket, error = %e, "Another task of the batch failed."),
            }
        }

        match failure {
            None => Ok(outputs),
            Some(e) => {
                self.discard(&awaited);
                Err(e)
            }
        }
    }

    fn locate(&mut self, ticket: &Ticket) -> Result<NodeId, PlacementError> {
        self.finished
            .remove(ticket)
            .ok_or(PlacementError::UnknownTicket(*ticket))
    }

    fn discard(&mut self, tickets: &[Ticket]) {
        for ticket in tickets {
            // A worker still running the task finds its reply channel closed.
            self.pending.remove(ticket);
            self.finished.remove(ticket);
        }
    }
}

impl<S: SegmentBackend + 'static> Drop for LocalCluster<S> {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.jobs.take();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    error!(node = %worker.node, "Worker thread panicked.");
                }
            }
        }
    }
}
