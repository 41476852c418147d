//! Bookkeeping for the worker processes.

use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ProcessConfig;

pub type WorkerId = u32;

pub type WorkerInput<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);
pub type WorkerOutput<'a> = &'a mut (dyn AsyncRead + Unpin + Send);

/// A running worker as the supervisor talks to it.
pub trait WorkerIo: Send + 'static {
    /// stdin, stdout and stderr of the worker.
    fn pipes(&mut self) -> (WorkerInput<'_>, WorkerOutput<'_>, WorkerOutput<'_>);

    fn has_exited(&mut self) -> bool;
}

/// Starts worker processes. Dropping a worker must stop it.
pub trait Launcher: Send + 'static {
    type Worker: WorkerIo;

    fn launch(&mut self) -> anyhow::Result<(WorkerId, Self::Worker)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Waiting,
    Busy,
}

struct Entry<W> {
    /// None while the worker is out bridging a connection.
    worker: Option<W>,
    state: WorkerState,
    handled: u64,
}

pub struct ProcessManager<L: Launcher> {
    launcher: L,
    processes: HashMap<WorkerId, Entry<L::Worker>>,
    waiting: Vec<WorkerId>,
    min: usize,
    max: usize,
    max_requests: u64,
}

impl<L: Launcher> ProcessManager<L> {
    pub fn new(launcher: L, limits: &ProcessConfig) -> Self {
        ProcessManager {
            launcher,
            processes: HashMap::new(),
            waiting: Vec::new(),
            min: limits.min,
            max: limits.max,
            max_requests: limits.max_requests,
        }
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn waiting(&self) -> &[WorkerId] {
        &self.waiting
    }

    pub fn state(&self, id: WorkerId) -> Option<WorkerState> {
        self.processes.get(&id).map(|e| e.state)
    }

    pub fn handled(&self, id: WorkerId) -> Option<u64> {
        self.processes.get(&id).map(|e| e.handled)
    }

    /// Starts one more worker and registers it as waiting.
    pub fn create_process(&mut self) -> anyhow::Result<WorkerId> {
        let (id, worker) = self.launcher.launch()?;
        log::debug!("Started worker {id}");
        self.processes.insert(
            id,
            Entry {
                worker: Some(worker),
                state: WorkerState::Waiting,
                handled: 0,
            },
        );
        self.waiting.push(id);
        Ok(id)
    }

    /// Starts workers until the pool is back at its floor.
    pub fn fill(&mut self) -> anyhow::Result<()> {
        while self.processes.len() < self.min {
            self.create_process()?;
        }
        Ok(())
    }

    /// Hands out the most recently idle worker, starting a new one when
    /// none is idle and the pool has room. None means the pool is
    /// exhausted.
    pub fn assign(&mut self) -> anyhow::Result<Option<(WorkerId, L::Worker)>> {
        let id = match self.waiting.pop() {
            Some(id) => id,
            None if self.processes.len() < self.max => {
                self.create_process()?;
                match self.waiting.pop() {
                    Some(id) => id,
                    None => return Ok(None),
                }
            }
            None => return Ok(None),
        };

        let Some(entry) = self.processes.get_mut(&id) else {
            return Ok(None);
        };
        let Some(worker) = entry.worker.take() else {
            return Ok(None);
        };
        entry.state = WorkerState::Busy;
        entry.handled += 1;
        Ok(Some((id, worker)))
    }

    /// Marks a worker idle again. Only possible while the pool holds its
    /// handle.
    pub fn mark_waiting(&mut self, id: WorkerId) -> bool {
        match self.processes.get_mut(&id) {
            Some(entry) if entry.worker.is_some() => {
                entry.state = WorkerState::Waiting;
                if !self.waiting.contains(&id) {
                    self.waiting.push(id);
                }
                true
            }
            _ => false,
        }
    }

    /// Takes back a worker whose session ended normally. A worker that has
    /// served its quota is retired instead.
    pub fn release(&mut self, id: WorkerId, worker: L::Worker) -> anyhow::Result<()> {
        let Some(entry) = self.processes.get_mut(&id) else {
            return Ok(());
        };
        if entry.handled >= self.max_requests {
            log::info!("Retiring worker {id} after {} sessions", entry.handled);
            drop(worker);
            return self.kill_process(id);
        }
        entry.worker = Some(worker);
        self.mark_waiting(id);
        Ok(())
    }

    /// Stops a worker and replenishes the pool.
    pub fn kill_process(&mut self, id: WorkerId) -> anyhow::Result<()> {
        if self.processes.remove(&id).is_some() {
            log::debug!("Stopped worker {id}");
        }
        self.waiting.retain(|w| *w != id);
        self.fill()
    }

    /// Drops idle workers that have exited on their own.
    pub fn reap(&mut self) -> anyhow::Result<()> {
        let dead: Vec<WorkerId> = self
            .processes
            .iter_mut()
            .filter_map(|(id, entry)| match entry.worker.as_mut() {
                Some(worker) => worker.has_exited().then_some(*id),
                None => None,
            })
            .collect();
        for id in dead {
            log::warn!("Worker {id} exited while idle");
            self.processes.remove(&id);
            self.waiting.retain(|w| *w != id);
        }
        self.fill()
    }

    /// Stops every worker, including those out bridging once their handle
    /// comes back and is dropped.
    pub fn shutdown(&mut self) {
        log::info!("Stopping {} workers", self.processes.len());
        self.processes.clear();
        self.waiting.clear();
        self.min = 0;
    }
}
