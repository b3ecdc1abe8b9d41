//! Fixed set of workers opened and closed together.

use crate::relay::LazyRelay;
use crate::worker::Worker;
use crate::{ReduceError, ReduceResult};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolTimeouts {
    /// How long to wait for each worker's STARTED message. `None` waits forever.
    pub start: Option<Duration>,
    pub finishing: Duration,
    pub after_termination: Duration,
}

impl Default for PoolTimeouts {
    fn default() -> Self {
        Self {
            start: None,
            finishing: Duration::from_secs(10),
            after_termination: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Created,
    Opened,
    Closed,
}

pub struct WorkerPool {
    workers: Vec<Worker>,
    relay: LazyRelay,
    state: PoolState,
    timeouts: PoolTimeouts,
}

impl WorkerPool {
    pub fn new(workers: Vec<Worker>, timeouts: PoolTimeouts) -> Self {
        Self {
            workers,
            relay: LazyRelay::new(),
            state: PoolState::Created,
            timeouts,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.state == PoolState::Opened
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn workers_mut(&mut self) -> &mut [Worker] {
        &mut self.workers
    }

    /// Start every worker. If one fails to start, the ones already started are
    /// terminated and joined before the error is returned.
    pub fn open(&mut self) -> ReduceResult<()> {
        if self.state != PoolState::Created {
            return Err(ReduceError::State(format!(
                "Pool can only be opened once (state {:?})",
                self.state
            )));
        }
        if let Some(worker) = self.workers.iter().find(|w| w.is_started()) {
            return Err(ReduceError::State(format!(
                "Worker {} was started outside the pool",
                worker.name()
            )));
        }
        let relay = self.relay.get_or_start()?;
        self.state = PoolState::Opened;

        for i in 0..self.workers.len() {
            if let Err(e) = self.workers[i].start_within(&relay, self.timeouts.start) {
                warn!("Worker {} failed to start: {}", self.workers[i].name(), e);
                for worker in &mut self.workers[..=i] {
                    stop_worker(worker, &self.timeouts);
                }
                self.state = PoolState::Closed;
                return Err(e);
            }
        }
        info!("Opened pool of {} workers", self.workers.len());
        Ok(())
    }

    /// Stop every worker. Never fails because of a worker: stubborn threads
    /// are logged and abandoned.
    pub fn close(&mut self) -> ReduceResult<()> {
        if self.state != PoolState::Opened {
            return Err(ReduceError::State(format!(
                "Pool is not open (state {:?})",
                self.state
            )));
        }
        self.state = PoolState::Closed;
        for worker in &mut self.workers {
            stop_worker(worker, &self.timeouts);
        }
        debug!("Closed pool of {} workers", self.workers.len());
        Ok(())
    }

    /// Fail if any worker has exited while the pool is still in use.
    pub fn ensure_alive(&self) -> ReduceResult<()> {
        match self.workers.iter().find(|w| !w.is_alive() || w.has_finished()) {
            Some(worker) => Err(ReduceError::WorkerDied(format!(
                "{} is not running",
                worker.name()
            ))),
            None => Ok(()),
        }
    }
}

fn stop_worker(worker: &mut Worker, timeouts: &PoolTimeouts) {
    if !worker.join(Some(timeouts.finishing)) {
        debug!("Terminating worker {}", worker.name());
        worker.terminate();
        if !worker.join(Some(timeouts.after_termination)) {
            warn!(
                "Worker {} did not stop within {:?} after termination",
                worker.name(),
                timeouts.after_termination
            );
            worker.abandon();
        }
    }
    if let Err(e) = worker.close() {
        warn!("Failed to close worker {}: {}", worker.name(), e);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.state == PoolState::Opened {
            let _ = self.close();
        }
    }
}
