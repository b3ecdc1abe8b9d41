//! Counting semaphore shared by reducer workers so that only a bounded number
//! of graph builds (or reductions) run at once.

use crate::{ReduceError, ReduceResult};
use crossbeam_channel::{Receiver, Sender};

/// Tokens live in a bounded channel: acquiring takes one out, releasing puts
/// it back. Clones share the same tokens.
#[derive(Clone)]
pub struct Semaphore {
    tokens_tx: Sender<()>,
    tokens_rx: Receiver<()>,
    capacity: usize,
}

pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Semaphore {
    pub fn new(capacity: usize) -> ReduceResult<Self> {
        if capacity == 0 {
            return Err(ReduceError::Config("semaphore capacity must be positive".to_string()));
        }
        let (tokens_tx, tokens_rx) = crossbeam_channel::bounded(capacity);
        for _ in 0..capacity {
            tokens_tx
                .try_send(())
                .map_err(|e| ReduceError::Other(format!("failed to fill semaphore: {}", e)))?;
        }
        Ok(Self { tokens_tx, tokens_rx, capacity })
    }

    /// Block until a token is free.
    pub fn acquire(&self) -> ReduceResult<SemaphoreGuard<'_>> {
        self.tokens_rx
            .recv()
            .map_err(|_| ReduceError::Closed("semaphore tokens dropped".to_string()))?;
        Ok(SemaphoreGuard { semaphore: self })
    }

    pub fn try_acquire(&self) -> Option<SemaphoreGuard<'_>> {
        self.tokens_rx.try_recv().ok().map(|_| SemaphoreGuard { semaphore: self })
    }

    pub fn available(&self) -> usize {
        self.tokens_rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        let _ = self.semaphore.tokens_tx.try_send(());
    }
}
