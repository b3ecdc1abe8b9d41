//! A worker is a body of code running on its own named thread, talking to the
//! manager over a [`pipe`](crate::channel::pipe). The manager-side handle reads
//! through the relay so checking for replies never blocks on one pipe.

use crate::channel::{
    Envelope, ManagerEndpoint, MessageKind, WorkerEndpoint, decode_payload, encode_payload, pipe,
};
use crate::relay::{ChannelId, Relay, Relayed};
use crate::{ReduceError, ReduceResult};
use bincode::{Decode, Encode};
use crossbeam_channel::Receiver;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Code executed on a worker thread.
///
/// `bootstrap` runs before the manager is told the worker started, so a
/// failure there surfaces as a failed `start()`. `run` receives the context
/// for talking to the manager; returning `Err` makes the framework send a
/// FAILED envelope carrying the error text.
pub trait WorkerBody: Send + 'static {
    fn bootstrap(&mut self) -> ReduceResult<()> {
        Ok(())
    }

    fn run(self: Box<Self>, ctx: &mut WorkerContext) -> ReduceResult<()>;
}

impl<F> WorkerBody for F
where
    F: FnOnce(&mut WorkerContext) -> ReduceResult<()> + Send + 'static,
{
    fn run(self: Box<Self>, ctx: &mut WorkerContext) -> ReduceResult<()> {
        (*self)(ctx)
    }
}

/// Worker-side view of the conversation with the manager.
pub struct WorkerContext {
    name: String,
    endpoint: WorkerEndpoint,
    cancelled: Arc<AtomicBool>,
}

impl WorkerContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send_to_manager<T: Encode>(&self, msg: &T) -> ReduceResult<()> {
        self.endpoint.send(&Envelope::other(encode_payload(msg)?))
    }

    /// Blocks for the next message; `Closed` once the manager terminated us.
    pub fn get_msg_from_manager<T: Decode<()>>(&self, timeout: Option<Duration>) -> ReduceResult<T> {
        let envelope = self.endpoint.receive(timeout)?;
        match envelope.kind {
            MessageKind::Other => decode_payload(&envelope.payload),
            kind => Err(ReduceError::Protocol(format!(
                "Unexpected {:?} message from manager",
                kind
            ))),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.endpoint.poll()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Finished,
}

struct Registration {
    relay: Arc<Relay>,
    id: ChannelId,
}

pub struct Worker {
    name: String,
    body: Option<Box<dyn WorkerBody>>,
    manager: Option<ManagerEndpoint>,
    worker_endpoint: Option<WorkerEndpoint>,
    handle: Option<JoinHandle<ReduceResult<()>>>,
    registration: Option<Registration>,
    queue: Option<Receiver<Relayed>>,
    closed: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    pending: VecDeque<Vec<u8>>,
    terminal: Option<MessageKind>,
    failure: Option<String>,
    started: bool,
    state: WorkerState,
}

impl Worker {
    pub fn new<B: WorkerBody>(name: impl Into<String>, body: B) -> Self {
        Self::from_boxed(name, Box::new(body))
    }

    pub fn from_boxed(name: impl Into<String>, body: Box<dyn WorkerBody>) -> Self {
        let (manager, worker_endpoint) = pipe();
        Self {
            name: name.into(),
            body: Some(body),
            manager: Some(manager),
            worker_endpoint: Some(worker_endpoint),
            handle: None,
            registration: None,
            queue: None,
            closed: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            pending: VecDeque::new(),
            terminal: None,
            failure: None,
            started: false,
            state: WorkerState::Starting,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn state(&self) -> WorkerState {
        if self.started && (self.closed.load(Ordering::Acquire) || self.handle.is_none()) {
            WorkerState::Finished
        } else {
            self.state
        }
    }

    /// Text of the FAILED envelope, once one has been read.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn start(&mut self, relay: &Arc<Relay>) -> ReduceResult<()> {
        self.start_within(relay, None)
    }

    /// Spawn the thread and block until it reports STARTED, or until
    /// `timeout` elapses.
    pub fn start_within(&mut self, relay: &Arc<Relay>, timeout: Option<Duration>) -> ReduceResult<()> {
        if self.started {
            return Err(ReduceError::State(format!("Worker {} already started", self.name)));
        }
        let closed = || ReduceError::State(format!("Worker {} was closed", self.name));
        if self.body.is_none() || self.worker_endpoint.is_none() {
            return Err(closed());
        }
        let manager = self.manager.as_ref().ok_or_else(closed)?;

        // Nothing is consumed until the relay accepted the pipe, so a failed
        // registration leaves the worker startable.
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        let id = relay.next_channel_id();
        relay.add(id, manager.incoming(), queue_tx, Arc::clone(&self.closed))?;

        let (Some(body), Some(endpoint)) = (self.body.take(), self.worker_endpoint.take()) else {
            relay.remove(id);
            return Err(closed());
        };
        let ctx = WorkerContext {
            name: self.name.clone(),
            endpoint,
            cancelled: Arc::clone(&self.cancelled),
        };
        let handle = match thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_worker(body, ctx))
        {
            Ok(handle) => handle,
            Err(e) => {
                relay.remove(id);
                return Err(e.into());
            }
        };
        self.started = true;
        self.handle = Some(handle);
        self.registration = Some(Registration { relay: Arc::clone(relay), id });
        self.queue = Some(queue_rx);

        let deadline = timeout.map(|t| Instant::now() + t);
        match self.next_item(deadline)? {
            Some(Relayed::Envelope(envelope)) if envelope.kind == MessageKind::Started => {
                self.state = WorkerState::Running;
                debug!(worker = %self.name, "Worker started");
                Ok(())
            }
            Some(Relayed::Envelope(envelope)) => Err(ReduceError::Protocol(format!(
                "Worker {} sent {:?} before STARTED",
                self.name, envelope.kind
            ))),
            Some(Relayed::Malformed(e)) => Err(ReduceError::Protocol(e)),
            None => Err(ReduceError::WorkerDied(format!(
                "{}: No started message received",
                self.name
            ))),
        }
    }

    pub fn send_to_worker<T: Encode>(&self, msg: &T) -> ReduceResult<()> {
        if !self.started {
            return Err(ReduceError::State(format!("Worker {} not started", self.name)));
        }
        let manager = self
            .manager
            .as_ref()
            .ok_or_else(|| ReduceError::Closed(format!("Worker {} is closed", self.name)))?;
        manager.send(&Envelope::other(encode_payload(msg)?))
    }

    /// Next OTHER payload from the worker. Once the worker has finished and
    /// nothing is left, returns `ReduceError::WorkerFinished`.
    pub fn get_msg_from_worker<T: Decode<()>>(&mut self, timeout: Option<Duration>) -> ReduceResult<T> {
        if let Some(payload) = self.pending.pop_front() {
            return decode_payload(&payload);
        }
        if !self.started {
            return Err(ReduceError::State(format!("Worker {} not started", self.name)));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.next_item(deadline)? {
                Some(Relayed::Envelope(envelope)) => {
                    let terminal = envelope.kind.is_terminal();
                    if let Some(payload) = self.accept(envelope)? {
                        return decode_payload(&payload);
                    }
                    if terminal {
                        return Err(ReduceError::WorkerFinished(self.name.clone()));
                    }
                }
                Some(Relayed::Malformed(e)) => return Err(ReduceError::Protocol(e)),
                None => return Err(ReduceError::WorkerFinished(self.name.clone())),
            }
        }
    }

    pub fn has_finished(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the body returned `Ok`. Only valid after `has_finished()`.
    /// Undelivered OTHER payloads stay readable through `get_msg_from_worker`.
    pub fn success(&mut self) -> ReduceResult<bool> {
        if !self.has_finished() {
            return Err(ReduceError::State(format!(
                "Worker {} has not finished yet",
                self.name
            )));
        }
        while let Some(item) = self.queue.as_ref().and_then(|queue| queue.try_recv().ok()) {
            match item {
                Relayed::Envelope(envelope) => {
                    if let Some(payload) = self.accept(envelope)? {
                        self.pending.push_back(payload);
                    }
                }
                Relayed::Malformed(e) => return Err(ReduceError::Protocol(e)),
            }
        }
        match self.terminal {
            Some(MessageKind::Success) => Ok(true),
            Some(MessageKind::Failed) => Ok(false),
            _ => Err(ReduceError::WorkerDied(format!(
                "{}: finished without a terminal message",
                self.name
            ))),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for the thread to exit. Returns false if it is still running when
    /// `timeout` elapses.
    pub fn join(&mut self, timeout: Option<Duration>) -> bool {
        let Some(handle) = self.handle.as_ref() else {
            return true;
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        while !handle.is_finished() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            thread::sleep(DEFAULT_POLL_TIMEOUT);
        }
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(Ok(())) => debug!(worker = %self.name, "Worker joined"),
                Ok(Err(e)) => debug!(worker = %self.name, "Worker exited with error: {}", e),
                Err(_) => warn!(worker = %self.name, "Worker thread panicked"),
            }
        }
        self.state = WorkerState::Finished;
        true
    }

    /// Ask the body to stop: raises the cancellation flag and closes our
    /// sending side so a blocked read in the body returns `Closed`.
    pub fn terminate(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(manager) = self.manager.as_mut() {
            manager.close_sending();
        }
    }

    /// Detach a thread that refuses to stop.
    pub fn abandon(&mut self) {
        if self.handle.take().is_some() {
            warn!(worker = %self.name, "Abandoning worker thread that did not stop");
        }
    }

    /// Release the channel. The thread must have exited (or been abandoned).
    pub fn close(&mut self) -> ReduceResult<()> {
        if self.is_alive() {
            return Err(ReduceError::State(format!(
                "Cannot close running worker {}",
                self.name
            )));
        }
        if let Some(registration) = self.registration.take() {
            registration.relay.remove(registration.id);
        }
        if let Some(manager) = self.manager.as_mut() {
            manager.close_sending();
        }
        self.manager = None;
        Ok(())
    }

    fn accept(&mut self, envelope: Envelope) -> ReduceResult<Option<Vec<u8>>> {
        match envelope.kind {
            MessageKind::Started => Err(ReduceError::Protocol(format!(
                "Worker {} sent a second STARTED message",
                self.name
            ))),
            MessageKind::Other if self.terminal.is_some() => Err(ReduceError::Protocol(format!(
                "Worker {} sent a message after finishing",
                self.name
            ))),
            MessageKind::Other => Ok(Some(envelope.payload)),
            kind if self.terminal.is_some() => Err(ReduceError::Protocol(format!(
                "Worker {} sent a second terminal message ({:?})",
                self.name, kind
            ))),
            kind => {
                if kind == MessageKind::Failed {
                    self.failure = Some(String::from_utf8_lossy(&envelope.payload).into_owned());
                }
                self.terminal = Some(kind);
                Ok(None)
            }
        }
    }

    /// Next relayed item; `None` once the pipe is closed and drained.
    fn next_item(&self, deadline: Option<Instant>) -> ReduceResult<Option<Relayed>> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| ReduceError::State(format!("Worker {} not started", self.name)))?;
        loop {
            if let Ok(item) = queue.try_recv() {
                return Ok(Some(item));
            }
            // The relay forwards every frame before raising the flag.
            if self.closed.load(Ordering::Acquire) {
                return Ok(queue.try_recv().ok());
            }
            let wait = match deadline {
                None => DEFAULT_POLL_TIMEOUT,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ReduceError::Timeout(format!(
                            "No message from worker {}",
                            self.name
                        )));
                    }
                    (deadline - now).min(DEFAULT_POLL_TIMEOUT)
                }
            };
            if let Ok(item) = queue.recv_timeout(wait) {
                return Ok(Some(item));
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(registration) = self.registration.take() {
            registration.relay.remove(registration.id);
        }
    }
}

fn run_worker(mut body: Box<dyn WorkerBody>, mut ctx: WorkerContext) -> ReduceResult<()> {
    if let Err(e) = body.bootstrap() {
        error!(worker = %ctx.name, "Worker bootstrap failed: {}", e);
        return Err(e);
    }
    ctx.endpoint.send(&Envelope::started())?;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body.run(&mut ctx)));
    match outcome {
        Ok(Ok(())) => {
            if let Err(e) = ctx.endpoint.send(&Envelope::success()) {
                debug!(worker = %ctx.name, "Could not report success: {}", e);
            }
            Ok(())
        }
        Ok(Err(e)) => {
            error!(worker = %ctx.name, "Worker failed: {}", e);
            if let Err(send_error) = ctx.endpoint.send(&Envelope::failed(&e.to_string())) {
                debug!(worker = %ctx.name, "Could not report failure: {}", send_error);
            }
            Err(e)
        }
        Err(payload) => panic::resume_unwind(payload),
    }
}
