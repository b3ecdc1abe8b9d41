//! Background relay that drains every registered manager-side pipe into a
//! per-worker queue, so a manager can ask "has worker X replied?" without
//! blocking on one particular pipe.

use crate::channel::Envelope;
use crate::{ReduceError, ReduceResult};
use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

pub const WAIT_TIMEOUT: Duration = Duration::from_millis(500);
pub const IDLE_POLL: Duration = Duration::from_millis(1);

pub type ChannelId = u64;

/// What the relay hands to a worker's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Relayed {
    Envelope(Envelope),
    Malformed(String),
}

#[derive(Clone)]
struct Registration {
    incoming: Receiver<Vec<u8>>,
    queue: Sender<Relayed>,
    closed: Arc<AtomicBool>,
}

type Registry = Arc<Mutex<FxHashMap<ChannelId, Registration>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, FxHashMap<ChannelId, Registration>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Relay {
    registry: Registry,
    stop: Arc<AtomicBool>,
    wake: Sender<()>,
    next_id: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    pub fn start() -> ReduceResult<Arc<Self>> {
        let registry: Registry = Arc::new(Mutex::new(FxHashMap::default()));
        let stop = Arc::new(AtomicBool::new(false));
        let (wake, wake_rx) = crossbeam_channel::unbounded();

        let handle = {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("worker_connections_relay".to_string())
                .spawn(move || run(registry, stop, wake_rx))?
        };
        debug!("Relay thread started");

        Ok(Arc::new(Self {
            registry,
            stop,
            wake,
            next_id: AtomicU64::new(0),
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub fn next_channel_id(&self) -> ChannelId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start servicing `incoming`. Frames go to `queue`; once the peer is gone
    /// and every frame has been forwarded, `closed` is raised.
    pub fn add(
        &self,
        id: ChannelId,
        incoming: Receiver<Vec<u8>>,
        queue: Sender<Relayed>,
        closed: Arc<AtomicBool>,
    ) -> ReduceResult<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(ReduceError::State("relay is shut down".to_string()));
        }
        {
            let mut registry = lock(&self.registry);
            if registry.contains_key(&id) {
                return Err(ReduceError::State(format!("channel {} already added", id)));
            }
            registry.insert(id, Registration { incoming, queue, closed });
        }
        let _ = self.wake.send(());
        Ok(())
    }

    /// Stop servicing a channel. Unknown ids are ignored.
    pub fn remove(&self, id: ChannelId) {
        lock(&self.registry).remove(&id);
    }

    pub fn registered(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.wake.send(());
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Relay thread panicked");
            }
            debug!("Relay thread stopped");
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(registry: Registry, stop: Arc<AtomicBool>, wake: Receiver<()>) {
    while !stop.load(Ordering::Acquire) {
        let snapshot: Vec<(ChannelId, Registration)> = lock(&registry)
            .iter()
            .map(|(id, registration)| (*id, registration.clone()))
            .collect();

        if snapshot.is_empty() {
            // Block on the wake channel so a fresh registration is seen at once.
            let _ = wake.recv_timeout(IDLE_POLL);
            continue;
        }

        let mut select = Select::new();
        let wake_index = select.recv(&wake);
        for (_, registration) in &snapshot {
            select.recv(&registration.incoming);
        }
        match select.ready_timeout(WAIT_TIMEOUT) {
            Ok(index) if index == wake_index => {
                while wake.try_recv().is_ok() {}
            }
            Ok(_) => {}
            Err(_) => continue,
        }

        let mut finished = Vec::new();
        for (id, registration) in &snapshot {
            if drain(registration) {
                finished.push(*id);
            }
        }
        if !finished.is_empty() {
            let mut registry = lock(&registry);
            for id in finished {
                registry.remove(&id);
            }
        }
    }
}

/// Forward every waiting frame. Returns true once the peer has disconnected.
fn drain(registration: &Registration) -> bool {
    loop {
        match registration.incoming.try_recv() {
            Ok(frame) => {
                let item = match Envelope::decode_frame(&frame) {
                    Ok(envelope) => Relayed::Envelope(envelope),
                    Err(e) => Relayed::Malformed(e.to_string()),
                };
                // The consumer may already be gone; nothing left to deliver to.
                let _ = registration.queue.send(item);
            }
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => {
                registration.closed.store(true, Ordering::Release);
                return true;
            }
        }
    }
}

/// Relay that is only started when the first worker needs it, owned by the
/// orchestrator that launches workers.
#[derive(Default)]
pub struct LazyRelay {
    relay: Mutex<Option<Arc<Relay>>>,
}

impl LazyRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_start(&self) -> ReduceResult<Arc<Relay>> {
        let mut slot = self.relay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(relay) = slot.as_ref() {
            return Ok(Arc::clone(relay));
        }
        let relay = Relay::start()?;
        *slot = Some(Arc::clone(&relay));
        Ok(relay)
    }

    pub fn get(&self) -> Option<Arc<Relay>> {
        self.relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Arc::clone)
    }
}
