//! Duplex byte pipe between a manager and one worker, plus the tagged
//! envelope every frame on it carries.

use crate::{ReduceError, ReduceResult};
use bincode::{Decode, Encode};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum MessageKind {
    Started,
    Other,
    Success,
    Failed,
}

impl MessageKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageKind::Success | MessageKind::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Envelope {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn started() -> Self {
        Self { kind: MessageKind::Started, payload: Vec::new() }
    }

    pub fn other(payload: Vec<u8>) -> Self {
        Self { kind: MessageKind::Other, payload }
    }

    pub fn success() -> Self {
        Self { kind: MessageKind::Success, payload: Vec::new() }
    }

    /// FAILED envelope carrying the failure text as its payload.
    pub fn failed(reason: &str) -> Self {
        Self { kind: MessageKind::Failed, payload: reason.as_bytes().to_vec() }
    }

    pub fn encode_frame(&self) -> ReduceResult<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode_frame(frame: &[u8]) -> ReduceResult<Self> {
        let (envelope, read): (Envelope, usize) =
            bincode::decode_from_slice(frame, bincode::config::standard())?;
        if read != frame.len() {
            return Err(ReduceError::Protocol(format!(
                "Frame has {} trailing bytes",
                frame.len() - read
            )));
        }
        Ok(envelope)
    }
}

pub fn encode_payload<T: Encode>(value: &T) -> ReduceResult<Vec<u8>> {
    Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
}

pub fn decode_payload<T: Decode<()>>(bytes: &[u8]) -> ReduceResult<T> {
    let (value, _): (T, usize) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

struct Duplex {
    tx: Option<Sender<Vec<u8>>>,
    rx: Receiver<Vec<u8>>,
}

impl Duplex {
    fn send(&self, envelope: &Envelope) -> ReduceResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ReduceError::Closed("sending side already closed".to_string()))?;
        tx.send(envelope.encode_frame()?)
            .map_err(|_| ReduceError::Closed("peer endpoint dropped".to_string()))
    }

    fn receive(&self, timeout: Option<Duration>) -> ReduceResult<Envelope> {
        let frame = match timeout {
            None => self
                .rx
                .recv()
                .map_err(|_| ReduceError::Closed("peer endpoint dropped".to_string()))?,
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => {
                    ReduceError::Timeout(format!("no message within {:?}", timeout))
                }
                RecvTimeoutError::Disconnected => {
                    ReduceError::Closed("peer endpoint dropped".to_string())
                }
            })?,
        };
        Envelope::decode_frame(&frame)
    }

    fn poll(&self) -> bool {
        !self.rx.is_empty()
    }
}

/// Manager side of a pipe. It never crosses into the worker thread.
pub struct ManagerEndpoint {
    inner: Duplex,
}

impl ManagerEndpoint {
    pub fn send(&self, envelope: &Envelope) -> ReduceResult<()> {
        self.inner.send(envelope)
    }

    pub fn receive(&self, timeout: Option<Duration>) -> ReduceResult<Envelope> {
        self.inner.receive(timeout)
    }

    pub fn poll(&self) -> bool {
        self.inner.poll()
    }

    /// Handle on the incoming frames, used to register the pipe with the relay.
    pub fn incoming(&self) -> Receiver<Vec<u8>> {
        self.inner.rx.clone()
    }

    /// Drop the sending half so the worker observes `Closed` on its next read.
    pub fn close_sending(&mut self) {
        self.inner.tx = None;
    }
}

/// Worker side of a pipe, moved into the worker thread.
pub struct WorkerEndpoint {
    inner: Duplex,
}

impl WorkerEndpoint {
    pub fn send(&self, envelope: &Envelope) -> ReduceResult<()> {
        self.inner.send(envelope)
    }

    pub fn receive(&self, timeout: Option<Duration>) -> ReduceResult<Envelope> {
        self.inner.receive(timeout)
    }

    pub fn poll(&self) -> bool {
        self.inner.poll()
    }
}

pub fn pipe() -> (ManagerEndpoint, WorkerEndpoint) {
    let (to_worker_tx, to_worker_rx) = crossbeam_channel::unbounded();
    let (to_manager_tx, to_manager_rx) = crossbeam_channel::unbounded();
    (
        ManagerEndpoint {
            inner: Duplex { tx: Some(to_worker_tx), rx: to_manager_rx },
        },
        WorkerEndpoint {
            inner: Duplex { tx: Some(to_manager_tx), rx: to_worker_rx },
        },
    )
}
