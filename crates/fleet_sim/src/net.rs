//! In-process transport and directory adapters.
//!
//! The engine only ever talks to its collaborators through the narrow
//! surfaces in this module: a capability directory, per-worker mailboxes and
//! per-auction reply queues. Everything here is backed by tokio channels and
//! a registry map; a networked deployment would swap these implementations
//! without touching the coordinator or the workers.

use std::sync::Arc;

use api::{MessageKind, TaskId, WorkerId};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory lookup for capability {0:?} failed")]
    Lookup(String),
}

/// A message that could not be handed to the recipient's mailbox.
#[derive(Debug, Error)]
#[error("{kind} to {to} could not be delivered")]
pub struct TransportError {
    pub to: WorkerId,
    pub kind: MessageKind,
}

/// One point-to-point protocol message.
///
/// `content` is the wire-encoded payload text. Replies within an auction
/// round go through the round's `reply` queue and nowhere else; a round that
/// has ended stops accepting replies simply by dropping the receiving end.
#[derive(Debug)]
pub struct Envelope {
    pub kind: MessageKind,
    pub conversation: TaskId,
    pub content: String,
    pub reply: Option<mpsc::UnboundedSender<AuctionReply>>,
}

/// A worker's answer to a call for proposals: a bid or a refusal.
#[derive(Debug)]
pub struct AuctionReply {
    pub worker: WorkerId,
    pub kind: MessageKind,
    pub content: String,
}

/// Sending handle for one worker's mailbox.
#[derive(Debug, Clone)]
pub struct WorkerRef {
    pub id: WorkerId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl WorkerRef {
    pub fn new(id: WorkerId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { id, tx }
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let kind = envelope.kind;
        self.tx
            .send(envelope)
            .map_err(|_| TransportError { to: self.id, kind })
    }
}

/// Lookup of registered workers by offered capability.
pub trait Directory: Send + Sync {
    /// All workers currently offering `capability`, in registration order.
    /// May be empty; a lookup error is local to the caller, never fatal.
    fn find_workers_offering(&self, capability: &str)
        -> Result<Vec<WorkerRef>, DirectoryError>;
}

/// Registry-backed directory for a single-process fleet.
///
/// Registration order is preserved so enumeration is stable across calls.
#[derive(Default)]
pub struct LocalDirectory {
    entries: RwLock<Vec<(String, WorkerRef)>>,
}

impl LocalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, capability: &str, worker: WorkerRef) {
        tracing::info!(worker = %worker.id, capability, "Registered worker");
        self.entries.write().push((capability.to_owned(), worker));
    }

    pub fn deregister(&self, id: WorkerId) {
        self.entries.write().retain(|(_, w)| w.id != id);
    }
}

impl Directory for LocalDirectory {
    fn find_workers_offering(
        &self,
        capability: &str,
    ) -> Result<Vec<WorkerRef>, DirectoryError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(offered, _)| offered == capability)
            .map(|(_, worker)| worker.clone())
            .collect())
    }
}

/// Convenience alias used wherever a directory is injected.
pub type SharedDirectory = Arc<dyn Directory>;
