//! Connection registry
//!
//! Holds the ordered set of live participants. Every mutation takes the write
//! lock exactly once, so a concurrent snapshot sees a participant either fully
//! added or fully absent.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors that can occur when delivering to a participant
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("Participant disconnected")]
    Disconnected,

    #[error("Participant outbound queue is full")]
    QueueFull,
}

/// Unique identifier of a participant's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending side of a connection's outbound queue
///
/// Handles are cheap to clone. Two handles are equal when they refer to the
/// same connection. Every clone shares one eviction signal, which tells the
/// owning connection that the hub stopped delivering to it.
#[derive(Debug, Clone)]
pub struct SendHandle {
    id: ParticipantId,
    tx: mpsc::Sender<String>,
    evicted: Arc<Notify>,
}

impl SendHandle {
    /// Create a handle together with the receiver its writer task drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ParticipantId::new(),
                tx,
                evicted: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    /// Get the connection ID behind this handle
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    /// Queue a message for delivery without waiting on the socket
    pub fn send(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.tx.try_send(text.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Signal the owning connection that it was dropped from the hub
    ///
    /// The signal is kept until observed, so a connection that starts waiting
    /// afterwards still sees it.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }

    /// Wait until this connection is evicted
    pub async fn evicted(&self) {
        self.evicted.notified().await;
    }

    /// Whether the writer side has gone away
    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for SendHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SendHandle {}

/// One connected, identified chat client
#[derive(Debug, Clone)]
pub struct Participant {
    identity: String,
    handle: SendHandle,
}

impl Participant {
    pub fn id(&self) -> ParticipantId {
        self.handle.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn handle(&self) -> &SendHandle {
        &self.handle
    }
}

/// Live set of participants in join order
#[derive(Debug, Default)]
pub struct Registry {
    participants: RwLock<Vec<Participant>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a participant
    ///
    /// A handle that is already registered is not added twice; the existing
    /// entry's ID is returned instead.
    pub async fn add(&self, identity: impl Into<String>, handle: SendHandle) -> ParticipantId {
        let id = handle.id;
        let mut participants = self.participants.write().await;

        if participants.iter().any(|p| p.handle == handle) {
            warn!("Participant {} already registered, ignoring add", id);
            return id;
        }

        let identity = identity.into();
        debug!("Registering participant {} as {:?}", id, identity);
        participants.push(Participant { identity, handle });
        id
    }

    /// Remove the entry for a handle, returning its identity
    ///
    /// Returns `None` when the handle is not (or no longer) registered.
    pub async fn remove(&self, handle: &SendHandle) -> Option<String> {
        let mut participants = self.participants.write().await;
        let index = participants.iter().position(|p| &p.handle == handle)?;
        let removed = participants.remove(index);
        debug!("Removed participant {} ({:?})", removed.id(), removed.identity);
        Some(removed.identity)
    }

    /// Remove every entry whose ID is listed, returning how many were removed
    pub async fn remove_all(&self, ids: &[ParticipantId]) -> usize {
        if ids.is_empty() {
            return 0;
        }

        let mut participants = self.participants.write().await;
        let before = participants.len();
        participants.retain(|p| !ids.contains(&p.id()));
        before - participants.len()
    }

    /// Point-in-time copy of the participants, in join order
    pub async fn snapshot(&self) -> Vec<Participant> {
        self.participants.read().await.clone()
    }

    /// Whether a handle is currently registered
    pub async fn contains(&self, handle: &SendHandle) -> bool {
        self.participants
            .read()
            .await
            .iter()
            .any(|p| &p.handle == handle)
    }

    /// Number of registered participants
    pub async fn len(&self) -> usize {
        self.participants.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.participants.read().await.is_empty()
    }
}
