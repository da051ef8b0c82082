//! Broadcast hub
//!
//! Joins participants into the registry, relays their messages to everyone
//! currently connected and announces arrivals and departures.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ParticipantId, Registry, SendHandle};

/// Default capacity of each participant's outbound queue
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Errors that can occur during hub operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Participant {0} is no longer registered")]
    NotRegistered(ParticipantId),
}

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Announcement sent to everyone (newcomer included) after a join
pub fn join_announcement(identity: &str) -> String {
    format!("{} has joined the chat.", identity)
}

/// Announcement sent to the remaining participants after a disconnect
pub fn leave_announcement(identity: &str) -> String {
    format!("{} has left the chat.", identity)
}

/// A participant's message as seen by everyone else
pub fn chat_line(identity: &str, message: &str) -> String {
    format!("{}: {}", identity, message)
}

/// What a connection holds while it is part of the hub
#[derive(Debug, Clone)]
pub struct Membership {
    identity: String,
    handle: SendHandle,
}

impl Membership {
    pub fn id(&self) -> ParticipantId {
        self.handle.id()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn handle(&self) -> &SendHandle {
        &self.handle
    }
}

/// Outcome of a single broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Participants the message was queued for
    pub delivered: usize,
    /// Participants removed because delivery failed
    pub evicted: Vec<ParticipantId>,
}

/// Relays messages between all registered participants
#[derive(Debug)]
pub struct Hub {
    registry: Arc<Registry>,
    outbound_capacity: usize,
}

impl Hub {
    /// Create a hub over the given registry
    pub fn new(registry: Arc<Registry>, outbound_capacity: usize) -> Self {
        Self {
            registry,
            outbound_capacity,
        }
    }

    /// Get the registry this hub manages
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register a new participant and announce it
    ///
    /// Returns the membership for the connection along with the receiver its
    /// writer task should drain. The join announcement is already queued on
    /// that receiver when this returns.
    pub async fn join(&self, identity: impl Into<String>) -> (Membership, mpsc::Receiver<String>) {
        let identity = identity.into();
        let (handle, outbound) = SendHandle::channel(self.outbound_capacity);

        let id = self.registry.add(identity.clone(), handle.clone()).await;
        info!("{} joined as participant {}", identity, id);

        self.broadcast(&join_announcement(&identity)).await;

        (Membership { identity, handle }, outbound)
    }

    /// Broadcast a message from a participant, tagged with its identity
    ///
    /// Fails without delivering anything when the sender has been evicted or
    /// has already left.
    pub async fn relay(&self, member: &Membership, message: &str) -> HubResult<BroadcastReport> {
        if !self.registry.contains(&member.handle).await {
            return Err(HubError::NotRegistered(member.id()));
        }

        debug!("Relaying {} bytes from {}", message.len(), member.identity);
        Ok(self.broadcast(&chat_line(&member.identity, message)).await)
    }

    /// Remove a participant and announce its departure
    ///
    /// Only the call that actually removes the participant announces; later
    /// calls for the same membership return `None`.
    pub async fn leave(&self, member: &Membership) -> Option<String> {
        let identity = self.registry.remove(&member.handle).await?;
        info!("{} left (participant {})", identity, member.id());

        self.broadcast(&leave_announcement(&identity)).await;
        Some(identity)
    }

    /// Queue a message for every current participant
    ///
    /// Delivery failures never reach the caller. Participants whose send fails
    /// are removed once the whole snapshot has been visited, without a
    /// departure announcement, and their connections are told through the
    /// handle's eviction signal.
    pub async fn broadcast(&self, message: &str) -> BroadcastReport {
        let participants = self.registry.snapshot().await;
        let mut report = BroadcastReport::default();

        for participant in &participants {
            match participant.handle().send(message) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        "Dropping participant {} ({}): {}",
                        participant.id(),
                        participant.identity(),
                        e
                    );
                    report.evicted.push(participant.id());
                }
            }
        }

        if self.registry.remove_all(&report.evicted).await > 0 {
            for participant in &participants {
                if report.evicted.contains(&participant.id()) {
                    participant.handle().evict();
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn hub() -> Hub {
        Hub::new(Arc::new(Registry::new()), DEFAULT_OUTBOUND_CAPACITY)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_message_formats() {
        assert_eq!(join_announcement("alice"), "alice has joined the chat.");
        assert_eq!(leave_announcement("bob"), "bob has left the chat.");
        assert_eq!(chat_line("alice", "hi"), "alice: hi");
    }

    #[tokio::test]
    async fn test_broadcast_empty_registry_is_noop() {
        let hub = hub();
        let report = hub.broadcast("hello").await;
        assert_eq!(report, BroadcastReport::default());
        assert!(hub.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_join_announces_to_newcomer() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.join("alice").await;

        assert_eq!(drain(&mut alice_rx), vec!["alice has joined the chat."]);
        assert!(hub.registry().contains(alice.handle()).await);
    }

    #[tokio::test]
    async fn test_chat_scenario() {
        let hub = hub();

        let (alice, mut alice_rx) = hub.join("alice").await;
        assert_eq!(drain(&mut alice_rx), vec!["alice has joined the chat."]);

        let (bob, mut bob_rx) = hub.join("bob").await;
        assert_eq!(drain(&mut alice_rx), vec!["bob has joined the chat."]);
        assert_eq!(drain(&mut bob_rx), vec!["bob has joined the chat."]);

        hub.relay(&alice, "hi").await.unwrap();
        assert_eq!(drain(&mut alice_rx), vec!["alice: hi"]);
        assert_eq!(drain(&mut bob_rx), vec!["alice: hi"]);

        assert_eq!(hub.leave(&bob).await, Some("bob".to_string()));
        assert_eq!(drain(&mut alice_rx), vec!["bob has left the chat."]);
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_double_leave_announces_once() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.join("alice").await;
        let (bob, _bob_rx) = hub.join("bob").await;
        drain(&mut alice_rx);

        assert_eq!(hub.leave(&bob).await, Some("bob".to_string()));
        assert_eq!(hub.leave(&bob).await, None);

        assert_eq!(drain(&mut alice_rx), vec!["bob has left the chat."]);
        assert_eq!(hub.registry().len().await, 1);
        assert!(hub.registry().contains(alice.handle()).await);
    }

    #[tokio::test]
    async fn test_failed_recipient_evicted_others_delivered() {
        let hub = hub();
        let (_alice, mut alice_rx) = hub.join("alice").await;
        let (bob, bob_rx) = hub.join("bob").await;
        let (_carol, mut carol_rx) = hub.join("carol").await;
        drain(&mut alice_rx);
        drain(&mut carol_rx);

        drop(bob_rx);

        let report = hub.broadcast("ping").await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.evicted, vec![bob.id()]);

        assert_eq!(drain(&mut alice_rx), vec!["ping"]);
        assert_eq!(drain(&mut carol_rx), vec!["ping"]);

        let remaining: Vec<String> = hub
            .registry()
            .snapshot()
            .await
            .iter()
            .map(|p| p.identity().to_string())
            .collect();
        assert_eq!(remaining, vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn test_eviction_is_silent() {
        let hub = hub();
        let (_alice, mut alice_rx) = hub.join("alice").await;
        let (bob, bob_rx) = hub.join("bob").await;
        drain(&mut alice_rx);

        drop(bob_rx);
        hub.broadcast("ping").await;

        // No departure announcement for evicted participants
        assert_eq!(drain(&mut alice_rx), vec!["ping"]);

        // The explicit disconnect that follows is a no-op
        assert_eq!(hub.leave(&bob).await, None);
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_evicts() {
        let hub = Hub::new(Arc::new(Registry::new()), 1);
        let (_alice, mut alice_rx) = hub.join("alice").await;
        drain(&mut alice_rx);
        let (slow, _slow_rx) = hub.join("slow").await;
        drain(&mut alice_rx);

        // slow's single slot still holds its join announcement
        let report = hub.broadcast("one").await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![slow.id()]);
        assert!(!hub.registry().contains(slow.handle()).await);
    }

    #[tokio::test]
    async fn test_evicted_sender_cannot_relay() {
        let hub = Hub::new(Arc::new(Registry::new()), 1);
        let (_alice, mut alice_rx) = hub.join("alice").await;
        drain(&mut alice_rx);
        let (slow, _slow_rx) = hub.join("slow").await;
        drain(&mut alice_rx);

        let report = hub.broadcast("x").await;
        assert_eq!(report.evicted, vec![slow.id()]);
        drain(&mut alice_rx);

        // The evicted connection is told about it
        timeout(Duration::from_secs(1), slow.handle().evicted())
            .await
            .expect("slow was not signalled");

        assert_eq!(
            hub.relay(&slow, "ghost").await,
            Err(HubError::NotRegistered(slow.id()))
        );
        assert!(drain(&mut alice_rx).is_empty());

        assert_eq!(hub.leave(&slow).await, None);
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_relay_after_leave_fails() {
        let hub = hub();
        let (alice, _alice_rx) = hub.join("alice").await;
        let (bob, mut bob_rx) = hub.join("bob").await;
        drain(&mut bob_rx);

        hub.leave(&alice).await;
        drain(&mut bob_rx);

        assert!(hub.relay(&alice, "late").await.is_err());
        assert!(drain(&mut bob_rx).is_empty());
        assert!(hub.registry().contains(bob.handle()).await);
    }

    #[tokio::test]
    async fn test_relay_preserves_sender_order() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.join("alice").await;
        let (_bob, mut bob_rx) = hub.join("bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        for i in 0..5 {
            hub.relay(&alice, &format!("m{}", i)).await.unwrap();
        }

        let expected: Vec<String> = (0..5).map(|i| format!("alice: m{}", i)).collect();
        assert_eq!(drain(&mut bob_rx), expected);
    }

    #[tokio::test]
    async fn test_duplicate_identities_are_separate_participants() {
        let hub = hub();
        let (first, mut first_rx) = hub.join("alice").await;
        let (_second, mut second_rx) = hub.join("alice").await;
        drain(&mut first_rx);
        drain(&mut second_rx);

        assert_eq!(hub.registry().len().await, 2);
        hub.leave(&first).await;

        assert_eq!(drain(&mut second_rx), vec!["alice has left the chat."]);
        assert_eq!(hub.registry().len().await, 1);
    }
}
