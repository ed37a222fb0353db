//! Notification subsystem: the write side ([`NotificationDispatcher`]) and the
//! read side ([`NotificationFeed`]), joined by a broadcast channel of
//! [`FeedEvent`]s for push subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::{ActorId, Notification, NotificationId};
use crate::storage::NotificationStore;

pub mod dispatcher;
pub mod feed;

pub use dispatcher::NotificationDispatcher;
pub use feed::{FeedPage, FeedQuery, NotificationFeed};

/// A change to one recipient's feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEvent {
    pub recipient: ActorId,
    #[serde(flatten)]
    pub kind: FeedEventKind,
    /// Unread count right after the change
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum FeedEventKind {
    Created(Notification),
    Read(NotificationId),
    AllRead(u64),
    Deleted(NotificationId),
}

impl FeedEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            FeedEventKind::Created(_) => "created",
            FeedEventKind::Read(_) => "read",
            FeedEventKind::AllRead(_) => "all_read",
            FeedEventKind::Deleted(_) => "deleted",
        }
    }
}

/// Fan-out of feed changes to push subscribers.
///
/// Shared by the dispatcher and the feed. Publishing with no subscribers is
/// a no-op, so the pull-based queries stay the source of truth.
#[derive(Clone)]
pub struct FeedEvents {
    sender: broadcast::Sender<FeedEvent>,
}

impl FeedEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.sender.subscribe()
    }

    /// Publish a change, attaching the recipient's current unread count.
    pub(crate) async fn announce(
        &self,
        store: &dyn NotificationStore,
        recipient: ActorId,
        kind: FeedEventKind,
    ) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        let unread_count = match store.count_unread(recipient).await {
            Ok(count) => count,
            Err(e) => {
                tracing::debug!(recipient = %recipient, error = %e, "Skipping feed event, unread count unavailable");
                return;
            }
        };
        tracing::trace!(recipient = %recipient, event = kind.name(), unread_count, "Publishing feed event");
        // Subscribers may have gone away since the check above
        let _ = self.sender.send(FeedEvent {
            recipient,
            kind,
            unread_count,
        });
    }
}
