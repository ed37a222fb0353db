//! Notification creation with best-effort redelivery.
//!
//! `dispatch` runs after a transition has committed and never reports
//! failure to it. Intents whose insert fails are queued and retried with
//! exponential backoff by [`NotificationDispatcher::redeliver_due`], which the
//! background worker calls on an interval.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{FeedEventKind, FeedEvents};
use crate::collaborators::IdentityService;
use crate::config::DispatchConfig;
use crate::domain::{Notification, NotificationIntent};
use crate::error::{Result, TurnstileError};
use crate::storage::NotificationStore;

/// A notification waiting for another delivery attempt.
#[derive(Debug, Clone)]
struct Redelivery {
    notification: Notification,
    /// Attempts made so far
    attempts: u32,
    not_before: Instant,
}

/// Turns notification intents into stored notifications.
#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    identity: Arc<dyn IdentityService>,
    events: FeedEvents,
    config: DispatchConfig,
    queue: Arc<Mutex<VecDeque<Redelivery>>>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        identity: Arc<dyn IdentityService>,
        events: FeedEvents,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            identity,
            events,
            config,
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Create one notification per intent.
    ///
    /// Returns the notifications stored on this attempt. Intents addressed to
    /// unknown actors are dropped; intents whose insert fails are queued for
    /// redelivery and are absent from the result.
    #[tracing::instrument(skip(self, intents), fields(count = intents.len()))]
    pub async fn dispatch(&self, intents: Vec<NotificationIntent>) -> Vec<Notification> {
        let mut delivered = Vec::with_capacity(intents.len());
        for intent in intents {
            let notification = Notification::from_intent(intent, Utc::now());
            match self.deliver(notification.clone()).await {
                Ok(stored) => delivered.push(stored),
                Err(e) => self.handle_failure(notification, 1, e),
            }
        }
        delivered
    }

    /// Retry every queued notification whose backoff has elapsed.
    ///
    /// Returns how many were delivered.
    pub async fn redeliver_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<Redelivery> = {
            let mut queue = self.queue.lock();
            let (due, waiting): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|item| item.not_before <= now);
            *queue = waiting;
            due.into()
        };

        let mut delivered = 0;
        for item in due {
            counter!("turnstile_dispatch_retries_total").increment(1);
            match self.deliver(item.notification.clone()).await {
                Ok(stored) => {
                    tracing::info!(
                        notification_id = %stored.id,
                        recipient = %stored.recipient,
                        attempts = item.attempts + 1,
                        "Notification redelivered"
                    );
                    delivered += 1;
                }
                Err(e) => self.handle_failure(item.notification, item.attempts + 1, e),
            }
        }
        delivered
    }

    /// Number of notifications waiting for redelivery.
    pub fn pending_redeliveries(&self) -> usize {
        self.queue.lock().len()
    }

    /// Spawn the redelivery worker. It stops when `shutdown` is cancelled.
    pub fn spawn_redelivery(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let period = Duration::from_millis(self.config.retry_interval_ms.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            tracing::info!(interval_ms = period.as_millis() as u64, "Notification redelivery started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let delivered = dispatcher.redeliver_due().await;
                        if delivered > 0 {
                            tracing::debug!(
                                delivered,
                                remaining = dispatcher.pending_redeliveries(),
                                "Redelivery pass finished"
                            );
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!(
                            remaining = dispatcher.pending_redeliveries(),
                            "Shutting down notification redelivery"
                        );
                        break;
                    }
                }
            }
        })
    }

    async fn deliver(&self, mut notification: Notification) -> Result<Notification> {
        self.identity.get_actor(notification.recipient).await?;

        // Stamp at insertion so late deliveries sort as new, not into pages
        // a client has already read.
        notification.created_at = Utc::now();
        let stored = self
            .store
            .insert_notification(notification)
            .await
            .map_err(|e| TurnstileError::DispatchFailed(e.to_string()))?;

        counter!(
            "turnstile_notifications_dispatched_total",
            "type" => stored.notification_type.as_str()
        )
        .increment(1);
        tracing::debug!(
            notification_id = %stored.id,
            recipient = %stored.recipient,
            notification_type = %stored.notification_type,
            "Notification created"
        );

        self.events
            .announce(
                self.store.as_ref(),
                stored.recipient,
                FeedEventKind::Created(stored.clone()),
            )
            .await;
        Ok(stored)
    }

    fn handle_failure(&self, notification: Notification, attempts: u32, error: TurnstileError) {
        if let TurnstileError::NotFound(_) = error {
            counter!("turnstile_dispatch_dropped_total").increment(1);
            tracing::warn!(
                recipient = %notification.recipient,
                notification_type = %notification.notification_type,
                "Dropping notification for unknown recipient"
            );
            return;
        }

        if attempts >= self.config.max_attempts {
            counter!("turnstile_dispatch_dropped_total").increment(1);
            tracing::error!(
                recipient = %notification.recipient,
                notification_type = %notification.notification_type,
                attempts,
                error = %error,
                "Giving up on notification after max attempts"
            );
            return;
        }

        let delay = self.config.backoff_for(attempts - 1);
        tracing::warn!(
            recipient = %notification.recipient,
            notification_type = %notification.notification_type,
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Notification dispatch failed, queued for redelivery"
        );
        self.queue.lock().push_back(Redelivery {
            notification,
            attempts,
            not_before: Instant::now() + delay,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryDirectory;
    use crate::domain::{ActorId, NotificationType, Role};
    use crate::storage::InMemoryStore;

    fn dispatcher(
        store: Arc<InMemoryStore>,
        directory: Arc<InMemoryDirectory>,
        max_attempts: u32,
    ) -> NotificationDispatcher {
        NotificationDispatcher::new(
            store,
            directory,
            FeedEvents::new(16),
            DispatchConfig {
                max_attempts,
                backoff_ms: 0,
                ..Default::default()
            },
        )
    }

    fn intent(recipient: ActorId) -> NotificationIntent {
        NotificationIntent::new(
            recipient,
            NotificationType::MembershipActivated,
            "Welcome to Alpha",
            "Your membership is active.",
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_recipient_is_dropped() {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let dispatcher = dispatcher(store, directory, 3);

        let delivered = dispatcher.dispatch(vec![intent(ActorId::new())]).await;
        assert!(delivered.is_empty());
        assert_eq!(dispatcher.pending_redeliveries(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_insert_is_redelivered() {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let member = directory.add_actor(Role::Member, "Max");
        let dispatcher = dispatcher(store.clone(), directory, 3);

        store.fail_next_notification_inserts(1);
        let delivered = dispatcher.dispatch(vec![intent(member)]).await;
        assert!(delivered.is_empty());
        assert_eq!(dispatcher.pending_redeliveries(), 1);
        assert_eq!(store.count_unread(member).await.unwrap(), 0);

        assert_eq!(dispatcher.redeliver_due().await, 1);
        assert_eq!(dispatcher.pending_redeliveries(), 0);
        assert_eq!(store.count_unread(member).await.unwrap(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_redelivery_gives_up_after_max_attempts() {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let member = directory.add_actor(Role::Member, "Max");
        let dispatcher = dispatcher(store.clone(), directory, 2);

        store.fail_next_notification_inserts(2);
        dispatcher.dispatch(vec![intent(member)]).await;
        assert_eq!(dispatcher.pending_redeliveries(), 1);

        assert_eq!(dispatcher.redeliver_due().await, 0);
        assert_eq!(dispatcher.pending_redeliveries(), 0);
        assert_eq!(store.count_unread(member).await.unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_worker_drains_queue_and_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let member = directory.add_actor(Role::Member, "Max");
        let dispatcher = NotificationDispatcher::new(
            store.clone(),
            directory,
            FeedEvents::new(16),
            DispatchConfig {
                backoff_ms: 0,
                retry_interval_ms: 5,
                ..Default::default()
            },
        );

        store.fail_next_notification_inserts(1);
        dispatcher.dispatch(vec![intent(member)]).await;

        let shutdown = CancellationToken::new();
        let worker = dispatcher.spawn_redelivery(shutdown.clone());
        tokio::time::timeout(Duration::from_secs(2), async {
            while dispatcher.pending_redeliveries() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("redelivery worker should drain the queue");

        shutdown.cancel();
        worker.await.unwrap();
        assert_eq!(store.count_unread(member).await.unwrap(), 1);
    }
}
