//! In-memory implementation of `RequestStore` and `NotificationStore`.
//!
//! All state is held in memory and lost on restart. Requests live behind a
//! single `RwLock`, which makes the version check and the write in
//! `update_request` one atomic step. Notifications are partitioned by
//! recipient, each partition ordered by feed cursor.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;

use super::{
    EffectMarker, FeedSlice, FeedWindow, NotificationStore, RequestFilter, RequestStore,
    StoredRequest,
};
use crate::domain::{ActorId, FeedCursor, Notification, NotificationId};
use crate::error::{Result, TurnstileError};
use crate::request::{AnyRequest, RequestId};

/// In-memory store for requests and notifications.
#[derive(Default)]
pub struct InMemoryStore {
    requests: RwLock<HashMap<RequestId, StoredRequest>>,
    /// recipient -> notifications ordered by (created_at, id)
    partitions: DashMap<ActorId, BTreeMap<FeedCursor, Notification>>,
    /// notification id -> (recipient, cursor) for keyed lookups
    index: DashMap<NotificationId, (ActorId, FeedCursor)>,
    /// Remaining notification inserts that should fail (fault injection)
    failing_inserts: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` notification inserts fail with a storage error.
    ///
    /// Used to exercise the dispatcher's redelivery path.
    pub fn fail_next_notification_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    /// Resolve a notification to its cursor, checking the caller owns it.
    fn owned_cursor(&self, recipient: ActorId, id: NotificationId) -> Result<FeedCursor> {
        let (owner, cursor) = self
            .index
            .get(&id)
            .map(|entry| *entry.value())
            .ok_or_else(|| TurnstileError::NotFound(format!("notification {id}")))?;
        if owner != recipient {
            return Err(TurnstileError::Forbidden(format!(
                "notification {id} belongs to another actor"
            )));
        }
        Ok(cursor)
    }
}

#[async_trait]
impl RequestStore for InMemoryStore {
    async fn insert_request(&self, request: AnyRequest) -> Result<StoredRequest> {
        let mut requests = self.requests.write().await;
        let id = request.id();
        if requests.contains_key(&id) {
            return Err(TurnstileError::Storage(format!("request {id} already exists")));
        }
        let stored = StoredRequest {
            request,
            version: 1,
            effects: EffectMarker::Settled,
        };
        requests.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_request(&self, id: RequestId) -> Result<StoredRequest> {
        let requests = self.requests.read().await;
        requests
            .get(&id)
            .cloned()
            .ok_or_else(|| TurnstileError::NotFound(format!("request {id}")))
    }

    async fn update_request(
        &self,
        expected_version: u64,
        request: AnyRequest,
        effects: EffectMarker,
    ) -> Result<StoredRequest> {
        let mut requests = self.requests.write().await;
        let id = request.id();
        let current = requests
            .get_mut(&id)
            .ok_or_else(|| TurnstileError::NotFound(format!("request {id}")))?;

        if current.version != expected_version {
            tracing::debug!(
                request_id = %id,
                expected_version,
                actual_version = current.version,
                "Conditional request write lost"
            );
            return Err(TurnstileError::StaleWrite(id));
        }

        current.request = request;
        current.version += 1;
        current.effects = effects;
        Ok(current.clone())
    }

    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<StoredRequest>> {
        let requests = self.requests.read().await;
        let mut matching: Vec<StoredRequest> = requests
            .values()
            .filter(|stored| filter.matches(&stored.request))
            .cloned()
            .collect();
        matching.sort_by_key(|stored| (stored.request.data().created_at, stored.request.id()));
        Ok(matching)
    }

    async fn list_unsettled(&self) -> Result<Vec<StoredRequest>> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|stored| stored.needs_roll_forward())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn insert_notification(&self, notification: Notification) -> Result<Notification> {
        if self.take_injected_failure() {
            return Err(TurnstileError::Storage(
                "notification insert failed (injected)".into(),
            ));
        }

        let cursor = notification.cursor();
        self.index
            .insert(notification.id, (notification.recipient, cursor));
        self.partitions
            .entry(notification.recipient)
            .or_default()
            .insert(cursor, notification.clone());
        Ok(notification)
    }

    async fn count_unread(&self, recipient: ActorId) -> Result<u64> {
        Ok(self
            .partitions
            .get(&recipient)
            .map(|partition| partition.values().filter(|n| !n.is_read()).count() as u64)
            .unwrap_or(0))
    }

    async fn read_feed(&self, recipient: ActorId, window: FeedWindow) -> Result<FeedSlice> {
        let Some(partition) = self.partitions.get(&recipient) else {
            return Ok(FeedSlice {
                items: Vec::new(),
                total: 0,
                newest: None,
            });
        };

        // Snapshot: everything at or before the anchor, newest first
        let snapshot: Vec<&Notification> = match window.as_of {
            Some(anchor) => partition.range(..=anchor).rev().map(|(_, n)| n).collect(),
            None => partition.values().rev().collect(),
        };

        let total = snapshot.len();
        let newest = snapshot.first().map(|n| n.cursor());

        let items = match window.after {
            Some(after) => snapshot
                .into_iter()
                .filter(|n| n.cursor() < after)
                .take(window.limit)
                .cloned()
                .collect(),
            None => snapshot
                .into_iter()
                .skip(window.offset)
                .take(window.limit)
                .cloned()
                .collect(),
        };

        Ok(FeedSlice {
            items,
            total,
            newest,
        })
    }

    async fn mark_read(
        &self,
        recipient: ActorId,
        id: NotificationId,
        now: DateTime<Utc>,
    ) -> Result<Notification> {
        let cursor = self.owned_cursor(recipient, id)?;
        let mut partition = self
            .partitions
            .get_mut(&recipient)
            .ok_or_else(|| TurnstileError::NotFound(format!("notification {id}")))?;
        let notification = partition
            .get_mut(&cursor)
            .ok_or_else(|| TurnstileError::NotFound(format!("notification {id}")))?;
        notification.mark_read(now);
        Ok(notification.clone())
    }

    async fn mark_all_read(&self, recipient: ActorId, now: DateTime<Utc>) -> Result<u64> {
        let Some(mut partition) = self.partitions.get_mut(&recipient) else {
            return Ok(0);
        };
        let updated = partition
            .values_mut()
            .map(|notification| notification.mark_read(now))
            .filter(|changed| *changed)
            .count();
        Ok(updated as u64)
    }

    async fn delete_notification(&self, recipient: ActorId, id: NotificationId) -> Result<()> {
        let cursor = self.owned_cursor(recipient, id)?;
        if let Some(mut partition) = self.partitions.get_mut(&recipient) {
            partition.remove(&cursor);
        }
        self.index.remove(&id);
        Ok(())
    }
}
