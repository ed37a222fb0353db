//! Storage traits for requests and notifications.
//!
//! These traits are the contract the engine needs from a durable keyed store:
//! keyed get/put plus a conditional update on requests, and a per-recipient
//! partitioned notification table. The type system ensures valid state
//! transitions, so implementations don't need to validate them; they only
//! enforce versions and ownership.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ActorId, FeedCursor, Notification, NotificationId, Subject};
use crate::error::Result;
use crate::request::{AnyRequest, RequestId, RequestKind, RequestStatus};

mod memory;

pub use memory::InMemoryStore;

/// Write-ahead marker for the effect belonging to the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectMarker {
    /// Nothing outstanding: pending requests, or terminal requests whose effect ran.
    Settled,
    /// Terminal state written, effect not yet confirmed. Must be rolled forward.
    Pending,
}

/// A request as held by the store, with its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRequest {
    pub request: AnyRequest,
    /// Bumped on every successful write
    pub version: u64,
    pub effects: EffectMarker,
}

impl StoredRequest {
    pub fn needs_roll_forward(&self) -> bool {
        self.effects == EffectMarker::Pending && self.request.is_terminal()
    }
}

/// Filter for listing requests. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilter {
    pub kind: Option<RequestKind>,
    pub status: Option<RequestStatus>,
    pub submitted_by: Option<ActorId>,
    pub subject: Option<Subject>,
}

impl RequestFilter {
    pub fn matches(&self, request: &AnyRequest) -> bool {
        let data = request.data();
        self.kind.is_none_or(|kind| kind == data.kind)
            && self.status.is_none_or(|status| status == request.status())
            && self
                .submitted_by
                .is_none_or(|submitter| submitter == data.submitted_by)
            && self.subject.is_none_or(|subject| subject == data.subject)
    }
}

/// Request persistence. Requests are never physically deleted.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a newly submitted request at version 1.
    async fn insert_request(&self, request: AnyRequest) -> Result<StoredRequest>;

    /// Get a request by ID. Fails with `NotFound` for unknown IDs.
    async fn get_request(&self, id: RequestId) -> Result<StoredRequest>;

    /// Replace a request only if its stored version still equals
    /// `expected_version`. Fails with `StaleWrite` otherwise.
    async fn update_request(
        &self,
        expected_version: u64,
        request: AnyRequest,
        effects: EffectMarker,
    ) -> Result<StoredRequest>;

    /// List requests matching the filter, oldest first.
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<StoredRequest>>;

    /// Terminal requests still carrying an `EffectMarker::Pending`.
    async fn list_unsettled(&self) -> Result<Vec<StoredRequest>>;
}

/// A window over one recipient's feed, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedWindow {
    /// Only consider notifications at or before this position (snapshot anchor)
    pub as_of: Option<FeedCursor>,
    /// Keyset mode: only notifications strictly older than this; `offset` is ignored
    pub after: Option<FeedCursor>,
    pub offset: usize,
    pub limit: usize,
}

/// Result of reading a [`FeedWindow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSlice {
    pub items: Vec<Notification>,
    /// Number of notifications inside the snapshot
    pub total: usize,
    /// Newest notification inside the snapshot
    pub newest: Option<FeedCursor>,
}

/// Notification persistence, partitioned by recipient.
///
/// Mutations take the calling actor and only touch rows it owns; a row that
/// exists under another recipient yields `Forbidden`.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_notification(&self, notification: Notification) -> Result<Notification>;

    async fn count_unread(&self, recipient: ActorId) -> Result<u64>;

    async fn read_feed(&self, recipient: ActorId, window: FeedWindow) -> Result<FeedSlice>;

    /// Idempotent: an already-read notification is returned unchanged.
    async fn mark_read(
        &self,
        recipient: ActorId,
        id: NotificationId,
        now: DateTime<Utc>,
    ) -> Result<Notification>;

    /// Returns the number of notifications that changed.
    async fn mark_all_read(&self, recipient: ActorId, now: DateTime<Utc>) -> Result<u64>;

    async fn delete_notification(&self, recipient: ActorId, id: NotificationId) -> Result<()>;
}
