//! Read side of the notification subsystem.

use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::{FeedEvent, FeedEventKind, FeedEvents};
use crate::config::FeedConfig;
use crate::domain::{ActorId, FeedCursor, Notification, NotificationId};
use crate::error::{Result, TurnstileError};
use crate::storage::{FeedWindow, NotificationStore};

/// Paging parameters for [`NotificationFeed::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedQuery {
    /// 1-based page number; defaults to 1
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// Snapshot anchor returned by an earlier page
    pub as_of: Option<FeedCursor>,
    /// Keyset mode: items strictly older than this cursor
    pub after: Option<FeedCursor>,
}

impl FeedQuery {
    pub fn page(page: u32, page_size: u32) -> Self {
        Self {
            page: Some(page),
            page_size: Some(page_size),
            ..Default::default()
        }
    }

    /// Pin this query to the snapshot another page was read from.
    pub fn as_of(mut self, anchor: Option<FeedCursor>) -> Self {
        self.as_of = anchor;
        self
    }
}

/// One page of a recipient's feed, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub items: Vec<Notification>,
    pub current_page: u32,
    pub total_pages: u32,
    pub unread_count: u64,
    /// Pass back as `asOf` to read further pages of the same snapshot
    pub as_of: Option<FeedCursor>,
    /// Pass back as `after` to continue in keyset mode
    pub next_cursor: Option<FeedCursor>,
}

/// Unread counts, paged listing, read/delete and push subscriptions.
#[derive(Clone)]
pub struct NotificationFeed {
    store: Arc<dyn NotificationStore>,
    events: FeedEvents,
    config: FeedConfig,
}

impl NotificationFeed {
    pub fn new(store: Arc<dyn NotificationStore>, events: FeedEvents, config: FeedConfig) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    pub async fn unread_count(&self, actor: ActorId) -> Result<u64> {
        self.store.count_unread(actor).await
    }

    /// List a page of the actor's feed.
    ///
    /// Page 1 defines the snapshot: its newest item is returned as `as_of`,
    /// and later pages requested with that anchor ignore notifications created
    /// since, so items are neither repeated nor skipped. Pages past the first
    /// must carry `as_of` (or use `after`), otherwise they are refused with
    /// `Validation`.
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn list(&self, actor: ActorId, query: FeedQuery) -> Result<FeedPage> {
        let page = query.page.unwrap_or(1);
        if page == 0 {
            return Err(TurnstileError::Validation("page numbers start at 1".into()));
        }
        if page > 1 && query.as_of.is_none() && query.after.is_none() {
            return Err(TurnstileError::Validation(
                "pages after the first need the asOf anchor returned by page 1".into(),
            ));
        }
        let page_size = match query.page_size {
            Some(0) => {
                return Err(TurnstileError::Validation(
                    "pageSize must be at least 1".into(),
                ));
            }
            Some(size) => size.min(self.config.max_page_size),
            None => self.config.default_page_size,
        };
        let limit = page_size as usize;
        let offset = (page as usize - 1) * limit;

        let slice = self
            .store
            .read_feed(
                actor,
                FeedWindow {
                    as_of: query.as_of,
                    after: query.after,
                    offset,
                    limit,
                },
            )
            .await?;
        let unread_count = self.store.count_unread(actor).await?;

        let has_more = match query.after {
            Some(_) => slice.items.len() == limit,
            None => offset + slice.items.len() < slice.total,
        };
        let next_cursor = if has_more {
            slice.items.last().map(Notification::cursor)
        } else {
            None
        };

        Ok(FeedPage {
            current_page: page,
            total_pages: slice.total.div_ceil(limit) as u32,
            unread_count,
            as_of: query.as_of.or(slice.newest),
            next_cursor,
            items: slice.items,
        })
    }

    /// Mark one of the actor's notifications read. Already-read is a no-op.
    #[tracing::instrument(skip(self), fields(actor = %actor, notification_id = %id))]
    pub async fn mark_read(&self, actor: ActorId, id: NotificationId) -> Result<Notification> {
        let notification = self.store.mark_read(actor, id, Utc::now()).await?;
        self.events
            .announce(self.store.as_ref(), actor, FeedEventKind::Read(id))
            .await;
        Ok(notification)
    }

    /// Mark everything read; returns how many notifications changed.
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn mark_all_read(&self, actor: ActorId) -> Result<u64> {
        let updated = self.store.mark_all_read(actor, Utc::now()).await?;
        tracing::debug!(updated, "Marked all notifications read");
        if updated > 0 {
            self.events
                .announce(self.store.as_ref(), actor, FeedEventKind::AllRead(updated))
                .await;
        }
        Ok(updated)
    }

    #[tracing::instrument(skip(self), fields(actor = %actor, notification_id = %id))]
    pub async fn delete(&self, actor: ActorId, id: NotificationId) -> Result<()> {
        self.store.delete_notification(actor, id).await?;
        self.events
            .announce(self.store.as_ref(), actor, FeedEventKind::Deleted(id))
            .await;
        Ok(())
    }

    /// Live changes to the actor's feed.
    ///
    /// A subscriber that falls more than `push_channel_capacity` events
    /// behind skips the missed events; it should re-query `unread_count`.
    pub fn subscribe(&self, actor: ActorId) -> impl Stream<Item = FeedEvent> + Send + use<> {
        BroadcastStream::new(self.events.subscribe()).filter_map(move |event| async move {
            match event {
                Ok(event) if event.recipient == actor => Some(event),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    tracing::warn!(actor = %actor, missed, "Feed subscriber lagged");
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NotificationIntent, NotificationType};
    use crate::storage::InMemoryStore;
    use chrono::Duration;

    async fn seeded(count: i64) -> (NotificationFeed, Arc<InMemoryStore>, ActorId) {
        let store = Arc::new(InMemoryStore::new());
        let recipient = ActorId::new();
        let start = Utc::now() - Duration::hours(1);
        for i in 0..count {
            let intent = NotificationIntent::new(
                recipient,
                NotificationType::Welcome,
                format!("notice {i}"),
                "hello",
            );
            store
                .insert_notification(Notification::from_intent(
                    intent,
                    start + Duration::seconds(i),
                ))
                .await
                .unwrap();
        }
        let feed = NotificationFeed::new(store.clone(), FeedEvents::new(8), FeedConfig::default());
        (feed, store, recipient)
    }

    #[test_log::test(tokio::test)]
    async fn test_page_metadata() {
        let (feed, _, recipient) = seeded(23).await;
        let first = feed.list(recipient, FeedQuery::page(1, 10)).await.unwrap();
        assert_eq!(first.total_pages, 3);
        assert!(first.next_cursor.is_some());
        let page = feed
            .list(recipient, FeedQuery::page(3, 10).as_of(first.as_of))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.current_page, 3);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.unread_count, 23);
        assert_eq!(page.next_cursor, None);
        assert_eq!(page.items[0].title, "notice 2");
    }

    #[test_log::test(tokio::test)]
    async fn test_empty_feed_has_no_pages() {
        let (feed, _, recipient) = seeded(0).await;
        let page = feed.list(recipient, FeedQuery::default()).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total_pages, 0);
        assert_eq!(page.as_of, None);
    }

    #[test_log::test(tokio::test)]
    async fn test_rejects_zero_paging() {
        let (feed, _, recipient) = seeded(1).await;
        let err = feed.list(recipient, FeedQuery::page(0, 10)).await.unwrap_err();
        assert!(matches!(err, TurnstileError::Validation(_)));
        let err = feed.list(recipient, FeedQuery::page(1, 0)).await.unwrap_err();
        assert!(matches!(err, TurnstileError::Validation(_)));
    }

    #[test_log::test(tokio::test)]
    async fn test_unanchored_later_page_is_refused() {
        let (feed, store, recipient) = seeded(6).await;
        let first = feed.list(recipient, FeedQuery::page(1, 5)).await.unwrap();

        let err = feed.list(recipient, FeedQuery::page(2, 5)).await.unwrap_err();
        assert!(matches!(err, TurnstileError::Validation(_)));

        // A newer arrival cannot push a page-1 item onto page 2 of the snapshot
        store
            .insert_notification(Notification::from_intent(
                NotificationIntent::new(recipient, NotificationType::Welcome, "late", "hi"),
                Utc::now(),
            ))
            .await
            .unwrap();
        let second = feed
            .list(recipient, FeedQuery::page(2, 5).as_of(first.as_of))
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(first.items.iter().all(|n| n.id != second.items[0].id));
    }

    #[test_log::test(tokio::test)]
    async fn test_page_size_is_clamped() {
        let (feed, _, recipient) = seeded(120).await;
        let page = feed.list(recipient, FeedQuery::page(1, 500)).await.unwrap();
        assert_eq!(page.items.len(), 100);
        assert_eq!(page.total_pages, 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_keyset_paging_walks_whole_feed() {
        let (feed, _, recipient) = seeded(7).await;
        let mut seen = Vec::new();
        let mut query = FeedQuery::page(1, 3);
        loop {
            let page = feed.list(recipient, query.clone()).await.unwrap();
            seen.extend(page.items.iter().map(|n| n.id));
            match page.next_cursor {
                Some(cursor) => query.after = Some(cursor),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
        seen.dedup();
        assert_eq!(seen.len(), 7);
    }

    #[test_log::test(tokio::test)]
    async fn test_subscriber_sees_only_own_events() {
        let (feed, store, recipient) = seeded(2).await;
        let (_, _, other) = seeded(0).await;
        let mut mine = Box::pin(feed.subscribe(recipient));
        let mut theirs = Box::pin(feed.subscribe(other));

        let page = feed.list(recipient, FeedQuery::default()).await.unwrap();
        feed.mark_read(recipient, page.items[0].id).await.unwrap();

        let event = mine.next().await.unwrap();
        assert_eq!(event.kind, FeedEventKind::Read(page.items[0].id));
        assert_eq!(event.unread_count, 1);
        assert_eq!(store.count_unread(recipient).await.unwrap(), 1);

        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(20), theirs.next()).await;
        assert!(nothing.is_err());
    }
}
