use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use turnstile::notifications::FeedEventKind;
use turnstile::{
    ActorId, Collaborators, EngineConfig, FeedQuery, InMemoryDirectory, InMemoryStore,
    NotificationDispatcher, NotificationFeed, NotificationId, NotificationIntent,
    NotificationType, Role, TurnstileError,
};

struct Harness {
    dispatcher: NotificationDispatcher,
    feed: NotificationFeed,
    directory: Arc<InMemoryDirectory>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let (engine, feed) = turnstile::assemble(
        store,
        Collaborators::in_memory(directory.clone()),
        &EngineConfig::default(),
    );
    Harness {
        dispatcher: engine.dispatcher().clone(),
        feed,
        directory,
    }
}

fn notice(recipient: ActorId, n: usize) -> NotificationIntent {
    NotificationIntent::new(
        recipient,
        NotificationType::CollaborationRequestReceived,
        format!("Invitation {n}"),
        "Join us",
    )
}

async fn deliver(h: &Harness, recipient: ActorId, count: usize) {
    for n in 0..count {
        let delivered = h.dispatcher.dispatch(vec![notice(recipient, n)]).await;
        assert_eq!(delivered.len(), 1);
    }
}

#[test_log::test(tokio::test)]
async fn test_unread_count_tracks_deliveries_and_reads() {
    let h = harness();
    let user = h.directory.add_actor(Role::Instructor, "Ivo");
    assert_eq!(h.feed.unread_count(user).await.unwrap(), 0);

    for expected in 1..=3 {
        deliver(&h, user, 1).await;
        assert_eq!(h.feed.unread_count(user).await.unwrap(), expected);
    }

    let page = h.feed.list(user, FeedQuery::default()).await.unwrap();
    for (read, item) in page.items.iter().enumerate() {
        h.feed.mark_read(user, item.id).await.unwrap();
        assert_eq!(
            h.feed.unread_count(user).await.unwrap(),
            3 - (read as u64 + 1)
        );
    }

    // Marking again is a no-op success
    let again = h.feed.mark_read(user, page.items[0].id).await.unwrap();
    assert!(again.is_read());
    assert_eq!(h.feed.unread_count(user).await.unwrap(), 0);
}

#[test_log::test(tokio::test)]
async fn test_mark_read_and_delete_round_trip_through_list() {
    let h = harness();
    let user = h.directory.add_actor(Role::Instructor, "Ivo");
    deliver(&h, user, 3).await;

    let page = h.feed.list(user, FeedQuery::default()).await.unwrap();
    let target = page.items[1].id;

    h.feed.mark_read(user, target).await.unwrap();
    let page = h.feed.list(user, FeedQuery::default()).await.unwrap();
    let listed = page.items.iter().find(|n| n.id == target).unwrap();
    assert!(listed.is_read());
    assert_eq!(page.unread_count, 2);
    for item in &page.items {
        assert_eq!(item.is_read(), item.read_at().is_some());
    }

    h.feed.delete(user, target).await.unwrap();
    let page = h.feed.list(user, FeedQuery::default()).await.unwrap();
    assert_eq!(page.items.len(), 2);
    assert!(page.items.iter().all(|n| n.id != target));

    let err = h.feed.delete(user, target).await.unwrap_err();
    assert!(matches!(err, TurnstileError::NotFound(_)));
    let err = h
        .feed
        .mark_read(user, NotificationId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TurnstileError::NotFound(_)));
}

#[test_log::test(tokio::test)]
async fn test_other_actors_notifications_are_forbidden() {
    let h = harness();
    let owner = h.directory.add_actor(Role::Instructor, "Ivo");
    let stranger = h.directory.add_actor(Role::Member, "Max");
    deliver(&h, owner, 1).await;
    let id = h.feed.list(owner, FeedQuery::default()).await.unwrap().items[0].id;

    let err = h.feed.mark_read(stranger, id).await.unwrap_err();
    assert!(matches!(err, TurnstileError::Forbidden(_)));
    let err = h.feed.delete(stranger, id).await.unwrap_err();
    assert!(matches!(err, TurnstileError::Forbidden(_)));

    assert!(
        h.feed
            .list(stranger, FeedQuery::default())
            .await
            .unwrap()
            .items
            .is_empty()
    );
    assert_eq!(h.feed.unread_count(owner).await.unwrap(), 1);
}

#[test_log::test(tokio::test)]
async fn test_mark_all_read_counts_only_changes() {
    let h = harness();
    let user = h.directory.add_actor(Role::Instructor, "Ivo");
    deliver(&h, user, 4).await;
    let first = h.feed.list(user, FeedQuery::default()).await.unwrap().items[0].id;
    h.feed.mark_read(user, first).await.unwrap();

    assert_eq!(h.feed.mark_all_read(user).await.unwrap(), 3);
    assert_eq!(h.feed.mark_all_read(user).await.unwrap(), 0);
    assert_eq!(h.feed.unread_count(user).await.unwrap(), 0);

    let page = h.feed.list(user, FeedQuery::default()).await.unwrap();
    assert!(page.items.iter().all(|n| n.is_read() && n.read_at().is_some()));
}

#[test_log::test(tokio::test)]
async fn test_pages_are_stable_under_concurrent_inserts() {
    let h = harness();
    let user = h.directory.add_actor(Role::Instructor, "Ivo");
    deliver(&h, user, 14).await;

    let first = h.feed.list(user, FeedQuery::page(1, 10)).await.unwrap();
    assert_eq!(first.items.len(), 10);
    assert_eq!(first.total_pages, 2);

    // A new notification lands between the two page reads
    deliver(&h, user, 1).await;

    let second = h
        .feed
        .list(user, FeedQuery::page(2, 10).as_of(first.as_of))
        .await
        .unwrap();
    assert_eq!(second.items.len(), 4);
    assert_eq!(second.total_pages, 2);
    assert_eq!(second.unread_count, 15);

    let first_ids: HashSet<_> = first.items.iter().map(|n| n.id).collect();
    let second_ids: HashSet<_> = second.items.iter().map(|n| n.id).collect();
    assert!(first_ids.is_disjoint(&second_ids));

    // Both pages together are exactly the 14 notifications that existed at page 1
    let fresh = h.feed.list(user, FeedQuery::page(1, 100)).await.unwrap();
    let original: HashSet<_> = fresh.items[1..].iter().map(|n| n.id).collect();
    let paged: HashSet<_> = first_ids.union(&second_ids).copied().collect();
    assert_eq!(paged, original);

    // Newest first throughout
    let order: Vec<_> = first
        .items
        .iter()
        .chain(second.items.iter())
        .map(|n| n.cursor())
        .collect();
    assert!(order.windows(2).all(|pair| pair[0] > pair[1]));
}

#[test_log::test(tokio::test)]
async fn test_push_stream_carries_unread_count() {
    let h = harness();
    let user = h.directory.add_actor(Role::Instructor, "Ivo");
    let mut events = Box::pin(h.feed.subscribe(user));

    deliver(&h, user, 2).await;
    let created = events.next().await.unwrap();
    assert!(matches!(created.kind, FeedEventKind::Created(_)));
    assert_eq!(created.unread_count, 1);
    let created = events.next().await.unwrap();
    assert_eq!(created.unread_count, 2);

    assert_eq!(h.feed.mark_all_read(user).await.unwrap(), 2);
    let all_read = events.next().await.unwrap();
    assert_eq!(all_read.kind, FeedEventKind::AllRead(2));
    assert_eq!(all_read.unread_count, 0);
}
