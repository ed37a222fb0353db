//! Request lifecycle engine for approval workflows with guaranteed-once side effects.
//!
//! Actors submit requests (gym registrations, instructor applications,
//! collaboration invitations, payment confirmations) which a reviewing actor
//! approves, rejects or confirms. The [`RequestStateMachine`] serializes
//! decisions per request, runs the domain effect registered for the new state
//! exactly once, and hands the resulting notifications to the
//! [`NotificationDispatcher`]. The [`NotificationFeed`] serves unread counts,
//! paged listings and a push stream of feed changes.
//!
//! Storage and the identity/domain collaborators are traits; in-memory
//! implementations ship with the crate.

pub mod api;
pub mod collaborators;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod notifications;
pub mod request;
pub mod storage;

use std::sync::Arc;

// Re-export commonly used types
pub use collaborators::{Collaborators, InMemoryDirectory};
pub use config::{DispatchConfig, EngineConfig, FeedConfig};
pub use domain::{
    Actor, ActorId, FeedCursor, Notification, NotificationId, NotificationIntent,
    NotificationType, Role,
};
pub use engine::{RequestStateMachine, TransitionRegistry};
pub use error::{Result, TurnstileError};
pub use notifications::{FeedEvent, FeedEvents, FeedPage, FeedQuery, NotificationDispatcher, NotificationFeed};
pub use request::*;
pub use storage::{InMemoryStore, NotificationStore, RequestFilter, RequestStore};

/// Wire an engine and a feed over one store, sharing the push channel.
///
/// The redelivery worker is not started; call
/// [`NotificationDispatcher::spawn_redelivery`] on `engine.dispatcher()`.
pub fn assemble<S>(
    store: Arc<S>,
    collaborators: Collaborators,
    config: &EngineConfig,
) -> (RequestStateMachine, NotificationFeed)
where
    S: RequestStore + NotificationStore + 'static,
{
    let events = FeedEvents::new(config.feed.push_channel_capacity);
    let dispatcher = NotificationDispatcher::new(
        store.clone(),
        collaborators.identity.clone(),
        events.clone(),
        config.dispatch.clone(),
    );
    let feed = NotificationFeed::new(store.clone(), events, config.feed.clone());
    let engine = RequestStateMachine::new(store, collaborators, dispatcher, config);
    (engine, feed)
}
