//! Core domain types for the request lifecycle engine.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Actors and roles
//! - Subjects and kind-specific payloads
//! - Request typestate machine
//! - Notifications and feed cursors

pub mod actor;
pub mod notification;
pub mod request;
pub mod subject;

pub use actor::{Actor, ActorId, Role};
pub use notification::{
    FeedCursor, Notification, NotificationId, NotificationIntent, NotificationType,
};
pub use subject::{ApplicationId, GymId, MemberId, PaymentMethod, RequestPayload, Subject};
