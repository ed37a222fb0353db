//! Notification records, intents and feed cursors.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::actor::ActorId;

/// Unique identifier for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub Uuid);

impl NotificationId {
    pub fn new() -> Self {
        NotificationId(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for NotificationId {
    fn from(uuid: Uuid) -> Self {
        NotificationId(uuid)
    }
}

/// What a notification is about. Mirrors request kind plus outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    GymRegistrationApproved,
    GymRegistrationRejected,
    InstructorApplicationApproved,
    InstructorApplicationRejected,
    CollaborationRequestReceived,
    CollaborationRequestAccepted,
    CollaborationRequestRejected,
    PaymentConfirmationRequested,
    MembershipActivated,
    PaymentRejected,
    Welcome,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::GymRegistrationApproved => "gym_registration_approved",
            NotificationType::GymRegistrationRejected => "gym_registration_rejected",
            NotificationType::InstructorApplicationApproved => "instructor_application_approved",
            NotificationType::InstructorApplicationRejected => "instructor_application_rejected",
            NotificationType::CollaborationRequestReceived => "collaboration_request_received",
            NotificationType::CollaborationRequestAccepted => "collaboration_request_accepted",
            NotificationType::CollaborationRequestRejected => "collaboration_request_rejected",
            NotificationType::PaymentConfirmationRequested => "payment_confirmation_requested",
            NotificationType::MembershipActivated => "membership_activated",
            NotificationType::PaymentRejected => "payment_rejected",
            NotificationType::Welcome => "welcome",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handler's declaration of who should be told about an effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub recipient: ActorId,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub sender: Option<ActorId>,
}

impl NotificationIntent {
    pub fn new(
        recipient: ActorId,
        notification_type: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            recipient,
            notification_type,
            title: title.into(),
            message: message.into(),
            sender: None,
        }
    }

    pub fn from_sender(mut self, sender: ActorId) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Greeting sent outside any request flow, e.g. after sign-up.
    pub fn welcome(recipient: ActorId, display_name: &str) -> Self {
        Self::new(
            recipient,
            NotificationType::Welcome,
            "Welcome aboard",
            format!("Hi {display_name}, your account is ready."),
        )
    }
}

/// A record of an effect surfaced to a user.
///
/// Immutable except for the `read`/`read_at` pair. Construct through
/// [`Notification::from_intent`] and mutate through [`Notification::mark_read`]
/// so that `read == read_at.is_some()` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub recipient: ActorId,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub sender: Option<ActorId>,
    read: bool,
    read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn from_intent(intent: NotificationIntent, now: DateTime<Utc>) -> Self {
        Self {
            id: NotificationId::new(),
            recipient: intent.recipient,
            notification_type: intent.notification_type,
            title: intent.title,
            message: intent.message,
            sender: intent.sender,
            read: false,
            read_at: None,
            created_at: now,
        }
    }

    pub fn is_read(&self) -> bool {
        self.read
    }

    pub fn read_at(&self) -> Option<DateTime<Utc>> {
        self.read_at
    }

    /// Mark as read. Returns false when it already was read; the first
    /// `read_at` is kept.
    pub fn mark_read(&mut self, now: DateTime<Utc>) -> bool {
        if self.read {
            return false;
        }
        self.read = true;
        self.read_at = Some(now);
        true
    }

    /// Position of this notification in the newest-first feed order.
    pub fn cursor(&self) -> FeedCursor {
        FeedCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Keyset position in a recipient's feed: `(created_at, id)`, compared
/// lexicographically so equal timestamps still order deterministically.
///
/// Serialized as an opaque `"<rfc3339>_<uuid>"` token so it can travel in a
/// query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct FeedCursor {
    pub created_at: DateTime<Utc>,
    pub id: NotificationId,
}

impl std::fmt::Display for FeedCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}",
            self.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.id.0
        )
    }
}

impl std::str::FromStr for FeedCursor {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (timestamp, id) = s
            .split_once('_')
            .ok_or_else(|| format!("malformed feed cursor '{s}'"))?;
        let created_at = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| format!("bad cursor timestamp: {e}"))?
            .with_timezone(&Utc);
        let id = Uuid::parse_str(id).map_err(|e| format!("bad cursor id: {e}"))?;
        Ok(FeedCursor {
            created_at,
            id: NotificationId(id),
        })
    }
}

impl TryFrom<String> for FeedCursor {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FeedCursor> for String {
    fn from(cursor: FeedCursor) -> Self {
        cursor.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_flag_tracks_read_at() {
        let intent = NotificationIntent::welcome(ActorId::new(), "Sam");
        let mut notification = Notification::from_intent(intent, Utc::now());
        assert!(!notification.is_read());
        assert_eq!(notification.read_at(), None);

        let first = Utc::now();
        assert!(notification.mark_read(first));
        assert!(notification.is_read());
        assert_eq!(notification.read_at(), Some(first));

        // Second mark is a no-op and keeps the original timestamp
        assert!(!notification.mark_read(first + chrono::Duration::seconds(5)));
        assert_eq!(notification.read_at(), Some(first));
    }

    #[test]
    fn test_cursor_orders_by_time_then_id() {
        let now = Utc::now();
        let a = FeedCursor {
            created_at: now,
            id: NotificationId(Uuid::from_u128(1)),
        };
        let b = FeedCursor {
            created_at: now,
            id: NotificationId(Uuid::from_u128(2)),
        };
        let c = FeedCursor {
            created_at: now + chrono::Duration::milliseconds(1),
            id: NotificationId(Uuid::from_u128(0)),
        };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_cursor_token_keeps_full_precision() {
        let notification = Notification::from_intent(
            NotificationIntent::welcome(ActorId::new(), "Sam"),
            Utc::now(),
        );
        let token = serde_json::to_value(notification.cursor()).unwrap();
        assert!(token.is_string());

        let parsed: FeedCursor = serde_json::from_value(token).unwrap();
        assert_eq!(parsed, notification.cursor());
        assert!("not-a-cursor".parse::<FeedCursor>().is_err());
    }

    #[test]
    fn test_notification_wire_shape() {
        let intent = NotificationIntent::new(
            ActorId::new(),
            NotificationType::GymRegistrationRejected,
            "Registration rejected",
            "Incomplete documents",
        );
        let json = serde_json::to_value(Notification::from_intent(intent, Utc::now())).unwrap();
        assert_eq!(json["type"], "gym_registration_rejected");
        assert_eq!(json["read"], false);
        assert!(json["readAt"].is_null());
    }
}
