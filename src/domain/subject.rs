//! Domain objects a request can be about, and the kind-specific payloads
//! captured when the request is submitted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::actor::ActorId;
use super::request::RequestKind;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", &self.0.to_string()[..8])
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                $name(uuid)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a gym.
    GymId
);
uuid_id!(
    /// Unique identifier for a gym membership.
    MemberId
);
uuid_id!(
    /// Unique identifier for an instructor application.
    ApplicationId
);

/// The domain object under review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Subject {
    Gym(GymId),
    Application(ApplicationId),
    /// The instructor a collaboration request is addressed to
    Instructor(ActorId),
    Member(MemberId),
}

/// How a member paid for their membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Card payment settled by the gateway, never confirmed by hand
    Card,
    /// Cash or bank transfer handed to the gym, confirmed by the owner
    Manual,
}

/// Kind-specific data captured at submission time. Immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestPayload {
    GymRegistration {
        gym_id: GymId,
        gym_name: String,
    },
    InstructorApplication {
        application_id: ApplicationId,
        specialization: String,
    },
    CollaborationRequest {
        gym_id: GymId,
        instructor_id: ActorId,
        message: String,
    },
    PaymentConfirmation {
        gym_id: GymId,
        member_id: MemberId,
        payment_method: PaymentMethod,
        amount_cents: u64,
        paid_at: DateTime<Utc>,
    },
}

impl RequestPayload {
    /// The request kind this payload belongs to.
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::GymRegistration { .. } => RequestKind::GymRegistration,
            RequestPayload::InstructorApplication { .. } => RequestKind::InstructorApplication,
            RequestPayload::CollaborationRequest { .. } => RequestKind::CollaborationRequest,
            RequestPayload::PaymentConfirmation { .. } => RequestKind::PaymentConfirmation,
        }
    }

    /// The subject a payload of this shape must be submitted against.
    pub fn expected_subject(&self) -> Subject {
        match self {
            RequestPayload::GymRegistration { gym_id, .. } => Subject::Gym(*gym_id),
            RequestPayload::InstructorApplication { application_id, .. } => {
                Subject::Application(*application_id)
            }
            RequestPayload::CollaborationRequest { instructor_id, .. } => {
                Subject::Instructor(*instructor_id)
            }
            RequestPayload::PaymentConfirmation { member_id, .. } => Subject::Member(*member_id),
        }
    }

    /// The gym the request concerns, if any.
    pub fn gym_id(&self) -> Option<GymId> {
        match self {
            RequestPayload::GymRegistration { gym_id, .. }
            | RequestPayload::CollaborationRequest { gym_id, .. }
            | RequestPayload::PaymentConfirmation { gym_id, .. } => Some(*gym_id),
            RequestPayload::InstructorApplication { .. } => None,
        }
    }
}
