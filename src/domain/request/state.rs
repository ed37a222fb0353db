//! Core request types.
//!
//! This module defines the type-safe request lifecycle using the typestate pattern.
//! Each request progresses from `Pending` to exactly one terminal state, enforced
//! at compile time: only a `Request<Pending>` exposes transition methods.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::actor::ActorId;
use crate::domain::subject::{RequestPayload, Subject};

/// The fixed set of request kinds sharing one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    GymRegistration,
    InstructorApplication,
    CollaborationRequest,
    PaymentConfirmation,
}

impl RequestKind {
    pub const ALL: [RequestKind; 4] = [
        RequestKind::GymRegistration,
        RequestKind::InstructorApplication,
        RequestKind::CollaborationRequest,
        RequestKind::PaymentConfirmation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::GymRegistration => "gym_registration",
            RequestKind::InstructorApplication => "instructor_application",
            RequestKind::CollaborationRequest => "collaboration_request",
            RequestKind::PaymentConfirmation => "payment_confirmation",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat state discriminant, used for filtering, registry keys and wire output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Confirmed,
}

impl RequestStatus {
    /// Terminal states are absorbing.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Confirmed => "confirmed",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action an actor can take on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Approve,
    Reject,
    Cancel,
    Confirm,
}

impl Action {
    /// The state a pending request moves to under this action.
    pub fn resulting_status(&self) -> RequestStatus {
        match self {
            Action::Approve => RequestStatus::Approved,
            Action::Reject => RequestStatus::Rejected,
            Action::Cancel => RequestStatus::Cancelled,
            Action::Confirm => RequestStatus::Confirmed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Cancel => "cancel",
            Action::Confirm => "confirm",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker trait for valid request states.
pub trait RequestState: Send + Sync {}

/// An auditable unit of a submit/decide workflow.
///
/// The generic parameter `T` represents the current state of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request<T: RequestState> {
    /// The current state of the request.
    pub state: T,
    /// Data captured at submission time.
    pub data: RequestData,
}

/// Everything about a request that is not state-specific.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    pub id: RequestId,
    pub kind: RequestKind,
    /// The owning party
    pub submitted_by: ActorId,
    pub subject: Subject,
    pub payload: RequestPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Request States
// ============================================================================

/// Request is waiting for a decision.
///
/// This is the initial state for all newly submitted requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pending {}

impl RequestState for Pending {}

/// A reviewer approved the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Approved {
    pub reviewed_by: ActorId,
    pub review_note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl RequestState for Approved {}

/// A reviewer rejected the request. Rejections always carry a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejected {
    pub reviewed_by: ActorId,
    pub review_note: String,
    pub decided_at: DateTime<Utc>,
}

impl RequestState for Rejected {}

/// The submitter withdrew the request. No reviewer is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cancelled {
    pub decided_at: DateTime<Utc>,
}

impl RequestState for Cancelled {}

/// The gym owner confirmed an offline payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Confirmed {
    pub reviewed_by: ActorId,
    pub review_note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl RequestState for Confirmed {}

/// Unique identifier for a request in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ============================================================================
// Unified Request Representation
// ============================================================================

/// Enum that can hold a request in any state.
///
/// This is used for storage and API responses where we need to handle
/// requests uniformly regardless of their current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "request")]
pub enum AnyRequest {
    Pending(Request<Pending>),
    Approved(Request<Approved>),
    Rejected(Request<Rejected>),
    Cancelled(Request<Cancelled>),
    Confirmed(Request<Confirmed>),
}

impl AnyRequest {
    /// Get the request ID regardless of state.
    pub fn id(&self) -> RequestId {
        self.data().id
    }

    pub fn kind(&self) -> RequestKind {
        self.data().kind
    }

    /// Get the request data regardless of state.
    pub fn data(&self) -> &RequestData {
        match self {
            AnyRequest::Pending(r) => &r.data,
            AnyRequest::Approved(r) => &r.data,
            AnyRequest::Rejected(r) => &r.data,
            AnyRequest::Cancelled(r) => &r.data,
            AnyRequest::Confirmed(r) => &r.data,
        }
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            AnyRequest::Pending(_) => RequestStatus::Pending,
            AnyRequest::Approved(_) => RequestStatus::Approved,
            AnyRequest::Rejected(_) => RequestStatus::Rejected,
            AnyRequest::Cancelled(_) => RequestStatus::Cancelled,
            AnyRequest::Confirmed(_) => RequestStatus::Confirmed,
        }
    }

    /// Check if this request is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// The reviewer, set only on actor-initiated terminal transitions.
    pub fn reviewed_by(&self) -> Option<ActorId> {
        match self {
            AnyRequest::Approved(r) => Some(r.state.reviewed_by),
            AnyRequest::Rejected(r) => Some(r.state.reviewed_by),
            AnyRequest::Confirmed(r) => Some(r.state.reviewed_by),
            AnyRequest::Pending(_) | AnyRequest::Cancelled(_) => None,
        }
    }

    /// The actor whose action produced the current terminal state.
    pub fn decided_by(&self) -> Option<ActorId> {
        match self {
            AnyRequest::Cancelled(r) => Some(r.data.submitted_by),
            other => other.reviewed_by(),
        }
    }

    pub fn review_note(&self) -> Option<&str> {
        match self {
            AnyRequest::Approved(r) => r.state.review_note.as_deref(),
            AnyRequest::Rejected(r) => Some(r.state.review_note.as_str()),
            AnyRequest::Confirmed(r) => r.state.review_note.as_deref(),
            AnyRequest::Pending(_) | AnyRequest::Cancelled(_) => None,
        }
    }

    /// Set exactly once, on the terminal transition.
    pub fn decided_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnyRequest::Pending(_) => None,
            AnyRequest::Approved(r) => Some(r.state.decided_at),
            AnyRequest::Rejected(r) => Some(r.state.decided_at),
            AnyRequest::Cancelled(r) => Some(r.state.decided_at),
            AnyRequest::Confirmed(r) => Some(r.state.decided_at),
        }
    }

    /// Try to extract as a Pending request.
    pub fn as_pending(&self) -> Option<&Request<Pending>> {
        match self {
            AnyRequest::Pending(r) => Some(r),
            _ => None,
        }
    }

    /// Try to take as a Pending request, consuming self.
    pub fn into_pending(self) -> Option<Request<Pending>> {
        match self {
            AnyRequest::Pending(r) => Some(r),
            _ => None,
        }
    }

    /// Flat representation for API responses.
    pub fn view(&self) -> RequestView {
        let data = self.data();
        RequestView {
            id: data.id,
            kind: data.kind,
            state: self.status(),
            submitted_by: data.submitted_by,
            reviewed_by: self.reviewed_by(),
            subject: data.subject,
            payload: data.payload.clone(),
            review_note: self.review_note().map(str::to_owned),
            created_at: data.created_at,
            updated_at: data.updated_at,
            decided_at: self.decided_at(),
        }
    }
}

/// Flat, state-agnostic shape of a request as shown to API clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestView {
    pub id: RequestId,
    pub kind: RequestKind,
    pub state: RequestStatus,
    pub submitted_by: ActorId,
    pub reviewed_by: Option<ActorId>,
    pub subject: Subject,
    pub payload: RequestPayload,
    pub review_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

// Conversion traits for going from typed Request to AnyRequest

impl From<Request<Pending>> for AnyRequest {
    fn from(r: Request<Pending>) -> Self {
        AnyRequest::Pending(r)
    }
}

impl From<Request<Approved>> for AnyRequest {
    fn from(r: Request<Approved>) -> Self {
        AnyRequest::Approved(r)
    }
}

impl From<Request<Rejected>> for AnyRequest {
    fn from(r: Request<Rejected>) -> Self {
        AnyRequest::Rejected(r)
    }
}

impl From<Request<Cancelled>> for AnyRequest {
    fn from(r: Request<Cancelled>) -> Self {
        AnyRequest::Cancelled(r)
    }
}

impl From<Request<Confirmed>> for AnyRequest {
    fn from(r: Request<Confirmed>) -> Self {
        AnyRequest::Confirmed(r)
    }
}
