//! State transitions for requests using the typestate pattern.
//!
//! Transitions here are pure: they build the next state and stamp the decision
//! metadata, but persist nothing and run no effects. The engine owns ordering,
//! guards and the write/effect critical section.
//!
//! ```text
//! Request<Pending> ──approve()──> Request<Approved>
//!                  ──reject()───> Request<Rejected>   (reason required)
//!                  ──cancel()───> Request<Cancelled>  (submitter, no reviewer)
//!                  ──confirm()──> Request<Confirmed>  (payment confirmations)
//! ```
//!
//! Every terminal state is absorbing; there are no methods on terminal types
//! that produce another state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{
    Action, AnyRequest, Approved, Cancelled, Confirmed, Pending, Rejected, Request, RequestData,
    RequestId, RequestKind,
};
use crate::domain::actor::ActorId;
use crate::domain::subject::{RequestPayload, Subject};
use crate::error::{Result, TurnstileError};

/// Input for submitting a new request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequest {
    pub kind: RequestKind,
    pub submitted_by: ActorId,
    pub subject: Subject,
    pub payload: RequestPayload,
}

/// A decision taken by an actor on a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub actor: ActorId,
    #[serde(default)]
    pub review_note: Option<String>,
}

impl Decision {
    pub fn new(action: Action, actor: ActorId) -> Self {
        Self {
            action,
            actor,
            review_note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.review_note = Some(note.into());
        self
    }

    /// The review note with surrounding whitespace removed; blank notes count as absent.
    pub fn note(&self) -> Option<&str> {
        self.review_note
            .as_deref()
            .map(str::trim)
            .filter(|note| !note.is_empty())
    }
}

impl NewRequest {
    /// Check the payload agrees with the declared kind and subject.
    pub fn validate(&self) -> Result<()> {
        if self.payload.kind() != self.kind {
            return Err(TurnstileError::Validation(format!(
                "payload of kind '{}' submitted as '{}'",
                self.payload.kind(),
                self.kind
            )));
        }
        if self.payload.expected_subject() != self.subject {
            return Err(TurnstileError::Validation(format!(
                "subject {:?} does not match {} payload",
                self.subject, self.kind
            )));
        }
        if let RequestPayload::CollaborationRequest {
            instructor_id,
            message,
            ..
        } = &self.payload
        {
            if *instructor_id == self.submitted_by {
                return Err(TurnstileError::Validation(
                    "a collaboration request cannot be addressed to its sender".into(),
                ));
            }
            if message.trim().is_empty() {
                return Err(TurnstileError::Validation(
                    "collaboration request message is empty".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Request<Pending> {
    /// Build a freshly submitted request.
    pub fn submit(input: NewRequest, now: DateTime<Utc>) -> Result<Self> {
        input.validate()?;
        Ok(Request {
            state: Pending {},
            data: RequestData {
                id: RequestId::new(),
                kind: input.kind,
                submitted_by: input.submitted_by,
                subject: input.subject,
                payload: input.payload,
                created_at: now,
                updated_at: now,
            },
        })
    }

    pub fn approve(
        self,
        reviewer: ActorId,
        review_note: Option<String>,
        now: DateTime<Utc>,
    ) -> Request<Approved> {
        Request {
            data: self.data.touched(now),
            state: Approved {
                reviewed_by: reviewer,
                review_note,
                decided_at: now,
            },
        }
    }

    pub fn reject(
        self,
        reviewer: ActorId,
        review_note: String,
        now: DateTime<Utc>,
    ) -> Request<Rejected> {
        Request {
            data: self.data.touched(now),
            state: Rejected {
                reviewed_by: reviewer,
                review_note,
                decided_at: now,
            },
        }
    }

    pub fn cancel(self, now: DateTime<Utc>) -> Request<Cancelled> {
        Request {
            data: self.data.touched(now),
            state: Cancelled { decided_at: now },
        }
    }

    pub fn confirm(
        self,
        reviewer: ActorId,
        review_note: Option<String>,
        now: DateTime<Utc>,
    ) -> Request<Confirmed> {
        Request {
            data: self.data.touched(now),
            state: Confirmed {
                reviewed_by: reviewer,
                review_note,
                decided_at: now,
            },
        }
    }

    /// Apply a decision that already passed every guard.
    ///
    /// Fails only when a rejection carries no reason.
    pub fn decide(self, decision: &Decision, now: DateTime<Utc>) -> Result<AnyRequest> {
        let note = decision.note().map(str::to_owned);
        let decided = match decision.action {
            Action::Approve => self.approve(decision.actor, note, now).into(),
            Action::Confirm => self.confirm(decision.actor, note, now).into(),
            Action::Cancel => self.cancel(now).into(),
            Action::Reject => {
                let note = note.ok_or_else(|| {
                    TurnstileError::PreconditionFailed("rejection requires a review note".into())
                })?;
                self.reject(decision.actor, note, now).into()
            }
        };
        Ok(decided)
    }
}

impl RequestData {
    fn touched(mut self, now: DateTime<Utc>) -> Self {
        self.updated_at = now;
        self
    }
}
