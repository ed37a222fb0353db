//! Submission-time checks against collaborator state and the notices a new
//! request sends.

use chrono::{Duration, Utc};

use crate::collaborators::Collaborators;
use crate::domain::{NotificationIntent, NotificationType, RequestPayload};
use crate::error::{Result, TurnstileError};
use crate::request::{AnyRequest, NewRequest};

/// How far ahead of the server clock a reported payment time may be.
const PAYMENT_CLOCK_SKEW_MINUTES: i64 = 5;

/// Check the submitter may open this request against the current domain state.
///
/// Shape checks (`NewRequest::validate`) have already passed.
pub(super) async fn check(input: &NewRequest, collaborators: &Collaborators) -> Result<()> {
    collaborators.identity.get_actor(input.submitted_by).await?;

    match &input.payload {
        RequestPayload::GymRegistration { gym_id, .. } => {
            let gym = collaborators.gyms.get_gym(*gym_id).await?;
            if gym.owner != input.submitted_by {
                return Err(TurnstileError::Forbidden(format!(
                    "gym {gym_id} is registered to another actor"
                )));
            }
        }
        RequestPayload::InstructorApplication { .. } => {
            if collaborators
                .instructors
                .get_verified_instructor(input.submitted_by)
                .await?
                .is_some()
            {
                return Err(TurnstileError::PreconditionFailed(format!(
                    "{} is already a verified instructor",
                    input.submitted_by
                )));
            }
        }
        RequestPayload::CollaborationRequest {
            gym_id,
            instructor_id,
            ..
        } => {
            let gym = collaborators.gyms.get_gym(*gym_id).await?;
            if gym.owner != input.submitted_by {
                return Err(TurnstileError::Forbidden(format!(
                    "only the owner of gym {gym_id} can invite instructors"
                )));
            }
            collaborators.identity.get_actor(*instructor_id).await?;
            if gym.freelance_instructors.contains(instructor_id) {
                return Err(TurnstileError::PreconditionFailed(format!(
                    "instructor {instructor_id} already collaborates with {}",
                    gym.name
                )));
            }
        }
        RequestPayload::PaymentConfirmation {
            gym_id,
            member_id,
            paid_at,
            ..
        } => {
            if *paid_at > Utc::now() + Duration::minutes(PAYMENT_CLOCK_SKEW_MINUTES) {
                return Err(TurnstileError::Validation(format!(
                    "paidAt {paid_at} lies in the future"
                )));
            }
            let member = collaborators.members.get_member(*member_id).await?;
            if member.actor != input.submitted_by {
                return Err(TurnstileError::Forbidden(format!(
                    "member {member_id} belongs to another actor"
                )));
            }
            if member.gym_id != *gym_id {
                return Err(TurnstileError::Validation(format!(
                    "member {member_id} is not registered at gym {gym_id}"
                )));
            }
        }
    }
    Ok(())
}

/// Notices sent when a request is opened. Only requests addressed to a
/// specific reviewer announce themselves.
pub(super) async fn intents(
    request: &AnyRequest,
    collaborators: &Collaborators,
) -> Result<Vec<NotificationIntent>> {
    let data = request.data();
    let intents = match &data.payload {
        RequestPayload::CollaborationRequest {
            gym_id,
            instructor_id,
            message,
        } => {
            let gym = collaborators.gyms.get_gym(*gym_id).await?;
            vec![
                NotificationIntent::new(
                    *instructor_id,
                    NotificationType::CollaborationRequestReceived,
                    format!("{} wants to work with you", gym.name),
                    message.clone(),
                )
                .from_sender(data.submitted_by),
            ]
        }
        RequestPayload::PaymentConfirmation {
            gym_id,
            amount_cents,
            ..
        } => {
            let gym = collaborators.gyms.get_gym(*gym_id).await?;
            let member = collaborators.identity.get_actor(data.submitted_by).await?;
            vec![
                NotificationIntent::new(
                    gym.owner,
                    NotificationType::PaymentConfirmationRequested,
                    "Payment awaiting confirmation",
                    format!(
                        "{} reported a payment of {}.{:02} for {}.",
                        member.display_name,
                        amount_cents / 100,
                        amount_cents % 100,
                        gym.name
                    ),
                )
                .from_sender(data.submitted_by),
            ]
        }
        RequestPayload::GymRegistration { .. } | RequestPayload::InstructorApplication { .. } => {
            Vec::new()
        }
    };
    Ok(intents)
}
