//! Effect handlers: the domain mutations each terminal state triggers.
//!
//! Handlers mutate collaborator state and return the notifications that
//! should follow; they never create notifications themselves. Each handler
//! must be safe to run more than once for the same request, because a request
//! whose effect was interrupted is rolled forward by running it again.
//!
//! A handler that makes more than one mutation records how to reverse each
//! completed one in the [`UndoLog`]. If a later step fails, the engine replays
//! the log before restoring the pending request, so a failed decision leaves
//! no partial effect behind. Handlers do their reads before their last
//! mutation, so a single-mutation handler never needs an undo entry.

use async_trait::async_trait;
use chrono::Duration;

use crate::collaborators::{
    Collaborators, MembershipActivation, VerificationStatus, VerifiedInstructor,
};
use crate::domain::{ActorId, GymId, NotificationIntent, NotificationType, RequestPayload, Role};
use crate::error::{Result, TurnstileError};
use crate::request::{AnyRequest, RequestKind};

/// What handlers can reach.
#[derive(Clone)]
pub struct EffectContext {
    pub collaborators: Collaborators,
    pub payment_cycle_days: i64,
}

/// Reverses one completed collaborator mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    RestoreRole {
        actor: ActorId,
        role: Role,
    },
    RestoreVerification {
        gym: GymId,
        status: VerificationStatus,
    },
    /// `None` means no record existed before
    RestoreVerifiedInstructor {
        actor: ActorId,
        previous: Option<VerifiedInstructor>,
    },
}

/// Undo entries for the mutations a handler run has completed, oldest first.
#[derive(Debug, Default)]
pub struct UndoLog {
    steps: Vec<Undo>,
}

impl UndoLog {
    pub fn record(&mut self, undo: Undo) {
        self.steps.push(undo);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Undo] {
        &self.steps
    }

    /// Reverse the recorded mutations, newest first. Stops at the first
    /// failure; the caller must then treat the effect as still in flight.
    pub async fn compensate(self, collaborators: &Collaborators) -> Result<()> {
        for undo in self.steps.into_iter().rev() {
            tracing::debug!(?undo, "Compensating effect step");
            match undo {
                Undo::RestoreRole { actor, role } => {
                    collaborators.identity.set_role(actor, role).await?;
                }
                Undo::RestoreVerification { gym, status } => {
                    collaborators.gyms.set_verification_status(gym, status).await?;
                }
                Undo::RestoreVerifiedInstructor { actor, previous } => match previous {
                    Some(record) => {
                        collaborators
                            .instructors
                            .upsert_verified_instructor(record)
                            .await?;
                    }
                    None => {
                        collaborators
                            .instructors
                            .remove_verified_instructor(actor)
                            .await?;
                    }
                },
            }
        }
        Ok(())
    }
}

/// Side effect for one `(kind, terminal state)` pair.
#[async_trait]
pub trait EffectHandler: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Apply the effect for a decided request and report who must be told.
    ///
    /// Every mutation that succeeds before a later step could still fail must
    /// be recorded in `undo`.
    async fn apply(
        &self,
        request: &AnyRequest,
        ctx: &EffectContext,
        undo: &mut UndoLog,
    ) -> Result<Vec<NotificationIntent>>;
}

fn unexpected_payload(handler: &str, request: &AnyRequest) -> TurnstileError {
    TurnstileError::Validation(format!(
        "{handler} cannot handle {} request {}",
        request.kind(),
        request.id()
    ))
}

/// Raise an actor's role, never lowering it. Re-running is a no-op.
async fn promote(
    collaborators: &Collaborators,
    actor: ActorId,
    role: Role,
    undo: &mut UndoLog,
) -> Result<()> {
    let current = collaborators.identity.get_actor(actor).await?;
    if current.role.rank() >= role.rank() {
        tracing::debug!(actor = %actor, current = %current.role, target = %role, "Role promotion skipped");
        return Ok(());
    }
    collaborators.identity.set_role(actor, role).await?;
    undo.record(Undo::RestoreRole {
        actor,
        role: current.role,
    });
    Ok(())
}

/// Terminal states without domain effects (cancellation).
pub struct NoEffect;

#[async_trait]
impl EffectHandler for NoEffect {
    fn name(&self) -> &'static str {
        "no_effect"
    }

    async fn apply(
        &self,
        _: &AnyRequest,
        _: &EffectContext,
        _: &mut UndoLog,
    ) -> Result<Vec<NotificationIntent>> {
        Ok(Vec::new())
    }
}

/// `gym_registration → approved`: the submitter becomes a gym owner and the gym is verified.
pub struct GymRegistrationApproved;

#[async_trait]
impl EffectHandler for GymRegistrationApproved {
    fn name(&self) -> &'static str {
        "gym_registration_approved"
    }

    async fn apply(
        &self,
        request: &AnyRequest,
        ctx: &EffectContext,
        undo: &mut UndoLog,
    ) -> Result<Vec<NotificationIntent>> {
        let RequestPayload::GymRegistration { gym_id, gym_name } = &request.data().payload else {
            return Err(unexpected_payload(self.name(), request));
        };
        let owner = request.data().submitted_by;
        let gym = ctx.collaborators.gyms.get_gym(*gym_id).await?;

        promote(&ctx.collaborators, owner, Role::GymOwner, undo).await?;
        if gym.verification_status != VerificationStatus::Verified {
            ctx.collaborators
                .gyms
                .set_verification_status(*gym_id, VerificationStatus::Verified)
                .await?;
            undo.record(Undo::RestoreVerification {
                gym: *gym_id,
                status: gym.verification_status,
            });
        }

        let mut intent = NotificationIntent::new(
            owner,
            NotificationType::GymRegistrationApproved,
            "Gym registration approved",
            format!("{gym_name} is now verified and visible to members."),
        );
        if let Some(reviewer) = request.reviewed_by() {
            intent = intent.from_sender(reviewer);
        }
        Ok(vec![intent])
    }
}

/// `instructor_application → approved`: the applicant becomes a verified instructor.
pub struct InstructorApplicationApproved;

#[async_trait]
impl EffectHandler for InstructorApplicationApproved {
    fn name(&self) -> &'static str {
        "instructor_application_approved"
    }

    async fn apply(
        &self,
        request: &AnyRequest,
        ctx: &EffectContext,
        undo: &mut UndoLog,
    ) -> Result<Vec<NotificationIntent>> {
        let RequestPayload::InstructorApplication {
            application_id,
            specialization,
        } = &request.data().payload
        else {
            return Err(unexpected_payload(self.name(), request));
        };
        let applicant = request.data().submitted_by;
        let verified_at = request
            .decided_at()
            .ok_or_else(|| unexpected_payload(self.name(), request))?;

        let previous = ctx
            .collaborators
            .instructors
            .get_verified_instructor(applicant)
            .await?;

        promote(&ctx.collaborators, applicant, Role::Instructor, undo).await?;
        ctx.collaborators
            .instructors
            .upsert_verified_instructor(VerifiedInstructor {
                actor: applicant,
                application_id: *application_id,
                specialization: specialization.clone(),
                verified_at,
            })
            .await?;
        undo.record(Undo::RestoreVerifiedInstructor {
            actor: applicant,
            previous,
        });

        let mut intent = NotificationIntent::new(
            applicant,
            NotificationType::InstructorApplicationApproved,
            "Instructor application approved",
            format!("You are now a verified {specialization} instructor."),
        );
        if let Some(reviewer) = request.reviewed_by() {
            intent = intent.from_sender(reviewer);
        }
        Ok(vec![intent])
    }
}

/// `collaboration_request → approved`: the instructor joins the gym's freelance roster.
pub struct CollaborationAccepted;

#[async_trait]
impl EffectHandler for CollaborationAccepted {
    fn name(&self) -> &'static str {
        "collaboration_accepted"
    }

    async fn apply(
        &self,
        request: &AnyRequest,
        ctx: &EffectContext,
        _undo: &mut UndoLog,
    ) -> Result<Vec<NotificationIntent>> {
        let RequestPayload::CollaborationRequest {
            gym_id,
            instructor_id,
            ..
        } = &request.data().payload
        else {
            return Err(unexpected_payload(self.name(), request));
        };

        let gym = ctx.collaborators.gyms.get_gym(*gym_id).await?;
        let instructor = ctx.collaborators.identity.get_actor(*instructor_id).await?;
        ctx.collaborators
            .gyms
            .add_freelance_instructor(*gym_id, *instructor_id)
            .await?;

        Ok(vec![
            NotificationIntent::new(
                gym.owner,
                NotificationType::CollaborationRequestAccepted,
                "Collaboration accepted",
                format!(
                    "{} accepted your invitation to teach at {}.",
                    instructor.display_name, gym.name
                ),
            )
            .from_sender(*instructor_id),
        ])
    }
}

/// `payment_confirmation → confirmed`: the membership becomes active and paid.
///
/// `next_payment_date` is `paid_at` plus the billing cycle, both taken from
/// the request so that re-running writes identical values.
pub struct PaymentConfirmed;

#[async_trait]
impl EffectHandler for PaymentConfirmed {
    fn name(&self) -> &'static str {
        "payment_confirmed"
    }

    async fn apply(
        &self,
        request: &AnyRequest,
        ctx: &EffectContext,
        _undo: &mut UndoLog,
    ) -> Result<Vec<NotificationIntent>> {
        let RequestPayload::PaymentConfirmation {
            gym_id,
            member_id,
            paid_at,
            ..
        } = &request.data().payload
        else {
            return Err(unexpected_payload(self.name(), request));
        };

        let next_payment_date = Duration::try_days(ctx.payment_cycle_days)
            .and_then(|cycle| paid_at.checked_add_signed(cycle))
            .ok_or_else(|| {
                TurnstileError::Validation(format!(
                    "next payment date after {paid_at} is out of range"
                ))
            })?;
        let activation = MembershipActivation {
            last_payment_date: *paid_at,
            next_payment_date,
        };
        let gym = ctx.collaborators.gyms.get_gym(*gym_id).await?;
        let member = ctx
            .collaborators
            .members
            .activate(*member_id, activation)
            .await?;

        let mut intent = NotificationIntent::new(
            member.actor,
            NotificationType::MembershipActivated,
            format!("Welcome to {}", gym.name),
            format!(
                "Your payment was confirmed and your membership is active. Next payment due {}.",
                activation.next_payment_date.format("%Y-%m-%d")
            ),
        );
        if let Some(reviewer) = request.reviewed_by() {
            intent = intent.from_sender(reviewer);
        }
        Ok(vec![intent])
    }
}

/// `any → rejected`: tell the submitter why. Gym registrations are also
/// marked rejected on the gym listing; nobody's role changes.
pub struct Rejection;

#[async_trait]
impl EffectHandler for Rejection {
    fn name(&self) -> &'static str {
        "rejection"
    }

    async fn apply(
        &self,
        request: &AnyRequest,
        ctx: &EffectContext,
        _undo: &mut UndoLog,
    ) -> Result<Vec<NotificationIntent>> {
        let reason = request
            .review_note()
            .ok_or_else(|| unexpected_payload(self.name(), request))?;

        if let RequestPayload::GymRegistration { gym_id, .. } = &request.data().payload {
            ctx.collaborators
                .gyms
                .set_verification_status(*gym_id, VerificationStatus::Rejected)
                .await?;
        }

        let (notification_type, title) = match request.kind() {
            RequestKind::GymRegistration => (
                NotificationType::GymRegistrationRejected,
                "Gym registration rejected",
            ),
            RequestKind::InstructorApplication => (
                NotificationType::InstructorApplicationRejected,
                "Instructor application rejected",
            ),
            RequestKind::CollaborationRequest => (
                NotificationType::CollaborationRequestRejected,
                "Collaboration declined",
            ),
            RequestKind::PaymentConfirmation => {
                (NotificationType::PaymentRejected, "Payment not confirmed")
            }
        };

        let mut intent = NotificationIntent::new(
            request.data().submitted_by,
            notification_type,
            title,
            reason,
        );
        if let Some(reviewer) = request.reviewed_by() {
            intent = intent.from_sender(reviewer);
        }
        Ok(vec![intent])
    }
}
