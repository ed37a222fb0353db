//! Declarative transition rules.
//!
//! One table answers "may this actor take this action on this kind of
//! request" and another answers "what happens when a request of this kind
//! lands in this state". Both are plain data so they can be tested without a
//! store or transport.

use std::collections::HashMap;
use std::sync::Arc;

use super::effects::{
    CollaborationAccepted, EffectHandler, GymRegistrationApproved, InstructorApplicationApproved,
    NoEffect, PaymentConfirmed, Rejection,
};
use crate::collaborators::Collaborators;
use crate::domain::{Actor, PaymentMethod, RequestPayload};
use crate::error::{Result, TurnstileError};
use crate::request::{Action, AnyRequest, Decision, RequestKind, RequestStatus};

/// Who may take an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// Actors holding the admin role
    PlatformAdmin,
    /// The actor that submitted the request
    Submitter,
    /// The instructor a collaboration request is addressed to
    AddressedInstructor,
    /// The owner of the gym named in the payload
    GymOwner,
}

/// Kind-specific guard evaluated after authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// The decision carries a non-blank review note
    ReviewNoteRequired,
    /// The payment being confirmed was made offline
    ManualPaymentMethod,
}

/// What is required to take `action` on a request of some kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub authority: Authority,
    pub preconditions: Vec<Precondition>,
}

impl Rule {
    fn new(authority: Authority) -> Self {
        Self {
            authority,
            preconditions: Vec::new(),
        }
    }

    fn requires(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }
}

/// Registry of legal actions and effect handlers per request kind.
#[derive(Clone)]
pub struct TransitionRegistry {
    rules: HashMap<(RequestKind, Action), Rule>,
    handlers: HashMap<(RequestKind, RequestStatus), Arc<dyn EffectHandler>>,
}

impl Default for TransitionRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl TransitionRegistry {
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// The rules and handlers for the four built-in request kinds.
    pub fn standard() -> Self {
        use RequestKind::*;

        let mut registry = Self::empty();
        let reject = |authority| Rule::new(authority).requires(Precondition::ReviewNoteRequired);

        for kind in RequestKind::ALL {
            registry.add_rule(kind, Action::Cancel, Rule::new(Authority::Submitter));
            registry.add_handler(kind, RequestStatus::Cancelled, Arc::new(NoEffect));
            registry.add_handler(kind, RequestStatus::Rejected, Arc::new(Rejection));
        }

        registry.add_rule(GymRegistration, Action::Approve, Rule::new(Authority::PlatformAdmin));
        registry.add_rule(GymRegistration, Action::Reject, reject(Authority::PlatformAdmin));
        registry.add_handler(
            GymRegistration,
            RequestStatus::Approved,
            Arc::new(GymRegistrationApproved),
        );

        registry.add_rule(
            InstructorApplication,
            Action::Approve,
            Rule::new(Authority::PlatformAdmin),
        );
        registry.add_rule(InstructorApplication, Action::Reject, reject(Authority::PlatformAdmin));
        registry.add_handler(
            InstructorApplication,
            RequestStatus::Approved,
            Arc::new(InstructorApplicationApproved),
        );

        registry.add_rule(
            CollaborationRequest,
            Action::Approve,
            Rule::new(Authority::AddressedInstructor),
        );
        registry.add_rule(
            CollaborationRequest,
            Action::Reject,
            reject(Authority::AddressedInstructor),
        );
        registry.add_handler(
            CollaborationRequest,
            RequestStatus::Approved,
            Arc::new(CollaborationAccepted),
        );

        registry.add_rule(
            PaymentConfirmation,
            Action::Confirm,
            Rule::new(Authority::GymOwner).requires(Precondition::ManualPaymentMethod),
        );
        registry.add_rule(PaymentConfirmation, Action::Reject, reject(Authority::GymOwner));
        registry.add_handler(
            PaymentConfirmation,
            RequestStatus::Confirmed,
            Arc::new(PaymentConfirmed),
        );

        registry
    }

    pub fn add_rule(&mut self, kind: RequestKind, action: Action, rule: Rule) {
        self.rules.insert((kind, action), rule);
    }

    pub fn add_handler(
        &mut self,
        kind: RequestKind,
        status: RequestStatus,
        handler: Arc<dyn EffectHandler>,
    ) {
        self.handlers.insert((kind, status), handler);
    }

    /// The rule for `(kind, action)`, or `None` when the action is not legal for the kind.
    pub fn rule(&self, kind: RequestKind, action: Action) -> Option<&Rule> {
        self.rules.get(&(kind, action))
    }

    pub fn handler(&self, kind: RequestKind, status: RequestStatus) -> Option<Arc<dyn EffectHandler>> {
        self.handlers.get(&(kind, status)).cloned()
    }

    pub fn legal_actions(&self, kind: RequestKind) -> Vec<Action> {
        let mut actions: Vec<Action> = self
            .rules
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, action)| *action)
            .collect();
        actions.sort_by_key(|action| action.as_str());
        actions
    }
}

/// Whether `actor` holds `authority` over `request`.
pub async fn is_authorized(
    authority: Authority,
    request: &AnyRequest,
    actor: &Actor,
    collaborators: &Collaborators,
) -> Result<bool> {
    let data = request.data();
    let authorized = match authority {
        Authority::PlatformAdmin => actor.is_admin(),
        Authority::Submitter => actor.id == data.submitted_by,
        Authority::AddressedInstructor => match &data.payload {
            RequestPayload::CollaborationRequest { instructor_id, .. } => {
                actor.id == *instructor_id
            }
            _ => false,
        },
        Authority::GymOwner => match data.payload.gym_id() {
            Some(gym_id) => collaborators.gyms.get_gym(gym_id).await?.owner == actor.id,
            None => false,
        },
    };
    Ok(authorized)
}

/// Evaluate a precondition, failing with `PreconditionFailed`.
pub fn check_precondition(
    precondition: Precondition,
    request: &AnyRequest,
    decision: &Decision,
) -> Result<()> {
    match precondition {
        Precondition::ReviewNoteRequired => {
            if decision.note().is_none() {
                return Err(TurnstileError::PreconditionFailed(format!(
                    "{} requires a review note",
                    decision.action
                )));
            }
        }
        Precondition::ManualPaymentMethod => match &request.data().payload {
            RequestPayload::PaymentConfirmation {
                payment_method: PaymentMethod::Manual,
                ..
            } => {}
            RequestPayload::PaymentConfirmation { payment_method, .. } => {
                return Err(TurnstileError::PreconditionFailed(format!(
                    "only manual payments can be confirmed, got {payment_method:?}"
                )));
            }
            _ => {
                return Err(TurnstileError::PreconditionFailed(
                    "request carries no payment".into(),
                ));
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryDirectory, VerificationStatus};
    use crate::domain::{ActorId, GymId, MemberId, Role, Subject};
    use crate::request::{NewRequest, Pending, Request};
    use chrono::Utc;

    fn actor(id: ActorId, role: Role) -> Actor {
        Actor {
            id,
            role,
            display_name: "someone".into(),
        }
    }

    fn payment(gym_id: GymId, method: PaymentMethod) -> AnyRequest {
        let member_id = MemberId::new();
        Request::<Pending>::submit(
            NewRequest {
                kind: RequestKind::PaymentConfirmation,
                submitted_by: ActorId::new(),
                subject: Subject::Member(member_id),
                payload: RequestPayload::PaymentConfirmation {
                    gym_id,
                    member_id,
                    payment_method: method,
                    amount_cents: 4_500,
                    paid_at: Utc::now(),
                },
            },
            Utc::now(),
        )
        .unwrap()
        .into()
    }

    #[test]
    fn test_legal_actions_per_kind() {
        let registry = TransitionRegistry::standard();
        assert_eq!(
            registry.legal_actions(RequestKind::PaymentConfirmation),
            vec![Action::Cancel, Action::Confirm, Action::Reject]
        );
        assert_eq!(
            registry.legal_actions(RequestKind::GymRegistration),
            vec![Action::Approve, Action::Cancel, Action::Reject]
        );
        assert!(registry.rule(RequestKind::GymRegistration, Action::Confirm).is_none());
    }

    #[test]
    fn test_every_reachable_state_has_a_handler() {
        let registry = TransitionRegistry::standard();
        for kind in RequestKind::ALL {
            for action in registry.legal_actions(kind) {
                assert!(
                    registry.handler(kind, action.resulting_status()).is_some(),
                    "missing handler for {kind} -> {}",
                    action.resulting_status()
                );
            }
        }
    }

    #[test]
    fn test_rejections_require_a_note() {
        let registry = TransitionRegistry::standard();
        for kind in RequestKind::ALL {
            let rule = registry.rule(kind, Action::Reject).unwrap();
            assert!(rule.preconditions.contains(&Precondition::ReviewNoteRequired));
        }
    }

    #[tokio::test]
    async fn test_gym_owner_authority_resolves_through_directory() {
        let directory = std::sync::Arc::new(InMemoryDirectory::new());
        let owner = directory.add_actor(Role::GymOwner, "Dana");
        let gym_id = directory.add_gym(owner, "Alpha", VerificationStatus::Verified);
        let collaborators = Collaborators::in_memory(directory);
        let request = payment(gym_id, PaymentMethod::Manual);

        assert!(
            is_authorized(
                Authority::GymOwner,
                &request,
                &actor(owner, Role::GymOwner),
                &collaborators
            )
            .await
            .unwrap()
        );
        assert!(
            !is_authorized(
                Authority::GymOwner,
                &request,
                &actor(ActorId::new(), Role::Admin),
                &collaborators
            )
            .await
            .unwrap()
        );
    }

    #[test]
    fn test_card_payments_cannot_be_confirmed() {
        let request = payment(GymId::new(), PaymentMethod::Card);
        let decision = Decision::new(Action::Confirm, ActorId::new());
        let err = check_precondition(Precondition::ManualPaymentMethod, &request, &decision)
            .unwrap_err();
        assert!(matches!(err, TurnstileError::PreconditionFailed(_)));
    }
}
