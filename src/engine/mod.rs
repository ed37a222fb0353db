//! The request state machine.
//!
//! `transition` is the only way a request leaves `pending`. For each request
//! id it runs as a critical section:
//!
//! 1. guards (existence, terminal, legal action, authority, preconditions)
//! 2. conditional write of the terminal state with [`EffectMarker::Pending`]
//! 3. the effect handler for `(kind, new state)`
//! 4. conditional write flipping the marker to [`EffectMarker::Settled`]
//!
//! If the handler fails, the mutations it completed are reversed from its
//! [`UndoLog`], step 2 is undone by a conditional write restoring the pending
//! request, and the caller gets `EffectFailed`. If the undo itself fails, the
//! marker stays `Pending` and the effect is finished forward instead. A
//! panicking handler counts as a failed one. If the process dies
//! between 2 and 4, the marker stays `Pending` and the request is rolled
//! forward by re-running the (idempotent) handler on its next access or by
//! [`RequestStateMachine::recover`]. Notifications are dispatched after the
//! critical section and never affect its outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use metrics::counter;

use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::domain::{ActorId, NotificationIntent};
use crate::error::{Result, TurnstileError};
use crate::notifications::NotificationDispatcher;
use crate::domain::Subject;
use crate::request::{
    Action, AnyRequest, Decision, NewRequest, Pending, Request, RequestId, RequestKind,
    RequestStatus,
};
use crate::storage::{EffectMarker, RequestFilter, RequestStore, StoredRequest};

pub mod effects;
mod locks;
pub mod registry;
mod submission;

use locks::KeyedLocks;

pub use effects::{EffectContext, EffectHandler, Undo, UndoLog};
pub use registry::{Authority, Precondition, Rule, TransitionRegistry};

/// How a successful `transition` call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Committed,
    Replayed,
}

/// Submits, decides and reads requests.
pub struct RequestStateMachine {
    store: Arc<dyn RequestStore>,
    registry: Arc<TransitionRegistry>,
    effects: EffectContext,
    dispatcher: NotificationDispatcher,
    /// Per-request critical sections
    locks: KeyedLocks<RequestId>,
    /// Serializes the duplicate-pending check with the insert, per duplicate key
    submissions: KeyedLocks<(RequestKind, Subject, ActorId)>,
}

impl RequestStateMachine {
    pub fn new(
        store: Arc<dyn RequestStore>,
        collaborators: Collaborators,
        dispatcher: NotificationDispatcher,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(TransitionRegistry::standard()),
            effects: EffectContext {
                collaborators,
                payment_cycle_days: config.payment_cycle_days,
            },
            dispatcher,
            locks: KeyedLocks::new(),
            submissions: KeyedLocks::new(),
        }
    }

    /// Replace the standard rules and handlers.
    pub fn with_registry(mut self, registry: TransitionRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn registry(&self) -> &TransitionRegistry {
        &self.registry
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.effects.collaborators
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    /// Open a new pending request.
    #[tracing::instrument(skip(self, input), fields(kind = %input.kind, submitted_by = %input.submitted_by), err)]
    pub async fn submit(&self, input: NewRequest) -> Result<AnyRequest> {
        input.validate()?;

        let key = (input.kind, input.subject, input.submitted_by);
        let stored = self
            .submissions
            .run(key, self.submit_locked(input))
            .await?;

        let request = stored.request;
        counter!("turnstile_requests_submitted_total", "kind" => request.kind().as_str())
            .increment(1);
        tracing::info!(request_id = %request.id(), "Request submitted");

        match submission::intents(&request, &self.effects.collaborators).await {
            Ok(intents) => {
                self.dispatcher.dispatch(intents).await;
            }
            Err(e) => {
                tracing::warn!(request_id = %request.id(), error = %e, "Could not build submission notices");
            }
        }
        Ok(request)
    }

    /// Apply a decision to a request.
    ///
    /// Repeating a decision that already took effect returns the decided
    /// request unchanged; any other call on a decided request fails with
    /// `InvalidTransition`.
    #[tracing::instrument(
        skip(self, decision),
        fields(request_id = %request_id, action = %decision.action, actor = %decision.actor),
        err
    )]
    pub async fn transition(&self, request_id: RequestId, decision: Decision) -> Result<AnyRequest> {
        let result = self
            .locks
            .run(request_id, self.transition_locked(request_id, &decision))
            .await;

        let kind = match &result {
            Ok((request, _, _)) => request.kind().as_str(),
            Err(_) => "unknown",
        };
        let outcome = match &result {
            Ok((_, Outcome::Committed, _)) => "committed",
            Ok((_, Outcome::Replayed, _)) => "replayed",
            Err(e) => error_label(e),
        };
        counter!(
            "turnstile_transitions_total",
            "kind" => kind,
            "action" => decision.action.as_str(),
            "outcome" => outcome
        )
        .increment(1);

        let (request, outcome, intents) = result?;
        if outcome == Outcome::Committed {
            tracing::info!(
                kind = %request.kind(),
                state = %request.status(),
                "Request decided"
            );
        }
        if !intents.is_empty() {
            self.dispatcher.dispatch(intents).await;
        }
        Ok(request)
    }

    /// Convenience wrapper building the [`Decision`].
    pub async fn decide(
        &self,
        request_id: RequestId,
        action: Action,
        actor: ActorId,
        review_note: Option<String>,
    ) -> Result<AnyRequest> {
        let decision = Decision {
            action,
            actor,
            review_note,
        };
        self.transition(request_id, decision).await
    }

    /// Fetch a request, finishing any interrupted effect first.
    #[tracing::instrument(skip(self), fields(request_id = %request_id))]
    pub async fn get(&self, request_id: RequestId) -> Result<AnyRequest> {
        let stored = self.store.get_request(request_id).await?;
        if !stored.needs_roll_forward() {
            return Ok(stored.request);
        }
        self.resume(request_id).await
    }

    /// Fetch a request on behalf of `viewer`.
    ///
    /// Visible to admins, the submitter, and whoever the registry lets decide
    /// it (the addressed instructor, the gym owner for payments). Everyone
    /// else, unknown actors included, gets `Forbidden`.
    #[tracing::instrument(skip(self), fields(request_id = %request_id, viewer = %viewer))]
    pub async fn get_as(&self, request_id: RequestId, viewer: ActorId) -> Result<AnyRequest> {
        let collaborators = &self.effects.collaborators;
        let actor = match collaborators.identity.get_actor(viewer).await {
            Ok(actor) => actor,
            Err(TurnstileError::NotFound(_)) => {
                return Err(TurnstileError::Forbidden(format!("unknown actor {viewer}")));
            }
            Err(e) => return Err(e),
        };
        let request = self.get(request_id).await?;
        if actor.is_admin() || request.data().submitted_by == viewer {
            return Ok(request);
        }
        for action in self.registry.legal_actions(request.kind()) {
            let Some(rule) = self.registry.rule(request.kind(), action) else {
                continue;
            };
            if registry::is_authorized(rule.authority, &request, &actor, collaborators).await? {
                return Ok(request);
            }
        }
        Err(TurnstileError::Forbidden(format!(
            "{viewer} may not view request {request_id}"
        )))
    }

    /// List requests matching `filter`, oldest first.
    pub async fn list(&self, filter: &RequestFilter) -> Result<Vec<AnyRequest>> {
        let stored = self.store.list_requests(filter).await?;
        Ok(stored.into_iter().map(|s| s.request).collect())
    }

    /// Roll forward every request left with an unfinished effect.
    ///
    /// Meant to run once at startup. Returns how many requests were settled;
    /// failures are logged and left for the next access.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        let unsettled = self.store.list_unsettled().await?;
        if unsettled.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = unsettled.len(), "Rolling forward unsettled requests");

        let mut settled = 0;
        for stored in unsettled {
            let id = stored.request.id();
            match self.resume(id).await {
                Ok(_) => settled += 1,
                Err(e) => {
                    tracing::error!(request_id = %id, error = %e, "Roll-forward failed");
                }
            }
        }
        Ok(settled)
    }

    async fn resume(&self, request_id: RequestId) -> Result<AnyRequest> {
        let result = self
            .locks
            .run(request_id, async {
                // Re-read: a concurrent caller may have settled it already
                let stored = self.store.get_request(request_id).await?;
                if stored.needs_roll_forward() {
                    self.roll_forward(stored).await
                } else {
                    Ok((stored, Vec::new()))
                }
            })
            .await;

        let (stored, intents) = result?;
        if !intents.is_empty() {
            self.dispatcher.dispatch(intents).await;
        }
        Ok(stored.request)
    }

    async fn submit_locked(&self, input: NewRequest) -> Result<StoredRequest> {
        submission::check(&input, &self.effects.collaborators).await?;

        let duplicates = RequestFilter {
            kind: Some(input.kind),
            status: Some(RequestStatus::Pending),
            submitted_by: Some(input.submitted_by),
            subject: Some(input.subject),
        };
        if !self.store.list_requests(&duplicates).await?.is_empty() {
            return Err(TurnstileError::PreconditionFailed(format!(
                "a pending {} request for this subject already exists",
                input.kind
            )));
        }

        let request = Request::<Pending>::submit(input, Utc::now())?;
        self.store.insert_request(request.into()).await
    }

    async fn transition_locked(
        &self,
        request_id: RequestId,
        decision: &Decision,
    ) -> Result<(AnyRequest, Outcome, Vec<NotificationIntent>)> {
        let mut stored = self.store.get_request(request_id).await?;
        let mut intents = Vec::new();
        if stored.needs_roll_forward() {
            let (settled, recovered) = self.roll_forward(stored).await?;
            stored = settled;
            intents = recovered;
        }

        let pending = match stored.request {
            AnyRequest::Pending(pending) => pending,
            decided => {
                return replay(decided, decision).map(|r| (r, Outcome::Replayed, intents));
            }
        };
        let request = AnyRequest::from(pending.clone());

        let rule = self
            .registry
            .rule(request.kind(), decision.action)
            .ok_or_else(|| invalid_transition(&request, decision.action))?;

        let actor = match self
            .effects
            .collaborators
            .identity
            .get_actor(decision.actor)
            .await
        {
            Ok(actor) => actor,
            Err(TurnstileError::NotFound(_)) => {
                return Err(TurnstileError::Forbidden(format!(
                    "unknown actor {}",
                    decision.actor
                )));
            }
            Err(e) => return Err(e),
        };
        if !registry::is_authorized(rule.authority, &request, &actor, &self.effects.collaborators)
            .await?
        {
            tracing::debug!(authority = ?rule.authority, role = %actor.role, "Authority check failed");
            return Err(TurnstileError::Forbidden(format!(
                "{} may not {} this {} request",
                actor.id,
                decision.action,
                request.kind()
            )));
        }
        for precondition in &rule.preconditions {
            registry::check_precondition(*precondition, &request, decision)?;
        }

        let decided = pending.decide(decision, Utc::now())?;

        let written = match self
            .store
            .update_request(stored.version, decided, EffectMarker::Pending)
            .await
        {
            Ok(written) => written,
            Err(TurnstileError::StaleWrite(_)) => {
                // Lost to a writer outside this process
                let current = self.store.get_request(request_id).await?;
                return replay(current.request, decision).map(|r| (r, Outcome::Replayed, intents));
            }
            Err(e) => return Err(e),
        };

        let mut undo = UndoLog::default();
        let intents = match self.apply_effect(&written, &mut undo).await {
            Ok(mut effect_intents) => {
                intents.append(&mut effect_intents);
                intents
            }
            Err(e) => {
                counter!("turnstile_effects_failed_total", "kind" => written.request.kind().as_str())
                    .increment(1);
                match undo.compensate(&self.effects.collaborators).await {
                    Ok(()) => self.roll_back(&written, request).await,
                    Err(undo_error) => {
                        // Partially applied and not undone: finish it forward instead
                        tracing::error!(
                            error = %undo_error,
                            "Compensation failed, request left for roll-forward"
                        );
                    }
                }
                return Err(TurnstileError::effect_failed(request_id, e));
            }
        };

        let settled = self.settle(written).await?;
        Ok((settled.request, Outcome::Committed, intents))
    }

    async fn apply_effect(
        &self,
        stored: &StoredRequest,
        undo: &mut UndoLog,
    ) -> Result<Vec<NotificationIntent>> {
        let request = &stored.request;
        let Some(handler) = self.registry.handler(request.kind(), request.status()) else {
            tracing::debug!(kind = %request.kind(), state = %request.status(), "No effect handler registered");
            return Ok(Vec::new());
        };
        tracing::debug!(handler = handler.name(), "Running effect handler");
        // A panicking handler must not leave the marker pending forever
        AssertUnwindSafe(handler.apply(request, &self.effects, undo))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(anyhow::anyhow!("effect handler {} panicked", handler.name()).into())
            })
    }

    /// Flip the write-ahead marker once the effect has run.
    async fn settle(&self, written: StoredRequest) -> Result<StoredRequest> {
        self.store
            .update_request(written.version, written.request, EffectMarker::Settled)
            .await
    }

    async fn roll_forward(
        &self,
        stored: StoredRequest,
    ) -> Result<(StoredRequest, Vec<NotificationIntent>)> {
        let request_id = stored.request.id();
        tracing::info!(request_id = %request_id, state = %stored.request.status(), "Rolling forward interrupted effect");

        let intents = self
            .apply_effect(&stored, &mut UndoLog::default())
            .await
            .map_err(|e| {
                counter!("turnstile_effects_failed_total", "kind" => stored.request.kind().as_str())
                    .increment(1);
                TurnstileError::effect_failed(request_id, e)
            })?;
        let settled = self.settle(stored).await?;
        Ok((settled, intents))
    }

    async fn roll_back(&self, written: &StoredRequest, original: AnyRequest) {
        let request_id = original.id();
        match self
            .store
            .update_request(written.version, original, EffectMarker::Settled)
            .await
        {
            Ok(_) => {
                tracing::warn!(request_id = %request_id, "Effect failed, transition rolled back");
            }
            Err(e) => {
                // The marker stays pending, so the next access rolls forward instead
                tracing::error!(
                    request_id = %request_id,
                    error = %e,
                    "Rollback write failed, request left for roll-forward"
                );
            }
        }
    }
}

/// Resolve a call against an already-decided request.
fn replay(request: AnyRequest, decision: &Decision) -> Result<AnyRequest> {
    if request.status() == decision.action.resulting_status()
        && request.decided_by() == Some(decision.actor)
    {
        tracing::debug!(request_id = %request.id(), "Replaying completed decision");
        return Ok(request);
    }
    Err(invalid_transition(&request, decision.action))
}

fn invalid_transition(request: &AnyRequest, action: Action) -> TurnstileError {
    TurnstileError::InvalidTransition {
        request_id: request.id(),
        state: request.status().to_string(),
        action: action.to_string(),
    }
}

fn error_label(error: &TurnstileError) -> &'static str {
    match error {
        TurnstileError::NotFound(_) => "not_found",
        TurnstileError::Forbidden(_) => "forbidden",
        TurnstileError::InvalidTransition { .. } => "invalid_transition",
        TurnstileError::PreconditionFailed(_) => "precondition_failed",
        TurnstileError::EffectFailed { .. } => "effect_failed",
        TurnstileError::Validation(_) => "validation",
        _ => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryDirectory, VerificationStatus};
    use crate::domain::{GymId, RequestPayload, Role, Subject};
    use crate::notifications::FeedEvents;
    use crate::request::RequestKind;
    use crate::storage::InMemoryStore;

    struct Fixture {
        engine: RequestStateMachine,
        store: Arc<InMemoryStore>,
        directory: Arc<InMemoryDirectory>,
        admin: ActorId,
        owner: ActorId,
        gym_id: GymId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let admin = directory.add_actor(Role::Admin, "Ada");
        let owner = directory.add_actor(Role::User, "Uma");
        let gym_id = directory.add_gym(owner, "Alpha", VerificationStatus::Pending);
        let config = EngineConfig::default();
        let dispatcher = NotificationDispatcher::new(
            store.clone(),
            directory.clone(),
            FeedEvents::new(16),
            config.dispatch.clone(),
        );
        let engine = RequestStateMachine::new(
            store.clone(),
            Collaborators::in_memory(directory.clone()),
            dispatcher,
            &config,
        );
        Fixture {
            engine,
            store,
            directory,
            admin,
            owner,
            gym_id,
        }
    }

    fn registration(f: &Fixture) -> NewRequest {
        NewRequest {
            kind: RequestKind::GymRegistration,
            submitted_by: f.owner,
            subject: Subject::Gym(f.gym_id),
            payload: RequestPayload::GymRegistration {
                gym_id: f.gym_id,
                gym_name: "Alpha".into(),
            },
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_guard_order_terminal_before_authority() {
        let f = fixture();
        let request = f.engine.submit(registration(&f)).await.unwrap();
        f.engine
            .decide(request.id(), Action::Approve, f.admin, None)
            .await
            .unwrap();

        // A stranger acting on a decided request sees the terminal state first
        let err = f
            .engine
            .decide(request.id(), Action::Reject, ActorId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidTransition { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn test_guard_order_authority_before_precondition() {
        let f = fixture();
        let request = f.engine.submit(registration(&f)).await.unwrap();

        // Owner rejecting their own registration without a note: authority fails first
        let err = f
            .engine
            .decide(request.id(), Action::Reject, f.owner, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnstileError::Forbidden(_)));

        let err = f
            .engine
            .decide(request.id(), Action::Reject, f.admin, Some("  ".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnstileError::PreconditionFailed(_)));

        let err = f
            .engine
            .decide(request.id(), Action::Confirm, f.admin, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidTransition { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_actor_is_forbidden() {
        let f = fixture();
        let request = f.engine.submit(registration(&f)).await.unwrap();
        let err = f
            .engine
            .decide(request.id(), Action::Approve, ActorId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnstileError::Forbidden(_)));
    }

    #[test_log::test(tokio::test)]
    async fn test_duplicate_pending_submission_rejected() {
        let f = fixture();
        f.engine.submit(registration(&f)).await.unwrap();
        let err = f.engine.submit(registration(&f)).await.unwrap_err();
        assert!(matches!(err, TurnstileError::PreconditionFailed(_)));
    }

    #[test_log::test(tokio::test)]
    async fn test_effect_failure_rolls_back_and_retry_succeeds() {
        let f = fixture();
        let request = f.engine.submit(registration(&f)).await.unwrap();

        f.directory.fail_mutations(true);
        let err = f
            .engine
            .decide(request.id(), Action::Approve, f.admin, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnstileError::EffectFailed { .. }));
        assert!(err.is_retryable());

        let stored = f.store.get_request(request.id()).await.unwrap();
        assert_eq!(stored.request.status(), RequestStatus::Pending);
        assert_eq!(stored.effects, EffectMarker::Settled);
        assert_eq!(stored.request.decided_at(), None);

        f.directory.fail_mutations(false);
        let decided = f
            .engine
            .decide(request.id(), Action::Approve, f.admin, None)
            .await
            .unwrap();
        assert_eq!(decided.status(), RequestStatus::Approved);
        assert!(f.engine.locks.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_get_rolls_forward_unsettled_request() {
        let f = fixture();
        let request = f.engine.submit(registration(&f)).await.unwrap();

        // Simulate a crash after the terminal write
        let stored = f.store.get_request(request.id()).await.unwrap();
        let decided = stored
            .request
            .clone()
            .into_pending()
            .unwrap()
            .decide(&Decision::new(Action::Approve, f.admin), Utc::now())
            .unwrap();
        f.store
            .update_request(stored.version, decided, EffectMarker::Pending)
            .await
            .unwrap();

        let fetched = f.engine.get(request.id()).await.unwrap();
        assert_eq!(fetched.status(), RequestStatus::Approved);
        let stored = f.store.get_request(request.id()).await.unwrap();
        assert_eq!(stored.effects, EffectMarker::Settled);
        assert!(
            f.directory
                .calls()
                .iter()
                .any(|call| call.starts_with("set_verification_status"))
        );
    }

    struct Exploding;

    #[async_trait::async_trait]
    impl EffectHandler for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        async fn apply(
            &self,
            _: &AnyRequest,
            _: &EffectContext,
            _: &mut UndoLog,
        ) -> Result<Vec<NotificationIntent>> {
            panic!("handler bug")
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_panicking_handler_is_rolled_back_not_stuck() {
        let f = fixture();
        let mut registry = TransitionRegistry::standard();
        registry.add_handler(
            RequestKind::GymRegistration,
            RequestStatus::Approved,
            Arc::new(Exploding),
        );
        let input = registration(&f);
        let Fixture {
            engine,
            store,
            admin,
            ..
        } = f;
        let engine = engine.with_registry(registry);
        let request = engine.submit(input).await.unwrap();

        let err = engine
            .decide(request.id(), Action::Approve, admin, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnstileError::EffectFailed { .. }));

        let stored = store.get_request(request.id()).await.unwrap();
        assert_eq!(stored.request.status(), RequestStatus::Pending);
        assert_eq!(stored.effects, EffectMarker::Settled);
        assert_eq!(
            engine.get(request.id()).await.unwrap().status(),
            RequestStatus::Pending
        );
        assert!(engine.locks.is_empty());
    }
}
