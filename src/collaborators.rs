//! Contracts for the external collaborators effect handlers mutate.
//!
//! Identity and the gym/member/instructor stores live outside this crate. The
//! traits below are the calls the engine makes on them. Every mutating call
//! must be idempotent: a request whose effect was interrupted is rolled forward
//! by running its handler again.
//!
//! [`InMemoryDirectory`] implements all of them in-process with call recording
//! and fault injection, for tests and embedders without a backing service.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::{Actor, ActorId, ApplicationId, GymId, MemberId, PaymentMethod, Role};
use crate::error::{Result, TurnstileError};

/// Verification state of a gym listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gym {
    pub id: GymId,
    pub name: String,
    pub owner: ActorId,
    pub verification_status: VerificationStatus,
    /// Instructors collaborating with this gym
    pub freelance_instructors: BTreeSet<ActorId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Inactive,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub last_payment_date: Option<DateTime<Utc>>,
    pub next_payment_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub actor: ActorId,
    pub gym_id: GymId,
    pub status: MemberStatus,
    pub payment_details: PaymentDetails,
}

/// Values written when a membership payment is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipActivation {
    pub last_payment_date: DateTime<Utc>,
    pub next_payment_date: DateTime<Utc>,
}

/// Record created when an instructor application is approved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedInstructor {
    pub actor: ActorId,
    pub application_id: ApplicationId,
    pub specialization: String,
    pub verified_at: DateTime<Utc>,
}

/// Identity/actor service.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Fails with `NotFound` for unknown actors.
    async fn get_actor(&self, id: ActorId) -> Result<Actor>;

    async fn set_role(&self, id: ActorId, role: Role) -> Result<()>;
}

#[async_trait]
pub trait GymDirectory: Send + Sync {
    async fn get_gym(&self, id: GymId) -> Result<Gym>;

    async fn set_verification_status(&self, id: GymId, status: VerificationStatus) -> Result<()>;

    /// Add an instructor to the gym's freelance roster. Adding twice is a no-op.
    async fn add_freelance_instructor(&self, id: GymId, instructor: ActorId) -> Result<()>;

    async fn freelance_instructors(&self, id: GymId) -> Result<Vec<ActorId>>;

    /// Verified gyms an instructor could still collaborate with: excludes
    /// gyms whose roster already contains the instructor.
    async fn gyms_for_instructor(&self, instructor: ActorId) -> Result<Vec<Gym>>;
}

#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn get_member(&self, id: MemberId) -> Result<Member>;

    /// Set `status = active`, `payment_status = paid` and the payment dates.
    async fn activate(&self, id: MemberId, activation: MembershipActivation) -> Result<Member>;
}

#[async_trait]
pub trait InstructorDirectory: Send + Sync {
    /// Create or overwrite the verified-instructor record for `record.actor`.
    async fn upsert_verified_instructor(&self, record: VerifiedInstructor) -> Result<()>;

    async fn get_verified_instructor(&self, actor: ActorId) -> Result<Option<VerifiedInstructor>>;

    /// Drop the verified-instructor record. Removing a missing record is a no-op.
    async fn remove_verified_instructor(&self, actor: ActorId) -> Result<()>;
}

/// The collaborator handles effect handlers and guards work against.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityService>,
    pub gyms: Arc<dyn GymDirectory>,
    pub members: Arc<dyn MemberDirectory>,
    pub instructors: Arc<dyn InstructorDirectory>,
}

impl Collaborators {
    /// Use one in-process directory for every collaborator.
    pub fn in_memory(directory: Arc<InMemoryDirectory>) -> Self {
        Self {
            identity: directory.clone(),
            gyms: directory.clone(),
            members: directory.clone(),
            instructors: directory,
        }
    }
}

// ============================================================================
// In-process implementation
// ============================================================================

#[derive(Default)]
struct DirectoryState {
    actors: HashMap<ActorId, Actor>,
    gyms: HashMap<GymId, Gym>,
    members: HashMap<MemberId, Member>,
    instructors: HashMap<ActorId, VerifiedInstructor>,
}

/// In-process directory implementing every collaborator trait.
///
/// Records each mutating call and can be told to fail mutations, either all
/// of them or only calls with a given name, which is how effect rollback and
/// compensation are exercised.
///
/// # Example
/// ```ignore
/// let directory = Arc::new(InMemoryDirectory::new());
/// let owner = directory.add_actor(Role::User, "Dana");
/// let gym = directory.add_gym(owner, "Iron Temple", VerificationStatus::Pending);
/// directory.fail_call("set_verification_status");
/// ```
#[derive(Default)]
pub struct InMemoryDirectory {
    state: Mutex<DirectoryState>,
    calls: Mutex<Vec<String>>,
    failing: AtomicBool,
    failing_calls: Mutex<HashSet<String>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_actor(&self, role: Role, display_name: &str) -> ActorId {
        let id = ActorId::new();
        self.state.lock().actors.insert(
            id,
            Actor {
                id,
                role,
                display_name: display_name.to_string(),
            },
        );
        id
    }

    pub fn add_gym(&self, owner: ActorId, name: &str, status: VerificationStatus) -> GymId {
        let id = GymId::new();
        self.state.lock().gyms.insert(
            id,
            Gym {
                id,
                name: name.to_string(),
                owner,
                verification_status: status,
                freelance_instructors: BTreeSet::new(),
            },
        );
        id
    }

    /// Register an inactive member awaiting payment.
    pub fn add_member(&self, actor: ActorId, gym_id: GymId, method: PaymentMethod) -> MemberId {
        let id = MemberId::new();
        self.state.lock().members.insert(
            id,
            Member {
                id,
                actor,
                gym_id,
                status: MemberStatus::Inactive,
                payment_details: PaymentDetails {
                    payment_method: method,
                    payment_status: PaymentStatus::Pending,
                    last_payment_date: None,
                    next_payment_date: None,
                },
            },
        );
        id
    }

    /// While set, every mutating call fails.
    pub fn fail_mutations(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail every later mutation named `name` (e.g. `"set_role"`) until
    /// [`InMemoryDirectory::clear_failures`].
    pub fn fail_call(&self, name: &str) {
        self.failing_calls.lock().insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.store(false, Ordering::SeqCst);
        self.failing_calls.lock().clear();
    }

    /// Mutating calls made so far, e.g. `"set_role <actor> gym_owner"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) -> Result<()> {
        let name = call.split_whitespace().next().unwrap_or_default();
        if self.failing.load(Ordering::SeqCst) || self.failing_calls.lock().contains(name) {
            tracing::debug!(call = %call, "Directory mutation failing (injected)");
            return Err(anyhow::anyhow!("directory unavailable: {call}").into());
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl IdentityService for InMemoryDirectory {
    async fn get_actor(&self, id: ActorId) -> Result<Actor> {
        self.state
            .lock()
            .actors
            .get(&id)
            .cloned()
            .ok_or_else(|| TurnstileError::NotFound(format!("actor {id}")))
    }

    async fn set_role(&self, id: ActorId, role: Role) -> Result<()> {
        self.record(format!("set_role {id} {role}"))?;
        let mut state = self.state.lock();
        let actor = state
            .actors
            .get_mut(&id)
            .ok_or_else(|| TurnstileError::NotFound(format!("actor {id}")))?;
        actor.role = role;
        Ok(())
    }
}

#[async_trait]
impl GymDirectory for InMemoryDirectory {
    async fn get_gym(&self, id: GymId) -> Result<Gym> {
        self.state
            .lock()
            .gyms
            .get(&id)
            .cloned()
            .ok_or_else(|| TurnstileError::NotFound(format!("gym {id}")))
    }

    async fn set_verification_status(&self, id: GymId, status: VerificationStatus) -> Result<()> {
        self.record(format!("set_verification_status {id} {status:?}"))?;
        let mut state = self.state.lock();
        let gym = state
            .gyms
            .get_mut(&id)
            .ok_or_else(|| TurnstileError::NotFound(format!("gym {id}")))?;
        gym.verification_status = status;
        Ok(())
    }

    async fn add_freelance_instructor(&self, id: GymId, instructor: ActorId) -> Result<()> {
        self.record(format!("add_freelance_instructor {id} {instructor}"))?;
        let mut state = self.state.lock();
        let gym = state
            .gyms
            .get_mut(&id)
            .ok_or_else(|| TurnstileError::NotFound(format!("gym {id}")))?;
        gym.freelance_instructors.insert(instructor);
        Ok(())
    }

    async fn freelance_instructors(&self, id: GymId) -> Result<Vec<ActorId>> {
        let state = self.state.lock();
        let gym = state
            .gyms
            .get(&id)
            .ok_or_else(|| TurnstileError::NotFound(format!("gym {id}")))?;
        Ok(gym.freelance_instructors.iter().copied().collect())
    }

    async fn gyms_for_instructor(&self, instructor: ActorId) -> Result<Vec<Gym>> {
        let state = self.state.lock();
        let mut gyms: Vec<Gym> = state
            .gyms
            .values()
            .filter(|gym| gym.verification_status == VerificationStatus::Verified)
            .filter(|gym| !gym.freelance_instructors.contains(&instructor))
            .cloned()
            .collect();
        gyms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(gyms)
    }
}

#[async_trait]
impl MemberDirectory for InMemoryDirectory {
    async fn get_member(&self, id: MemberId) -> Result<Member> {
        self.state
            .lock()
            .members
            .get(&id)
            .cloned()
            .ok_or_else(|| TurnstileError::NotFound(format!("member {id}")))
    }

    async fn activate(&self, id: MemberId, activation: MembershipActivation) -> Result<Member> {
        self.record(format!("activate {id}"))?;
        let mut state = self.state.lock();
        let member = state
            .members
            .get_mut(&id)
            .ok_or_else(|| TurnstileError::NotFound(format!("member {id}")))?;
        member.status = MemberStatus::Active;
        member.payment_details.payment_status = PaymentStatus::Paid;
        member.payment_details.last_payment_date = Some(activation.last_payment_date);
        member.payment_details.next_payment_date = Some(activation.next_payment_date);
        Ok(member.clone())
    }
}

#[async_trait]
impl InstructorDirectory for InMemoryDirectory {
    async fn upsert_verified_instructor(&self, record: VerifiedInstructor) -> Result<()> {
        self.record(format!("upsert_verified_instructor {}", record.actor))?;
        self.state.lock().instructors.insert(record.actor, record);
        Ok(())
    }

    async fn get_verified_instructor(&self, actor: ActorId) -> Result<Option<VerifiedInstructor>> {
        Ok(self.state.lock().instructors.get(&actor).cloned())
    }

    async fn remove_verified_instructor(&self, actor: ActorId) -> Result<()> {
        self.record(format!("remove_verified_instructor {actor}"))?;
        self.state.lock().instructors.remove(&actor);
        Ok(())
    }
}
