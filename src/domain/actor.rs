//! Actors: any user-like party that submits or decides requests.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub Uuid);

impl ActorId {
    pub fn new() -> Self {
        ActorId(Uuid::new_v4())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for ActorId {
    fn from(uuid: Uuid) -> Self {
        ActorId(uuid)
    }
}

impl std::str::FromStr for ActorId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ActorId)
    }
}

/// Platform role held by an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Freshly registered account with no elevated role
    User,
    Member,
    Instructor,
    GymOwner,
    /// Platform administrator
    Admin,
}

impl Role {
    /// Position in the promotion order. Promotions never lower it.
    pub fn rank(&self) -> u8 {
        match self {
            Role::User => 0,
            Role::Member => 1,
            Role::Instructor => 2,
            Role::GymOwner => 3,
            Role::Admin => 4,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::User => "user",
            Role::Member => "member",
            Role::Instructor => "instructor",
            Role::GymOwner => "gym_owner",
            Role::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// Identity record as returned by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub role: Role,
    pub display_name: String,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
