use serde::{Deserialize, Serialize};

use crate::auth::store::FallbackRecord;
use crate::models::remote::RemoteUser;

/// The portal's closed set of roles, plus `Unresolved` for "no role determined yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Candidate,
    Recruiter,
    Client,
    #[default]
    Unresolved,
}

impl Role {
    /// Parses one of the three assignable roles. Anything else, including
    /// "unresolved", yields `None`.
    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "candidate" => Some(Role::Candidate),
            "recruiter" => Some(Role::Recruiter),
            "client" => Some(Role::Client),
            _ => None,
        }
    }

    /// Like `parse`, but maps unknown input to `Unresolved`.
    pub fn from_optional(raw: Option<&str>) -> Role {
        raw.and_then(Role::parse).unwrap_or(Role::Unresolved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Candidate => "candidate",
            Role::Recruiter => "recruiter",
            Role::Client => "client",
            Role::Unresolved => "unresolved",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Role::Unresolved)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resolved principal, identical in shape whether it came from the
/// remote provider or from the fallback record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        role: Role,
        display_name: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            role,
            display_name: display_name.filter(|n| !n.trim().is_empty()),
        }
    }

    /// Builds an identity from a remote user. Metadata the provider omits is
    /// filled from the cached record, but only when the record belongs to the
    /// same user.
    pub fn from_remote(user: &RemoteUser, cached: &FallbackRecord) -> Self {
        let same_user = cached.user_id.as_deref() == Some(user.id.as_str());
        let role = user
            .metadata
            .role
            .as_deref()
            .and_then(Role::parse)
            .unwrap_or_else(|| if same_user { cached.role() } else { Role::Unresolved });
        let display_name = user
            .metadata
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| cached.display_name.clone().filter(|_| same_user));
        let email = user
            .email
            .clone()
            .or_else(|| cached.email.clone().filter(|_| same_user))
            .unwrap_or_default();

        Self::new(user.id.clone(), email, role, display_name)
    }
}

/// Resolver state. `Initializing` is distinct from `Unauthenticated` so the
/// UI never flashes a logged-out screen during startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "identity", rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Unauthenticated,
    Authenticated(Identity),
}

impl SessionState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            SessionState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }
}

/// Snapshot handed to downstream consumers on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub state: SessionState,
    pub loading: bool,
    pub identity: Option<Identity>,
    pub role: Role,
}
