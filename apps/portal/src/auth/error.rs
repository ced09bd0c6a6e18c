use serde::Serialize;
use thiserror::Error;

/// Message shown when the remote provider cannot be reached at all.
pub const UNREACHABLE_MESSAGE: &str = "Unable to reach the authentication service. \
The service may be paused, your network connection may be down, or the service \
URL and key may be misconfigured.";

pub const ALREADY_REGISTERED_MESSAGE: &str =
    "An account with this email already exists. Try signing in instead.";

/// Recoverable failures reported by the identity provider. These are returned
/// as values and never tear down the resolver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0}")]
    AlreadyRegistered(String),

    #[error("{0}")]
    Unreachable(String),

    #[error("{0}")]
    Generic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    AlreadyRegistered,
    Unreachable,
    Generic,
}

impl AuthError {
    pub fn already_registered() -> Self {
        AuthError::AlreadyRegistered(ALREADY_REGISTERED_MESSAGE.to_string())
    }

    pub fn unreachable() -> Self {
        AuthError::Unreachable(UNREACHABLE_MESSAGE.to_string())
    }

    pub fn kind(&self) -> AuthErrorKind {
        match self {
            AuthError::AlreadyRegistered(_) => AuthErrorKind::AlreadyRegistered,
            AuthError::Unreachable(_) => AuthErrorKind::Unreachable,
            AuthError::Generic(_) => AuthErrorKind::Generic,
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            AuthError::unreachable()
        } else {
            AuthError::Generic(e.to_string())
        }
    }
}
