//! The remote identity provider capability set the resolver consumes.
//!
//! Any backend offering these operations is interchangeable. The resolver
//! holds an `Arc<dyn IdentityProvider>` and never sees the wire format.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::auth::error::AuthError;
use crate::models::identity::Role;
use crate::models::remote::{RemoteSession, RemoteUser, SignUpData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

pub type SessionListener = Arc<dyn Fn(SessionEvent, Option<RemoteSession>) + Send + Sync>;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Creates the account and starts a session immediately.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        data: &SignUpData,
    ) -> Result<RemoteSession, AuthError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<RemoteSession, AuthError>;

    /// Callers are free to ignore the error; local cleanup proceeds either way.
    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Best-effort; failures read as `None`.
    async fn current_user(&self) -> Option<RemoteUser>;

    /// Best-effort; failures read as `None`.
    async fn current_session(&self) -> Option<RemoteSession>;

    /// `Ok(None)` means no role on record (or nobody to look up), which is a
    /// valid outcome. `Err` is a transient lookup failure.
    async fn get_role(&self, user_id: Option<&str>) -> Result<Option<Role>, AuthError>;

    /// Idempotent. Returns whether the update was stored.
    async fn set_role(&self, user_id: &str, role: Role) -> bool;

    fn on_session_change(&self, listener: SessionListener) -> Subscription;
}

// ────────────────────────────────────────────────────────────────────────────
// Listener registry
// ────────────────────────────────────────────────────────────────────────────

/// Ordered set of session listeners, shared by provider implementations.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, SessionListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, listener: SessionListener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, listener);
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Invokes every listener in registration order. The lock is released
    /// before calling out so listeners may (un)subscribe.
    pub fn emit(&self, event: SessionEvent, session: Option<RemoteSession>) {
        let snapshot: Vec<SessionListener> = self.listeners.lock().values().cloned().collect();
        for listener in snapshot {
            listener(event, session.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    fn remove(&self, id: u64) {
        self.listeners.lock().remove(&id);
    }
}

/// Handle returned by `on_session_change`. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MockProvider
// ────────────────────────────────────────────────────────────────────────────
