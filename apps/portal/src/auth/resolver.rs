//! Session Resolver — the single answer to "who is logged in, and as what".
//!
//! State machine: `Initializing → {Unauthenticated, Authenticated(Identity)}`.
//!
//! In `Remote` mode the provider is authoritative and the fallback record is a
//! cache; provider notifications are the only channel for out-of-band changes.
//! In `Local` mode the fallback record is the identity and state changes only
//! through the mutation operations below.
//!
//! Overlapping calls are not cancelled. Every write is idempotent and the last
//! one to land wins.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::error::AuthError;
use crate::auth::provider::{IdentityProvider, SessionEvent, Subscription};
use crate::auth::store::{FallbackKey, FallbackRecord, FallbackStore, FallbackStoreExt};
use crate::config::ConfigurationMode;
use crate::models::identity::{Identity, Role, SessionState, SessionView};
use crate::models::remote::{RemoteSession, SignUpData};

/// The authoritative identity source, fixed for the resolver's lifetime.
#[derive(Clone)]
pub enum AuthBackend {
    Remote(Arc<dyn IdentityProvider>),
    Local,
}

impl AuthBackend {
    pub fn mode(&self) -> ConfigurationMode {
        match self {
            AuthBackend::Remote(_) => ConfigurationMode::Remote,
            AuthBackend::Local => ConfigurationMode::Local,
        }
    }
}

pub struct SessionResolver {
    backend: AuthBackend,
    store: Arc<dyn FallbackStore>,
    state: RwLock<SessionState>,
    notifier: watch::Sender<SessionView>,
    subscription: Mutex<Option<Subscription>>,
}

impl SessionResolver {
    /// Creates a resolver in `Initializing`. Call `initialize` to resolve.
    pub fn new(backend: AuthBackend, store: Arc<dyn FallbackStore>) -> Arc<Self> {
        let (notifier, _) = watch::channel(SessionView {
            state: SessionState::Initializing,
            loading: true,
            identity: None,
            role: Role::Unresolved,
        });

        Arc::new(Self {
            backend,
            store,
            state: RwLock::new(SessionState::Initializing),
            notifier,
            subscription: Mutex::new(None),
        })
    }

    pub async fn start(backend: AuthBackend, store: Arc<dyn FallbackStore>) -> Arc<Self> {
        let resolver = Self::new(backend, store);
        resolver.initialize().await;
        resolver
    }

    /// Runs the startup transition. In remote mode this also subscribes to
    /// provider session changes for as long as the resolver lives.
    pub async fn initialize(self: &Arc<Self>) {
        match &self.backend {
            AuthBackend::Remote(provider) => {
                let weak: Weak<Self> = Arc::downgrade(self);
                let listener = move |event: SessionEvent, session: Option<RemoteSession>| {
                    if let Some(resolver) = weak.upgrade() {
                        resolver.on_remote_change(event, session);
                    }
                };
                let subscription = provider.on_session_change(Arc::new(listener));
                *self.subscription.lock() = Some(subscription);

                match provider.current_session().await {
                    Some(session) => {
                        self.apply_remote_session(&session);
                    }
                    None => {
                        // The record is only a cache here; leave it alone.
                        self.set_state(SessionState::Unauthenticated);
                    }
                }
            }
            AuthBackend::Local => {
                let record = FallbackRecord::load(self.store.as_ref());
                let state = if record.authenticated {
                    SessionState::Authenticated(Identity::new(
                        record.user_id.clone().unwrap_or_else(new_local_id),
                        record.email.clone().unwrap_or_default(),
                        record.role(),
                        record.display_name.clone(),
                    ))
                } else {
                    SessionState::Unauthenticated
                };
                self.set_state(state);
            }
        }

        info!(
            "Session resolver initialized in {:?} mode: authenticated={}",
            self.mode(),
            self.state.read().is_authenticated()
        );
    }

    // ────────────────────────────────────────────────────────────────────────
    // Reads
    // ────────────────────────────────────────────────────────────────────────

    pub fn mode(&self) -> ConfigurationMode {
        self.backend.mode()
    }

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.read().identity().cloned()
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.state.read(), SessionState::Initializing)
    }

    pub fn view(&self) -> SessionView {
        self.notifier.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.notifier.subscribe()
    }

    /// Live remote role first, then the cached role, then `Unresolved`. The
    /// cached value is shown while the authoritative lookup is pending.
    pub fn resolved_role(&self) -> Role {
        let state = self.state.read();
        Self::resolve_role(&self.backend, &state, self.store.as_ref())
    }

    fn resolve_role(backend: &AuthBackend, state: &SessionState, store: &dyn FallbackStore) -> Role {
        if let (AuthBackend::Remote(_), SessionState::Authenticated(identity)) = (backend, state) {
            if identity.role.is_resolved() {
                return identity.role;
            }
        }
        Role::from_optional(store.get_field(&FallbackKey::Role).as_deref())
    }

    pub fn pass_through(&self, name: &str) -> Option<String> {
        self.store
            .get_field(&FallbackKey::PassThrough(name.to_string()))
    }

    // ────────────────────────────────────────────────────────────────────────
    // Mutations
    // ────────────────────────────────────────────────────────────────────────

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        match &self.backend {
            AuthBackend::Remote(provider) => {
                let session = provider.sign_in(email, password).await.map_err(|e| {
                    warn!("Remote sign-in failed ({:?}): {e}", e.kind());
                    e
                })?;
                Ok(self.apply_remote_session(&session))
            }
            AuthBackend::Local => {
                let record = FallbackRecord::load(self.store.as_ref());
                let same_user = record.email.as_deref() == Some(email);
                let id = record
                    .user_id
                    .clone()
                    .filter(|_| same_user)
                    .unwrap_or_else(new_local_id);
                let display_name = record.display_name.clone().filter(|_| same_user);

                let identity = Identity::new(id, email, record.role(), display_name);
                self.write_record(&identity);
                self.set_state(SessionState::Authenticated(identity.clone()));
                info!("Local sign-in for {email}");
                Ok(identity)
            }
        }
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        data: SignUpData,
    ) -> Result<Identity, AuthError> {
        let identity = match &self.backend {
            AuthBackend::Remote(provider) => {
                let session = provider.sign_up(email, password, &data).await.map_err(|e| {
                    warn!("Remote sign-up failed ({:?}): {e}", e.kind());
                    e
                })?;
                let record = FallbackRecord::load(self.store.as_ref());
                let mut identity = Identity::from_remote(&session.user, &record);
                // Supplied values win over metadata that may not have propagated yet.
                if data.role.is_resolved() {
                    identity.role = data.role;
                }
                if data.name.is_some() {
                    identity.display_name = data.name.clone();
                }
                identity
            }
            AuthBackend::Local => Identity::new(new_local_id(), email, data.role, data.name.clone()),
        };

        self.write_record(&identity);
        self.set_state(SessionState::Authenticated(identity.clone()));
        info!("Sign-up for {email} as {}", identity.role);
        Ok(identity)
    }

    /// Always ends `Unauthenticated` with an empty fallback record. A remote
    /// failure is logged and otherwise ignored.
    pub async fn sign_out(&self) {
        if let AuthBackend::Remote(provider) = &self.backend {
            if let Err(e) = provider.sign_out().await {
                warn!("Remote sign-out failed, clearing local state anyway: {e}");
            }
        }

        self.store.remove_field(&FallbackKey::Authenticated);
        self.store.clear();
        self.set_state(SessionState::Unauthenticated);
        info!("Signed out");
    }

    /// Fetches the authoritative role. `Unresolved` means there is no role on
    /// record yet and leaves the cached role untouched. Transient failures are
    /// returned, not retried.
    pub async fn refresh_role(&self) -> Result<Role, AuthError> {
        let provider = match &self.backend {
            AuthBackend::Remote(provider) => provider,
            AuthBackend::Local => return Ok(self.resolved_role()),
        };

        let user_id = self.identity().map(|i| i.id);
        match provider.get_role(user_id.as_deref()).await {
            Ok(Some(role)) => {
                self.store.set_field(&FallbackKey::Role, role.as_str());
                self.update_identity_role(user_id.as_deref(), role);
                debug!("Role refreshed: {role}");
                Ok(role)
            }
            Ok(None) => {
                debug!("No role on record yet");
                Ok(Role::Unresolved)
            }
            Err(e) => {
                warn!("Role lookup failed: {e}");
                Err(e)
            }
        }
    }

    /// Stores the role a user picked after their role came back unresolved.
    /// Returns whether the remote provider accepted it (always true locally).
    pub async fn select_role(&self, role: Role) -> Result<bool, AuthError> {
        if !role.is_resolved() {
            return Err(AuthError::Generic(
                "Choose candidate, recruiter or client".to_string(),
            ));
        }
        let identity = self
            .identity()
            .ok_or_else(|| AuthError::Generic("Sign in before choosing a role".to_string()))?;

        if let AuthBackend::Remote(provider) = &self.backend {
            if !provider.set_role(&identity.id, role).await {
                warn!("Provider rejected role {role} for {}", identity.id);
                return Ok(false);
            }
        }

        self.store.set_field(&FallbackKey::Role, role.as_str());
        self.update_identity_role(Some(identity.id.as_str()), role);
        Ok(true)
    }

    pub fn set_pass_through(&self, name: &str, value: &str) {
        self.store
            .set_field(&FallbackKey::PassThrough(name.to_string()), value);
    }

    // ────────────────────────────────────────────────────────────────────────
    // Internals
    // ────────────────────────────────────────────────────────────────────────

    fn on_remote_change(&self, event: SessionEvent, session: Option<RemoteSession>) {
        debug!("Remote session change: {event:?}");
        match session {
            Some(session) => {
                self.apply_remote_session(&session);
            }
            None => {
                // Role and name stay cached; only the flag goes.
                self.store.remove_field(&FallbackKey::Authenticated);
                self.set_state(SessionState::Unauthenticated);
            }
        }
    }

    fn apply_remote_session(&self, session: &RemoteSession) -> Identity {
        let record = FallbackRecord::load(self.store.as_ref());
        if record.user_id.as_deref() != Some(session.user.id.as_str()) {
            self.drop_pass_through(&record);
        }
        let identity = Identity::from_remote(&session.user, &record);
        self.write_record(&identity);
        self.set_state(SessionState::Authenticated(identity.clone()));
        identity
    }

    /// Identifiers cached for someone else must not follow a new user in.
    fn drop_pass_through(&self, record: &FallbackRecord) {
        for name in record.pass_through.keys() {
            self.store
                .remove_field(&FallbackKey::PassThrough(name.clone()));
        }
    }

    /// Writes identity fields, then the authentication flag last so a torn
    /// write never reads as authenticated with fields missing. Fields the
    /// identity lacks are removed so nothing of a previous user survives.
    fn write_record(&self, identity: &Identity) {
        self.store.set_field(&FallbackKey::UserId, &identity.id);
        self.store.set_field(&FallbackKey::Email, &identity.email);
        match &identity.display_name {
            Some(name) => self.store.set_field(&FallbackKey::DisplayName, name),
            None => self.store.remove_field(&FallbackKey::DisplayName),
        }
        if identity.role.is_resolved() {
            self.store.set_field(&FallbackKey::Role, identity.role.as_str());
        } else {
            self.store.remove_field(&FallbackKey::Role);
        }
        self.store.set_field(&FallbackKey::Authenticated, "true");
    }

    fn update_identity_role(&self, user_id: Option<&str>, role: Role) {
        let updated = {
            let state = self.state.read();
            match &*state {
                SessionState::Authenticated(identity)
                    if user_id.map_or(true, |id| id == identity.id) =>
                {
                    let mut identity = identity.clone();
                    identity.role = role;
                    Some(SessionState::Authenticated(identity))
                }
                _ => None,
            }
        };
        if let Some(state) = updated {
            self.set_state(state);
        }
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.write();
        *state = next;
        let view = SessionView {
            loading: matches!(*state, SessionState::Initializing),
            identity: state.identity().cloned(),
            role: Self::resolve_role(&self.backend, &state, self.store.as_ref()),
            state: state.clone(),
        };
        self.notifier.send_replace(view);
    }
}

fn new_local_id() -> String {
    format!("local-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::error::AuthErrorKind;
    use crate::auth::provider::mock::{session_for, MockProvider};
    use crate::auth::store::MemoryStore;

    /// Records the order of mutating calls.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        ops: Mutex<Vec<String>>,
    }

    impl FallbackStore for RecordingStore {
        fn get(&self, key: &str) -> Option<String> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &str) {
            self.ops.lock().push(format!("set {key}"));
            self.inner.set(key, value);
        }
        fn remove(&self, key: &str) {
            self.ops.lock().push(format!("remove {key}"));
            self.inner.remove(key);
        }
        fn clear(&self) {
            self.ops.lock().push("clear".to_string());
            self.inner.clear();
        }
        fn keys(&self) -> Vec<String> {
            self.inner.keys()
        }
    }

    fn candidate_signup() -> SignUpData {
        SignUpData {
            name: Some("Cara".to_string()),
            role: Role::Candidate,
        }
    }

    async fn local_resolver(store: Arc<MemoryStore>) -> Arc<SessionResolver> {
        SessionResolver::start(AuthBackend::Local, store).await
    }

    async fn remote_resolver(
        provider: Arc<MockProvider>,
        store: Arc<MemoryStore>,
    ) -> Arc<SessionResolver> {
        SessionResolver::start(AuthBackend::Remote(provider), store).await
    }

    #[test]
    fn test_new_resolver_is_initializing() {
        let resolver = SessionResolver::new(AuthBackend::Local, Arc::new(MemoryStore::new()));
        assert!(resolver.is_loading());
        assert_eq!(resolver.state(), SessionState::Initializing);
        assert!(resolver.view().loading);
    }

    #[tokio::test]
    async fn test_sign_up_then_resolved_role_local() {
        let store = Arc::new(MemoryStore::new());
        let resolver = local_resolver(store.clone()).await;

        resolver.sign_up("c@d.com", "pw", candidate_signup()).await.unwrap();
        assert_eq!(resolver.resolved_role(), Role::Candidate);
        assert_eq!(store.get("userName").as_deref(), Some("Cara"));
    }

    #[tokio::test]
    async fn test_sign_up_then_resolved_role_remote() {
        let store = Arc::new(MemoryStore::new());
        let resolver = remote_resolver(MockProvider::new(), store.clone()).await;

        let identity = resolver
            .sign_up("c@d.com", "pw", SignUpData { name: None, role: Role::Client })
            .await
            .unwrap();
        assert_eq!(identity.role, Role::Client);
        assert_eq!(resolver.resolved_role(), Role::Client);
        assert_eq!(store.get("userRole").as_deref(), Some("client"));
    }

    #[tokio::test]
    async fn test_sign_out_completes_despite_remote_failure() {
        let provider = MockProvider::with_session(session_for("u-1", "a@b.com", Some("client"), None));
        provider.state.lock().sign_out_error = Some(AuthError::unreachable());
        let store = Arc::new(MemoryStore::new());
        store.set_field(&FallbackKey::UserId, "u-1");
        store.set_field(&FallbackKey::PassThrough("candidateId".into()), "cand-7");
        let resolver = remote_resolver(provider.clone(), store.clone()).await;
        assert!(resolver.state().is_authenticated());

        resolver.sign_out().await;

        assert_eq!(resolver.state(), SessionState::Unauthenticated);
        assert!(FallbackRecord::load(store.as_ref()).is_empty());
        assert!(store.keys().is_empty());
        assert_eq!(provider.state.lock().sign_out_calls, 1);
    }

    #[tokio::test]
    async fn test_sign_out_twice_matches_once() {
        let store = Arc::new(MemoryStore::new());
        let resolver = local_resolver(store.clone()).await;
        resolver.sign_in("a@b.com", "x").await.unwrap();

        resolver.sign_out().await;
        let once = (resolver.state(), FallbackRecord::load(store.as_ref()));
        resolver.sign_out().await;
        let twice = (resolver.state(), FallbackRecord::load(store.as_ref()));

        assert_eq!(once, twice);
        assert_eq!(twice.0, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_missing_profile_row_is_unresolved_and_keeps_cache() {
        let provider = MockProvider::with_session(session_for("u-1", "a@b.com", None, None));
        provider.state.lock().role_lookup = Some(Ok(None));
        let store = Arc::new(MemoryStore::new());
        store.set_field(&FallbackKey::UserId, "u-1");
        store.set_field(&FallbackKey::Role, "candidate");
        let resolver = remote_resolver(provider, store.clone()).await;

        assert_eq!(resolver.refresh_role().await, Ok(Role::Unresolved));
        assert_eq!(store.get("userRole").as_deref(), Some("candidate"));
        assert_eq!(resolver.resolved_role(), Role::Candidate);
    }

    #[tokio::test]
    async fn test_transient_role_failure_is_surfaced() {
        let provider = MockProvider::with_session(session_for("u-1", "a@b.com", None, None));
        provider.state.lock().role_lookup = Some(Err(AuthError::unreachable()));
        let store = Arc::new(MemoryStore::new());
        store.set_field(&FallbackKey::UserId, "u-1");
        store.set_field(&FallbackKey::Role, "client");
        let resolver = remote_resolver(provider, store.clone()).await;

        let err = resolver.refresh_role().await.unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Unreachable);
        assert_eq!(resolver.resolved_role(), Role::Client);
    }

    #[tokio::test]
    async fn test_refresh_role_replaces_cached_value() {
        let provider = MockProvider::with_session(session_for("u-1", "a@b.com", None, None));
        provider.state.lock().role_lookup = Some(Ok(Some(Role::Recruiter)));
        let store = Arc::new(MemoryStore::new());
        store.set_field(&FallbackKey::UserId, "u-1");
        store.set_field(&FallbackKey::Role, "candidate");
        let resolver = remote_resolver(provider, store.clone()).await;
        assert_eq!(resolver.resolved_role(), Role::Candidate);

        assert_eq!(resolver.refresh_role().await, Ok(Role::Recruiter));
        assert_eq!(resolver.resolved_role(), Role::Recruiter);
        assert_eq!(resolver.identity().unwrap().role, Role::Recruiter);
        assert_eq!(store.get("userRole").as_deref(), Some("recruiter"));
    }

    #[tokio::test]
    async fn test_remote_role_beats_cached_role() {
        let provider =
            MockProvider::with_session(session_for("u-1", "a@b.com", Some("recruiter"), None));
        let store = Arc::new(MemoryStore::new());
        store.set_field(&FallbackKey::UserId, "u-1");
        store.set_field(&FallbackKey::Role, "candidate");
        let resolver = remote_resolver(provider, store).await;

        assert_eq!(resolver.resolved_role(), Role::Recruiter);
    }

    #[tokio::test]
    async fn test_local_sign_in_with_empty_record() {
        let store = Arc::new(MemoryStore::new());
        let resolver = local_resolver(store.clone()).await;
        assert_eq!(resolver.state(), SessionState::Unauthenticated);

        let identity = resolver.sign_in("a@b.com", "x").await.unwrap();
        assert!(!identity.id.is_empty());
        assert_eq!(identity.email, "a@b.com");
        assert_eq!(identity.role, Role::Unresolved);
        assert_eq!(store.get("isAuthenticated").as_deref(), Some("true"));
        assert_eq!(resolver.state(), SessionState::Authenticated(identity));
    }

    #[tokio::test]
    async fn test_local_sign_in_reuses_id_for_same_email() {
        let store = Arc::new(MemoryStore::new());
        store.set_field(&FallbackKey::UserId, "local-fixed");
        store.set_field(&FallbackKey::Email, "a@b.com");
        store.set_field(&FallbackKey::Role, "recruiter");
        let resolver = local_resolver(store.clone()).await;

        let identity = resolver.sign_in("a@b.com", "x").await.unwrap();
        assert_eq!(identity.id, "local-fixed");
        assert_eq!(identity.role, Role::Recruiter);

        let other = resolver.sign_in("z@b.com", "x").await.unwrap();
        assert_ne!(other.id, "local-fixed");
    }

    #[tokio::test]
    async fn test_local_sign_in_as_other_user_drops_previous_name() {
        let store = Arc::new(MemoryStore::new());
        let resolver = local_resolver(store.clone()).await;
        resolver
            .sign_up(
                "ann@b.com",
                "x",
                SignUpData { name: Some("Ann".to_string()), role: Role::Candidate },
            )
            .await
            .unwrap();

        let bob = resolver.sign_in("bob@b.com", "x").await.unwrap();
        assert_eq!(bob.display_name, None);
        assert_eq!(store.get("userName"), None);

        let restarted = local_resolver(store).await;
        let identity = restarted.identity().unwrap();
        assert_eq!(identity.email, "bob@b.com");
        assert_eq!(identity.display_name, None);
    }

    #[tokio::test]
    async fn test_remote_unreachable_sign_in_leaves_everything_alone() {
        let provider = MockProvider::new();
        provider.state.lock().sign_in_error = Some(AuthError::unreachable());
        let store = Arc::new(MemoryStore::new());
        store.set_field(&FallbackKey::Role, "client");
        let before = FallbackRecord::load(store.as_ref());
        let resolver = remote_resolver(provider, store.clone()).await;

        let err = resolver.sign_in("a@b.com", "x").await.unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::Unreachable);
        assert_eq!(resolver.state(), SessionState::Unauthenticated);
        assert_eq!(FallbackRecord::load(store.as_ref()), before);
    }

    #[tokio::test]
    async fn test_remote_already_registered_is_distinguished() {
        let provider = MockProvider::new();
        provider.state.lock().sign_up_error = Some(AuthError::already_registered());
        let resolver = remote_resolver(provider, Arc::new(MemoryStore::new())).await;

        let err = resolver
            .sign_up("a@b.com", "x", candidate_signup())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::AlreadyRegistered);
        assert_eq!(resolver.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_local_startup_reads_record() {
        let store = Arc::new(MemoryStore::new());
        store.set_field(&FallbackKey::UserId, "local-1");
        store.set_field(&FallbackKey::Email, "a@b.com");
        store.set_field(&FallbackKey::Authenticated, "true");
        let resolver = local_resolver(store).await;

        let identity = resolver.identity().unwrap();
        assert_eq!(identity.id, "local-1");
        assert_eq!(identity.role, Role::Unresolved);
        assert!(!resolver.is_loading());
    }

    #[tokio::test]
    async fn test_remote_startup_without_session_keeps_cache() {
        let store = Arc::new(MemoryStore::new());
        store.set_field(&FallbackKey::Role, "client");
        store.set_field(&FallbackKey::Authenticated, "true");
        let resolver = remote_resolver(MockProvider::new(), store.clone()).await;

        assert_eq!(resolver.state(), SessionState::Unauthenticated);
        assert_eq!(store.get("userRole").as_deref(), Some("client"));
        assert_eq!(store.get("isAuthenticated").as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_remote_metadata_gaps_filled_from_cache() {
        let provider = MockProvider::with_session(session_for("u-1", "a@b.com", None, None));
        let store = Arc::new(MemoryStore::new());
        store.set_field(&FallbackKey::UserId, "u-1");
        store.set_field(&FallbackKey::Role, "client");
        store.set_field(&FallbackKey::DisplayName, "Cached Name");
        let resolver = remote_resolver(provider, store).await;

        let identity = resolver.identity().unwrap();
        assert_eq!(identity.role, Role::Client);
        assert_eq!(identity.display_name.as_deref(), Some("Cached Name"));
    }

    #[tokio::test]
    async fn test_out_of_band_sign_out_is_observed() {
        let provider =
            MockProvider::with_session(session_for("u-1", "a@b.com", Some("client"), None));
        let store = Arc::new(MemoryStore::new());
        let resolver = remote_resolver(provider.clone(), store.clone()).await;
        let mut rx = resolver.subscribe();
        assert!(resolver.state().is_authenticated());

        provider.push(SessionEvent::SignedOut, None);

        assert_eq!(resolver.state(), SessionState::Unauthenticated);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().state, SessionState::Unauthenticated);
        assert_eq!(store.get("isAuthenticated"), None);
        assert_eq!(store.get("userRole").as_deref(), Some("client"));
    }

    #[tokio::test]
    async fn test_out_of_band_sign_in_is_observed() {
        let provider = MockProvider::new();
        let resolver = remote_resolver(provider.clone(), Arc::new(MemoryStore::new())).await;

        provider.push(
            SessionEvent::SignedIn,
            Some(session_for("u-2", "b@c.com", Some("recruiter"), Some("Rob"))),
        );

        let view = resolver.view();
        assert_eq!(view.role, Role::Recruiter);
        assert_eq!(view.identity.unwrap().display_name.as_deref(), Some("Rob"));
    }

    #[tokio::test]
    async fn test_new_remote_user_does_not_inherit_previous_cache() {
        let provider =
            MockProvider::with_session(session_for("u-a", "a@b.com", Some("recruiter"), Some("Alice")));
        let store = Arc::new(MemoryStore::new());
        let resolver = remote_resolver(provider.clone(), store.clone()).await;
        resolver.set_pass_through("candidateId", "cand-a");
        assert_eq!(store.get("userName").as_deref(), Some("Alice"));

        provider.push(SessionEvent::SignedOut, None);
        provider.push(
            SessionEvent::SignedIn,
            Some(session_for("u-b", "b@c.com", None, None)),
        );

        let identity = resolver.identity().unwrap();
        assert_eq!(identity.id, "u-b");
        assert_eq!(identity.role, Role::Unresolved);
        assert_eq!(identity.display_name, None);
        assert_eq!(resolver.resolved_role(), Role::Unresolved);
        assert_eq!(store.get("userRole"), None);
        assert_eq!(store.get("userName"), None);
        assert_eq!(resolver.pass_through("candidateId"), None);
    }

    #[tokio::test]
    async fn test_same_remote_user_keeps_cache_across_sign_out() {
        let provider =
            MockProvider::with_session(session_for("u-a", "a@b.com", Some("client"), Some("Alice")));
        let store = Arc::new(MemoryStore::new());
        let resolver = remote_resolver(provider.clone(), store.clone()).await;

        provider.push(SessionEvent::SignedOut, None);
        provider.push(
            SessionEvent::SignedIn,
            Some(session_for("u-a", "a@b.com", None, None)),
        );

        let identity = resolver.identity().unwrap();
        assert_eq!(identity.role, Role::Client);
        assert_eq!(identity.display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_dropping_resolver_unsubscribes() {
        let provider = MockProvider::new();
        let resolver = remote_resolver(provider.clone(), Arc::new(MemoryStore::new())).await;
        assert_eq!(provider.listener_count(), 1);

        drop(resolver);
        assert_eq!(provider.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_write_order_flag_last_in_first_out() {
        let store = Arc::new(RecordingStore::default());
        let resolver = SessionResolver::start(AuthBackend::Local, store.clone()).await;

        resolver.sign_up("a@b.com", "x", candidate_signup()).await.unwrap();
        let ops = store.ops.lock().clone();
        assert_eq!(ops.last().map(String::as_str), Some("set isAuthenticated"));

        store.ops.lock().clear();
        resolver.sign_out().await;
        let ops = store.ops.lock().clone();
        assert_eq!(ops, vec!["remove isAuthenticated".to_string(), "clear".to_string()]);
    }

    #[tokio::test]
    async fn test_select_role_after_unresolved() {
        let provider = MockProvider::with_session(session_for("u-1", "a@b.com", None, None));
        let store = Arc::new(MemoryStore::new());
        let resolver = remote_resolver(provider.clone(), store.clone()).await;
        assert_eq!(resolver.resolved_role(), Role::Unresolved);

        assert_eq!(resolver.select_role(Role::Client).await, Ok(true));
        assert_eq!(resolver.resolved_role(), Role::Client);
        assert_eq!(provider.state.lock().roles.get("u-1"), Some(&Role::Client));
        assert_eq!(store.get("userRole").as_deref(), Some("client"));
    }

    #[tokio::test]
    async fn test_select_role_rejected_remotely_changes_nothing() {
        let provider = MockProvider::with_session(session_for("u-1", "a@b.com", None, None));
        provider.state.lock().set_role_result = Some(false);
        let store = Arc::new(MemoryStore::new());
        let resolver = remote_resolver(provider, store.clone()).await;

        assert_eq!(resolver.select_role(Role::Client).await, Ok(false));
        assert_eq!(resolver.resolved_role(), Role::Unresolved);
        assert_eq!(store.get("userRole"), None);
    }

    #[tokio::test]
    async fn test_select_role_requires_session_and_real_role() {
        let resolver = local_resolver(Arc::new(MemoryStore::new())).await;
        assert!(resolver.select_role(Role::Client).await.is_err());

        resolver.sign_in("a@b.com", "x").await.unwrap();
        assert!(resolver.select_role(Role::Unresolved).await.is_err());
        assert_eq!(resolver.select_role(Role::Recruiter).await, Ok(true));
    }

    #[tokio::test]
    async fn test_pass_through_cleared_on_sign_out() {
        let resolver = local_resolver(Arc::new(MemoryStore::new())).await;
        resolver.sign_in("a@b.com", "x").await.unwrap();
        resolver.set_pass_through("candidateId", "cand-42");
        assert_eq!(resolver.pass_through("candidateId").as_deref(), Some("cand-42"));

        resolver.sign_out().await;
        assert_eq!(resolver.pass_through("candidateId"), None);
    }

    #[tokio::test]
    async fn test_last_sign_in_wins() {
        let store = Arc::new(MemoryStore::new());
        let resolver = local_resolver(store.clone()).await;

        resolver.sign_in("first@b.com", "x").await.unwrap();
        resolver.sign_in("second@b.com", "x").await.unwrap();

        assert_eq!(resolver.identity().unwrap().email, "second@b.com");
        assert_eq!(store.get("userEmail").as_deref(), Some("second@b.com"));
    }
}
