//! GoTrue-style REST provider, the concrete remote backend.
//!
//! Speaks the `/auth/v1` endpoints for credentials and sessions and reads the
//! role attribute from the `profiles` table under `/rest/v1`. Holds the live
//! session in memory, mirrors it into the fallback store so it survives a
//! restart, and notifies listeners whenever it changes. A timer watches the
//! session's expiry so listeners hear about it without anyone asking.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::error::AuthError;
use crate::auth::provider::{
    IdentityProvider, ListenerRegistry, SessionEvent, SessionListener, Subscription,
};
use crate::auth::store::{FallbackKey, FallbackStore, FallbackStoreExt};
use crate::models::identity::Role;
use crate::models::remote::{RemoteSession, RemoteUser, SignUpData};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const PROFILES_TABLE: &str = "profiles";
/// Slack past `expires_at` before the timer re-checks the session.
const EXPIRY_GRACE: Duration = Duration::from_millis(10);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: Option<RemoteUser>,
}

impl TokenResponse {
    fn into_session(self) -> Option<RemoteSession> {
        let access_token = self.access_token?;
        let user = self.user?;
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => DateTime::from_timestamp(at, 0),
            (None, Some(secs)) => Some(Utc::now() + chrono::Duration::seconds(secs)),
            (None, None) => None,
        };
        Some(RemoteSession {
            access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user,
        })
    }
}

/// The service reports errors under several field names depending on endpoint.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    msg: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
    error_code: Option<String>,
}

impl ErrorBody {
    fn message(&self) -> Option<String> {
        self.msg
            .clone()
            .or_else(|| self.error_description.clone())
            .or_else(|| self.message.clone())
            .or_else(|| self.error.clone())
    }
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    role: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProfileUpsert<'a> {
    id: &'a str,
    role: Role,
}

pub struct GoTrueProvider {
    client: Client,
    base_url: String,
    anon_key: String,
    session: RwLock<Option<RemoteSession>>,
    listeners: Arc<ListenerRegistry>,
    store: Arc<dyn FallbackStore>,
    expiry_timer: Mutex<Option<JoinHandle<()>>>,
    /// Serializes expiry handling so the timer and a caller never both refresh.
    refresh_lock: tokio::sync::Mutex<()>,
    this: Weak<GoTrueProvider>,
}

impl GoTrueProvider {
    /// Builds the provider and restores any session a previous run left in
    /// `store`. An expired restored session is refreshed (or dropped) the
    /// first time it is asked for.
    pub fn new(
        base_url: &str,
        anon_key: &str,
        store: Arc<dyn FallbackStore>,
    ) -> Result<Arc<Self>, AuthError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Generic(format!("Failed to build HTTP client: {e}")))?;

        let restored = restore_session(store.as_ref());
        if let Some(session) = &restored {
            info!("Restored remote session for user {}", session.user.id);
        }

        let provider = Arc::new_cyclic(|this| Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            session: RwLock::new(restored.clone()),
            listeners: ListenerRegistry::new(),
            store,
            expiry_timer: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            this: this.clone(),
        });
        provider.schedule_expiry(restored.as_ref());
        Ok(provider)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attaches the API key and a bearer token: the session's when present,
    /// the anonymous key otherwise.
    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .session
            .read()
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone());
        builder
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer)
    }

    fn store_session(&self, event: SessionEvent, session: Option<RemoteSession>) {
        *self.session.write() = session.clone();
        self.persist(session.as_ref());
        self.schedule_expiry(session.as_ref());
        self.listeners.emit(event, session);
    }

    fn persist(&self, session: Option<&RemoteSession>) {
        match session.map(serde_json::to_string) {
            Some(Ok(raw)) => self.store.set_field(&FallbackKey::ProviderSession, &raw),
            Some(Err(e)) => warn!("Failed to serialize remote session: {e}"),
            None => self.store.remove_field(&FallbackKey::ProviderSession),
        }
    }

    /// Replaces the expiry timer. Without a runtime (or an expiry) there is
    /// no timer and expiry is only noticed by `current_session`.
    fn schedule_expiry(&self, session: Option<&RemoteSession>) {
        let mut timer = self.expiry_timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let Some(expires_at) = session.and_then(|s| s.expires_at) else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            return;
        };

        let wait = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO) + EXPIRY_GRACE;
        let this = self.this.clone();
        *timer = Some(runtime.spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(provider) = this.upgrade() {
                // Detach ourselves so a reschedule below does not abort this task.
                provider.expiry_timer.lock().take();
                provider.ensure_fresh().await;
            }
        }));
    }

    /// Returns the live session, refreshing it first if it has expired. A
    /// session that cannot be refreshed is dropped and listeners hear
    /// `SignedOut`.
    async fn ensure_fresh(&self) -> Option<RemoteSession> {
        let _guard = self.refresh_lock.lock().await;

        let session = self.session.read().clone()?;
        if !session.is_expired(Utc::now()) {
            return Some(session);
        }

        if let Some(refresh_token) = session.refresh_token.as_deref() {
            if let Some(refreshed) = self.refresh(refresh_token).await {
                return Some(refreshed);
            }
        }

        info!("Remote session for user {} expired", session.user.id);
        self.store_session(SessionEvent::SignedOut, None);
        None
    }

    async fn token_grant(&self, grant: &str, body: serde_json::Value) -> Result<RemoteSession, AuthError> {
        let response = self
            .authorized(self.client.post(self.url("/auth/v1/token")))
            .query(&[("grant_type", grant)])
            .json(&body)
            .send()
            .await?;

        let token: TokenResponse = parse_success(response).await?;
        token
            .into_session()
            .ok_or_else(|| AuthError::Generic("Authentication service returned no session".to_string()))
    }

    async fn refresh(&self, refresh_token: &str) -> Option<RemoteSession> {
        match self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
        {
            Ok(session) => {
                debug!("Session refreshed for user {}", session.user.id);
                self.store_session(SessionEvent::TokenRefreshed, Some(session.clone()));
                Some(session)
            }
            Err(e) => {
                warn!("Session refresh failed: {e}");
                None
            }
        }
    }

    /// Mirrors a stored role into the live user's metadata and tells
    /// listeners the user changed. The profile row stays authoritative, so a
    /// failed metadata write still updates the in-memory copy.
    async fn sync_session_role(&self, user_id: &str, role: Role) {
        let Some(mut session) = self.session.read().clone() else {
            return;
        };
        if session.user.id != user_id {
            return;
        }

        let response = self
            .authorized(self.client.put(self.url("/auth/v1/user")))
            .json(&json!({ "data": { "role": role } }))
            .send()
            .await;
        let user = match response {
            Ok(response) => parse_success::<RemoteUser>(response).await,
            Err(e) => Err(AuthError::from(e)),
        };

        match user {
            Ok(user) => session.user = user,
            Err(e) => {
                warn!("Failed to update metadata for {user_id}: {e}");
                session.user.metadata.role = Some(role.as_str().to_string());
            }
        }
        self.store_session(SessionEvent::UserUpdated, Some(session));
    }
}

impl Drop for GoTrueProvider {
    fn drop(&mut self) {
        if let Some(timer) = self.expiry_timer.get_mut().take() {
            timer.abort();
        }
    }
}

fn restore_session(store: &dyn FallbackStore) -> Option<RemoteSession> {
    let raw = store.get_field(&FallbackKey::ProviderSession)?;
    match serde_json::from_str(&raw) {
        Ok(session) => Some(session),
        Err(e) => {
            warn!("Discarding unreadable stored session: {e}");
            store.remove_field(&FallbackKey::ProviderSession);
            None
        }
    }
}

/// Decodes a success body, or classifies the failure.
async fn parse_success<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, AuthError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| AuthError::Generic(format!("Malformed response from authentication service: {e}")));
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status, &body))
}

fn classify_failure(status: StatusCode, body: &str) -> AuthError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed.message().unwrap_or_else(|| {
        if body.trim().is_empty() {
            format!("Authentication service returned {status}")
        } else {
            body.to_string()
        }
    });

    let lowered = message.to_ascii_lowercase();
    let already = parsed.error_code.as_deref() == Some("user_already_exists")
        || lowered.contains("already registered")
        || lowered.contains("already exists");
    if already && matches!(status.as_u16(), 400 | 409 | 422) {
        return AuthError::already_registered();
    }

    if matches!(status.as_u16(), 502..=504) {
        return AuthError::unreachable();
    }

    AuthError::Generic(message)
}

#[async_trait]
impl IdentityProvider for GoTrueProvider {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        data: &SignUpData,
    ) -> Result<RemoteSession, AuthError> {
        let body = json!({
            "email": email,
            "password": password,
            "data": { "name": data.name, "role": data.role },
        });
        let response = self
            .authorized(self.client.post(self.url("/auth/v1/signup")))
            .json(&body)
            .send()
            .await?;

        let token: TokenResponse = parse_success(response).await?;
        let session = token.into_session().ok_or_else(|| {
            AuthError::Generic(
                "Account created, but the service did not start a session. Confirm your email and sign in."
                    .to_string(),
            )
        })?;

        info!("Remote sign-up succeeded for user {}", session.user.id);
        self.store_session(SessionEvent::SignedIn, Some(session.clone()));

        if data.role.is_resolved() && !self.set_role(&session.user.id, data.role).await {
            warn!("Could not store role for new user {}", session.user.id);
        }

        Ok(session)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<RemoteSession, AuthError> {
        let session = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;
        info!("Remote sign-in succeeded for user {}", session.user.id);
        self.store_session(SessionEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if self.session.read().is_none() {
            return Ok(());
        }

        let result = match self
            .authorized(self.client.post(self.url("/auth/v1/logout")))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                Err(classify_failure(status, &body))
            }
            Err(e) => Err(AuthError::from(e)),
        };

        // The local copy of the session goes regardless of what the service said.
        self.store_session(SessionEvent::SignedOut, None);
        result
    }

    async fn current_user(&self) -> Option<RemoteUser> {
        self.session.read().as_ref()?;

        let response = match self
            .authorized(self.client.get(self.url("/auth/v1/user")))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to fetch current user: {e}");
                return None;
            }
        };

        match parse_success::<RemoteUser>(response).await {
            Ok(user) => Some(user),
            Err(e) => {
                warn!("Failed to fetch current user: {e}");
                None
            }
        }
    }

    async fn current_session(&self) -> Option<RemoteSession> {
        self.ensure_fresh().await
    }

    async fn get_role(&self, user_id: Option<&str>) -> Result<Option<Role>, AuthError> {
        let id = match user_id {
            Some(id) => id.to_string(),
            None => match self.session.read().as_ref() {
                Some(s) => s.user.id.clone(),
                None => return Ok(None),
            },
        };

        let filter = format!("eq.{id}");
        let response = self
            .authorized(self.client.get(self.url(&format!("/rest/v1/{PROFILES_TABLE}"))))
            .query(&[("id", filter.as_str()), ("select", "role")])
            .send()
            .await?;

        let rows: Vec<ProfileRow> = parse_success(response).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.role)
            .as_deref()
            .and_then(Role::parse))
    }

    async fn set_role(&self, user_id: &str, role: Role) -> bool {
        let result = self
            .authorized(self.client.post(self.url(&format!("/rest/v1/{PROFILES_TABLE}"))))
            .header("Prefer", "resolution=merge-duplicates")
            .json(&[ProfileUpsert { id: user_id, role }])
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                self.sync_session_role(user_id, role).await;
                true
            }
            Ok(response) => {
                warn!("Role update for {user_id} rejected with {}", response.status());
                false
            }
            Err(e) => {
                warn!("Role update for {user_id} failed: {e}");
                false
            }
        }
    }

    fn on_session_change(&self, listener: SessionListener) -> Subscription {
        self.listeners.register(listener)
    }
}
