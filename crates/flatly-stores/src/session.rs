//! Session/auth store: `Loading -> { Anonymous, Authenticated }`, driven by
//! the identity backend's state stream and a live subscription to the user's
//! own document. A wall-clock expiry ticker enforces a soft session ceiling;
//! the backend's own token expiry is the real security control.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flatly_backend::{AuthState, DocumentBackend, IdentityBackend};
use flatly_types::events::SessionState;
use flatly_types::models::UserProfile;
use flatly_types::validate::{self, Registration, ValidationError};

use crate::collections::USERS;
use crate::error::{StoreError, StoreResult};
use crate::notify::Notifier;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Hard ceiling on a client session; on expiry the store forces sign-out.
    pub ttl: Duration,
    /// How often the expiry check runs.
    pub expiry_tick: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            expiry_tick: Duration::from_secs(1),
        }
    }
}

/// Partial profile update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<chrono::NaiveDate>,
}

struct SessionInner {
    identity: Arc<dyn IdentityBackend>,
    docs: Arc<dyn DocumentBackend>,
    notifier: Notifier,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    login_at: Mutex<Option<Instant>>,
    user_sub: Mutex<Option<JoinHandle<()>>>,
}

impl SessionInner {
    /// Drops to `Anonymous`: tears down the user-doc subscription pump and
    /// clears the login instant.
    fn clear_session(&self) {
        if let Some(task) = lock(&self.user_sub).take() {
            task.abort();
        }
        *lock(&self.login_at) = None;
        self.state_tx.send_replace(SessionState::Anonymous);
    }

    fn session_expired(&self) -> bool {
        lock(&self.login_at).is_some_and(|at| at.elapsed() >= self.config.ttl)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

impl SessionStore {
    /// Builds the store and starts its background tasks; call from within
    /// the runtime, once, at application start.
    pub fn new(
        identity: Arc<dyn IdentityBackend>,
        docs: Arc<dyn DocumentBackend>,
        notifier: Notifier,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Loading);
        let store = Self {
            inner: Arc::new(SessionInner {
                identity,
                docs,
                notifier,
                config,
                state_tx,
                login_at: Mutex::new(None),
                user_sub: Mutex::new(None),
            }),
        };
        store.spawn_auth_watcher();
        store.spawn_expiry_ticker();
        store
    }

    pub fn state(&self) -> SessionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Observable session state; the receiver always holds the latest value.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.inner.state_tx.borrow().user().cloned()
    }

    pub fn is_admin(&self) -> bool {
        self.inner.state_tx.borrow().is_admin()
    }

    /// Validates the form, checks email uniqueness, creates the identity and
    /// the user document, and signs the new user in.
    pub async fn register(&self, reg: Registration) -> StoreResult<UserProfile> {
        validate::validate_registration(&reg)?;

        let taken = self
            .inner
            .docs
            .query_eq(USERS, "email", &json!(reg.email))
            .await?;
        if !taken.is_empty() {
            return Err(ValidationError {
                field: "email",
                message: "Email is already registered. Please use a different email".into(),
            }
            .into());
        }

        let auth = self.inner.identity.sign_up(&reg.email, &reg.password).await?;
        let profile = UserProfile {
            id: auth.uid,
            first_name: reg.first_name.trim().to_string(),
            last_name: reg.last_name.trim().to_string(),
            email: reg.email.clone(),
            birth_date: reg.birth_date,
            is_admin: false,
            created_at: Utc::now(),
            is_google_account: false,
        };
        self.inner
            .docs
            .create(USERS, &auth.uid.to_string(), serde_json::to_value(&profile)?)
            .await?;

        info!(user = %auth.uid, "registered");
        self.finish_sign_in(profile.clone()).await;
        Ok(profile)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> StoreResult<UserProfile> {
        let auth = self.inner.identity.sign_in(email, password).await?;
        let profile = self.load_profile(auth.uid).await?;
        self.finish_sign_in(profile.clone()).await;
        Ok(profile)
    }

    /// Federated (Google) sign-in. A first-time identity gets a minimal user
    /// document derived from its email address.
    pub async fn sign_in_with_google(&self, email: &str) -> StoreResult<UserProfile> {
        let auth = self.inner.identity.sign_in_federated(email).await?;
        let uid = auth.uid.to_string();

        let profile = match self.inner.docs.get(USERS, &uid).await? {
            Some(doc) => serde_json::from_value(doc)?,
            None => {
                let local_part = email.split('@').next().unwrap_or(email);
                let profile = UserProfile {
                    id: auth.uid,
                    first_name: local_part.to_string(),
                    last_name: String::new(),
                    email: email.to_string(),
                    birth_date: None,
                    is_admin: false,
                    created_at: Utc::now(),
                    is_google_account: true,
                };
                self.inner
                    .docs
                    .create(USERS, &uid, serde_json::to_value(&profile)?)
                    .await?;
                profile
            }
        };

        self.finish_sign_in(profile.clone()).await;
        Ok(profile)
    }

    pub async fn sign_out(&self) -> StoreResult<()> {
        self.inner.identity.sign_out().await?;
        self.inner.clear_session();
        Ok(())
    }

    /// Partial update of the current user's document. The live subscription
    /// propagates the new state; no local mutation here.
    pub async fn update_profile(&self, update: ProfileUpdate) -> StoreResult<()> {
        let user = self.current_user().ok_or(StoreError::NotSignedIn)?;

        if update.first_name.as_deref().is_some_and(|n| n.trim().len() < 2) {
            return Err(ValidationError {
                field: "first_name",
                message: "First name must be at least 2 characters long".into(),
            }
            .into());
        }
        if update.last_name.as_deref().is_some_and(|n| n.trim().len() < 2) {
            return Err(ValidationError {
                field: "last_name",
                message: "Last name must be at least 2 characters long".into(),
            }
            .into());
        }

        let mut changes = serde_json::to_value(&update)?;
        if let Some(fields) = changes.as_object_mut() {
            fields.insert("updated_at".into(), json!(Utc::now()));
        }
        self.inner
            .docs
            .update(USERS, &user.id.to_string(), changes)
            .await?;
        Ok(())
    }

    async fn load_profile(&self, uid: Uuid) -> StoreResult<UserProfile> {
        let doc = self
            .inner
            .docs
            .get(USERS, &uid.to_string())
            .await?
            .ok_or(flatly_backend::BackendError::NotFound {
                collection: USERS.to_string(),
                id: uid.to_string(),
            })?;
        Ok(serde_json::from_value(doc)?)
    }

    /// One eager profile read already happened; record the login instant,
    /// publish `Authenticated`, and attach the live user-doc subscription.
    async fn finish_sign_in(&self, profile: UserProfile) {
        *lock(&self.inner.login_at) = Some(Instant::now());
        let user_id = profile.id;
        self.inner
            .state_tx
            .send_replace(SessionState::Authenticated(Box::new(profile)));
        self.attach_user_subscription(user_id).await;
    }

    async fn attach_user_subscription(&self, user_id: Uuid) {
        let mut sub = self
            .inner
            .docs
            .subscribe_doc(USERS, &user_id.to_string())
            .await;

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(snapshot) = sub.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let Some(doc) = snapshot else { continue };
                match serde_json::from_value::<UserProfile>(doc) {
                    Ok(profile) => {
                        // Only apply while this user is still the signed-in
                        // one; a stale pump must not clobber a newer session.
                        inner.state_tx.send_if_modified(|state| match state {
                            SessionState::Authenticated(current) if current.id == user_id => {
                                if **current == profile {
                                    false
                                } else {
                                    debug!(user = %user_id, "user document changed");
                                    *current = Box::new(profile.clone());
                                    true
                                }
                            }
                            _ => false,
                        });
                    }
                    Err(e) => warn!(user = %user_id, "malformed user document: {e}"),
                }
            }
        });

        if let Some(old) = lock(&self.inner.user_sub).replace(handle) {
            old.abort();
        }
    }

    /// Maps the identity backend's stream onto the session state machine.
    /// Sign-ins are completed by the explicit sign-in paths; this task only
    /// resolves the initial state and reacts to external sign-outs.
    fn spawn_auth_watcher(&self) {
        let mut rx = self.inner.identity.subscribe();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let auth = rx.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else { break };
                let signed_out = auth == AuthState::SignedOut;
                let already_anonymous =
                    matches!(*inner.state_tx.borrow(), SessionState::Anonymous);
                if signed_out && !already_anonymous {
                    inner.clear_session();
                }
                drop(inner);
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_expiry_ticker(&self) {
        let tick = self.inner.config.expiry_tick;
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.session_expired() {
                    info!("session expired, signing out");
                    inner.notifier.info("Session expired, please sign in again");
                    if let Err(e) = inner.identity.sign_out().await {
                        warn!("sign-out after expiry failed: {e}");
                    }
                    inner.clear_session();
                }
            }
        });
    }
}
