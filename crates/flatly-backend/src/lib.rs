//! Abstract seams for the hosted backend-as-a-service: identity, document
//! store, and blob store. The application consumes these traits only; the
//! concrete hosted SDK lives behind them. `memory` provides the in-process
//! implementation used by tests and the demo binary.

pub mod memory;
pub mod subscription;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

pub use subscription::Subscription;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("not found: {collection}/{id}")]
    NotFound { collection: String, id: String },
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("email is already registered")]
    EmailInUse,
    #[error("no authenticated user")]
    NotAuthenticated,
    #[error("write rejected: {0}")]
    WriteRejected(String),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// How long the identity backend keeps the session alive across restarts.
/// The original app selects this once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    Local,
    Session,
    None,
}

/// The identity the auth provider knows about, distinct from the richer
/// `UserProfile` document the app keeps in the document store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub uid: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthState {
    /// Initial state, before the provider has reported anything.
    #[default]
    Unknown,
    SignedOut,
    SignedIn(AuthUser),
}

impl AuthState {
    pub fn user(&self) -> Option<&AuthUser> {
        match self {
            Self::SignedIn(user) => Some(user),
            _ => None,
        }
    }
}

#[async_trait]
pub trait IdentityBackend: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> BackendResult<AuthUser>;

    async fn sign_in(&self, email: &str, password: &str) -> BackendResult<AuthUser>;

    /// Federated (Google) sign-in. Creates the identity on first use.
    async fn sign_in_federated(&self, email: &str) -> BackendResult<AuthUser>;

    async fn sign_out(&self) -> BackendResult<()>;

    async fn current_user(&self) -> Option<AuthUser>;

    /// Auth-state change stream. The receiver always holds the latest state.
    fn subscribe(&self) -> watch::Receiver<AuthState>;

    async fn set_persistence(&self, mode: Persistence) -> BackendResult<()>;

    /// Removes the identity entirely (account-deletion cascade).
    async fn delete_identity(&self, uid: Uuid) -> BackendResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Document-database operations. Documents cross this seam as
/// `serde_json::Value` objects; typed models live in flatly-types.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Value>>;

    /// Equality filter on a single top-level field.
    async fn query_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> BackendResult<Vec<(String, Value)>>;

    /// Whole collection, ordered by a top-level field.
    async fn query_ordered(
        &self,
        collection: &str,
        order_by: &str,
        order: SortOrder,
    ) -> BackendResult<Vec<(String, Value)>>;

    async fn create(&self, collection: &str, id: &str, doc: Value) -> BackendResult<()>;

    /// Partial update: top-level fields of `changes` are merged into the
    /// existing document.
    async fn update(&self, collection: &str, id: &str, changes: Value) -> BackendResult<()>;

    async fn delete(&self, collection: &str, id: &str) -> BackendResult<()>;

    /// Live document feed. Delivers the current snapshot immediately, then
    /// one snapshot per change. `None` means the document does not exist.
    async fn subscribe_doc(&self, collection: &str, id: &str) -> Subscription<Option<Value>>;

    /// Live collection feed, same delivery contract as `subscribe_doc`.
    async fn subscribe_collection(&self, collection: &str) -> Subscription<Vec<(String, Value)>>;
}

/// Byte counters polled by the UI while an upload runs.
#[derive(Debug, Default)]
pub struct UploadProgress {
    bytes_sent: AtomicU64,
    total_bytes: AtomicU64,
}

impl UploadProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, sent: u64, total: u64) {
        self.bytes_sent.store(sent, Ordering::Relaxed);
        self.total_bytes.store(total, Ordering::Relaxed);
    }

    /// Completion fraction in `0.0..=1.0`; 0 until the total is known.
    pub fn fraction(&self) -> f64 {
        let total = self.total_bytes.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.bytes_sent.load(Ordering::Relaxed) as f64 / total as f64
    }
}

#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Stores `data` under `path`, updating `progress` as bytes land.
    async fn upload(
        &self,
        path: &str,
        data: &[u8],
        progress: Arc<UploadProgress>,
    ) -> BackendResult<()>;

    /// Resolves the public URL of a previously uploaded blob.
    async fn public_url(&self, path: &str) -> BackendResult<String>;
}
