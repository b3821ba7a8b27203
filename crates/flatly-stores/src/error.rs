use thiserror::Error;

use flatly_backend::BackendError;
use flatly_types::validate::ValidationError;

/// Store-level failure taxonomy: field validation (surfaced inline),
/// backend-rejected operations (surfaced as notices, rolled back where the
/// contract says so), and authorization gating.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not signed in")]
    NotSignedIn,

    #[error("not allowed: {0}")]
    Forbidden(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;
