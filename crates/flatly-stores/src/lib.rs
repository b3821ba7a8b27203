//! The client-side synchronization layer: stores holding provisional local
//! state over the backend's documents. Optimistic updates hide latency; the
//! backend's live subscriptions remain the source of eventual truth.

pub mod admin;
pub mod error;
pub mod favorites;
pub mod filter;
pub mod flats;
pub mod messages;
pub mod notify;
pub mod session;

pub use error::{StoreError, StoreResult};
pub use notify::Notifier;

/// Document collections the stores read and write.
pub mod collections {
    pub const USERS: &str = "users";
    pub const FLATS: &str = "flats";
    pub const FAVORITES: &str = "favorites";
    pub const MESSAGES: &str = "messages";
}
