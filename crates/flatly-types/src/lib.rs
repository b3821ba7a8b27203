pub mod events;
pub mod models;
pub mod validate;

pub use models::{Flat, FlatDraft, FavoriteMap, Message, UserProfile};
