use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    /// Absent for federated identities, which never go through the
    /// registration form.
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    /// Set for identities created through the federated (Google) sign-in path.
    pub is_google_account: bool,
}

impl UserProfile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// A rental listing. Ownership is a plain foreign-key reference; the backend
/// does not enforce that `owner_id` still exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flat {
    pub id: Uuid,
    pub name: String,
    pub city: String,
    pub street_name: String,
    pub street_number: u32,
    /// Square meters.
    pub area_size: f64,
    /// Monthly rent.
    pub rent_price: f64,
    pub year_built: i32,
    pub has_ac: bool,
    pub image_url: Option<String>,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Owner-supplied fields of a listing, before the store assigns identity
/// and timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlatDraft {
    pub name: String,
    pub city: String,
    pub street_name: String,
    pub street_number: u32,
    pub area_size: f64,
    pub rent_price: f64,
    pub year_built: i32,
    pub has_ac: bool,
}

/// The per-user favorites document: flat id -> presence flag. Unfavoriting
/// removes the key rather than storing `false`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FavoriteMap {
    #[serde(default)]
    pub flats: HashMap<Uuid, bool>,
}

impl FavoriteMap {
    pub fn contains(&self, flat_id: Uuid) -> bool {
        self.flats.get(&flat_id).copied().unwrap_or(false)
    }

    /// Flips membership for `flat_id`, returning the new membership value.
    pub fn toggle(&mut self, flat_id: Uuid) -> bool {
        if self.contains(flat_id) {
            self.flats.remove(&flat_id);
            false
        } else {
            self.flats.insert(flat_id, true);
            true
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub flat_id: Uuid,
    /// Denormalized listing name so threads stay readable after edits.
    pub flat_name: String,
    pub sender_id: Uuid,
    pub sender_email: String,
    pub recipient_id: Uuid,
    pub recipient_email: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    /// Monotonic: flips false -> true when the recipient opens the thread,
    /// never back.
    pub read: bool,
}
