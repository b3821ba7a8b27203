//! Admin console: the user roster with per-user listing counts, role
//! toggling, and the account-deletion cascade. The admin flag is client-side
//! gating only; a real deployment needs the backend to re-validate it on
//! every privileged write.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use flatly_backend::{DocumentBackend, IdentityBackend, SortOrder};
use flatly_types::models::UserProfile;
use flatly_types::validate::age_on;

use crate::collections::{FAVORITES, FLATS, MESSAGES, USERS};
use crate::error::{StoreError, StoreResult};
use crate::filter::SortDirection;
use crate::notify::Notifier;
use crate::session::SessionStore;

/// A roster row: the profile plus how many listings the user owns.
#[derive(Debug, Clone, PartialEq)]
pub struct AdminUser {
    pub profile: UserProfile,
    pub flats_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoleFilter {
    #[default]
    All,
    Admins,
    Regular,
}

/// Roster filters; numeric bounds are form text, parsed permissively.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserFilters {
    pub role: RoleFilter,
    pub min_age: String,
    pub max_age: String,
    pub min_flats: String,
    pub max_flats: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSortKey {
    FirstName,
    LastName,
    Email,
    FlatsCount,
}

fn bound(text: &str) -> Option<i64> {
    text.trim().parse::<i64>().ok()
}

/// Pure roster filter. Users without a birth date (federated accounts) pass
/// the age bounds; age unknown is not age zero.
pub fn filter_users(users: &[AdminUser], filters: &UserFilters, today: NaiveDate) -> Vec<AdminUser> {
    let min_age = bound(&filters.min_age);
    let max_age = bound(&filters.max_age);
    let min_flats = bound(&filters.min_flats);
    let max_flats = bound(&filters.max_flats);

    users
        .iter()
        .filter(|user| {
            match filters.role {
                RoleFilter::All => {}
                RoleFilter::Admins if !user.profile.is_admin => return false,
                RoleFilter::Regular if user.profile.is_admin => return false,
                _ => {}
            }
            let age = user.profile.birth_date.map(|b| i64::from(age_on(b, today)));
            if let (Some(min), Some(age)) = (min_age, age) {
                if age < min {
                    return false;
                }
            }
            if let (Some(max), Some(age)) = (max_age, age) {
                if age > max {
                    return false;
                }
            }
            let flats = user.flats_count as i64;
            if min_flats.is_some_and(|min| flats < min) {
                return false;
            }
            if max_flats.is_some_and(|max| flats > max) {
                return false;
            }
            true
        })
        .cloned()
        .collect()
}

pub fn sort_users(users: &[AdminUser], key: UserSortKey, direction: SortDirection) -> Vec<AdminUser> {
    let mut sorted = users.to_vec();
    sorted.sort_by(|a, b| {
        let ord = match key {
            UserSortKey::FirstName => a.profile.first_name.cmp(&b.profile.first_name),
            UserSortKey::LastName => a.profile.last_name.cmp(&b.profile.last_name),
            UserSortKey::Email => a.profile.email.cmp(&b.profile.email),
            UserSortKey::FlatsCount => a.flats_count.cmp(&b.flats_count),
        };
        match direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        }
    });
    sorted
}

struct AdminInner {
    docs: Arc<dyn DocumentBackend>,
    identity: Arc<dyn IdentityBackend>,
    session: SessionStore,
    notifier: Notifier,
    users: Mutex<Vec<AdminUser>>,
}

#[derive(Clone)]
pub struct AdminStore {
    inner: Arc<AdminInner>,
}

impl AdminStore {
    pub fn new(
        docs: Arc<dyn DocumentBackend>,
        identity: Arc<dyn IdentityBackend>,
        session: SessionStore,
        notifier: Notifier,
    ) -> Self {
        Self {
            inner: Arc::new(AdminInner {
                docs,
                identity,
                session,
                notifier,
                users: Mutex::new(Vec::new()),
            }),
        }
    }

    fn users_cache(&self) -> MutexGuard<'_, Vec<AdminUser>> {
        self.inner.users.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn require_admin(&self) -> StoreResult<UserProfile> {
        let user = self.inner.session.current_user().ok_or(StoreError::NotSignedIn)?;
        if !user.is_admin {
            return Err(StoreError::Forbidden("admin console requires the admin flag"));
        }
        Ok(user)
    }

    /// Loads the full roster with per-user listing counts.
    pub async fn load(&self) -> StoreResult<Vec<AdminUser>> {
        self.require_admin()?;

        let docs = self
            .inner
            .docs
            .query_ordered(USERS, "created_at", SortOrder::Asc)
            .await?;

        let mut roster = Vec::with_capacity(docs.len());
        for (id, doc) in docs {
            let profile: UserProfile = match serde_json::from_value(doc) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(user = %id, "malformed user document: {e}");
                    continue;
                }
            };
            let flats_count = self
                .inner
                .docs
                .query_eq(FLATS, "owner_id", &json!(profile.id))
                .await?
                .len();
            roster.push(AdminUser { profile, flats_count });
        }

        *self.users_cache() = roster.clone();
        Ok(roster)
    }

    pub fn users(&self) -> Vec<AdminUser> {
        self.users_cache().clone()
    }

    /// Flips the admin flag; the target's own session picks the change up
    /// through its live user-document subscription.
    pub async fn set_admin(&self, user_id: Uuid, is_admin: bool) -> StoreResult<()> {
        self.require_admin()?;

        self.inner
            .docs
            .update(USERS, &user_id.to_string(), json!({ "is_admin": is_admin }))
            .await?;

        if let Some(row) = self.users_cache().iter_mut().find(|u| u.profile.id == user_id) {
            row.profile.is_admin = is_admin;
        }
        info!(user = %user_id, is_admin, "admin flag changed");
        Ok(())
    }

    /// Deletes an account and everything referencing it: owned listings,
    /// the favorites document, sent and received messages, the user
    /// document, and finally the identity. Allowed for the user themselves
    /// or an admin.
    ///
    /// The backend offers no transaction, so the cascade can be observed
    /// half-done; listings go first to shrink the window in which a flat
    /// references a deleted owner. Every step is attempted even after a
    /// failure; the first error is returned.
    pub async fn delete_account(&self, user_id: Uuid) -> StoreResult<()> {
        let actor = self.inner.session.current_user().ok_or(StoreError::NotSignedIn)?;
        if actor.id != user_id && !actor.is_admin {
            return Err(StoreError::Forbidden(
                "only the account owner or an admin may delete an account",
            ));
        }

        warn!(user = %user_id, "account cascade is not transactional; a concurrent reader may see dangling references");

        let mut first_error: Option<StoreError> = None;
        let mut record = |result: Result<(), StoreError>| {
            if let Err(e) = result {
                warn!("cascade step failed: {e}");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        };

        record(self.delete_matching(FLATS, "owner_id", user_id).await);
        record(
            self.inner
                .docs
                .delete(FAVORITES, &user_id.to_string())
                .await
                .map_err(StoreError::from),
        );
        record(self.delete_matching(MESSAGES, "sender_id", user_id).await);
        record(self.delete_matching(MESSAGES, "recipient_id", user_id).await);
        record(
            self.inner
                .docs
                .delete(USERS, &user_id.to_string())
                .await
                .map_err(StoreError::from),
        );
        record(
            self.inner
                .identity
                .delete_identity(user_id)
                .await
                .map_err(StoreError::from),
        );

        self.users_cache().retain(|u| u.profile.id != user_id);

        match first_error {
            None => {
                info!(user = %user_id, "account deleted");
                self.inner.notifier.success("Account deleted");
                Ok(())
            }
            Some(e) => {
                self.inner.notifier.error("Account deletion did not fully complete");
                Err(e)
            }
        }
    }

    async fn delete_matching(
        &self,
        collection: &str,
        field: &str,
        user_id: Uuid,
    ) -> StoreResult<()> {
        let matches = self
            .inner
            .docs
            .query_eq(collection, field, &json!(user_id))
            .await?;
        for (id, _) in matches {
            self.inner.docs.delete(collection, &id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use flatly_backend::memory::MemoryBackend;
    use flatly_types::models::FlatDraft;
    use flatly_types::validate::Registration;

    use crate::flats::FlatsStore;
    use crate::session::SessionConfig;

    use super::*;

    fn profile(first: &str, birth: Option<NaiveDate>, is_admin: bool) -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            first_name: first.into(),
            last_name: "Berg".into(),
            email: format!("{first}@example.com"),
            birth_date: birth,
            is_admin,
            created_at: Utc::now(),
            is_google_account: birth.is_none(),
        }
    }

    fn row(first: &str, birth: Option<NaiveDate>, is_admin: bool, flats: usize) -> AdminUser {
        AdminUser { profile: profile(first, birth, is_admin), flats_count: flats }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn age_bounds_use_calendar_age() {
        let users = vec![row("ana", Some(date(2000, 6, 15)), false, 0)];
        let filters = UserFilters { min_age: "24".into(), ..Default::default() };

        // Day before the birthday she is 23, on the day she is 24.
        assert!(filter_users(&users, &filters, date(2024, 6, 14)).is_empty());
        assert_eq!(filter_users(&users, &filters, date(2024, 6, 15)).len(), 1);
    }

    #[test]
    fn unknown_age_passes_age_bounds() {
        let users = vec![row("google", None, false, 0)];
        let filters = UserFilters {
            min_age: "18".into(),
            max_age: "99".into(),
            ..Default::default()
        };
        assert_eq!(filter_users(&users, &filters, date(2024, 1, 1)).len(), 1);
    }

    #[test]
    fn role_and_flat_count_filters() {
        let users = vec![
            row("ana", Some(date(1990, 1, 1)), true, 3),
            row("bo", Some(date(1990, 1, 1)), false, 0),
        ];

        let admins = UserFilters { role: RoleFilter::Admins, ..Default::default() };
        assert_eq!(filter_users(&users, &admins, date(2024, 1, 1)).len(), 1);

        let landlords = UserFilters { min_flats: "1".into(), ..Default::default() };
        let result = filter_users(&users, &landlords, date(2024, 1, 1));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].profile.first_name, "ana");
    }

    #[test]
    fn sorts_by_flat_count_numerically() {
        let users = vec![
            row("ana", None, false, 10),
            row("bo", None, false, 2),
        ];
        let sorted = sort_users(&users, UserSortKey::FlatsCount, SortDirection::Asc);
        assert_eq!(sorted[0].flats_count, 2);
        let reversed = sort_users(&users, UserSortKey::FlatsCount, SortDirection::Desc);
        assert_eq!(reversed[0].flats_count, 10);
    }

    fn registration(first: &str, email: &str) -> Registration {
        Registration {
            first_name: first.into(),
            last_name: "Berg".into(),
            email: email.into(),
            password: "Abc1!x".into(),
            birth_date: NaiveDate::from_ymd_opt(1990, 3, 1),
        }
    }

    struct Fixture {
        backend: MemoryBackend,
        session: SessionStore,
        flats: FlatsStore,
        admin: AdminStore,
    }

    async fn fixture() -> Fixture {
        let backend = MemoryBackend::new();
        let shared = Arc::new(backend.clone());
        let session = SessionStore::new(
            shared.clone(),
            shared.clone(),
            Notifier::new(),
            SessionConfig::default(),
        );
        let flats = FlatsStore::new(
            shared.clone(),
            shared.clone(),
            session.clone(),
            Notifier::new(),
        );
        let admin = AdminStore::new(shared.clone(), shared, session.clone(), Notifier::new());
        Fixture { backend, session, flats, admin }
    }

    async fn promote_current(fx: &Fixture) {
        let user = fx.session.current_user().unwrap();
        fx.backend
            .update(USERS, &user.id.to_string(), json!({ "is_admin": true }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.session.is_admin());
    }

    #[tokio::test]
    async fn load_requires_the_admin_flag() {
        let fx = fixture().await;
        fx.session.register(registration("Bo", "bo@example.com")).await.unwrap();

        let err = fx.admin.load().await.unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn roster_counts_listings_per_user() {
        let fx = fixture().await;

        // A landlord with two listings.
        fx.session.register(registration("Bo", "bo@example.com")).await.unwrap();
        for name in ["One", "Two"] {
            fx.flats
                .create(
                    FlatDraft {
                        name: name.into(),
                        city: "Linz".into(),
                        street_name: "Hauptstrasse".into(),
                        street_number: 4,
                        area_size: 60.0,
                        rent_price: 700.0,
                        year_built: 1995,
                        has_ac: false,
                    },
                    None,
                )
                .await
                .unwrap();
        }
        fx.session.sign_out().await.unwrap();

        fx.session.register(registration("Ana", "ana@example.com")).await.unwrap();
        promote_current(&fx).await;

        let roster = fx.admin.load().await.unwrap();
        assert_eq!(roster.len(), 2);
        let bo = roster.iter().find(|u| u.profile.first_name == "Bo").unwrap();
        assert_eq!(bo.flats_count, 2);
    }

    #[tokio::test]
    async fn set_admin_updates_backend_and_cache() {
        let fx = fixture().await;
        fx.session.register(registration("Bo", "bo@example.com")).await.unwrap();
        let bo = fx.session.current_user().unwrap();
        fx.session.sign_out().await.unwrap();

        fx.session.register(registration("Ana", "ana@example.com")).await.unwrap();
        promote_current(&fx).await;
        fx.admin.load().await.unwrap();

        fx.admin.set_admin(bo.id, true).await.unwrap();

        let cached = fx.admin.users();
        let row = cached.iter().find(|u| u.profile.id == bo.id).unwrap();
        assert!(row.profile.is_admin);

        let doc = fx.backend.get(USERS, &bo.id.to_string()).await.unwrap().unwrap();
        assert_eq!(doc["is_admin"], json!(true));
    }

    #[tokio::test]
    async fn delete_account_cascades_everything() {
        let fx = fixture().await;

        fx.session.register(registration("Bo", "bo@example.com")).await.unwrap();
        let bo = fx.session.current_user().unwrap();
        let flat = fx.flats
            .create(
                FlatDraft {
                    name: "Loft".into(),
                    city: "Linz".into(),
                    street_name: "Hauptstrasse".into(),
                    street_number: 4,
                    area_size: 60.0,
                    rent_price: 700.0,
                    year_built: 1995,
                    has_ac: false,
                },
                None,
            )
            .await
            .unwrap();
        fx.backend
            .create(FAVORITES, &bo.id.to_string(), json!({ "flats": {} }))
            .await
            .unwrap();
        fx.session.sign_out().await.unwrap();

        // A message Bo received.
        fx.session.register(registration("Rita", "rita@example.com")).await.unwrap();
        let messages =
            crate::messages::MessageStore::new(Arc::new(fx.backend.clone()), fx.session.clone(), Notifier::new());
        messages.send(&flat, "Still available?").await.unwrap();
        fx.session.sign_out().await.unwrap();

        fx.session.register(registration("Ana", "ana@example.com")).await.unwrap();
        promote_current(&fx).await;

        fx.admin.delete_account(bo.id).await.unwrap();

        assert!(fx.backend.get(USERS, &bo.id.to_string()).await.unwrap().is_none());
        assert!(fx.backend.get(FAVORITES, &bo.id.to_string()).await.unwrap().is_none());
        assert!(fx.backend.get(FLATS, &flat.id.to_string()).await.unwrap().is_none());
        assert!(fx.backend
            .query_eq(MESSAGES, "recipient_id", &json!(bo.id))
            .await
            .unwrap()
            .is_empty());

        // The identity is gone too.
        assert!(fx.session.sign_in("bo@example.com", "Abc1!x").await.is_err());
    }

    #[tokio::test]
    async fn regular_user_cannot_delete_someone_else() {
        let fx = fixture().await;
        fx.session.register(registration("Bo", "bo@example.com")).await.unwrap();
        let bo = fx.session.current_user().unwrap();
        fx.session.sign_out().await.unwrap();

        fx.session.register(registration("Rita", "rita@example.com")).await.unwrap();
        let err = fx.admin.delete_account(bo.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
    }
}
