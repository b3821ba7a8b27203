//! Listing collection cache. `fetch_all` replaces the snapshot; writes the
//! store itself issues are applied to the cache in place so the UI never
//! needs a full refetch after its own mutation. Authorization here is
//! client-side gating only; the backend must re-check ownership and the
//! admin flag for any real deployment.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flatly_backend::{BlobBackend, DocumentBackend, SortOrder, UploadProgress};
use flatly_types::models::{Flat, FlatDraft};
use flatly_types::validate;

use crate::collections::FLATS;
use crate::error::{StoreError, StoreResult};
use crate::notify::Notifier;
use crate::session::SessionStore;

/// An image picked in the listing form, uploaded before the document is
/// created. `progress` can be polled by the UI while the upload runs.
pub struct ImageUpload {
    pub file_name: String,
    pub data: Vec<u8>,
    pub progress: Arc<UploadProgress>,
}

/// Partial listing update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlatChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rent_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_built: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_ac: Option<bool>,
}

impl FlatChanges {
    fn apply(&self, flat: &mut Flat) {
        if let Some(name) = &self.name {
            flat.name = name.clone();
        }
        if let Some(city) = &self.city {
            flat.city = city.clone();
        }
        if let Some(street_name) = &self.street_name {
            flat.street_name = street_name.clone();
        }
        if let Some(street_number) = self.street_number {
            flat.street_number = street_number;
        }
        if let Some(area_size) = self.area_size {
            flat.area_size = area_size;
        }
        if let Some(rent_price) = self.rent_price {
            flat.rent_price = rent_price;
        }
        if let Some(year_built) = self.year_built {
            flat.year_built = year_built;
        }
        if let Some(has_ac) = self.has_ac {
            flat.has_ac = has_ac;
        }
    }
}

struct FlatsInner {
    docs: Arc<dyn DocumentBackend>,
    blobs: Arc<dyn BlobBackend>,
    session: SessionStore,
    notifier: Notifier,
    cache: Mutex<Vec<Flat>>,
}

#[derive(Clone)]
pub struct FlatsStore {
    inner: Arc<FlatsInner>,
}

impl FlatsStore {
    pub fn new(
        docs: Arc<dyn DocumentBackend>,
        blobs: Arc<dyn BlobBackend>,
        session: SessionStore,
        notifier: Notifier,
    ) -> Self {
        Self {
            inner: Arc::new(FlatsInner {
                docs,
                blobs,
                session,
                notifier,
                cache: Mutex::new(Vec::new()),
            }),
        }
    }

    fn cache(&self) -> MutexGuard<'_, Vec<Flat>> {
        self.inner.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the cache with the backend's listing set, newest first.
    pub async fn fetch_all(&self) -> StoreResult<Vec<Flat>> {
        let docs = self
            .inner
            .docs
            .query_ordered(FLATS, "created_at", SortOrder::Desc)
            .await?;

        let mut flats = Vec::with_capacity(docs.len());
        for (id, doc) in docs {
            match serde_json::from_value::<Flat>(doc) {
                Ok(flat) => flats.push(flat),
                Err(e) => warn!(flat = %id, "malformed listing document: {e}"),
            }
        }

        *self.cache() = flats.clone();
        debug!(count = flats.len(), "listings fetched");
        Ok(flats)
    }

    /// Current cached snapshot, in fetch order.
    pub fn flats(&self) -> Vec<Flat> {
        self.cache().clone()
    }

    /// Listings owned by the signed-in user.
    pub async fn fetch_owned(&self) -> StoreResult<Vec<Flat>> {
        let user = self.inner.session.current_user().ok_or(StoreError::NotSignedIn)?;
        let docs = self
            .inner
            .docs
            .query_eq(FLATS, "owner_id", &serde_json::json!(user.id))
            .await?;

        let mut flats = Vec::with_capacity(docs.len());
        for (id, doc) in docs {
            match serde_json::from_value::<Flat>(doc) {
                Ok(flat) => flats.push(flat),
                Err(e) => warn!(flat = %id, "malformed listing document: {e}"),
            }
        }
        flats.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(flats)
    }

    /// Validates the draft, uploads the image if present, creates the
    /// document, and prepends the new listing to the cache.
    pub async fn create(
        &self,
        draft: FlatDraft,
        image: Option<ImageUpload>,
    ) -> StoreResult<Flat> {
        let user = self.inner.session.current_user().ok_or(StoreError::NotSignedIn)?;
        validate::validate_flat(&draft)?;

        let image_url = match image {
            Some(upload) => {
                let path = format!(
                    "images/{}_{}",
                    Utc::now().timestamp_millis(),
                    upload.file_name
                );
                self.inner
                    .blobs
                    .upload(&path, &upload.data, upload.progress)
                    .await?;
                Some(self.inner.blobs.public_url(&path).await?)
            }
            None => None,
        };

        let flat = Flat {
            id: Uuid::new_v4(),
            name: draft.name,
            city: draft.city,
            street_name: draft.street_name,
            street_number: draft.street_number,
            area_size: draft.area_size,
            rent_price: draft.rent_price,
            year_built: draft.year_built,
            has_ac: draft.has_ac,
            image_url,
            owner_id: user.id,
            created_at: Utc::now(),
        };

        self.inner
            .docs
            .create(FLATS, &flat.id.to_string(), serde_json::to_value(&flat)?)
            .await?;

        self.cache().insert(0, flat.clone());
        info!(flat = %flat.id, "listing created");
        self.inner.notifier.success("Flat added successfully");
        Ok(flat)
    }

    /// Owner-or-admin partial update; the cache entry is patched in place.
    pub async fn update(&self, flat_id: Uuid, changes: FlatChanges) -> StoreResult<()> {
        let flat = self.find(flat_id).await?;
        self.authorize_mutation(&flat)?;

        self.inner
            .docs
            .update(FLATS, &flat_id.to_string(), serde_json::to_value(&changes)?)
            .await?;

        let mut cache = self.cache();
        if let Some(cached) = cache.iter_mut().find(|f| f.id == flat_id) {
            changes.apply(cached);
        }
        drop(cache);

        self.inner.notifier.success("Flat updated successfully");
        Ok(())
    }

    /// Owner-or-admin delete; the cache entry is dropped in place.
    pub async fn delete(&self, flat_id: Uuid) -> StoreResult<()> {
        let flat = self.find(flat_id).await?;
        self.authorize_mutation(&flat)?;

        self.inner.docs.delete(FLATS, &flat_id.to_string()).await?;
        self.cache().retain(|f| f.id != flat_id);

        info!(flat = %flat_id, "listing deleted");
        self.inner.notifier.success("Flat deleted successfully");
        Ok(())
    }

    async fn find(&self, flat_id: Uuid) -> StoreResult<Flat> {
        if let Some(flat) = self.cache().iter().find(|f| f.id == flat_id).cloned() {
            return Ok(flat);
        }
        let doc = self
            .inner
            .docs
            .get(FLATS, &flat_id.to_string())
            .await?
            .ok_or(flatly_backend::BackendError::NotFound {
                collection: FLATS.to_string(),
                id: flat_id.to_string(),
            })?;
        Ok(serde_json::from_value(doc)?)
    }

    fn authorize_mutation(&self, flat: &Flat) -> StoreResult<()> {
        let state = self.inner.session.state();
        let Some(user) = state.user() else {
            return Err(StoreError::NotSignedIn);
        };
        if user.id != flat.owner_id && !user.is_admin {
            return Err(StoreError::Forbidden(
                "only the owner or an admin may modify a listing",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::NaiveDate;
    use flatly_backend::memory::MemoryBackend;
    use flatly_types::validate::Registration;
    use serde_json::json;

    use crate::session::SessionConfig;

    use super::*;

    fn draft(name: &str, rent: f64) -> FlatDraft {
        FlatDraft {
            name: name.into(),
            city: "Linz".into(),
            street_name: "Hauptstrasse".into(),
            street_number: 4,
            area_size: 60.0,
            rent_price: rent,
            year_built: 1995,
            has_ac: false,
        }
    }

    async fn signed_in_store(backend: &MemoryBackend, email: &str) -> (FlatsStore, SessionStore) {
        let shared = Arc::new(backend.clone());
        let session = SessionStore::new(
            shared.clone(),
            shared.clone(),
            Notifier::new(),
            SessionConfig::default(),
        );
        session
            .register(Registration {
                first_name: "Ana".into(),
                last_name: "Berg".into(),
                email: email.into(),
                password: "Abc1!x".into(),
                birth_date: NaiveDate::from_ymd_opt(1990, 3, 1),
            })
            .await
            .unwrap();
        let store = FlatsStore::new(shared.clone(), shared, session.clone(), Notifier::new());
        (store, session)
    }

    #[tokio::test]
    async fn create_requires_sign_in() {
        let backend = Arc::new(MemoryBackend::new());
        let session = SessionStore::new(
            backend.clone(),
            backend.clone(),
            Notifier::new(),
            SessionConfig::default(),
        );
        let store = FlatsStore::new(backend.clone(), backend, session, Notifier::new());

        let err = store.create(draft("Loft", 700.0), None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotSignedIn));
    }

    #[tokio::test]
    async fn create_validates_the_draft() {
        let backend = MemoryBackend::new();
        let (store, _session) = signed_in_store(&backend, "ana@example.com").await;

        let err = store.create(draft("Loft", 0.0), None).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(v) if v.field == "rent_price"));
    }

    #[tokio::test]
    async fn fetch_all_orders_newest_first() {
        let backend = MemoryBackend::new();
        let (store, _session) = signed_in_store(&backend, "ana@example.com").await;

        store.create(draft("First", 500.0), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.create(draft("Second", 600.0), None).await.unwrap();

        let flats = store.fetch_all().await.unwrap();
        assert_eq!(flats[0].name, "Second");
        assert_eq!(flats[1].name, "First");
    }

    #[tokio::test]
    async fn update_patches_cache_without_refetch() {
        let backend = MemoryBackend::new();
        let (store, _session) = signed_in_store(&backend, "ana@example.com").await;

        let flat = store.create(draft("Loft", 700.0), None).await.unwrap();
        store
            .update(
                flat.id,
                FlatChanges { rent_price: Some(750.0), ..Default::default() },
            )
            .await
            .unwrap();

        // Cache reflects the edit with no fetch_all in between.
        let cached = store.flats();
        assert_eq!(cached[0].rent_price, 750.0);

        // And the backend document agrees.
        let doc = backend.get(FLATS, &flat.id.to_string()).await.unwrap().unwrap();
        assert_eq!(doc["rent_price"], json!(750.0));
    }

    #[tokio::test]
    async fn delete_removes_from_cache_in_place() {
        let backend = MemoryBackend::new();
        let (store, _session) = signed_in_store(&backend, "ana@example.com").await;

        let flat = store.create(draft("Loft", 700.0), None).await.unwrap();
        store.delete(flat.id).await.unwrap();

        assert!(store.flats().is_empty());
        assert!(backend.get(FLATS, &flat.id.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_owner_is_forbidden_admin_is_not() {
        let backend = MemoryBackend::new();
        let (store, session) = signed_in_store(&backend, "owner@example.com").await;
        let flat = store.create(draft("Loft", 700.0), None).await.unwrap();

        // A different user may not touch it.
        session.sign_out().await.unwrap();
        session
            .register(Registration {
                first_name: "Bo".into(),
                last_name: "Chen".into(),
                email: "other@example.com".into(),
                password: "Abc1!x".into(),
                birth_date: NaiveDate::from_ymd_opt(1985, 1, 1),
            })
            .await
            .unwrap();
        let err = store.delete(flat.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));

        // Promoting them to admin flips the outcome.
        let other = session.current_user().unwrap();
        backend
            .update(
                crate::collections::USERS,
                &other.id.to_string(),
                json!({ "is_admin": true }),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.delete(flat.id).await.unwrap();
    }

    #[tokio::test]
    async fn create_with_image_resolves_public_url() {
        let backend = MemoryBackend::new();
        let (store, _session) = signed_in_store(&backend, "ana@example.com").await;

        let progress = UploadProgress::new();
        let flat = store
            .create(
                draft("Loft", 700.0),
                Some(ImageUpload {
                    file_name: "loft.jpg".into(),
                    data: vec![1u8; 150_000],
                    progress: progress.clone(),
                }),
            )
            .await
            .unwrap();

        assert!((progress.fraction() - 1.0).abs() < f64::EPSILON);
        let url = flat.image_url.unwrap();
        assert!(url.contains("loft.jpg"));
    }
}
