//! Favorites store: optimistic toggle with debounce-coalesce and rollback.
//!
//! `toggle` flips local membership immediately and schedules one debounced
//! write of the whole map; rapid toggles within the window coalesce into a
//! single write of the final state. A failed write rolls local state back to
//! the snapshot taken at the last toggle and clears the pending flags; no
//! retry is scheduled. There is no cross-session conflict detection: two
//! concurrent sessions resolve last-write-wins at the backend, and the live
//! document subscription is the source of eventual truth once no write is
//! pending.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use flatly_backend::DocumentBackend;
use flatly_types::models::FavoriteMap;

use crate::collections::FAVORITES;
use crate::error::{StoreError, StoreResult};
use crate::notify::Notifier;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Write lifecycle of the store's one mutable document. Commit and rollback
/// both land back in `Clean`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Clean,
    PendingWrite,
}

struct FavState {
    user_id: Option<Uuid>,
    map: FavoriteMap,
    /// Flat ids with an unconfirmed optimistic flip.
    pending: HashSet<Uuid>,
    /// Pre-toggle map of the most recent toggle; restored on write failure.
    rollback: Option<FavoriteMap>,
    write_state: WriteState,
    /// Bumped on every toggle and on detach; a flush whose epoch no longer
    /// matches has been superseded and must not touch the store.
    epoch: u64,
    debounce_task: Option<JoinHandle<()>>,
    sub_task: Option<JoinHandle<()>>,
}

impl FavState {
    fn new() -> Self {
        Self {
            user_id: None,
            map: FavoriteMap::default(),
            pending: HashSet::new(),
            rollback: None,
            write_state: WriteState::Clean,
            epoch: 0,
            debounce_task: None,
            sub_task: None,
        }
    }
}

struct FavInner {
    docs: Arc<dyn DocumentBackend>,
    notifier: Notifier,
    debounce: Duration,
    state: Mutex<FavState>,
}

impl FavInner {
    fn lock(&self) -> MutexGuard<'_, FavState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A backend snapshot replaces local state only while no optimistic
    /// write is in flight; provisional local state wins until it commits or
    /// rolls back.
    fn apply_snapshot(&self, user_id: Uuid, map: FavoriteMap) {
        let mut st = self.lock();
        if st.user_id == Some(user_id) && st.write_state == WriteState::Clean {
            st.map = map;
        }
    }
}

#[derive(Clone)]
pub struct FavoritesStore {
    inner: Arc<FavInner>,
}

impl FavoritesStore {
    pub fn new(docs: Arc<dyn DocumentBackend>, notifier: Notifier) -> Self {
        Self::with_debounce(docs, notifier, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(
        docs: Arc<dyn DocumentBackend>,
        notifier: Notifier,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(FavInner {
                docs,
                notifier,
                debounce,
                state: Mutex::new(FavState::new()),
            }),
        }
    }

    /// Binds the store to a signed-in user and attaches the live favorites
    /// subscription. A missing document is created lazily, so the favorites
    /// record exists from the first session on.
    pub async fn attach(&self, user_id: Uuid) {
        self.detach();
        self.inner.lock().user_id = Some(user_id);

        let mut sub = self
            .inner
            .docs
            .subscribe_doc(FAVORITES, &user_id.to_string())
            .await;
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(snapshot) = sub.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                match snapshot {
                    Some(doc) => match serde_json::from_value::<FavoriteMap>(doc) {
                        Ok(map) => inner.apply_snapshot(user_id, map),
                        Err(e) => warn!(user = %user_id, "malformed favorites document: {e}"),
                    },
                    None => {
                        if let Err(e) = inner
                            .docs
                            .create(FAVORITES, &user_id.to_string(), json!({ "flats": {} }))
                            .await
                        {
                            warn!(user = %user_id, "could not initialize favorites: {e}");
                        }
                        inner.apply_snapshot(user_id, FavoriteMap::default());
                    }
                }
            }
        });

        if let Some(old) = self.inner.lock().sub_task.replace(handle) {
            old.abort();
        }
    }

    /// Unbinds from the current user: cancels the subscription pump, drops
    /// any scheduled write, and clears local state.
    pub fn detach(&self) {
        let mut st = self.inner.lock();
        if let Some(task) = st.sub_task.take() {
            task.abort();
        }
        if let Some(task) = st.debounce_task.take() {
            task.abort();
        }
        *st = FavState::new();
    }

    /// Optimistically flips membership for `flat_id` and (re)schedules the
    /// debounced write. Returns the new local membership.
    pub fn toggle(&self, flat_id: Uuid) -> StoreResult<bool> {
        let mut st = self.inner.lock();
        let Some(user_id) = st.user_id else {
            return Err(StoreError::NotSignedIn);
        };

        let snapshot = st.map.clone();
        let now_favorite = st.map.toggle(flat_id);
        st.pending.insert(flat_id);
        st.rollback = Some(snapshot);
        st.write_state = WriteState::PendingWrite;
        st.epoch += 1;
        let epoch = st.epoch;

        // Coalesce: only the most recent toggle's write survives the window.
        if let Some(task) = st.debounce_task.take() {
            task.abort();
        }
        let store = self.clone();
        let delay = self.inner.debounce;
        st.debounce_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            store.flush(user_id, epoch).await;
        }));

        debug!(flat = %flat_id, favorite = now_favorite, "favorite toggled");
        Ok(now_favorite)
    }

    pub fn is_favorite(&self, flat_id: Uuid) -> bool {
        self.inner.lock().map.contains(flat_id)
    }

    /// True while `flat_id` has an optimistic flip awaiting confirmation.
    pub fn is_pending(&self, flat_id: Uuid) -> bool {
        self.inner.lock().pending.contains(&flat_id)
    }

    pub fn favorites(&self) -> FavoriteMap {
        self.inner.lock().map.clone()
    }

    pub fn write_state(&self) -> WriteState {
        self.inner.lock().write_state
    }

    /// Persists the whole current map. Runs once per debounce window; a
    /// superseded epoch means a newer toggle rescheduled the write.
    async fn flush(&self, user_id: Uuid, epoch: u64) {
        let map = {
            let st = self.inner.lock();
            if st.epoch != epoch {
                return;
            }
            st.map.clone()
        };

        let payload = match serde_json::to_value(&map) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("favorites serialization failed: {e}");
                return;
            }
        };

        let result = self
            .inner
            .docs
            .create(FAVORITES, &user_id.to_string(), payload)
            .await;

        let mut st = self.inner.lock();
        if st.epoch != epoch {
            return;
        }
        match result {
            Ok(()) => {
                st.pending.clear();
                st.rollback = None;
                st.write_state = WriteState::Clean;
                debug!(user = %user_id, "favorites persisted");
            }
            Err(e) => {
                warn!(user = %user_id, "favorites write failed, rolling back: {e}");
                if let Some(previous) = st.rollback.take() {
                    st.map = previous;
                }
                st.pending.clear();
                st.write_state = WriteState::Clean;
                drop(st);
                self.inner.notifier.error("Could not save favorites");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use flatly_backend::memory::MemoryBackend;

    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(30);

    async fn attached_store(backend: &MemoryBackend) -> (FavoritesStore, Uuid) {
        let store = FavoritesStore::with_debounce(
            Arc::new(backend.clone()),
            Notifier::new(),
            DEBOUNCE,
        );
        let user_id = Uuid::new_v4();
        store.attach(user_id).await;
        // Let the subscription pump lazily create the document.
        tokio::time::sleep(Duration::from_millis(10)).await;
        (store, user_id)
    }

    async fn past_debounce() {
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(40)).await;
    }

    async fn persisted_map(backend: &MemoryBackend, user_id: Uuid) -> FavoriteMap {
        let doc = backend
            .get(FAVORITES, &user_id.to_string())
            .await
            .unwrap()
            .expect("favorites document");
        serde_json::from_value(doc).unwrap()
    }

    #[tokio::test]
    async fn toggle_is_optimistic_and_persists_after_debounce() {
        let backend = MemoryBackend::new();
        let (store, user_id) = attached_store(&backend).await;
        let flat = Uuid::new_v4();

        assert!(store.toggle(flat).unwrap());
        assert!(store.is_favorite(flat));
        assert!(store.is_pending(flat));
        assert_eq!(store.write_state(), WriteState::PendingWrite);

        past_debounce().await;
        assert!(store.is_favorite(flat));
        assert!(!store.is_pending(flat));
        assert_eq!(store.write_state(), WriteState::Clean);
        assert!(persisted_map(&backend, user_id).await.contains(flat));
    }

    #[tokio::test]
    async fn rapid_toggles_coalesce_into_one_final_write() {
        let backend = MemoryBackend::new();
        let (store, user_id) = attached_store(&backend).await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        // a on, b on, a off again, all inside one window.
        store.toggle(a).unwrap();
        store.toggle(b).unwrap();
        store.toggle(a).unwrap();
        assert!(!store.is_favorite(a));
        assert!(store.is_favorite(b));

        past_debounce().await;

        let persisted = persisted_map(&backend, user_id).await;
        assert!(!persisted.contains(a));
        assert!(persisted.contains(b));
        assert_eq!(persisted, store.favorites());
    }

    #[tokio::test]
    async fn failed_write_rolls_back_the_toggle() {
        let backend = MemoryBackend::new();
        let (store, _user_id) = attached_store(&backend).await;
        let flat = Uuid::new_v4();

        store.toggle(flat).unwrap();
        assert!(store.is_favorite(flat));

        backend.fail_next_write();
        past_debounce().await;

        assert!(!store.is_favorite(flat));
        assert!(!store.is_pending(flat));
        assert_eq!(store.write_state(), WriteState::Clean);
    }

    #[tokio::test]
    async fn failure_notice_is_published() {
        let backend = MemoryBackend::new();
        let notifier = Notifier::new();
        let store = FavoritesStore::with_debounce(
            Arc::new(backend.clone()),
            notifier.clone(),
            DEBOUNCE,
        );
        let user_id = Uuid::new_v4();
        store.attach(user_id).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut notices = notifier.subscribe();
        store.toggle(Uuid::new_v4()).unwrap();
        backend.fail_next_write();
        past_debounce().await;

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.level, flatly_types::events::NoticeLevel::Error);
    }

    #[tokio::test]
    async fn toggling_while_signed_out_is_rejected() {
        let backend = MemoryBackend::new();
        let store =
            FavoritesStore::with_debounce(Arc::new(backend), Notifier::new(), DEBOUNCE);
        assert!(matches!(
            store.toggle(Uuid::new_v4()),
            Err(StoreError::NotSignedIn)
        ));
    }

    #[tokio::test]
    async fn external_snapshot_updates_clean_state() {
        let backend = MemoryBackend::new();
        let (store, user_id) = attached_store(&backend).await;
        let flat = Uuid::new_v4();

        // Another session favorites a flat; this one follows along.
        backend
            .update(
                FAVORITES,
                &user_id.to_string(),
                json!({ "flats": { flat.to_string(): true } }),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(store.is_favorite(flat));
    }

    #[tokio::test]
    async fn detach_clears_state_and_cancels_writes() {
        let backend = MemoryBackend::new();
        let (store, user_id) = attached_store(&backend).await;
        let flat = Uuid::new_v4();

        store.toggle(flat).unwrap();
        store.detach();
        past_debounce().await;

        // The scheduled write never ran.
        let persisted = persisted_map(&backend, user_id).await;
        assert!(!persisted.contains(flat));
        assert!(!store.is_favorite(flat));
    }
}
