//! In-process backend used by tests and the demo binary. Behaves like the
//! hosted service from the stores' point of view: merge-updates, immediate
//! initial snapshots on subscribe, last write wins. Write failures can be
//! injected one at a time for rollback tests.

use std::collections::{BTreeMap, HashMap};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::subscription::{SubscriberRegistry, Subscription};
use crate::{
    AuthState, AuthUser, BackendError, BackendResult, BlobBackend, DocumentBackend,
    IdentityBackend, Persistence, SortOrder, UploadProgress,
};

type Collections = HashMap<String, BTreeMap<String, Value>>;

struct Account {
    uid: Uuid,
    password: Option<String>,
    federated: bool,
}

struct MemoryInner {
    collections: Mutex<Collections>,
    doc_subs: SubscriberRegistry<Option<Value>>,
    coll_subs: SubscriberRegistry<Vec<(String, Value)>>,
    fail_next_write: AtomicBool,

    accounts: Mutex<HashMap<String, Account>>,
    auth_tx: watch::Sender<AuthState>,
    persistence: Mutex<Persistence>,

    blobs: Mutex<HashMap<String, u64>>,
}

#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        // The in-memory provider knows its auth state from the start; real
        // SDKs sit in `Unknown` until their first state-change callback.
        let (auth_tx, _) = watch::channel(AuthState::SignedOut);
        Self {
            inner: Arc::new(MemoryInner {
                collections: Mutex::new(HashMap::new()),
                doc_subs: SubscriberRegistry::new(),
                coll_subs: SubscriberRegistry::new(),
                fail_next_write: AtomicBool::new(false),
                accounts: Mutex::new(HashMap::new()),
                auth_tx,
                persistence: Mutex::new(Persistence::Local),
                blobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Makes the next document write fail with `WriteRejected`. One-shot.
    pub fn fail_next_write(&self) {
        self.inner.fail_next_write.store(true, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> BackendResult<()> {
        if self.inner.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(BackendError::WriteRejected("injected write failure".into()));
        }
        Ok(())
    }

    fn collections(&self) -> MutexGuard<'_, Collections> {
        self.inner.collections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn doc_key(collection: &str, id: &str) -> String {
        format!("{collection}/{id}")
    }

    /// Pushes the post-write snapshots to document and collection listeners.
    fn notify(&self, collection: &str, id: &str) {
        let (doc, all) = {
            let guard = self.collections();
            let coll = guard.get(collection);
            let doc = coll.and_then(|c| c.get(id)).cloned();
            let all: Vec<(String, Value)> = coll
                .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            (doc, all)
        };
        self.inner.doc_subs.publish(&Self::doc_key(collection, id), doc);
        self.inner.coll_subs.publish(collection, all);
    }
}

/// Field ordering used by `query_ordered`: numbers by value, strings
/// lexicographically (RFC 3339 timestamps sort correctly this way), missing
/// fields last.
fn cmp_field(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(f64::NAN)
            .partial_cmp(&y.as_f64().unwrap_or(f64::NAN))
            .unwrap_or(CmpOrdering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => CmpOrdering::Equal,
        (Value::Null, _) => CmpOrdering::Greater,
        (_, Value::Null) => CmpOrdering::Less,
        _ => CmpOrdering::Equal,
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Value>> {
        Ok(self.collections().get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn query_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> BackendResult<Vec<(String, Value)>> {
        let guard = self.collections();
        let Some(coll) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(coll
            .iter()
            .filter(|(_, doc)| doc.get(field) == Some(value))
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect())
    }

    async fn query_ordered(
        &self,
        collection: &str,
        order_by: &str,
        order: SortOrder,
    ) -> BackendResult<Vec<(String, Value)>> {
        let mut docs: Vec<(String, Value)> = {
            let guard = self.collections();
            guard
                .get(collection)
                .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        };
        docs.sort_by(|(_, a), (_, b)| {
            let ord = cmp_field(
                a.get(order_by).unwrap_or(&Value::Null),
                b.get(order_by).unwrap_or(&Value::Null),
            );
            match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
        Ok(docs)
    }

    async fn create(&self, collection: &str, id: &str, doc: Value) -> BackendResult<()> {
        self.take_injected_failure()?;
        self.collections()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        debug!(collection, id, "document created");
        self.notify(collection, id);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, changes: Value) -> BackendResult<()> {
        self.take_injected_failure()?;
        let Value::Object(changes) = changes else {
            return Err(BackendError::WriteRejected("update payload must be an object".into()));
        };
        {
            let mut guard = self.collections();
            let doc = guard
                .get_mut(collection)
                .and_then(|c| c.get_mut(id))
                .ok_or_else(|| BackendError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;
            let Some(fields) = doc.as_object_mut() else {
                return Err(BackendError::WriteRejected("document is not an object".into()));
            };
            for (key, value) in changes {
                fields.insert(key, value);
            }
        }
        debug!(collection, id, "document updated");
        self.notify(collection, id);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> BackendResult<()> {
        self.take_injected_failure()?;
        if let Some(coll) = self.collections().get_mut(collection) {
            coll.remove(id);
        }
        debug!(collection, id, "document deleted");
        self.notify(collection, id);
        Ok(())
    }

    async fn subscribe_doc(&self, collection: &str, id: &str) -> Subscription<Option<Value>> {
        let key = Self::doc_key(collection, id);
        let sub = self.inner.doc_subs.subscribe(&key);
        let current = self.collections().get(collection).and_then(|c| c.get(id)).cloned();
        self.inner.doc_subs.publish_to(&key, sub.id(), current);
        sub
    }

    async fn subscribe_collection(&self, collection: &str) -> Subscription<Vec<(String, Value)>> {
        let sub = self.inner.coll_subs.subscribe(collection);
        let current: Vec<(String, Value)> = self
            .collections()
            .get(collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        self.inner.coll_subs.publish_to(collection, sub.id(), current);
        sub
    }
}

#[async_trait]
impl IdentityBackend for MemoryBackend {
    async fn sign_up(&self, email: &str, password: &str) -> BackendResult<AuthUser> {
        let user = {
            let mut accounts = self.inner.accounts.lock().unwrap_or_else(|e| e.into_inner());
            if accounts.contains_key(email) {
                return Err(BackendError::EmailInUse);
            }
            let uid = Uuid::new_v4();
            accounts.insert(
                email.to_string(),
                Account { uid, password: Some(password.to_string()), federated: false },
            );
            AuthUser { uid, email: email.to_string() }
        };
        debug!(%user.uid, "identity created");
        let _ = self.inner.auth_tx.send(AuthState::SignedIn(user.clone()));
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> BackendResult<AuthUser> {
        let user = {
            let accounts = self.inner.accounts.lock().unwrap_or_else(|e| e.into_inner());
            let account = accounts.get(email).ok_or(BackendError::InvalidCredentials)?;
            // Test double: plain equality. The hosted provider owns real
            // credential verification.
            if account.password.as_deref() != Some(password) {
                return Err(BackendError::InvalidCredentials);
            }
            AuthUser { uid: account.uid, email: email.to_string() }
        };
        let _ = self.inner.auth_tx.send(AuthState::SignedIn(user.clone()));
        Ok(user)
    }

    async fn sign_in_federated(&self, email: &str) -> BackendResult<AuthUser> {
        let user = {
            let mut accounts = self.inner.accounts.lock().unwrap_or_else(|e| e.into_inner());
            let account = accounts.entry(email.to_string()).or_insert_with(|| Account {
                uid: Uuid::new_v4(),
                password: None,
                federated: true,
            });
            AuthUser { uid: account.uid, email: email.to_string() }
        };
        let _ = self.inner.auth_tx.send(AuthState::SignedIn(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        let _ = self.inner.auth_tx.send(AuthState::SignedOut);
        Ok(())
    }

    async fn current_user(&self) -> Option<AuthUser> {
        self.inner.auth_tx.borrow().user().cloned()
    }

    fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.auth_tx.subscribe()
    }

    async fn set_persistence(&self, mode: Persistence) -> BackendResult<()> {
        *self.inner.persistence.lock().unwrap_or_else(|e| e.into_inner()) = mode;
        Ok(())
    }

    async fn delete_identity(&self, uid: Uuid) -> BackendResult<()> {
        {
            let mut accounts = self.inner.accounts.lock().unwrap_or_else(|e| e.into_inner());
            accounts.retain(|_, account| account.uid != uid);
        }
        if self.inner.auth_tx.borrow().user().is_some_and(|u| u.uid == uid) {
            let _ = self.inner.auth_tx.send(AuthState::SignedOut);
        }
        Ok(())
    }
}

const UPLOAD_CHUNK: usize = 64 * 1024;

#[async_trait]
impl BlobBackend for MemoryBackend {
    async fn upload(
        &self,
        path: &str,
        data: &[u8],
        progress: Arc<UploadProgress>,
    ) -> BackendResult<()> {
        let total = data.len() as u64;
        progress.record(0, total);
        let mut sent = 0u64;
        for chunk in data.chunks(UPLOAD_CHUNK) {
            sent += chunk.len() as u64;
            progress.record(sent, total);
            tokio::task::yield_now().await;
        }
        self.inner
            .blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), total);
        debug!(path, bytes = total, "blob stored");
        Ok(())
    }

    async fn public_url(&self, path: &str) -> BackendResult<String> {
        let blobs = self.inner.blobs.lock().unwrap_or_else(|e| e.into_inner());
        if !blobs.contains_key(path) {
            return Err(BackendError::NotFound {
                collection: "blobs".to_string(),
                id: path.to_string(),
            });
        }
        Ok(format!("memory://blobs/{path}"))
    }
}
