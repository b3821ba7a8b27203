//! Per-listing messaging between a prospective renter and the owner.
//! Read-state is best-effort: marking a thread read is optimistic and the
//! batched writes are never rolled back on failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use flatly_backend::DocumentBackend;
use flatly_types::models::{Flat, Message, UserProfile};
use flatly_types::validate::ValidationError;

use crate::collections::{MESSAGES, USERS};
use crate::error::{StoreError, StoreResult};
use crate::notify::Notifier;
use crate::session::SessionStore;

struct MessagesInner {
    docs: Arc<dyn DocumentBackend>,
    session: SessionStore,
    notifier: Notifier,
    /// Threads the current user has opened, keyed by flat id.
    threads: Mutex<HashMap<Uuid, Vec<Message>>>,
}

#[derive(Clone)]
pub struct MessageStore {
    inner: Arc<MessagesInner>,
}

impl MessageStore {
    pub fn new(
        docs: Arc<dyn DocumentBackend>,
        session: SessionStore,
        notifier: Notifier,
    ) -> Self {
        Self {
            inner: Arc::new(MessagesInner {
                docs,
                session,
                notifier,
                threads: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn threads(&self) -> MutexGuard<'_, HashMap<Uuid, Vec<Message>>> {
        self.inner.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sends a message about `flat` to its owner.
    pub async fn send(&self, flat: &Flat, body: &str) -> StoreResult<Message> {
        let sender = self.inner.session.current_user().ok_or(StoreError::NotSignedIn)?;

        if body.trim().is_empty() {
            return Err(ValidationError {
                field: "body",
                message: "Please write a message".into(),
            }
            .into());
        }
        if sender.id == flat.owner_id {
            return Err(ValidationError {
                field: "recipient",
                message: "You cannot send a message to yourself".into(),
            }
            .into());
        }

        let owner = self.load_user(flat.owner_id).await?;
        let message = Message {
            id: Uuid::new_v4(),
            flat_id: flat.id,
            flat_name: flat.name.clone(),
            sender_id: sender.id,
            sender_email: sender.email.clone(),
            recipient_id: owner.id,
            recipient_email: owner.email,
            body: body.trim().to_string(),
            timestamp: Utc::now(),
            read: false,
        };

        self.inner
            .docs
            .create(MESSAGES, &message.id.to_string(), serde_json::to_value(&message)?)
            .await?;

        info!(flat = %flat.id, "message sent");
        self.inner.notifier.success("Message sent successfully");
        Ok(message)
    }

    /// Messages addressed to the current user for `flat_id`, oldest first.
    /// The result is cached so `unread_count` and `mark_all_read` work on
    /// the same snapshot the UI shows.
    pub async fn fetch_thread(&self, flat_id: Uuid) -> StoreResult<Vec<Message>> {
        let user = self.inner.session.current_user().ok_or(StoreError::NotSignedIn)?;

        let docs = self
            .inner
            .docs
            .query_eq(MESSAGES, "flat_id", &json!(flat_id))
            .await?;

        let mut thread: Vec<Message> = Vec::new();
        for (id, doc) in docs {
            match serde_json::from_value::<Message>(doc) {
                Ok(msg) if msg.recipient_id == user.id => thread.push(msg),
                Ok(_) => {}
                Err(e) => warn!(message = %id, "malformed message document: {e}"),
            }
        }
        thread.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        self.threads().insert(flat_id, thread.clone());
        Ok(thread)
    }

    pub fn unread_count(&self, flat_id: Uuid) -> usize {
        self.threads()
            .get(&flat_id)
            .map(|t| t.iter().filter(|m| !m.read).count())
            .unwrap_or(0)
    }

    /// Marks every unread message in the cached thread as read: local state
    /// first, then one batch of per-message writes. A failed write is logged
    /// and the local flag stays set; read-state only moves false -> true.
    pub async fn mark_all_read(&self, flat_id: Uuid) -> StoreResult<()> {
        self.inner.session.current_user().ok_or(StoreError::NotSignedIn)?;

        let unread_ids: Vec<Uuid> = {
            let mut threads = self.threads();
            let Some(thread) = threads.get_mut(&flat_id) else {
                return Ok(());
            };
            let ids = thread.iter().filter(|m| !m.read).map(|m| m.id).collect();
            for msg in thread.iter_mut() {
                msg.read = true;
            }
            ids
        };

        for id in unread_ids {
            if let Err(e) = self
                .inner
                .docs
                .update(MESSAGES, &id.to_string(), json!({ "read": true }))
                .await
            {
                warn!(message = %id, "read-state write failed: {e}");
            }
        }
        Ok(())
    }

    async fn load_user(&self, user_id: Uuid) -> StoreResult<UserProfile> {
        let doc = self
            .inner
            .docs
            .get(USERS, &user_id.to_string())
            .await?
            .ok_or(flatly_backend::BackendError::NotFound {
                collection: USERS.to_string(),
                id: user_id.to_string(),
            })?;
        Ok(serde_json::from_value(doc)?)
    }
}
