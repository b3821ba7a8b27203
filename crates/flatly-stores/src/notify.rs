//! User-visible notifications. Stores push transient notices here; the UI
//! layer subscribes and renders them as toasts.

use tokio::sync::broadcast;

use flatly_types::events::Notice;

const NOTICE_BUFFER: usize = 64;

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    /// Fire-and-forget: a notice with no listeners is simply dropped.
    pub fn push(&self, notice: Notice) {
        let _ = self.tx.send(notice);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.push(Notice::info(text));
    }

    pub fn success(&self, text: impl Into<String>) {
        self.push(Notice::success(text));
    }

    pub fn error(&self, text: impl Into<String>) {
        self.push(Notice::error(text));
    }
}
