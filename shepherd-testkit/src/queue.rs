use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use shepherd::{ReceiptHandle, ReceivedMessage, WorkQueue};
use uuid::Uuid;

#[derive(Clone, Debug)]
struct StoredMessage {
    message_id: String,
    body: String,
    receive_count: u32,
    receipt: Option<String>,
    visible_at: Instant,
}

/// In-process queue with visibility timeouts.
///
/// `receive` never blocks; an empty queue returns immediately. Received
/// messages stay hidden until their visibility timeout passes or
/// [`expire_visibility`](Self::expire_visibility) is called. Every
/// successful delete is counted against the message id.
#[derive(Clone, Default)]
pub struct InMemoryWorkQueue {
    messages: Arc<Mutex<Vec<StoredMessage>>>,
    acks: Arc<Mutex<HashMap<String, u32>>>,
    stale_deletes: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message with a chosen id.
    pub fn push(&self, message_id: impl Into<String>, body: impl Into<String>) {
        self.messages.lock().push(StoredMessage {
            message_id: message_id.into(),
            body: body.into(),
            receive_count: 0,
            receipt: None,
            visible_at: Instant::now(),
        });
    }

    /// Publish a `{"work_ref": ..}` message with a chosen id.
    pub fn push_work(&self, message_id: impl Into<String>, work_ref: &str) {
        let body = serde_json::json!({ "work_ref": work_ref }).to_string();
        self.push(message_id, body);
    }

    /// Make every in-flight message visible again, as if its visibility
    /// timeout had passed.
    pub fn expire_visibility(&self) {
        let now = Instant::now();
        for message in self.messages.lock().iter_mut() {
            message.visible_at = now;
        }
    }

    /// Make `depth`, `receive` and `send` fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages not yet deleted, visible or not.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages
            .lock()
            .iter()
            .any(|m| m.message_id == message_id)
    }

    /// Body of a pending message.
    pub fn body(&self, message_id: &str) -> Option<String> {
        self.messages
            .lock()
            .iter()
            .find(|m| m.message_id == message_id)
            .map(|m| m.body.clone())
    }

    /// Successful deletes recorded for `message_id`.
    pub fn ack_count(&self, message_id: &str) -> u32 {
        self.acks.lock().get(message_id).copied().unwrap_or(0)
    }

    /// Deletes whose receipt no longer matched a delivery.
    pub fn stale_delete_count(&self) -> u64 {
        self.stale_deletes.load(Ordering::SeqCst)
    }

    pub fn assert_acked_once(&self, message_id: &str) {
        assert_eq!(
            self.ack_count(message_id),
            1,
            "expected message {message_id} to be acknowledged exactly once"
        );
        assert!(
            !self.contains(message_id),
            "message {message_id} is still queued"
        );
    }

    pub fn assert_not_acked(&self, message_id: &str) {
        assert_eq!(
            self.ack_count(message_id),
            0,
            "expected message {message_id} to stay unacknowledged"
        );
        assert!(self.contains(message_id), "message {message_id} is gone");
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("queue unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn receive(
        &self,
        max_messages: usize,
        _wait_time: Duration,
        visibility_timeout: Duration,
    ) -> anyhow::Result<Vec<ReceivedMessage>> {
        self.check_available()?;
        let now = Instant::now();
        let mut received = Vec::new();
        for message in self.messages.lock().iter_mut() {
            if received.len() >= max_messages.max(1) {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            let receipt = Uuid::new_v4().to_string();
            message.receive_count += 1;
            message.receipt = Some(receipt.clone());
            message.visible_at = now + visibility_timeout;
            received.push(ReceivedMessage {
                message_id: message.message_id.clone(),
                handle: ReceiptHandle::new(receipt),
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
        }
        Ok(received)
    }

    async fn delete(&self, handle: &ReceiptHandle) -> anyhow::Result<()> {
        let mut messages = self.messages.lock();
        let position = messages
            .iter()
            .position(|m| m.receipt.as_deref() == Some(handle.as_str()));
        match position {
            Some(index) => {
                let message = messages.remove(index);
                *self.acks.lock().entry(message.message_id).or_default() += 1;
            }
            None => {
                self.stale_deletes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn depth(&self) -> anyhow::Result<u64> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .messages
            .lock()
            .iter()
            .filter(|m| m.visible_at <= now)
            .count() as u64)
    }

    async fn send(&self, body: &str) -> anyhow::Result<String> {
        self.check_available()?;
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.push(id.clone(), body);
        Ok(id)
    }
}
