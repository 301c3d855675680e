use std::fmt::{self, Display};
use std::time::Duration;

use async_trait::async_trait;

/// Opaque acknowledgment token for one delivery of a message.
///
/// A redelivered message carries a new handle; only the latest handle is
/// guaranteed to acknowledge it.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed out by [`WorkQueue::receive`].
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    /// Stable across redeliveries.
    pub message_id: String,
    pub handle: ReceiptHandle,
    pub body: String,
    /// Number of times the message has been received, this delivery included.
    pub receive_count: u32,
}

/// Pull-model, at-least-once work queue.
///
/// Received messages stay hidden from other consumers for the visibility
/// timeout and reappear unless [`WorkQueue::delete`] acknowledges them.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Receive up to `max_messages`, waiting at most `wait_time` for one to
    /// become available.
    async fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
        visibility_timeout: Duration,
    ) -> anyhow::Result<Vec<ReceivedMessage>>;

    /// Acknowledge a delivery so it is never redelivered.
    async fn delete(&self, handle: &ReceiptHandle) -> anyhow::Result<()>;

    /// Approximate number of messages ready for delivery.
    async fn depth(&self) -> anyhow::Result<u64>;

    /// Publish a new message, returning its id.
    async fn send(&self, body: &str) -> anyhow::Result<String>;
}
