//! At-least-once work queue.

mod sqlite;

pub use sqlite::SqliteWorkQueue;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;

/// Ordering and deduplication hints attached to a send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupHints {
    pub group_id: Option<String>,
    /// A send is dropped while an undeleted message with this id exists.
    pub dedup_id: Option<String>,
}

impl DedupHints {
    pub fn new(group_id: impl Into<String>, dedup_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            dedup_id: Some(dedup_id.into()),
        }
    }
}

/// A leased message. Valid until deleted or until its visibility lapses,
/// after which `receipt_handle` is stale.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    pub receipt_handle: String,
    /// 1 on first delivery.
    pub receive_count: u32,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueues `body`. Returns false when the send was collapsed into an
    /// existing message by its dedup id.
    async fn send(&self, body: &str, hints: &DedupHints) -> Result<bool, QueueError>;

    /// Long-polls for up to `max_messages`, waiting at most `wait`.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Hides a leased message for `timeout` from now.
    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;
}
