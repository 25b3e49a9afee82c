use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DedupHints, ReceivedMessage, WorkQueue};
use crate::db::queue_repo::{self, NewMessage};
use crate::db::Database;
use crate::error::QueueError;

/// Re-check interval while long-polling, for messages whose visibility
/// lapsed or that another process sent.
const POLL_TICK: Duration = Duration::from_millis(200);

/// Durable queue stored in the `queue_messages` table. Several named
/// queues can share one database.
#[derive(Clone)]
pub struct SqliteWorkQueue {
    db: Database,
    name: String,
    visibility_timeout: Duration,
    notify: Arc<Notify>,
}

impl SqliteWorkQueue {
    pub fn new(db: Database, name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            db,
            name: name.into(),
            visibility_timeout,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Undeleted messages, leased or not.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        let (db, name) = (self.db.clone(), self.name.clone());
        tokio::task::spawn_blocking(move || queue_repo::depth(&db, &name))
            .await
            .map_err(|e| QueueError::Task(e.to_string()))?
            .map_err(QueueError::from)
    }

    async fn lease(&self, max: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let (db, name) = (self.db.clone(), self.name.clone());
        let visibility_ms = duration_ms(self.visibility_timeout);
        let rows = tokio::task::spawn_blocking(move || {
            queue_repo::lease(&db, &name, max, now_ms(), visibility_ms)
        })
        .await
        .map_err(|e| QueueError::Task(e.to_string()))??;

        Ok(rows
            .into_iter()
            .map(|row| ReceivedMessage {
                message_id: row.message_id,
                body: row.body,
                receipt_handle: row.receipt_handle,
                receive_count: row.receive_count,
            })
            .collect())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn send(&self, body: &str, hints: &DedupHints) -> Result<bool, QueueError> {
        let (db, name) = (self.db.clone(), self.name.clone());
        let body = body.to_string();
        let hints = hints.clone();
        let message_id = uuid::Uuid::new_v4().to_string();

        let inserted = tokio::task::spawn_blocking(move || {
            let message = NewMessage {
                message_id: &message_id,
                body: &body,
                group_id: hints.group_id.as_deref(),
                dedup_id: hints.dedup_id.as_deref(),
            };
            queue_repo::enqueue(&db, &name, &message, now_ms())
        })
        .await
        .map_err(|e| QueueError::Task(e.to_string()))??;

        if inserted {
            self.notify.notify_waiters();
        } else {
            tracing::debug!(queue = %self.name, "Send collapsed by dedup id");
        }
        Ok(inserted)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before leasing so a send in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let messages = self.lease(max_messages.max(1)).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let nap = POLL_TICK.min(deadline - now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let (db, name) = (self.db.clone(), self.name.clone());
        let handle = receipt_handle.to_string();
        let visible_at = now_ms().saturating_add(duration_ms(timeout));

        let updated = tokio::task::spawn_blocking(move || {
            queue_repo::set_visible_at(&db, &name, &handle, visible_at)
        })
        .await
        .map_err(|e| QueueError::Task(e.to_string()))??;

        if updated {
            Ok(())
        } else {
            Err(QueueError::InvalidReceiptHandle(receipt_handle.to_string()))
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let (db, name) = (self.db.clone(), self.name.clone());
        let handle = receipt_handle.to_string();

        let deleted =
            tokio::task::spawn_blocking(move || queue_repo::delete(&db, &name, &handle))
                .await
                .map_err(|e| QueueError::Task(e.to_string()))??;

        if deleted {
            Ok(())
        } else {
            Err(QueueError::InvalidReceiptHandle(receipt_handle.to_string()))
        }
    }
}
