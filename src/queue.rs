//! Durable work queue backed by a Postgres table.
//!
//! Delivery is at-least-once: a dequeued item is leased for five minutes and
//! comes back if it is neither acked nor nacked by then.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgListener, PgPool, Row};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::QueueError;

const NOTIFY_CHANNEL: &str = "work_queue";
pub const MAX_ATTEMPTS: i32 = 5;

/// Expired leases that already used their last attempt are dead letters;
/// the dequeue filter never picks them up again.
const REAP_EXHAUSTED_SQL: &str = "UPDATE work_queue \
     SET status = 'failed', locked_until = NULL, updated_at = now() \
     WHERE queue_name = $1 \
       AND status = 'processing' \
       AND locked_until < now() \
       AND attempts >= max_attempts \
     RETURNING id";

const DEQUEUE_SQL: &str = "UPDATE work_queue \
     SET status = 'processing', attempts = attempts + 1, \
         locked_until = now() + interval '5 minutes', updated_at = now() \
     WHERE id = ( \
         SELECT id FROM work_queue \
         WHERE queue_name = $1 \
           AND attempts < max_attempts \
           AND (status = 'pending' OR (status = 'processing' AND locked_until < now())) \
         ORDER BY id ASC \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED \
     ) \
     RETURNING id, payload, attempts";

/// Finished items leave the table; only dead letters are kept.
const ACK_SQL: &str = "DELETE FROM work_queue WHERE id = $1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: i64,
    pub payload: String,
    pub attempts: i32,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Persists one payload. Returns once the row is committed.
    async fn enqueue(&self, payload: &Value) -> Result<i64, QueueError>;

    /// Claims the oldest deliverable item, if any.
    async fn dequeue(&self) -> Result<Option<WorkItem>, QueueError>;

    async fn ack(&self, id: i64) -> Result<(), QueueError>;

    /// Returns the item for redelivery, or dead-letters it once it has used
    /// all its attempts.
    async fn nack(&self, id: i64) -> Result<(), QueueError>;

    /// Sleeps until new work is announced or `timeout` elapses.
    async fn wait_for_work(&self, timeout: Duration);
}

#[derive(Clone)]
pub struct PgQueue {
    db: PgPool,
    name: String,
    notify: Arc<Notify>,
}

impl PgQueue {
    pub fn new(db: PgPool, name: &str) -> Self {
        PgQueue {
            db,
            name: name.to_string(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Forwards `NOTIFY work_queue` for this queue to local waiters until
    /// shutdown. Consumers fall back to polling if the listener drops.
    pub fn spawn_listener(&self, shutdown: CancellationToken) {
        let db = self.db.clone();
        let name = self.name.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            let mut listener = match PgListener::connect_with(&db).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!(error = %err, "queue listener unavailable, polling only");
                    return;
                }
            };
            if let Err(err) = listener.listen(NOTIFY_CHANNEL).await {
                warn!(error = %err, "LISTEN failed, polling only");
                return;
            }
            info!(queue = %name, "queue listener started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = listener.recv() => match received {
                        Ok(notification) if notification.payload() == name => notify.notify_waiters(),
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "queue listener error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    async fn enqueue(&self, payload: &Value) -> Result<i64, QueueError> {
        let body = serde_json::to_string(payload)?;
        let mut tx = self.db.begin().await?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO work_queue (queue_name, payload, max_attempts) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(&self.name)
        .bind(body)
        .bind(MAX_ATTEMPTS)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(&self.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(queue_id = id, queue = %self.name, "enqueued");
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<WorkItem>, QueueError> {
        let reaped: Vec<i64> = sqlx::query_scalar(REAP_EXHAUSTED_SQL)
            .bind(&self.name)
            .fetch_all(&self.db)
            .await?;
        for id in reaped {
            warn!(queue_id = id, "lease expired on final attempt, work item dead-lettered");
        }

        let row = sqlx::query(DEQUEUE_SQL)
            .bind(&self.name)
            .fetch_optional(&self.db)
            .await?;
        row.map(|row| -> Result<WorkItem, QueueError> {
            Ok(WorkItem {
                id: row.try_get("id")?,
                payload: row.try_get("payload")?,
                attempts: row.try_get("attempts")?,
            })
        })
        .transpose()
    }

    async fn ack(&self, id: i64) -> Result<(), QueueError> {
        sqlx::query(ACK_SQL).bind(id).execute(&self.db).await?;
        Ok(())
    }

    async fn nack(&self, id: i64) -> Result<(), QueueError> {
        let status: Option<String> = sqlx::query_scalar(
            "UPDATE work_queue \
             SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END, \
                 locked_until = NULL, updated_at = now() \
             WHERE id = $1 \
             RETURNING status",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        if status.as_deref() == Some("failed") {
            warn!(queue_id = id, "work item dead-lettered after max attempts");
        } else {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
