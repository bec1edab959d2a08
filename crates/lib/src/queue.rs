//! Dispatch queue: durable, at-least-once job queue backed by the `jobs` table.
//!
//! A claim leases a job for a fixed window; a job whose lease runs out without an
//! ack is handed out again. Failed jobs stay in the table with their last error.

use crate::store::{to_millis, Database, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

const STATUS_READY: &str = "ready";
const STATUS_LEASED: &str = "leased";
const STATUS_FAILED: &str = "failed";

/// One inbound text message to be answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingJob {
    /// Remote assistant id answering the message.
    pub agent_id: String,
    /// Tenant's channel sender identifier.
    pub sender_id: String,
    /// End-user channel identifier.
    pub end_user: String,
    /// Inbound channel message id (idempotency key).
    pub message_id: String,
    pub text: String,
}

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: i64,
    /// Deliveries so far, including this one.
    pub attempts: u32,
    pub job: ProcessingJob,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub ready: u64,
    pub leased: u64,
    pub failed: u64,
}

/// Handle to the queue. Cheap to clone; clones share the wake-up signal.
#[derive(Clone)]
pub struct DispatchQueue {
    db: Database,
    notify: Arc<Notify>,
    lease: Duration,
    idle_poll: Duration,
}

impl DispatchQueue {
    pub fn new(db: Database, lease: Duration, idle_poll: Duration) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
            lease,
            idle_poll,
        }
    }

    /// Persist a job and wake one idle worker.
    pub async fn enqueue(&self, job: &ProcessingJob) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(job)?;
        let now = to_millis(Utc::now());
        let id = {
            let conn = self.db.lock().await;
            conn.execute(
                "INSERT INTO jobs(payload, status, attempts, available_at, created_at, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?3, ?3)",
                params![payload, STATUS_READY, now],
            )?;
            conn.last_insert_rowid()
        };
        self.notify.notify_one();
        Ok(id)
    }

    /// Lease the next due job: a ready job whose delay has passed, or a leased job
    /// whose lease expired.
    pub async fn claim(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>, StoreError> {
        let now_ms = to_millis(now);
        let lease_until = now_ms + self.lease.as_millis() as i64;
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let row: Option<(i64, i64, String)> = tx
            .query_row(
                "SELECT id, attempts, payload FROM jobs
                 WHERE (status = ?1 AND available_at <= ?3)
                    OR (status = ?2 AND lease_until <= ?3)
                 ORDER BY available_at, id LIMIT 1",
                params![STATUS_READY, STATUS_LEASED, now_ms],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((id, attempts, payload)) = row else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE jobs SET status = ?2, attempts = attempts + 1, lease_until = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, STATUS_LEASED, lease_until, now_ms],
        )?;
        tx.commit()?;
        drop(conn);
        let job: ProcessingJob = serde_json::from_str(&payload)?;
        Ok(Some(QueuedJob {
            id,
            attempts: attempts as u32 + 1,
            job,
        }))
    }

    /// Wait for the next job. Returns None once `shutdown` flips to true.
    pub async fn next(&self, shutdown: &mut watch::Receiver<bool>) -> Option<QueuedJob> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            match self.claim(Utc::now()).await {
                Ok(Some(job)) => return Some(job),
                Ok(None) => {}
                Err(e) => log::warn!("queue: claim failed: {}", e),
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.idle_poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Job finished; remove it.
    pub async fn ack(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.db.lock().await;
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Release the lease and make the job due again after `delay`.
    pub async fn retry_later(&self, id: i64, delay: Duration, error: &str) -> Result<(), StoreError> {
        let now = to_millis(Utc::now());
        let available_at = now + delay.as_millis() as i64;
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE jobs SET status = ?2, available_at = ?3, lease_until = NULL, last_error = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, STATUS_READY, available_at, error, now],
        )?;
        Ok(())
    }

    /// Give up on the job; it stays in the table as a failed outcome.
    pub async fn abandon(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let now = to_millis(Utc::now());
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE jobs SET status = ?2, lease_until = NULL, last_error = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, STATUS_FAILED, error, now],
        )?;
        Ok(())
    }

    pub async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut counts = QueueCounts::default();
        for (status, n) in rows {
            match status.as_str() {
                STATUS_READY => counts.ready = n as u64,
                STATUS_LEASED => counts.leased = n as u64,
                STATUS_FAILED => counts.failed = n as u64,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Last recorded error of a job, if the job is still in the table.
    pub async fn last_error(&self, id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.db.lock().await;
        let err: Option<Option<String>> = conn
            .query_row(
                "SELECT last_error FROM jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(err.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(message_id: &str) -> ProcessingJob {
        ProcessingJob {
            agent_id: "asst_1".to_string(),
            sender_id: "pn1".to_string(),
            end_user: "u1".to_string(),
            message_id: message_id.to_string(),
            text: "Hello".to_string(),
        }
    }

    fn queue(lease: Duration) -> DispatchQueue {
        DispatchQueue::new(
            Database::open_in_memory().unwrap(),
            lease,
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn claim_leases_each_job_once() {
        let q = queue(Duration::from_secs(60));
        q.enqueue(&job("a")).await.unwrap();
        let now = Utc::now();
        let first = q.claim(now).await.unwrap().unwrap();
        assert_eq!(first.job.message_id, "a");
        assert_eq!(first.attempts, 1);
        assert!(q.claim(now).await.unwrap().is_none());
        q.ack(first.id).await.unwrap();
        assert_eq!(q.counts().await.unwrap(), QueueCounts::default());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let q = queue(Duration::from_secs(60));
        q.enqueue(&job("a")).await.unwrap();
        let now = Utc::now();
        let first = q.claim(now).await.unwrap().unwrap();
        let later = now + chrono::Duration::seconds(61);
        let again = q.claim(later).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn retry_later_delays_and_abandon_keeps_row() {
        let q = queue(Duration::from_secs(60));
        q.enqueue(&job("a")).await.unwrap();
        let claimed = q.claim(Utc::now()).await.unwrap().unwrap();
        q.retry_later(claimed.id, Duration::from_secs(30), "boom")
            .await
            .unwrap();
        assert!(q.claim(Utc::now()).await.unwrap().is_none());
        let due = Utc::now() + chrono::Duration::seconds(31);
        let again = q.claim(due).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
        q.abandon(again.id, "gave up").await.unwrap();
        let counts = q.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.ready, 0);
        assert_eq!(q.last_error(again.id).await.unwrap().as_deref(), Some("gave up"));
    }

    #[tokio::test]
    async fn next_wakes_on_enqueue_and_stops_on_shutdown() {
        let q = queue(Duration::from_secs(60));
        let (tx, mut rx) = watch::channel(false);
        let producer = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(&job("late")).await.unwrap();
        });
        let got = q.next(&mut rx).await.unwrap();
        assert_eq!(got.job.message_id, "late");
        tx.send(true).unwrap();
        assert!(q.next(&mut rx).await.is_none());
    }
}
