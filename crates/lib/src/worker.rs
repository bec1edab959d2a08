//! Conversation worker: consumes dispatch jobs and answers them.
//!
//! One job walks CONTEXT_RESOLVED -> RUN_SUBMITTED -> RUN_POLLING -> RUN_COMPLETED | RUN_FAILED
//! -> REPLY_SENT | REPLY_FAILED. Every write is keyed by the inbound message id, so a
//! redelivered job never runs the assistant twice once a reply is stored.

use crate::affinity::{AffinityError, AffinityStore, ConversationKey};
use crate::assistant::{drive_run, AssistantApi, AssistantError, RunPolicy};
use crate::channels::{format_reply, ChannelError, ChannelHandle};
use crate::config::Config;
use crate::conversation::{Conversation, DeliveryStatus, Message, NewMessage, Role};
use crate::queue::{DispatchQueue, ProcessingJob, QueuedJob};
use crate::store::StoreError;
use chrono::Utc;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    ContextResolved,
    RunSubmitted,
    RunPolling,
    RunCompleted,
    RunFailed,
    ReplySent,
    ReplyFailed,
}

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::ContextResolved => "CONTEXT_RESOLVED",
            JobStage::RunSubmitted => "RUN_SUBMITTED",
            JobStage::RunPolling => "RUN_POLLING",
            JobStage::RunCompleted => "RUN_COMPLETED",
            JobStage::RunFailed => "RUN_FAILED",
            JobStage::ReplySent => "REPLY_SENT",
            JobStage::ReplyFailed => "REPLY_FAILED",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Assistant(#[from] AssistantError),
    #[error("reply delivery failed: {0}")]
    Delivery(#[from] ChannelError),
    #[error("job did not finish within {0:?}")]
    Timeout(Duration),
}

impl From<AffinityError> for JobError {
    fn from(e: AffinityError) -> Self {
        match e {
            AffinityError::Store(e) => JobError::Store(e),
            AffinityError::Assistant(e) => JobError::Assistant(e),
        }
    }
}

impl JobError {
    /// Failures on the AI side, which earn the end-user an apology once retries run out.
    /// A job timeout counts: the only unbounded waits in a job are assistant calls.
    pub fn is_assistant_error(&self) -> bool {
        matches!(self, JobError::Assistant(_) | JobError::Timeout(_))
    }
}

/// How a successful job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Assistant ran and the reply was delivered.
    Replied,
    /// A stored but undelivered reply was sent again; no new run.
    Redelivered,
    /// The reply for this inbound message was already delivered.
    AlreadyAnswered,
}

/// What the worker did with a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Completed(JobOutcome),
    Retrying(Duration),
    Abandoned,
}

/// Worker tunables, taken from the `worker`, `assistant` and `channels` config sections.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub run_policy: RunPolicy,
    pub max_message_chars: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub job_timeout: Duration,
    pub apology_text: String,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        let w = &config.worker;
        Self {
            run_policy: RunPolicy {
                poll_interval: config.assistant.poll_interval(),
                timeout: config.assistant.poll_timeout(),
            },
            max_message_chars: config.channels.whatsapp.max_message_chars,
            max_retries: w.max_retries,
            backoff_base: Duration::from_millis(w.backoff_base_ms),
            backoff_max: Duration::from_millis(w.backoff_max_ms),
            job_timeout: Duration::from_secs(w.job_timeout_secs),
            apology_text: config.assistant.apology_text.clone(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Delay before retry number `attempt` (0-based): `base * 2^attempt` capped at `max`,
/// with +/-25% jitter and a 100 ms floor.
pub fn retry_backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let exp_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(max_ms);
    let jitter_range = exp_ms / 4;
    let jitter = if jitter_range > 0 {
        let offset = rand::thread_rng().gen_range(0..=jitter_range * 2);
        offset as i64 - jitter_range as i64
    } else {
        0
    };
    Duration::from_millis((exp_ms as i64 + jitter).max(100) as u64)
}

pub struct Worker {
    queue: DispatchQueue,
    affinity: Arc<AffinityStore>,
    assistant: Arc<dyn AssistantApi>,
    channel: Arc<dyn ChannelHandle>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: DispatchQueue,
        affinity: Arc<AffinityStore>,
        assistant: Arc<dyn AssistantApi>,
        channel: Arc<dyn ChannelHandle>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            affinity,
            assistant,
            channel,
            settings,
        }
    }

    /// Answer one inbound message.
    pub async fn process(&self, job: &ProcessingJob) -> Result<JobOutcome, JobError> {
        let key = ConversationKey::new(job.sender_id.as_str(), job.end_user.as_str());
        let conversation = self.affinity.get_or_create(&key).await?;
        log::debug!(
            "job {}: {} (conversation {})",
            job.message_id,
            JobStage::ContextResolved,
            conversation.id
        );
        let db = self.affinity.database();

        let (_, fresh) = db
            .insert_message_or_fetch(
                &NewMessage::user(&conversation, &job.message_id, &job.text),
                Utc::now(),
            )
            .await?;
        if !fresh {
            log::debug!("job {}: inbound message already stored", job.message_id);
        }

        let (reply, outcome) = match db
            .find_message(conversation.id, &job.message_id, Role::Assistant)
            .await?
        {
            Some(prior) if prior.status == DeliveryStatus::Sent => {
                log::info!(
                    "job {}: reply already delivered, nothing to do",
                    job.message_id
                );
                return Ok(JobOutcome::AlreadyAnswered);
            }
            Some(prior) => (prior, JobOutcome::Redelivered),
            None => {
                let text = self.run_assistant(job, &conversation).await?;
                let (stored, _) = db
                    .insert_message_or_fetch(
                        &NewMessage::assistant(&conversation, &job.message_id, &text),
                        Utc::now(),
                    )
                    .await?;
                (stored, JobOutcome::Replied)
            }
        };

        self.deliver(&key, &reply).await?;
        Ok(outcome)
    }

    async fn run_assistant(
        &self,
        job: &ProcessingJob,
        conversation: &Conversation,
    ) -> Result<String, JobError> {
        log::debug!(
            "job {}: {} with agent {}",
            job.message_id,
            JobStage::RunSubmitted,
            job.agent_id
        );
        let raw = drive_run(
            self.assistant.as_ref(),
            &conversation.context_id,
            &job.agent_id,
            &job.text,
            self.settings.run_policy,
        )
        .await
        .map_err(|e| {
            log::warn!("job {}: {}: {}", job.message_id, JobStage::RunFailed, e);
            e
        })?;
        let text = format_reply(&raw, self.settings.max_message_chars);
        if text.is_empty() {
            log::warn!(
                "job {}: {}: reply empty after formatting",
                job.message_id,
                JobStage::RunFailed
            );
            return Err(AssistantError::EmptyReply.into());
        }
        log::debug!("job {}: {}", job.message_id, JobStage::RunCompleted);
        Ok(text)
    }

    /// Send a stored assistant message and record the delivery result. Activity advances
    /// only on success.
    async fn deliver(&self, key: &ConversationKey, reply: &Message) -> Result<(), JobError> {
        let db = self.affinity.database();
        match self
            .channel
            .send_message(&key.sender_id, &key.end_user, &reply.content)
            .await
        {
            Ok(()) => {
                db.set_message_status(reply.id, DeliveryStatus::Sent, None)
                    .await?;
                self.affinity.touch(key, Utc::now()).await?;
                log::debug!(
                    "reply {}: {} to {}",
                    reply.channel_message_id,
                    JobStage::ReplySent,
                    key.end_user
                );
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                log::warn!(
                    "reply {}: {}: {}",
                    reply.channel_message_id,
                    JobStage::ReplyFailed,
                    detail
                );
                db.set_message_status(reply.id, DeliveryStatus::Failed, Some(&detail))
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Best-effort apology after the last retry failed on the AI side. Recorded under the
    /// inbound message id so it is sent at most once.
    async fn apologize(&self, job: &ProcessingJob) {
        let key = ConversationKey::new(job.sender_id.as_str(), job.end_user.as_str());
        let text = self.settings.apology_text.as_str();
        let db = self.affinity.database();
        let conversation = match db.find_conversation(&key.sender_id, &key.end_user).await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("job {}: apology lookup failed: {}", job.message_id, e);
                None
            }
        };
        let Some(conversation) = conversation else {
            // No context could be created; nothing to record the apology against.
            if let Err(e) = self
                .channel
                .send_message(&key.sender_id, &key.end_user, text)
                .await
            {
                log::warn!("job {}: apology not delivered: {}", job.message_id, e);
            }
            return;
        };
        let stored = db
            .insert_message_or_fetch(
                &NewMessage::assistant(&conversation, &job.message_id, text),
                Utc::now(),
            )
            .await;
        match stored {
            Ok((msg, _)) if msg.status == DeliveryStatus::Sent => {}
            Ok((msg, _)) => {
                if let Err(e) = self.deliver(&key, &msg).await {
                    log::warn!("job {}: apology not delivered: {}", job.message_id, e);
                }
            }
            Err(e) => log::warn!("job {}: apology not recorded: {}", job.message_id, e),
        }
    }

    /// Process a claimed job under the job timeout and settle it in the queue.
    pub async fn handle(&self, queued: QueuedJob) -> JobDisposition {
        let timeout = self.settings.job_timeout;
        let result = match tokio::time::timeout(timeout, self.process(&queued.job)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout(timeout)),
        };

        match result {
            Ok(outcome) => {
                if let Err(e) = self.queue.ack(queued.id).await {
                    log::warn!("queue: ack of job {} failed: {}", queued.id, e);
                }
                JobDisposition::Completed(outcome)
            }
            Err(e) => {
                let detail = e.to_string();
                let retries_used = queued.attempts.saturating_sub(1);
                if retries_used < self.settings.max_retries {
                    let delay = retry_backoff_delay(
                        retries_used,
                        self.settings.backoff_base,
                        self.settings.backoff_max,
                    );
                    log::warn!(
                        "job {} (attempt {}): {}; retrying in {:?}",
                        queued.id,
                        queued.attempts,
                        detail,
                        delay
                    );
                    if let Err(e) = self.queue.retry_later(queued.id, delay, &detail).await {
                        log::warn!("queue: rescheduling job {} failed: {}", queued.id, e);
                    }
                    JobDisposition::Retrying(delay)
                } else {
                    log::warn!(
                        "job {} failed after {} attempts: {}",
                        queued.id,
                        queued.attempts,
                        detail
                    );
                    if let Err(e) = self.queue.abandon(queued.id, &detail).await {
                        log::warn!("queue: marking job {} failed: {}", queued.id, e);
                    }
                    if e.is_assistant_error() {
                        self.apologize(&queued.job).await;
                    }
                    JobDisposition::Abandoned
                }
            }
        }
    }

    /// Consume jobs until shutdown is signalled. A job in flight is finished first.
    pub async fn run(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        log::debug!("worker {}: started", worker_id);
        while let Some(queued) = self.queue.next(&mut shutdown).await {
            self.handle(queued).await;
        }
        log::debug!("worker {}: stopped", worker_id);
    }
}

/// Start `count` workers sharing one [`Worker`].
pub fn spawn_workers(
    worker: Arc<Worker>,
    count: usize,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let count = count.max(1);
    log::info!("starting {} workers", count);
    (0..count)
        .map(|i| tokio::spawn(worker.clone().run(i, shutdown.clone())))
        .collect()
}
