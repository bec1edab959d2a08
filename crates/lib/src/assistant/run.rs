//! Bounded run driver: append, submit, poll until done or the ceiling, fetch the reply.

use super::{AssistantApi, AssistantError, RunStatus};
use std::time::Duration;
use tokio::time::Instant;

/// Poll cadence and ceiling for one run.
#[derive(Debug, Clone, Copy)]
pub struct RunPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Append `text` to the context, run `agent_id` over it and return the raw reply text.
///
/// Polls while the run is queued or in progress. A run still pending when `policy.timeout`
/// elapses is a [`AssistantError::RunTimeout`]; any other non-completed status is
/// [`AssistantError::RunFailed`].
pub async fn drive_run(
    api: &dyn AssistantApi,
    context_id: &str,
    agent_id: &str,
    text: &str,
    policy: RunPolicy,
) -> Result<String, AssistantError> {
    api.append_message(context_id, text).await?;
    let mut run = api.submit_run(context_id, agent_id).await?;
    log::debug!("run {}: submitted ({})", run.id, run.status);

    let deadline = Instant::now() + policy.timeout;
    while run.status.is_pending() {
        let now = Instant::now();
        if now >= deadline {
            log::warn!(
                "run {}: still {} after {:?}, giving up",
                run.id,
                run.status,
                policy.timeout
            );
            return Err(AssistantError::RunTimeout(policy.timeout));
        }
        tokio::time::sleep(policy.poll_interval.min(deadline - now)).await;
        run = api.poll_run(context_id, &run.id).await?;
    }

    if run.status != RunStatus::Completed {
        return Err(AssistantError::RunFailed {
            status: run.status,
            detail: run.last_error,
        });
    }
    log::debug!("run {}: completed", run.id);

    match api.latest_reply(context_id).await? {
        Some(reply) if !reply.trim().is_empty() => Ok(reply),
        _ => Err(AssistantError::EmptyReply),
    }
}
