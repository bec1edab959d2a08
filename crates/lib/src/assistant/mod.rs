//! Remote assistant service: dialogue contexts (threads) and runs.
//!
//! The worker talks to the service through [`AssistantApi`] so tests and other
//! providers can stand in for the OpenAI client.

mod openai;
mod run;

pub use openai::OpenAiAssistants;
pub use run::{drive_run, RunPolicy};

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("assistant request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("assistant api error: {status} {body}")]
    Api { status: u16, body: String },
    #[error("assistant api key not configured")]
    NotConfigured,
    #[error("run ended with status {status}: {}", .detail.as_deref().unwrap_or("no detail"))]
    RunFailed {
        status: RunStatus,
        detail: Option<String>,
    },
    #[error("run did not finish within {0:?}")]
    RunTimeout(Duration),
    #[error("run completed without an assistant reply")]
    EmptyReply,
}

impl AssistantError {
    /// Terminal run failures: the run itself finished badly or never finished.
    pub fn is_terminal_run_failure(&self) -> bool {
        matches!(
            self,
            AssistantError::RunFailed { .. }
                | AssistantError::RunTimeout(_)
                | AssistantError::EmptyReply
        )
    }
}

/// Run lifecycle as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Still worth polling.
    pub fn is_pending(self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Expired => "expired",
            RunStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    pub id: String,
    pub status: RunStatus,
    /// Service-provided failure message, when the run failed.
    pub last_error: Option<String>,
}

/// Operations the pipeline needs from the remote assistant service.
#[async_trait]
pub trait AssistantApi: Send + Sync {
    /// Create a new dialogue context; returns its handle.
    async fn create_context(&self) -> Result<String, AssistantError>;

    /// Append a user message to the context.
    async fn append_message(&self, context_id: &str, text: &str) -> Result<(), AssistantError>;

    /// Start a run of `agent_id` over the context.
    async fn submit_run(&self, context_id: &str, agent_id: &str)
        -> Result<RunSnapshot, AssistantError>;

    /// Current state of a run.
    async fn poll_run(&self, context_id: &str, run_id: &str) -> Result<RunSnapshot, AssistantError>;

    /// Text of the most recent assistant message in the context.
    async fn latest_reply(&self, context_id: &str) -> Result<Option<String>, AssistantError>;

    /// Retire the context on the service side.
    async fn close_context(&self, context_id: &str) -> Result<(), AssistantError>;
}
