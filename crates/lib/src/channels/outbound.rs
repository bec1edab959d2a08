//! Reply delivery handle.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("channel api error: {status} {body}")]
    Api { status: u16, body: String },
    #[error("channel access token not configured")]
    NotConfigured,
}

/// Sends text replies to end-users.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Send `text` from the tenant's sender identity to `recipient`.
    async fn send_message(
        &self,
        sender_id: &str,
        recipient: &str,
        text: &str,
    ) -> Result<(), ChannelError>;
}
