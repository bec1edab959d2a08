//! Inbound message from the channel: one text message to route to a tenant's agent.

/// A text message extracted from a webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Channel message id (WhatsApp `wamid.*`).
    pub message_id: String,
    /// Business number that received the message (tenant sender identifier).
    pub sender_id: String,
    /// End-user who wrote the message.
    pub end_user: String,
    pub text: String,
}
