//! Conversation and message records owned by the pipeline.
//!
//! A conversation binds one end-user of one tenant to a remote dialogue context.
//! Messages are the local transcript of that conversation, used for the idle report.

use chrono::{DateTime, Utc};

/// Affinity record: (tenant sender id, end-user) -> remote dialogue context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: i64,
    /// Channel sender identifier of the owning tenant.
    pub sender_id: String,
    /// End-user channel identifier (WhatsApp wa_id).
    pub end_user: String,
    /// Opaque remote dialogue-context handle (assistant thread id).
    pub context_id: String,
    pub created_at: DateTime<Utc>,
    /// Last successful reply delivery (creation time until then).
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// Delivery state of a message. Inbound user messages are stored as `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub end_user: String,
    /// Inbound channel message id; a reply carries the id of the message it answers.
    pub channel_message_id: String,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to append a message.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub conversation_id: i64,
    pub role: Role,
    pub content: &'a str,
    pub end_user: &'a str,
    pub channel_message_id: &'a str,
    pub status: DeliveryStatus,
}

impl<'a> NewMessage<'a> {
    pub fn user(conversation: &'a Conversation, channel_message_id: &'a str, content: &'a str) -> Self {
        Self {
            conversation_id: conversation.id,
            role: Role::User,
            content,
            end_user: &conversation.end_user,
            channel_message_id,
            status: DeliveryStatus::Sent,
        }
    }

    pub fn assistant(
        conversation: &'a Conversation,
        channel_message_id: &'a str,
        content: &'a str,
    ) -> Self {
        Self {
            conversation_id: conversation.id,
            role: Role::Assistant,
            content,
            end_user: &conversation.end_user,
            channel_message_id,
            status: DeliveryStatus::Pending,
        }
    }
}
