//! Messaging channel (WhatsApp Cloud API).
//!
//! Inbound payloads are parsed into [`InboundMessage`]s by the gateway; replies go out
//! through a [`ChannelHandle`].

mod format;
mod inbound;
mod outbound;
mod signature;
mod whatsapp;

pub use format::format_reply;
pub use inbound::InboundMessage;
pub use outbound::{ChannelError, ChannelHandle};
pub use signature::{verify_signature, SIGNATURE_HEADER};
pub use whatsapp::{WebhookPayload, WhatsAppChannel};
