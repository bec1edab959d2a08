//! WhatsApp Cloud API: webhook payload types and sendMessage via the Graph API.

use crate::channels::inbound::InboundMessage;
use crate::channels::outbound::{ChannelError, ChannelHandle};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v19.0";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Webhook POST body.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: Option<ChangeValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub metadata: Option<ChangeMetadata>,
    #[serde(default)]
    pub messages: Option<Vec<WaMessage>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeMetadata {
    #[serde(default)]
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(rename = "type", default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub text: Option<WaText>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaText {
    #[serde(default)]
    pub body: String,
}

impl WebhookPayload {
    /// True when some change carries a message list. Status callbacks carry none.
    pub fn has_messages(&self) -> bool {
        self.entry.iter().flat_map(|e| &e.changes).any(|c| {
            c.value
                .as_ref()
                .and_then(|v| v.messages.as_ref())
                .is_some()
        })
    }

    /// Every text message with a sender number, end-user, id and non-empty body.
    pub fn text_messages(&self) -> Vec<InboundMessage> {
        let mut out = Vec::new();
        for change in self.entry.iter().flat_map(|e| &e.changes) {
            if change.field.as_deref().is_some_and(|f| f != "messages") {
                continue;
            }
            let Some(value) = change.value.as_ref() else {
                continue;
            };
            let Some(sender_id) = value
                .metadata
                .as_ref()
                .and_then(|m| m.phone_number_id.as_deref())
                .filter(|s| !s.is_empty())
            else {
                continue;
            };
            for msg in value.messages.iter().flatten() {
                if msg.message_type.as_deref() != Some("text") {
                    log::debug!(
                        "whatsapp: skipping {} message",
                        msg.message_type.as_deref().unwrap_or("untyped")
                    );
                    continue;
                }
                let (Some(from), Some(id), Some(text)) =
                    (msg.from.as_deref(), msg.id.as_deref(), msg.text.as_ref())
                else {
                    continue;
                };
                if from.is_empty() || id.is_empty() || text.body.trim().is_empty() {
                    continue;
                }
                out.push(InboundMessage {
                    message_id: id.to_string(),
                    sender_id: sender_id.to_string(),
                    end_user: from.to_string(),
                    text: text.body.clone(),
                });
            }
        }
        out
    }
}

/// WhatsApp connector: sends replies through the Graph API messages endpoint.
pub struct WhatsAppChannel {
    token: Option<String>,
    api_base: String,
    client: reqwest::Client,
}

impl WhatsAppChannel {
    pub fn new(token: Option<String>, api_base: Option<String>) -> Self {
        let api_base = api_base
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| GRAPH_API_BASE.to_string());
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            token,
            api_base,
            client,
        }
    }

    /// POST /{phone_number_id}/messages with a text body.
    pub async fn send_text(
        &self,
        phone_number_id: &str,
        to: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let token = self.token.as_ref().ok_or(ChannelError::NotConfigured)?;
        let url = format!("{}/{}/messages", self.api_base, phone_number_id);
        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": { "body": text },
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::Api { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelHandle for WhatsAppChannel {
    async fn send_message(
        &self,
        sender_id: &str,
        recipient: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.send_text(sender_id, recipient, text).await
    }
}
