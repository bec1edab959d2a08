//! Webhook ingress: verify, parse, route to a tenant agent, enqueue. No remote calls.

use crate::channels::{verify_signature, WebhookPayload};
use crate::queue::{DispatchQueue, ProcessingJob};
use crate::store::StoreError;
use crate::tenants::TenantDirectory;
use std::fmt;
use std::sync::Arc;

/// Why a payload was dropped without processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Signature header present but does not match the body.
    BadSignature,
    /// Signature header present but no app secret to check it with.
    NoSecret,
    /// No signature header while signatures are required.
    MissingSignature,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::BadSignature => "signature mismatch",
            RejectReason::NoSecret => "signed payload but no app secret configured",
            RejectReason::MissingSignature => "missing signature header",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Payload processed; `enqueued` jobs created, `unrouted` messages had no agent.
    Accepted { enqueued: usize, unrouted: usize },
    Rejected(RejectReason),
    /// Not a message payload (malformed JSON, status callback).
    Ignored,
}

pub struct Ingress {
    queue: DispatchQueue,
    tenants: Arc<dyn TenantDirectory>,
    app_secret: Option<String>,
    require_signature: bool,
    default_agent: Option<String>,
}

impl Ingress {
    pub fn new(
        queue: DispatchQueue,
        tenants: Arc<dyn TenantDirectory>,
        app_secret: Option<String>,
        require_signature: bool,
        default_agent: Option<String>,
    ) -> Self {
        Self {
            queue,
            tenants,
            app_secret,
            require_signature,
            default_agent,
        }
    }

    /// Handle one webhook POST body. An error means the payload could not be durably
    /// accepted and the provider should redeliver it.
    pub async fn handle_inbound(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngressOutcome, StoreError> {
        if let Some(reason) = self.check_signature(body, signature) {
            log::warn!("webhook: payload rejected: {}", reason);
            return Ok(IngressOutcome::Rejected(reason));
        }

        let payload: WebhookPayload = match serde_json::from_slice(body) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("webhook: ignoring unparseable payload: {}", e);
                return Ok(IngressOutcome::Ignored);
            }
        };
        if !payload.has_messages() {
            return Ok(IngressOutcome::Ignored);
        }

        let mut enqueued = 0;
        let mut unrouted = 0;
        for msg in payload.text_messages() {
            let agent_id = match self.tenants.find_active(&msg.sender_id).await? {
                Some(tenant) => {
                    log::debug!(
                        "webhook: {} from {} routed to tenant {}",
                        msg.message_id,
                        msg.end_user,
                        tenant.label()
                    );
                    tenant.agent_id
                }
                None => match self.default_agent.as_ref() {
                    Some(agent) => {
                        log::debug!(
                            "webhook: no active tenant for {}, using default agent",
                            msg.sender_id
                        );
                        agent.clone()
                    }
                    None => {
                        log::warn!(
                            "webhook: no active tenant for {} and no default agent, dropping {}",
                            msg.sender_id,
                            msg.message_id
                        );
                        unrouted += 1;
                        continue;
                    }
                },
            };
            let job = ProcessingJob {
                agent_id,
                sender_id: msg.sender_id,
                end_user: msg.end_user,
                message_id: msg.message_id,
                text: msg.text,
            };
            self.queue.enqueue(&job).await?;
            enqueued += 1;
        }
        Ok(IngressOutcome::Accepted { enqueued, unrouted })
    }

    fn check_signature(&self, body: &[u8], signature: Option<&str>) -> Option<RejectReason> {
        match (signature, self.app_secret.as_deref()) {
            (Some(header), Some(secret)) => {
                (!verify_signature(body, header, secret)).then_some(RejectReason::BadSignature)
            }
            (Some(_), None) => Some(RejectReason::NoSecret),
            (None, _) if self.require_signature => Some(RejectReason::MissingSignature),
            (None, _) => None,
        }
    }
}
