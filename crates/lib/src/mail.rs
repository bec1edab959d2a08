//! Report delivery by email (Resend HTTP API).

use crate::config::{resolve_report_key, Config};
use async_trait::async_trait;
use std::time::Duration;

const MAIL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("mail api error: {status} {body}")]
    Api { status: u16, body: String },
}

/// Sends rendered reports to a tenant.
#[async_trait]
pub trait ReportMailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError>;
}

/// Resend client: `POST {base}/emails`.
pub struct ResendMailer {
    api_key: String,
    api_base: String,
    from: String,
    client: reqwest::Client,
}

impl ResendMailer {
    pub fn new(api_key: String, api_base: &str, from: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(MAIL_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            from,
            client,
        }
    }

    /// Mailer from the `report` section, or None when no API key is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let key = resolve_report_key(config)?;
        Some(Self::new(
            key,
            &config.report.api_base,
            config.report.from.clone(),
        ))
    }
}

#[async_trait]
impl ReportMailer for ResendMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError> {
        let url = format!("{}/emails", self.api_base);
        let body = serde_json::json!({
            "from": self.from,
            "to": [to],
            "subject": subject,
            "html": html,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(MailError::Api { status, body });
        }
        log::debug!("report mailed to {}", to);
        Ok(())
    }
}
