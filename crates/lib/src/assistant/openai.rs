//! OpenAI Assistants API client (v2): threads, messages and runs.

use super::{AssistantApi, AssistantError, RunSnapshot, RunStatus};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the Assistants API.
#[derive(Clone)]
pub struct OpenAiAssistants {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ObjectId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    status: RunStatus,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    role: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    typ: String,
    #[serde(default)]
    text: Option<TextValue>,
}

#[derive(Debug, Deserialize)]
struct TextValue {
    value: String,
}

impl From<RunObject> for RunSnapshot {
    fn from(run: RunObject) -> Self {
        let last_error = run.last_error.map(|e| match (e.code, e.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (Some(code), None) => code,
            (None, Some(message)) => message,
            (None, None) => "unspecified".to_string(),
        });
        RunSnapshot {
            id: run.id,
            status: run.status,
            last_error,
        }
    }
}

impl OpenAiAssistants {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            api_key,
            client,
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, AssistantError> {
        let key = self.api_key.as_ref().ok_or(AssistantError::NotConfigured)?;
        let url = format!("{}{}", self.base_url, path);
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(key)
            .header(BETA_HEADER.0, BETA_HEADER.1))
    }

    async fn send(req: reqwest::RequestBuilder) -> Result<reqwest::Response, AssistantError> {
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(AssistantError::Api { status, body });
        }
        Ok(res)
    }
}

#[async_trait]
impl AssistantApi for OpenAiAssistants {
    /// POST /threads
    async fn create_context(&self) -> Result<String, AssistantError> {
        let req = self
            .request(reqwest::Method::POST, "/threads")?
            .json(&serde_json::json!({}));
        let thread: ObjectId = Self::send(req).await?.json().await?;
        Ok(thread.id)
    }

    /// POST /threads/{id}/messages
    async fn append_message(&self, context_id: &str, text: &str) -> Result<(), AssistantError> {
        let req = self
            .request(
                reqwest::Method::POST,
                &format!("/threads/{}/messages", context_id),
            )?
            .json(&serde_json::json!({ "role": "user", "content": text }));
        Self::send(req).await?;
        Ok(())
    }

    /// POST /threads/{id}/runs
    async fn submit_run(
        &self,
        context_id: &str,
        agent_id: &str,
    ) -> Result<RunSnapshot, AssistantError> {
        let req = self
            .request(reqwest::Method::POST, &format!("/threads/{}/runs", context_id))?
            .json(&serde_json::json!({ "assistant_id": agent_id }));
        let run: RunObject = Self::send(req).await?.json().await?;
        Ok(run.into())
    }

    /// GET /threads/{id}/runs/{run_id}
    async fn poll_run(&self, context_id: &str, run_id: &str) -> Result<RunSnapshot, AssistantError> {
        let req = self.request(
            reqwest::Method::GET,
            &format!("/threads/{}/runs/{}", context_id, run_id),
        )?;
        let run: RunObject = Self::send(req).await?.json().await?;
        Ok(run.into())
    }

    /// GET /threads/{id}/messages?limit=1&order=desc
    async fn latest_reply(&self, context_id: &str) -> Result<Option<String>, AssistantError> {
        let req = self.request(
            reqwest::Method::GET,
            &format!("/threads/{}/messages?limit=1&order=desc", context_id),
        )?;
        let list: MessageList = Self::send(req).await?.json().await?;
        Ok(list
            .data
            .into_iter()
            .find(|m| m.role == "assistant")
            .and_then(|m| {
                let text: Vec<String> = m
                    .content
                    .into_iter()
                    .filter(|p| p.typ == "text")
                    .filter_map(|p| p.text.map(|t| t.value))
                    .collect();
                if text.is_empty() {
                    None
                } else {
                    Some(text.join("\n\n"))
                }
            }))
    }

    /// DELETE /threads/{id}
    async fn close_context(&self, context_id: &str) -> Result<(), AssistantError> {
        let req = self.request(reqwest::Method::DELETE, &format!("/threads/{}", context_id))?;
        Self::send(req).await?;
        Ok(())
    }
}
