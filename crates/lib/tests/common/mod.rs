//! In-process fakes for the assistant service, the channel and the mailer, plus a harness
//! wiring them over an in-memory store.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use lib::assistant::{AssistantApi, AssistantError, RunSnapshot, RunStatus};
use lib::channels::{ChannelError, ChannelHandle};
use lib::config::Config;
use lib::mail::{MailError, ReportMailer};
use lib::queue::{ProcessingJob, QueuedJob};
use lib::services::Services;
use lib::store::Database;
use lib::tenants::{StaticTenantDirectory, Tenant};
use lib::worker::Worker;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SENDER: &str = "PN1";
pub const HOST_EMAIL: &str = "host@example.com";

/// How runs end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunScript {
    Complete,
    Fail,
    Stuck,
}

pub struct FakeAssistant {
    pub script: Mutex<RunScript>,
    replies: Mutex<HashMap<String, String>>,
    pub created: AtomicUsize,
    pub runs: AtomicUsize,
    pub appended: Mutex<Vec<(String, String)>>,
    pub closed: Mutex<Vec<String>>,
}

impl FakeAssistant {
    pub fn new(script: RunScript) -> Self {
        Self {
            script: Mutex::new(script),
            replies: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            appended: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, script: RunScript) {
        *self.script.lock().unwrap() = script;
    }

    /// Canned answer for a user text. Unknown texts are echoed back.
    pub fn answer(&self, question: &str, reply: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(question.to_string(), reply.to_string());
    }

    fn snapshot(&self, run_id: &str) -> RunSnapshot {
        let status = match *self.script.lock().unwrap() {
            RunScript::Complete => RunStatus::Completed,
            RunScript::Fail => RunStatus::Failed,
            RunScript::Stuck => RunStatus::InProgress,
        };
        RunSnapshot {
            id: run_id.to_string(),
            status,
            last_error: (status == RunStatus::Failed).then(|| "server_error".to_string()),
        }
    }
}

#[async_trait]
impl AssistantApi for FakeAssistant {
    async fn create_context(&self) -> Result<String, AssistantError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(format!("thread_{}", n))
    }

    async fn append_message(&self, context_id: &str, text: &str) -> Result<(), AssistantError> {
        self.appended
            .lock()
            .unwrap()
            .push((context_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn submit_run(&self, _: &str, _: &str) -> Result<RunSnapshot, AssistantError> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(RunSnapshot {
            id: format!("run_{}", n),
            status: RunStatus::Queued,
            last_error: None,
        })
    }

    async fn poll_run(&self, _: &str, run_id: &str) -> Result<RunSnapshot, AssistantError> {
        Ok(self.snapshot(run_id))
    }

    async fn latest_reply(&self, context_id: &str) -> Result<Option<String>, AssistantError> {
        let last = self
            .appended
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(ctx, _)| ctx == context_id)
            .map(|(_, text)| text.clone());
        Ok(last.map(|q| {
            self.replies
                .lock()
                .unwrap()
                .get(&q)
                .cloned()
                .unwrap_or(q)
        }))
    }

    async fn close_context(&self, context_id: &str) -> Result<(), AssistantError> {
        self.closed.lock().unwrap().push(context_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeChannel {
    /// (sender_id, recipient, text) of every delivered message.
    pub sent: Mutex<Vec<(String, String, String)>>,
    /// Number of upcoming sends that fail.
    pub fail_next: AtomicUsize,
}

impl FakeChannel {
    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, t)| t.clone())
            .collect()
    }
}

#[async_trait]
impl ChannelHandle for FakeChannel {
    async fn send_message(
        &self,
        sender_id: &str,
        recipient: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChannelError::Api {
                status: 500,
                body: "upstream unavailable".to_string(),
            });
        }
        self.sent.lock().unwrap().push((
            sender_id.to_string(),
            recipient.to_string(),
            text.to_string(),
        ));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMailer {
    /// (to, subject, html)
    pub sent: Mutex<Vec<(String, String, String)>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl ReportMailer for FakeMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MailError::Api {
                status: 422,
                body: "invalid recipient".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string(), html.to_string()));
        Ok(())
    }
}

pub fn tenant(active: bool) -> Tenant {
    Tenant {
        sender_id: SENDER.to_string(),
        name: "Casa Azul".to_string(),
        agent_id: "asst_casa".to_string(),
        active,
        welcome_text: None,
        report_email: Some(HOST_EMAIL.to_string()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Fast timings: short polls, small backoff, one retry.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.assistant.poll_interval_ms = 5;
    config.assistant.poll_timeout_secs = 1;
    config.worker.max_retries = 1;
    config.worker.backoff_base_ms = 10;
    config.worker.backoff_max_ms = 40;
    config.worker.job_timeout_secs = 10;
    config.worker.idle_poll_ms = 20;
    config
}

pub struct Harness {
    pub config: Config,
    pub services: Services,
    pub assistant: Arc<FakeAssistant>,
    pub channel: Arc<FakeChannel>,
    pub mailer: Arc<FakeMailer>,
    pub worker: Arc<Worker>,
}

impl Harness {
    pub fn new(script: RunScript) -> Self {
        Self::with_tenants(script, vec![tenant(true)])
    }

    pub fn with_tenants(script: RunScript, tenants: Vec<Tenant>) -> Self {
        let config = test_config();
        let assistant = Arc::new(FakeAssistant::new(script));
        let channel = Arc::new(FakeChannel::default());
        let mailer = Arc::new(FakeMailer::default());
        let services = Services::new(
            &config,
            Database::open_in_memory().unwrap(),
            Arc::new(StaticTenantDirectory::new(tenants)),
            assistant.clone(),
            channel.clone(),
            Some(mailer.clone() as Arc<dyn ReportMailer>),
        );
        let worker = Arc::new(services.worker(&config));
        Self {
            config,
            services,
            assistant,
            channel,
            mailer,
            worker,
        }
    }

    pub fn job(&self, end_user: &str, message_id: &str, text: &str) -> ProcessingJob {
        ProcessingJob {
            agent_id: "asst_casa".to_string(),
            sender_id: SENDER.to_string(),
            end_user: end_user.to_string(),
            message_id: message_id.to_string(),
            text: text.to_string(),
        }
    }

    /// Claim the next job as if `ahead` had passed, so retry delays are already due.
    pub async fn claim_ahead(&self, ahead: Duration) -> Option<QueuedJob> {
        let now = Utc::now() + chrono::Duration::milliseconds(ahead.as_millis() as i64);
        self.services.queue.claim(now).await.unwrap()
    }
}
