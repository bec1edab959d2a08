//! Wiring: builds the shared handles once and hands them to the gateway, workers and reaper.

use crate::affinity::AffinityStore;
use crate::assistant::{AssistantApi, OpenAiAssistants};
use crate::channels::{ChannelHandle, WhatsAppChannel};
use crate::config::{self, Config};
use crate::gateway::Ingress;
use crate::mail::{ReportMailer, ResendMailer};
use crate::queue::DispatchQueue;
use crate::reaper::Reaper;
use crate::store::Database;
use crate::tenants::{SqliteTenantDirectory, StaticTenantDirectory, TenantDirectory};
use crate::worker::{Worker, WorkerSettings};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Dependency handles shared by every component.
#[derive(Clone)]
pub struct Services {
    pub db: Database,
    pub queue: DispatchQueue,
    pub tenants: Arc<dyn TenantDirectory>,
    pub assistant: Arc<dyn AssistantApi>,
    pub channel: Arc<dyn ChannelHandle>,
    pub mailer: Option<Arc<dyn ReportMailer>>,
    pub affinity: Arc<AffinityStore>,
}

impl Services {
    /// Assemble from explicit parts. The queue and affinity store are built over `db`.
    pub fn new(
        config: &Config,
        db: Database,
        tenants: Arc<dyn TenantDirectory>,
        assistant: Arc<dyn AssistantApi>,
        channel: Arc<dyn ChannelHandle>,
        mailer: Option<Arc<dyn ReportMailer>>,
    ) -> Self {
        let queue = DispatchQueue::new(
            db.clone(),
            Duration::from_secs(config.worker.lease_secs),
            Duration::from_millis(config.worker.idle_poll_ms.max(1)),
        );
        let affinity = Arc::new(AffinityStore::new(db.clone(), assistant.clone()));
        Self {
            db,
            queue,
            tenants,
            assistant,
            channel,
            mailer,
            affinity,
        }
    }

    /// Open the store and build the production clients from config and environment.
    pub fn open(config: &Config, config_path: &Path) -> Result<Self> {
        let store_path = config::resolve_store_path(config, config_path);
        if let Some(dir) = store_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating store directory {}", dir.display()))?;
        }
        let db = Database::open(&store_path)
            .with_context(|| format!("opening store at {}", store_path.display()))?;
        log::info!("store: {}", store_path.display());

        let tenants: Arc<dyn TenantDirectory> = if config.tenants.is_empty() {
            log::info!("tenants: read from store");
            Arc::new(SqliteTenantDirectory::new(db.clone()))
        } else {
            log::info!("tenants: {} declared in config", config.tenants.len());
            Arc::new(StaticTenantDirectory::from_config(&config.tenants))
        };

        let assistant_key = config::resolve_assistant_key(config);
        if assistant_key.is_none() {
            log::warn!("no assistant api key (assistant.apiKey or OPENAI_API_KEY); jobs will fail");
        }
        let assistant: Arc<dyn AssistantApi> = Arc::new(OpenAiAssistants::new(
            Some(config.assistant.api_base.clone()),
            assistant_key,
        ));

        let token = config::resolve_whatsapp_token(config);
        if token.is_none() {
            log::warn!("no whatsapp access token (WHATSAPP_ACCESS_TOKEN); replies cannot be sent");
        }
        let channel: Arc<dyn ChannelHandle> = Arc::new(WhatsAppChannel::new(
            token,
            Some(config.channels.whatsapp.api_base.clone()),
        ));

        let mailer: Option<Arc<dyn ReportMailer>> = match ResendMailer::from_config(config) {
            Some(m) => Some(Arc::new(m)),
            None => {
                log::info!("no report api key (RESEND_API_KEY); conversations close without reports");
                None
            }
        };

        Ok(Self::new(config, db, tenants, assistant, channel, mailer))
    }

    pub fn ingress(&self, config: &Config) -> Ingress {
        Ingress::new(
            self.queue.clone(),
            self.tenants.clone(),
            config::resolve_app_secret(config),
            config.channels.whatsapp.require_signature,
            config::resolve_default_agent(config),
        )
    }

    pub fn worker(&self, config: &Config) -> Worker {
        Worker::new(
            self.queue.clone(),
            self.affinity.clone(),
            self.assistant.clone(),
            self.channel.clone(),
            WorkerSettings::from_config(config),
        )
    }

    pub fn reaper(&self, config: &Config) -> Reaper {
        Reaper::new(
            self.affinity.clone(),
            self.tenants.clone(),
            self.assistant.clone(),
            self.mailer.clone(),
            Duration::from_secs(config.reaper.inactivity_secs),
        )
    }
}
