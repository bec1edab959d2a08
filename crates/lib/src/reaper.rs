//! Idle conversation reaper.
//!
//! Conversations with no delivered reply for the inactivity threshold are reported to the
//! tenant by email, their remote context is closed, and all local state is deleted. Report
//! and close are best-effort; deletion always happens.

use crate::affinity::{AffinityStore, ConversationKey};
use crate::assistant::AssistantApi;
use crate::conversation::{Conversation, Message};
use crate::mail::ReportMailer;
use crate::report::render_report;
use crate::store::StoreError;
use crate::tenants::{Tenant, TenantDirectory};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Result of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapSummary {
    /// Conversations past the threshold at scan time.
    pub candidates: usize,
    /// Conversations closed and deleted.
    pub purged: usize,
    /// Messages deleted with them.
    pub messages_removed: usize,
    /// Reports handed to the mailer.
    pub reports_sent: usize,
    /// Candidates left alone: tenant inactive, or activity resumed before the lock.
    pub skipped: usize,
    /// Candidates whose purge failed; they are retried on the next scan.
    pub errors: usize,
}

pub struct Reaper {
    affinity: Arc<AffinityStore>,
    tenants: Arc<dyn TenantDirectory>,
    assistant: Arc<dyn AssistantApi>,
    mailer: Option<Arc<dyn ReportMailer>>,
    inactivity: Duration,
}

impl Reaper {
    pub fn new(
        affinity: Arc<AffinityStore>,
        tenants: Arc<dyn TenantDirectory>,
        assistant: Arc<dyn AssistantApi>,
        mailer: Option<Arc<dyn ReportMailer>>,
        inactivity: Duration,
    ) -> Self {
        Self {
            affinity,
            tenants,
            assistant,
            mailer,
            inactivity,
        }
    }

    /// One scan as of `now`.
    pub async fn reap_once(&self, now: DateTime<Utc>) -> Result<ReapSummary, StoreError> {
        let mut summary = ReapSummary::default();
        let threshold = chrono::Duration::milliseconds(
            self.inactivity.as_millis().min(i64::MAX as u128) as i64,
        );
        let Some(cutoff) = now.checked_sub_signed(threshold) else {
            return Ok(summary);
        };
        let candidates = self.affinity.database().idle_conversations(cutoff).await?;
        summary.candidates = candidates.len();

        for candidate in candidates {
            let tenant = match self.tenants.find_active(&candidate.sender_id).await {
                Ok(Some(tenant)) => tenant,
                Ok(None) => {
                    log::debug!(
                        "reaper: no active tenant for {}, leaving conversation {}",
                        candidate.sender_id,
                        candidate.id
                    );
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    log::warn!("reaper: tenant lookup for {} failed: {}", candidate.sender_id, e);
                    summary.errors += 1;
                    continue;
                }
            };
            match self.reap_conversation(&tenant, &candidate, cutoff).await {
                Ok(Some(outcome)) => {
                    summary.purged += 1;
                    summary.messages_removed += outcome.messages_removed;
                    if outcome.reported {
                        summary.reports_sent += 1;
                    }
                }
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    log::warn!("reaper: conversation {} not purged: {}", candidate.id, e);
                    summary.errors += 1;
                }
            }
        }
        if summary.purged > 0 || summary.errors > 0 {
            log::info!(
                "reaper: purged {} of {} idle conversations ({} messages, {} reports, {} errors)",
                summary.purged,
                summary.candidates,
                summary.messages_removed,
                summary.reports_sent,
                summary.errors
            );
        }
        Ok(summary)
    }

    /// Purge one conversation under its key lock. None when it was no longer idle.
    async fn reap_conversation(
        &self,
        tenant: &Tenant,
        candidate: &Conversation,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<PurgeOutcome>, StoreError> {
        let key = ConversationKey::new(candidate.sender_id.as_str(), candidate.end_user.as_str());
        let _guard = self.affinity.lock(&key).await;
        let db = self.affinity.database();

        let Some(current) = db.find_conversation(&key.sender_id, &key.end_user).await? else {
            return Ok(None);
        };
        if current.id != candidate.id || current.last_activity_at >= cutoff {
            log::debug!("reaper: conversation {} became active again", candidate.id);
            return Ok(None);
        }
        // last_activity_at only moves on a sent reply; a recent inbound means a job is in flight.
        if let Some(latest) = db.latest_message_at(current.id).await? {
            if latest >= cutoff {
                log::debug!("reaper: conversation {} has a message being answered", candidate.id);
                return Ok(None);
            }
        }

        let messages = db.messages_for(current.id).await?;
        let reported = self.send_report(tenant, &current, &messages).await;

        if let Err(e) = self.assistant.close_context(&current.context_id).await {
            log::warn!(
                "reaper: closing context {} failed: {}",
                current.context_id,
                e
            );
        }

        let messages_removed = db.delete_conversation(current.id).await?;
        log::info!(
            "reaper: closed conversation {} ({}/{}), {} messages",
            current.id,
            current.sender_id,
            current.end_user,
            messages_removed
        );
        Ok(Some(PurgeOutcome {
            messages_removed,
            reported,
        }))
    }

    async fn send_report(
        &self,
        tenant: &Tenant,
        conversation: &Conversation,
        messages: &[Message],
    ) -> bool {
        let Some(mailer) = self.mailer.as_ref() else {
            log::warn!(
                "reaper: no mailer configured, conversation {} closes without a report",
                conversation.id
            );
            return false;
        };
        let Some(to) = tenant
            .report_email
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            log::warn!(
                "reaper: tenant {} has no report email, conversation {} closes without a report",
                tenant.label(),
                conversation.id
            );
            return false;
        };
        let report = match render_report(tenant, conversation, messages) {
            Ok(report) => report,
            Err(e) => {
                log::warn!("reaper: rendering report for {} failed: {}", conversation.id, e);
                return false;
            }
        };
        match mailer.send(to, &report.subject, &report.html).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("reaper: report for {} not sent: {}", conversation.id, e);
                false
            }
        }
    }

    /// Scan every `interval` until shutdown is signalled.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!(
            "reaper: scanning every {:?}, inactivity threshold {:?}",
            interval,
            self.inactivity
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once(Utc::now()).await {
                        log::warn!("reaper: scan failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::debug!("reaper: stopped");
    }
}

struct PurgeOutcome {
    messages_removed: usize,
    reported: bool,
}
