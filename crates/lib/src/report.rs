//! HTML transcript report for a closed conversation.

use crate::conversation::{Conversation, DeliveryStatus, Message};
use crate::tenants::Tenant;
use askama::Template;
use chrono::{DateTime, Utc};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// One transcript entry as shown in the report.
pub(crate) struct TranscriptLine {
    role: &'static str,
    timestamp: String,
    content: String,
    delivered: bool,
}

#[derive(Template)]
#[template(path = "report.html", escape = "html")]
struct ReportTemplate<'a> {
    tenant_name: &'a str,
    sender_id: &'a str,
    end_user: &'a str,
    started_at: String,
    last_activity_at: String,
    message_count: usize,
    lines: &'a [TranscriptLine],
}

/// Rendered report, ready to mail.
#[derive(Debug, Clone)]
pub struct Report {
    pub subject: String,
    pub html: String,
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.format(TIME_FORMAT).to_string()
}

/// Render the transcript of `conversation` for `tenant`. `messages` must be in creation order.
pub fn render_report(
    tenant: &Tenant,
    conversation: &Conversation,
    messages: &[Message],
) -> Result<Report, askama::Error> {
    let lines: Vec<TranscriptLine> = messages
        .iter()
        .map(|m| TranscriptLine {
            role: m.role.as_str(),
            timestamp: format_time(m.created_at),
            content: m.content.clone(),
            delivered: m.status == DeliveryStatus::Sent,
        })
        .collect();
    let template = ReportTemplate {
        tenant_name: tenant.label(),
        sender_id: &conversation.sender_id,
        end_user: &conversation.end_user,
        started_at: format_time(conversation.created_at),
        last_activity_at: format_time(conversation.last_activity_at),
        message_count: messages.len(),
        lines: &lines,
    };
    let html = template.render()?;
    Ok(Report {
        subject: format!(
            "Conversation report - {} - {}",
            tenant.label(),
            conversation.end_user
        ),
        html,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn message(id: i64, role: Role, content: &str, status: DeliveryStatus) -> Message {
        Message {
            id,
            conversation_id: 1,
            role,
            content: content.to_string(),
            end_user: "34600111222".to_string(),
            channel_message_id: format!("wamid.{}", id),
            status,
            error: None,
            created_at: at(id),
        }
    }

    #[test]
    fn report_lists_participants_and_escapes_content() {
        let tenant = Tenant {
            sender_id: "PN1".to_string(),
            name: "Casa Azul".to_string(),
            agent_id: "asst_1".to_string(),
            active: true,
            welcome_text: None,
            report_email: Some("host@example.com".to_string()),
            created_at: at(0),
            updated_at: at(0),
        };
        let conversation = Conversation {
            id: 1,
            sender_id: "PN1".to_string(),
            end_user: "34600111222".to_string(),
            context_id: "thread_1".to_string(),
            created_at: at(0),
            last_activity_at: at(4),
        };
        let messages = vec![
            message(1, Role::User, "Hello <b>there</b>", DeliveryStatus::Sent),
            message(2, Role::Assistant, "Hi there!", DeliveryStatus::Sent),
            message(3, Role::User, "Pricing?", DeliveryStatus::Sent),
            message(4, Role::Assistant, "10€", DeliveryStatus::Failed),
        ];
        let report = render_report(&tenant, &conversation, &messages).unwrap();
        assert_eq!(report.subject, "Conversation report - Casa Azul - 34600111222");
        assert!(report.html.contains("Messages: 4"));
        assert!(report.html.contains("WhatsApp user: 34600111222"));
        assert!(report.html.contains("Hello &lt;b&gt;there&lt;/b&gt;"));
        assert!(report.html.contains("not delivered"));
        assert!(report.html.contains("2023-11-14 22:13:20 UTC"));
    }
}
