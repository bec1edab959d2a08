//! Idle conversation reaper against a populated store.

mod common;

use chrono::Utc;
use common::{tenant, Harness, RunScript, HOST_EMAIL, SENDER};
use lib::conversation::NewMessage;
use lib::reaper::ReapSummary;
use std::sync::atomic::Ordering;

async fn two_exchanges(h: &Harness, end_user: &str) {
    h.assistant.answer("Hello", "Hi there!");
    h.worker
        .process(&h.job(end_user, "wamid.1", "Hello"))
        .await
        .unwrap();
    h.worker
        .process(&h.job(end_user, "wamid.2", "Is breakfast included?"))
        .await
        .unwrap();
}

fn seconds(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

#[tokio::test]
async fn idle_conversation_is_reported_closed_and_purged() {
    let h = Harness::new(RunScript::Complete);
    two_exchanges(&h, "u1").await;
    let reaper = h.services.reaper(&h.config);
    let db = &h.services.db;
    let conversation = db.find_conversation(SENDER, "u1").await.unwrap().unwrap();

    // Not idle long enough yet.
    let early = reaper.reap_once(Utc::now() + seconds(300)).await.unwrap();
    assert_eq!(early, ReapSummary::default());
    assert!(db.find_conversation(SENDER, "u1").await.unwrap().is_some());

    let summary = reaper.reap_once(Utc::now() + seconds(700)).await.unwrap();
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.purged, 1);
    assert_eq!(summary.messages_removed, 4);
    assert_eq!(summary.reports_sent, 1);

    let mails = h.mailer.sent.lock().unwrap().clone();
    assert_eq!(mails.len(), 1);
    let (to, subject, html) = &mails[0];
    assert_eq!(to, HOST_EMAIL);
    assert!(subject.contains("Casa Azul"));
    assert!(html.contains("Messages: 4"));
    assert!(html.contains("Hi there!"));
    assert!(html.contains("Is breakfast included?"));

    assert_eq!(
        h.assistant.closed.lock().unwrap().clone(),
        vec![conversation.context_id.clone()]
    );
    assert!(db.find_conversation(SENDER, "u1").await.unwrap().is_none());
    assert!(db.messages_for(conversation.id).await.unwrap().is_empty());

    // Nothing left for the next scan.
    let again = reaper.reap_once(Utc::now() + seconds(1400)).await.unwrap();
    assert_eq!(again.candidates, 0);
}

#[tokio::test]
async fn report_failure_does_not_block_the_purge() {
    let h = Harness::new(RunScript::Complete);
    two_exchanges(&h, "u1").await;
    h.mailer.fail.store(true, Ordering::SeqCst);

    let summary = h
        .services
        .reaper(&h.config)
        .reap_once(Utc::now() + seconds(700))
        .await
        .unwrap();
    assert_eq!(summary.purged, 1);
    assert_eq!(summary.reports_sent, 0);
    assert!(h
        .services
        .db
        .find_conversation(SENDER, "u1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn conversations_of_inactive_tenants_are_left_alone() {
    let h = Harness::with_tenants(RunScript::Complete, vec![tenant(false)]);
    two_exchanges(&h, "u1").await;

    let summary = h
        .services
        .reaper(&h.config)
        .reap_once(Utc::now() + seconds(700))
        .await
        .unwrap();
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.purged, 0);
    assert!(h.mailer.sent.lock().unwrap().is_empty());
    assert!(h
        .services
        .db
        .find_conversation(SENDER, "u1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn only_idle_conversations_are_touched_and_purged_users_start_fresh() {
    let h = Harness::new(RunScript::Complete);
    two_exchanges(&h, "u1").await;
    let reaper = h.services.reaper(&h.config);

    let summary = reaper.reap_once(Utc::now() + seconds(700)).await.unwrap();
    assert_eq!(summary.purged, 1);

    // u2 talks now; u1 comes back after the purge.
    two_exchanges(&h, "u2").await;
    h.worker
        .process(&h.job("u1", "wamid.9", "Hello again"))
        .await
        .unwrap();
    assert_eq!(h.assistant.created.load(Ordering::SeqCst), 3);

    let summary = reaper.reap_once(Utc::now()).await.unwrap();
    assert_eq!(summary.candidates, 0);
    let u1 = h
        .services
        .db
        .find_conversation(SENDER, "u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.services.db.count_messages(u1.id).await.unwrap(), 2);
}

#[tokio::test]
async fn conversation_with_a_message_being_answered_is_not_purged() {
    let h = Harness::new(RunScript::Complete);
    let db = &h.services.db;
    let now = Utc::now();
    let long_ago = now - seconds(700);

    // Idle since an old exchange; the user has just written again and the job is in flight.
    let (conversation, _) = db
        .insert_conversation_or_fetch(SENDER, "u1", "thread_prior", long_ago)
        .await
        .unwrap();
    db.insert_message_or_fetch(&NewMessage::user(&conversation, "wamid.0", "Hello"), long_ago)
        .await
        .unwrap();
    db.insert_message_or_fetch(&NewMessage::user(&conversation, "wamid.1", "Hello again"), now)
        .await
        .unwrap();

    let summary = h.services.reaper(&h.config).reap_once(now).await.unwrap();
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.purged, 0);
    assert!(h.mailer.sent.lock().unwrap().is_empty());
    assert!(h.assistant.closed.lock().unwrap().is_empty());

    // The in-flight job finishes on the existing context.
    h.worker
        .process(&h.job("u1", "wamid.1", "Hello again"))
        .await
        .unwrap();
    assert_eq!(h.assistant.created.load(Ordering::SeqCst), 0);
    let appended = h.assistant.appended.lock().unwrap().clone();
    assert_eq!(
        appended,
        vec![("thread_prior".to_string(), "Hello again".to_string())]
    );
    let current = db.find_conversation(SENDER, "u1").await.unwrap().unwrap();
    assert_eq!(current.id, conversation.id);
    assert!(current.last_activity_at > long_ago);
    assert_eq!(db.count_messages(current.id).await.unwrap(), 3);
}
