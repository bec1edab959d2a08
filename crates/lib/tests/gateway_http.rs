//! Integration test: start the gateway on a free port and drive it over HTTP.
//! Does not reach WhatsApp or OpenAI. The server task is left running when the test ends.

use hmac::{Hmac, Mac};
use lib::config::{Config, TenantConfig};
use lib::gateway;
use sha2::Sha256;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

const APP_SECRET: &str = "test-app-secret";
const VERIFY_TOKEN: &str = "test-verify-token";

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

fn temp_config_dir() -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!("parley-gateway-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create config dir");
    let config_path = dir.join("config.json");
    std::fs::File::create(&config_path)
        .and_then(|mut f| f.write_all(b"{}"))
        .expect("write config.json");
    (dir, config_path)
}

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(APP_SECRET.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

async fn queued_jobs(client: &reqwest::Client, base: &str) -> u64 {
    let json: serde_json::Value = client
        .get(base)
        .send()
        .await
        .expect("GET /")
        .json()
        .await
        .expect("parse JSON");
    let queue = &json["queue"];
    ["ready", "leased", "failed"]
        .iter()
        .map(|k| queue[*k].as_u64().unwrap_or(0))
        .sum()
}

async fn start_gateway() -> String {
    let port = free_port();
    let (_dir, config_path) = temp_config_dir();

    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();
    config.channels.whatsapp.app_secret = Some(APP_SECRET.to_string());
    config.channels.whatsapp.verify_token = Some(VERIFY_TOKEN.to_string());
    config.reaper.enabled = false;
    config.worker.concurrency = 1;
    config.tenants = vec![TenantConfig {
        sender_id: "PN1".to_string(),
        name: "Casa Azul".to_string(),
        agent_id: "asst_casa".to_string(),
        active: true,
        welcome_text: None,
        report_email: None,
    }];

    tokio::spawn(async move {
        let _ = gateway::run_gateway(config, config_path).await;
    });

    let base = format!("http://127.0.0.1:{}/", port);
    let client = reqwest::Client::new();
    let mut last_err = None;
    for _ in 0..100 {
        match client.get(&base).send().await {
            Ok(resp) if resp.status().is_success() => return base,
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "GET {} did not return 200 within 5s; last error: {:?}",
        base, last_err
    );
}

#[tokio::test]
async fn gateway_health_reports_running_and_queue_depth() {
    let base = start_gateway().await;
    let json: serde_json::Value = reqwest::get(&base).await.unwrap().json().await.unwrap();
    assert_eq!(json.get("runtime").and_then(|v| v.as_str()), Some("running"));
    assert_eq!(json["queue"]["ready"].as_u64(), Some(0));
    assert_eq!(json["queue"]["failed"].as_u64(), Some(0));
}

#[tokio::test]
async fn webhook_verification_echoes_the_challenge() {
    let base = start_gateway().await;
    let client = reqwest::Client::new();

    let ok = client
        .get(format!("{}webhook", base))
        .query(&[
            ("hub.mode", "subscribe"),
            ("hub.verify_token", VERIFY_TOKEN),
            ("hub.challenge", "1158201444"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), reqwest::StatusCode::OK);
    assert_eq!(ok.text().await.unwrap(), "1158201444");

    let refused = client
        .get(format!("{}webhook", base))
        .query(&[
            ("hub.mode", "subscribe"),
            ("hub.verify_token", "wrong"),
            ("hub.challenge", "1158201444"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status(), reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn webhook_enqueues_only_correctly_signed_payloads() {
    let base = start_gateway().await;
    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "entry": [{ "changes": [{ "field": "messages", "value": {
            "metadata": { "phone_number_id": "PN1" },
            "messages": [{ "from": "u1", "id": "wamid.1", "type": "text", "text": { "body": "Hello" } }]
        }}]}]
    })
    .to_string();

    let forged = client
        .post(format!("{}webhook", base))
        .header("X-Hub-Signature-256", "sha256=deadbeef")
        .header("Content-Type", "application/json")
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(forged.status(), reqwest::StatusCode::OK);
    assert_eq!(queued_jobs(&client, &base).await, 0);

    let signed = client
        .post(format!("{}webhook", base))
        .header("X-Hub-Signature-256", sign(body.as_bytes()))
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(signed.status(), reqwest::StatusCode::OK);
    // No assistant is reachable here, so the job stays in the queue awaiting a retry.
    assert_eq!(queued_jobs(&client, &base).await, 1);

    let junk = client
        .post(format!("{}webhook", base))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(junk.status(), reqwest::StatusCode::OK);
}
