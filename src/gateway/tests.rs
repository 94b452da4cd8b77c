use super::api::{TelegramApi, Update};
use super::*;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway_config(allowed: Vec<i64>) -> GatewayConfig {
    GatewayConfig {
        enabled: true,
        bot_token: "123:ABC".into(),
        allowed_chat_ids: allowed,
        ..GatewayConfig::default()
    }
}

fn update(chat_id: i64, text: Option<&str>) -> Update {
    Update {
        update_id: 1,
        chat_id,
        text: text.map(ToString::to_string),
    }
}

// ─── Whitelist gate ─────────────────────────────────────────────────────────

#[test]
fn whitelisted_chat_is_accepted() {
    let config = gateway_config(vec![123]);
    let accepted = accept(&config, &update(123, Some("hello")));
    assert_eq!(accepted, Some((123, "hello".to_string())));
}

#[test]
fn non_whitelisted_chat_is_rejected_silently() {
    // Chat 999 is not in allowed_chat_ids=[123]: no dispatch, no reply.
    let config = gateway_config(vec![123]);
    assert!(accept(&config, &update(999, Some("hello"))).is_none());
}

#[test]
fn group_chats_use_negative_ids() {
    let config = gateway_config(vec![-1001234]);
    assert!(accept(&config, &update(-1001234, Some("hi"))).is_some());
    assert!(accept(&config, &update(1001234, Some("hi"))).is_none());
}

#[test]
fn disabled_gateway_rejects_everything() {
    let mut config = gateway_config(vec![123]);
    config.enabled = false;
    assert!(accept(&config, &update(123, Some("hello"))).is_none());
}

#[test]
fn missing_token_rejects_everything() {
    let mut config = gateway_config(vec![123]);
    config.bot_token = String::new();
    assert!(accept(&config, &update(123, Some("hello"))).is_none());
}

#[test]
fn non_text_messages_are_skipped() {
    let config = gateway_config(vec![123]);
    assert!(accept(&config, &update(123, None)).is_none());
}

// ─── Listener construction ──────────────────────────────────────────────────

#[test]
fn listener_requires_available_gateway() {
    use crate::config::{Config, Defaults};
    use crate::executor::Executor;
    use crate::output::Router;

    let executor = Arc::new(Executor::new(&Defaults::default()));
    let router = Arc::new(Router::new(&Config::default()));

    let mut config = gateway_config(vec![123]);
    config.bot_token = String::new();
    assert!(GatewayListener::new(config, executor, router).is_err());
}

// ─── Bot API client ─────────────────────────────────────────────────────────

#[tokio::test]
async fn get_updates_parses_messages_and_advances_offset() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/getUpdates"))
        .and(body_partial_json(serde_json::json!({ "offset": 5 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "result": [{
                "update_id": 11,
                "message": { "chat": { "id": 123 }, "text": "ping" }
            }]
        })))
        .mount(&server)
        .await;

    let api = TelegramApi::with_base_url(server.uri());
    let updates = api.get_updates(5, 0).await.unwrap();

    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].update_id, 11);
    assert_eq!(updates[0].chat_id, 123);
    assert_eq!(updates[0].text.as_deref(), Some("ping"));
}

#[tokio::test]
async fn get_updates_surfaces_http_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/getUpdates"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let api = TelegramApi::with_base_url(server.uri());
    assert!(api.get_updates(0, 0).await.is_err());
}

#[tokio::test]
async fn send_message_posts_chat_id_and_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sendMessage"))
        .and(body_partial_json(serde_json::json!({
            "chat_id": -1001,
            "text": "reply"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
        .expect(1)
        .mount(&server)
        .await;

    let api = TelegramApi::with_base_url(server.uri());
    api.send_message(-1001, "reply").await.unwrap();
}

#[tokio::test]
async fn health_check_reflects_get_me() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/getMe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
        .mount(&server)
        .await;

    let api = TelegramApi::with_base_url(server.uri());
    assert!(api.health_check().await);
}
