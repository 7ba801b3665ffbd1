use std::time::Duration;

use super::*;
use crate::{
    test_support::{FakeServices, KMS_CLUSTER},
    transport::{HttpMethod, StaticTokenAuthenticator},
};
use kms::cipher;
use serde_json::json;
use tokio::time::timeout;

fn settings() -> ClientSettings {
    ClientSettings {
        device_url: "https://devices/d1".to_string(),
        ..ClientSettings::default()
    }
}

/// Client wired to fake services, with KMS replies routed back through the
/// push entry point.
fn start() -> (ActivityClient, Arc<FakeServices>) {
    let (services, mut push) = FakeServices::new();
    let client = ActivityClient::new(
        settings(),
        services.clone(),
        Arc::new(StaticTokenAuthenticator::new("token")),
    );
    let forward = client.clone();
    tokio::spawn(async move {
        while let Some(raw) = push.recv().await {
            let _ = forward.receive_push_event(&raw).await;
        }
    });
    (client, services)
}

fn r1() -> ConversationId {
    ConversationId::new("R1")
}

async fn next_event(events: &mut broadcast::Receiver<ActivityEvent>) -> ActivityEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("event")
}

#[tokio::test]
async fn post_sends_ciphertext_and_returns_plaintext() {
    let (client, services) = start();

    let echo = client.post(&r1(), "hello", Vec::new(), Vec::new()).await.expect("post");
    assert_eq!(echo.text.as_deref(), Some("hello"));

    let key_url = format!("{KMS_CLUSTER}/keys/R1");
    let posted = services.posted();
    assert_eq!(posted[0]["encryptionKeyUrl"], key_url.as_str());
    let key = services.content_key(&key_url);
    let wire = posted[0]["text"].as_str().expect("text");
    assert_eq!(cipher::open_str(&key, wire).expect("opens"), "hello");

    assert_eq!(client.key_state(&r1()).await.expect("state"), KeyState::KeyAvailable);
    assert_eq!(client.readiness(&r1()).await.expect("readiness"), Readiness::PostOnly);
}

#[tokio::test]
async fn mentions_are_posted_in_the_clear() {
    let (client, services) = start();

    let mentions = vec![Mention::person("u2"), Mention::all()];
    let echo = client.post(&r1(), "look here", mentions.clone(), Vec::new()).await.expect("post");
    assert_eq!(echo.mention_items(), mentions.as_slice());

    let posted = services.posted();
    assert_eq!(posted[0]["mentions"]["items"][0]["id"], "u2");
    assert_eq!(posted[0]["mentions"]["items"][0]["objectType"], "person");
    assert_eq!(posted[0]["mentions"]["items"][1]["objectType"], "groupMention");
    assert_ne!(posted[0]["text"], "look here");
}

#[tokio::test]
async fn concurrent_cold_posts_share_one_bootstrap_and_keep_order() {
    let (client, services) = start();

    let r1 = r1();
    let r2 = ConversationId::new("R2");
    let (first, second, other) = tokio::join!(
        client.post(&r1, "first", Vec::new(), Vec::new()),
        client.post(&r1, "second", Vec::new(), Vec::new()),
        client.post(&r2, "elsewhere", Vec::new(), Vec::new()),
    );
    first.expect("first");
    second.expect("second");
    other.expect("other");

    assert_eq!(services.request_count(HttpMethod::Get, "users"), 1);
    assert_eq!(services.request_count(HttpMethod::Get, "kms"), 1);
    assert_eq!(services.request_count(HttpMethod::Get, "conversations/R1"), 1);

    let key = services.content_key(&format!("{KMS_CLUSTER}/keys/R1"));
    let r1_texts: Vec<_> = services
        .posted()
        .iter()
        .filter(|item| item["conversationId"] == "R1")
        .map(|item| cipher::open_str(&key, item["text"].as_str().unwrap_or_default()).expect("opens"))
        .collect();
    assert_eq!(r1_texts, vec!["first", "second"]);
}

#[tokio::test]
async fn share_allocates_space_and_file_round_trips() {
    let (client, services) = start();
    let file = OutgoingFile::new("notes.txt", b"secret notes".to_vec()).with_mime_type("text/plain");

    let echo = client.post(&r1(), "see attached", Vec::new(), vec![file]).await.expect("share");
    assert_eq!(
        services.request_count(HttpMethod::Put, "conversations/R1/space"),
        1
    );
    assert_eq!(client.readiness(&r1()).await.expect("readiness"), Readiness::PostAndShare);

    let shared = &echo.files[0];
    assert_eq!(shared.display_name, "notes.txt");
    let body = client.download_file_body(&r1(), shared).await.expect("download");
    assert_eq!(body, b"secret notes".to_vec());
    assert_eq!(
        client.download_thumbnail(&r1(), shared).await.expect("thumbnail"),
        None
    );
}

#[tokio::test(start_paused = true)]
async fn ephemeral_key_timeout_fails_pending_posts() {
    let (client, services) = start();
    services.hold_kms(true);

    let err = client.post(&r1(), "stuck", Vec::new(), Vec::new()).await.expect_err("timeout");
    assert_eq!(err, ActivityError::EphemeralKeyFetchFailed);

    // The late reply is ignored.
    services.release_kms();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.key_state(&r1()).await.expect("state"), KeyState::LocationKnown);
    assert!(services.posted().is_empty());

    services.hold_kms(false);
    client.post(&r1(), "retry", Vec::new(), Vec::new()).await.expect("second handshake");
    assert_eq!(services.posted().len(), 1);
}

#[tokio::test]
async fn conversation_without_key_url_is_rejected() {
    let (client, services) = start();
    services.set_key_url("R1", None);

    let err = client.post(&r1(), "hi", Vec::new(), Vec::new()).await.expect_err("no key url");
    assert!(matches!(err, ActivityError::EncryptionLocationFetchFailed { .. }));
}

#[tokio::test]
async fn identity_failure_is_reported() {
    let (client, services) = start();
    services.fail_path("users");

    let err = client.post(&r1(), "hi", Vec::new(), Vec::new()).await.expect_err("no identity");
    assert_eq!(err, ActivityError::ClientIdentityFetchFailed);
}

#[tokio::test]
async fn pushed_activity_is_decrypted_once_key_arrives() {
    let (client, services) = start();
    let mut events = client.subscribe_events();
    let key_url = format!("{KMS_CLUSTER}/keys/R1");
    let key = services.content_key(&key_url);

    let broken = json!({
        "eventType": "conversation.activity",
        "activity": {
            "id": "A1",
            "conversationId": "R1",
            "verb": "post",
            "text": "not ciphertext",
            "encryptionKeyUrl": key_url,
        }
    });
    let good = json!({
        "eventType": "conversation.activity",
        "activity": {
            "id": "A2",
            "conversationId": "R1",
            "verb": "post",
            "text": cipher::seal_str(&key, "hi there").expect("seal"),
            "encryptionKeyUrl": key_url,
        }
    });
    client.receive_push_event(&broken.to_string()).await.expect("push");
    client.receive_push_event(&good.to_string()).await.expect("push");

    assert!(matches!(
        next_event(&mut events).await,
        ActivityEvent::Error(ActivityError::CryptoTransformFailed { .. })
    ));
    match next_event(&mut events).await {
        ActivityEvent::Message(activity) => {
            assert_eq!(activity.id, Some(ActivityId::new("A2")));
            assert_eq!(activity.text.as_deref(), Some("hi there"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn typing_and_flag_push_events_are_forwarded() {
    let (client, _services) = start();
    let mut events = client.subscribe_events();

    client
        .receive_push_event(r#"{"eventType":"status.start_typing","conversationId":"R1","actorId":"u2"}"#)
        .await
        .expect("typing");
    client
        .receive_push_event(r#"{"eventType":"flag.update","flag":{"id":"F1","flag-item":"https://conv/activities/A1","state":"flagged"}}"#)
        .await
        .expect("flag");

    match next_event(&mut events).await {
        ActivityEvent::Typing(typing) => {
            assert_eq!(typing.conversation_id, r1());
            assert_eq!(typing.actor_id.as_deref(), Some("u2"));
            assert!(typing.is_typing);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        ActivityEvent::Flag(FlagActivity { ref state, .. }) if state == "flagged"
    ));

    let err = client.receive_push_event("{not json").await.expect_err("invalid");
    assert!(matches!(err, ActivityError::InvalidResponse(_)));
}

#[tokio::test]
async fn list_and_get_decrypt_with_known_keys() {
    let (client, _services) = start();
    let echo = client.post(&r1(), "remember me", Vec::new(), Vec::new()).await.expect("post");

    let listed = client
        .list(&ListActivitiesQuery::for_conversation(r1()))
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].text.as_deref(), Some("remember me"));

    let id = echo.id.expect("echo id");
    let fetched = client.get(&id).await.expect("get");
    assert_eq!(fetched.text.as_deref(), Some("remember me"));
}

#[tokio::test]
async fn delete_read_typing_and_flags_go_straight_to_services() {
    let (client, services) = start();
    let target = ActivityId::new("A9");

    let deleted = client.delete(&r1(), &target).await.expect("delete");
    assert_eq!(deleted.verb, ActivityVerb::Delete);
    client.read(&r1(), &target).await.expect("read");
    client.start_typing(&r1()).await.expect("start typing");
    client.stop_typing(&r1()).await.expect("stop typing");
    let flag = client.flag("https://conv/activities/A9").await.expect("flag");
    assert_eq!(flag.state, "flagged");
    client.unflag("F1").await.expect("unflag");

    let verbs: Vec<_> = services
        .posted()
        .iter()
        .map(|item| item["verb"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(verbs, vec!["delete", "acknowledge"]);
    assert_eq!(services.request_count(HttpMethod::Post, "status/typing"), 2);
    assert_eq!(services.request_count(HttpMethod::Delete, "flags/F1"), 1);
    // None of these needed key material.
    assert_eq!(services.request_count(HttpMethod::Get, "users"), 0);
}

#[tokio::test]
async fn download_without_key_fails() {
    let (client, _services) = start();
    let file = FileRef {
        display_name: "a".to_string(),
        source_uri: "https://files/a".to_string(),
        mime_type: None,
        file_size: None,
        thumbnail: None,
    };
    let err = client.download_file(&r1(), &file).await.expect_err("no key");
    assert!(matches!(err, ActivityError::MissingKeyMaterial { .. }));
}

#[tokio::test]
async fn client_handles_share_one_engine() {
    let (client, services) = start();
    let other = client.clone();
    client.post(&r1(), "one", Vec::new(), Vec::new()).await.expect("post");
    other.post(&r1(), "two", Vec::new(), Vec::new()).await.expect("post");
    assert_eq!(services.request_count(HttpMethod::Get, "users"), 1);
    assert!(services
        .requests()
        .iter()
        .any(|(method, path)| *method == HttpMethod::Post && path.ends_with("/kms/messages")));
}
