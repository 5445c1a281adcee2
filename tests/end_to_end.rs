//! ClipBus end to end over a mock push relay, with and without content
//! encryption

use std::time::Duration;

use clipshift::config::{BackendConfig, EncryptionConfig, PushRelayConfig};
use clipshift::encryption::{CipherMode, ContentCipher};
use clipshift::transport::ConnectionState;
use clipshift::{Clip, ClipBus};
use mockito::{Matcher, Server};
use pretty_assertions::assert_eq;
use tokio::time::timeout;

fn backend(host: String, key: Option<&str>) -> BackendConfig {
    BackendConfig::PushRelay(PushRelayConfig {
        client_id: "dev1".to_string(),
        host,
        topic: "t1".to_string(),
        user: None,
        pass: None,
        encryption: EncryptionConfig {
            key: key.map(str::to_string),
            mode: CipherMode::FixedIv,
        },
    })
}

fn event_stream(messages: &[(&str, &str)]) -> String {
    let mut body = String::from("retry: 60000\n\n");
    for (title, message) in messages {
        let json = serde_json::json!({
            "event": "message",
            "topic": "t1",
            "title": title,
            "message": message,
        });
        body.push_str(&format!("data: {}\n\n", json));
    }
    body
}

async fn next_clip(bus: &mut ClipBus) -> Clip {
    loop {
        let clip = timeout(Duration::from_secs(5), bus.process_next())
            .await
            .expect("no clip arrived");
        if let Some(clip) = clip {
            return clip;
        }
    }
}

#[tokio::test]
async fn test_plain_round_trip() {
    let mut server = Server::new_async().await;
    let publish = server
        .mock("POST", "/t1")
        .match_header("title", "dev1")
        .match_body("ping")
        .create_async()
        .await;
    let _stream = server
        .mock("GET", "/t1/sse")
        .with_header("content-type", "text/event-stream")
        .with_body(event_stream(&[("dev1", "echo"), ("dev2", "pong")]))
        .create_async()
        .await;

    let mut bus = ClipBus::new();
    let mut clips = bus.subscribe();
    bus.set_config(backend(server.url(), None)).await.unwrap();

    bus.send("ping").await.unwrap();
    publish.assert_async().await;

    let clip = next_clip(&mut bus).await;
    assert_eq!((clip.client.as_str(), clip.contents.as_str()), ("dev2", "pong"));
    assert_eq!(clips.recv().await.unwrap(), clip);
    assert_eq!(bus.history(), vec![clip]);
    assert!(bus.drain().is_empty());

    bus.shutdown().await;
    assert_eq!(bus.connection_state(), None);
}

#[tokio::test]
async fn test_encrypted_round_trip() {
    let cipher = ContentCipher::from_passphrase("secret", CipherMode::FixedIv);
    let incoming = cipher.encrypt("pong");

    let mut server = Server::new_async().await;
    let publish = server
        .mock("POST", "/t1")
        .match_body(Matcher::Exact(cipher.encrypt("hello")))
        .create_async()
        .await;
    let _stream = server
        .mock("GET", "/t1/sse")
        .with_header("content-type", "text/event-stream")
        .with_body(event_stream(&[("dev2", "garbage"), ("dev2", &incoming)]))
        .create_async()
        .await;

    let mut bus = ClipBus::new();
    bus.set_config(backend(server.url(), Some("secret"))).await.unwrap();
    assert!(bus.is_encrypted());

    bus.send("hello").await.unwrap();
    publish.assert_async().await;

    // What went over the wire is not the plaintext but decrypts back to it
    let wire = cipher.encrypt("hello");
    assert_ne!(wire, "hello");
    assert_eq!(cipher.decrypt(&wire), "hello");

    // The undecryptable clip is skipped, the real one is recorded
    let clip = next_clip(&mut bus).await;
    assert_eq!(clip.contents, "pong");
    assert_eq!(bus.history().len(), 1);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_switching_backends_closes_previous_subscription() {
    let mut first = Server::new_async().await;
    let _first_stream = first
        .mock("GET", "/t1/sse")
        .with_body(event_stream(&[]))
        .create_async()
        .await;
    let mut second = Server::new_async().await;
    let second_publish = second.mock("POST", "/t1").create_async().await;
    let _second_stream = second
        .mock("GET", "/t1/sse")
        .with_body(event_stream(&[]))
        .create_async()
        .await;

    let mut bus = ClipBus::new();
    bus.set_config(backend(first.url(), None)).await.unwrap();
    bus.set_config(backend(second.url(), None)).await.unwrap();

    bus.send("moved").await.unwrap();
    second_publish.assert_async().await;
    assert_ne!(bus.connection_state(), Some(ConnectionState::Closed));

    bus.set_config(BackendConfig::None).await.unwrap();
    assert_eq!(bus.connection_state(), None);
    bus.send("dropped").await.unwrap();
}
