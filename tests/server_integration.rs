//! HTTP and WebSocket behaviour of a running server

mod common;

use common::{eventually, fake_clone, TestServer, SAMPLE_REPO};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::io::{Cursor, Write};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[tokio::test]
async fn test_config_and_health() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let config: Value = client
        .get(server.url("/config"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(config["API_URL"], format!("http://{}", server.addr));

    let health: Value = client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, json!({ "status": "ok", "sessions": 0 }));

    server.stop().await;
}

#[tokio::test]
async fn test_analyze_requires_session_header() {
    let server = TestServer::start().await;

    let response = reqwest::Client::new()
        .post(server.url("/analyze"))
        .json(&json!({ "repo_url": "https://example.com/a/b" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("x-session-id"));

    server.stop().await;
}

#[tokio::test]
async fn test_analyze_and_export() {
    let server = TestServer::start().await;
    fake_clone(&server.mock, SAMPLE_REPO);
    let client = reqwest::Client::new();

    let analysis: Value = client
        .post(server.url("/analyze"))
        .header("x-session-id", "sess-1")
        .json(&json!({ "repo_url": "https://github.com/acme/sample.git" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(analysis["repo_name"], "sample");
    assert_eq!(analysis["extensions"], json!([".md", ".rs", ".toml"]));
    assert_eq!(analysis["dirs"], json!(["docs", "src"]));
    assert_eq!(analysis["dirs_tree"]["type"], "directory");

    let text: Value = client
        .post(server.url("/export/text"))
        .header("x-session-id", "sess-1")
        .json(&json!({ "repo_name": "sample", "exts": [".rs"], "dirs": ["src"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(text["export_file"], "sample_export.md");
    let content = text["content"].as_str().unwrap();
    assert!(content.contains("### `src/main.rs`"));
    assert!(!content.contains("### `docs/guide.md`"));

    let file = client
        .post(server.url("/export/file"))
        .header("x-session-id", "sess-1")
        .json(&json!({ "repo_name": "sample", "exts": [], "dirs": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(file.status(), 200);
    assert_eq!(
        file.headers()["content-disposition"],
        "attachment; filename=\"sample_export.md\""
    );
    assert!(file.text().await.unwrap().contains("### `docs/guide.md`"));

    server.stop().await;
}

#[tokio::test]
async fn test_export_not_found_cases() {
    let server = TestServer::start().await;
    fake_clone(&server.mock, SAMPLE_REPO);
    let client = reqwest::Client::new();

    let unknown_session = client
        .post(server.url("/export/text"))
        .header("x-session-id", "nobody")
        .json(&json!({ "repo_name": "sample", "exts": [], "dirs": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_session.status(), 404);

    client
        .post(server.url("/analyze"))
        .header("x-session-id", "s")
        .json(&json!({ "repo_url": "https://github.com/acme/sample" }))
        .send()
        .await
        .unwrap();
    let nothing = client
        .post(server.url("/export/text"))
        .header("x-session-id", "s")
        .json(&json!({ "repo_name": "sample", "exts": [".java"], "dirs": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(nothing.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn test_clone_failure_is_bad_request() {
    let server = TestServer::start().await;
    server
        .mock
        .expect_command("git")
        .returns_exit_code(128)
        .returns_stderr("fatal: repository not found")
        .finish();

    let response = reqwest::Client::new()
        .post(server.url("/analyze"))
        .header("x-session-id", "s")
        .json(&json!({ "repo_url": "https://github.com/acme/missing" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .contains("repository not found"));

    server.stop().await;
}

#[tokio::test]
async fn test_hostile_session_header_rejected() {
    let server = TestServer::start().await;

    let response = reqwest::Client::new()
        .post(server.url("/analyze"))
        .header("x-session-id", "../../etc")
        .json(&json!({ "repo_url": "https://github.com/acme/sample" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert!(server.mock.get_call_history().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_archive_upload() {
    let server = TestServer::start().await;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer.add_directory("site/", options).unwrap();
    writer.start_file("site/index.html", options).unwrap();
    writer.write_all(b"<h1>hi</h1>").unwrap();
    let bytes = writer.finish().unwrap().into_inner();

    let analysis: Value = reqwest::Client::new()
        .post(server.url("/analyze/archive?file_name=site.zip"))
        .header("x-session-id", "up")
        .body(bytes)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(analysis["repo_name"], "site");
    assert_eq!(analysis["extensions"], json!([".html"]));

    let garbage = reqwest::Client::new()
        .post(server.url("/analyze/archive"))
        .header("x-session-id", "up")
        .body("definitely not a zip")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), 400);

    server.stop().await;
}

#[tokio::test]
async fn test_websocket_ping_and_disconnect() {
    let server = TestServer::start().await;
    fake_clone(&server.mock, SAMPLE_REPO);

    let (mut socket, _) = connect_async(server.ws_url("live")).await.unwrap();
    socket.send(Message::Text("ping".into())).await.unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    assert_eq!(reply.into_text().unwrap().as_str(), "pong");
    assert!(server.manager.store().contains("live").await);

    let client = reqwest::Client::new();
    let analyzed = client
        .post(server.url("/analyze"))
        .header("x-session-id", "live")
        .json(&json!({ "repo_url": "https://github.com/acme/sample" }))
        .send()
        .await
        .unwrap();
    assert_eq!(analyzed.status(), 200);
    let workspace = server.manager.sandbox().resolve("live").unwrap();
    assert!(workspace.join("sample").is_dir());

    socket
        .send(Message::Text("disconnect".into()))
        .await
        .unwrap();
    assert!(
        eventually(|| async { !server.manager.store().contains("live").await }).await
    );
    assert!(eventually(|| async { !workspace.exists() }).await);

    // A later analyze recreates the session with a fresh workspace
    let again = client
        .post(server.url("/analyze"))
        .header("x-session-id", "live")
        .json(&json!({ "repo_url": "https://github.com/acme/sample" }))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 200);
    assert!(server.manager.store().contains("live").await);
    assert!(workspace.join("sample/src/main.rs").is_file());

    server.stop().await;
}

#[tokio::test]
async fn test_websocket_close_tears_down() {
    let server = TestServer::start().await;

    let (mut socket, _) = connect_async(server.ws_url("closer")).await.unwrap();
    assert!(eventually(|| async { server.manager.store().contains("closer").await }).await);
    server.manager.sandbox().ensure("closer").unwrap();

    socket.close(None).await.unwrap();
    drop(socket);

    assert!(
        eventually(|| async { !server.manager.store().contains("closer").await }).await
    );
    let workspace = server.manager.sandbox().resolve("closer").unwrap();
    assert!(eventually(|| async { !workspace.exists() }).await);

    server.stop().await;
}

#[tokio::test]
async fn test_websocket_rejects_hostile_id() {
    let server = TestServer::start().await;
    assert!(connect_async(server.ws_url("..")).await.is_err());
    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_survives_close_of_older_socket() {
    let server = TestServer::start().await;

    let (mut old, _) = connect_async(server.ws_url("tab")).await.unwrap();
    let (mut new, _) = connect_async(server.ws_url("tab")).await.unwrap();
    let workspace = server.manager.sandbox().ensure("tab").unwrap();

    old.close(None).await.unwrap();
    while old.next().await.is_some() {}
    drop(old);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The newer socket still answers and its session stays
    new.send(Message::Text("ping".into())).await.unwrap();
    let reply = new.next().await.unwrap().unwrap();
    assert_eq!(reply.into_text().unwrap().as_str(), "pong");
    assert!(server.manager.store().contains("tab").await);
    assert!(workspace.is_dir());

    new.close(None).await.unwrap();
    drop(new);
    assert!(eventually(|| async { !server.manager.store().contains("tab").await }).await);
    assert!(eventually(|| async { !workspace.exists() }).await);

    server.stop().await;
}
