//! Both protocol surfaces driven end to end over one shared registry.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::Engine;
use clap::Parser;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tower::ServiceExt;

use sbx_server::config::ServerConfig;
use sbx_server::http::router;
use sbx_server::rpc::RpcServer;
use sbx_server::state::AppState;
use sbx_workspaces::copydir::CopyProvider;
use sbx_workspaces::{StoreLayout, WorkspaceStore};

fn test_state() -> (TempDir, AppState) {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig::parse_from(["sbx-server"]);
    let store = Arc::new(
        WorkspaceStore::with_provider(
            StoreLayout::under(dir.path()),
            Box::new(CopyProvider::new()),
        )
        .unwrap(),
    );
    let state = AppState::new(&config, store);
    (dir, state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Value) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn get(app: &Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn create_session(app: &Router) -> String {
    let response = send_json(app, "POST", "/sessions", json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["session_id"].as_str().unwrap().to_string()
}

async fn exec(app: &Router, id: &str, script: &str, extra: Value) -> Value {
    let mut body = json!({"command": ["/bin/sh", "-c", script]});
    if let (Some(obj), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    let response = send_json(app, "POST", &format!("/sessions/{}/exec", id), body).await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn health_reports_session_count() {
    let (_dir, state) = test_state();
    let app = router(state);

    let response = get(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 0);

    create_session(&app).await;
    let body = body_json(get(&app, "/health").await).await;
    assert_eq!(body["active_sessions"], 1);
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let (_dir, state) = test_state();
    let app = router(state);
    let id = create_session(&app).await;

    let result = exec(&app, &id, "echo hi", json!({"time_ms": 5000})).await;
    assert_eq!(result["stdout"], "hi\n");
    assert_eq!(result["exit_code"], 0);

    let response = send_json(
        &app,
        "POST",
        &format!("/sessions/{}/env", id),
        json!({"env": {"FOO": "bar"}}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let result = exec(&app, &id, "echo $FOO", json!({})).await;
    assert_eq!(result["stdout"], "bar\n");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/sessions/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // destroyed sessions reject work
    let response = send_json(
        &app,
        "POST",
        &format!("/sessions/{}/exec", id),
        json!({"command": ["/bin/sh", "-c", "echo nope"]}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "SessionNotFound");
}

#[tokio::test]
async fn http_exec_flattens_signal_deaths() {
    let (_dir, state) = test_state();
    let app = router(state);
    let id = create_session(&app).await;

    let result = exec(&app, &id, "sleep 10", json!({"time_ms": 200})).await;
    let exit_code = result["exit_code"].as_i64().unwrap();
    assert!(exit_code > 128, "expected 128+signal, got {}", exit_code);
}

#[tokio::test]
async fn cwd_escape_is_rejected_with_path_escape() {
    let (_dir, state) = test_state();
    let app = router(state);
    let id = create_session(&app).await;

    let response = send_json(
        &app,
        "POST",
        &format!("/sessions/{}/exec", id),
        json!({"command": ["/bin/sh", "-c", "id"], "cwd": "/etc"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "PathEscape");
}

#[tokio::test]
async fn invalid_snapshot_names_are_bad_requests() {
    let (_dir, state) = test_state();
    let app = router(state);
    let id = create_session(&app).await;

    let response = send_json(
        &app,
        "POST",
        &format!("/sessions/{}/snapshots", id),
        json!({"name": "no/slashes"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["kind"], "InvalidArgument");
}

#[tokio::test]
async fn snapshot_export_download_import_flow() {
    let (_dir, state) = test_state();
    let app = router(state);
    let id = create_session(&app).await;

    exec(&app, &id, "printf %s world > hello.txt", json!({})).await;
    let response = send_json(
        &app,
        "POST",
        &format!("/sessions/{}/snapshots", id),
        json!({"name": "s1"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let listing = body_json(get(&app, &format!("/sessions/{}/snapshots", id)).await).await;
    assert_eq!(listing["snapshots"][0]["name"], "s1");

    // mutate, restore, verify
    exec(&app, &id, "printf %s changed > hello.txt", json!({})).await;
    let response = send_json(
        &app,
        "POST",
        &format!("/sessions/{}/snapshots/s1/restore", id),
        json!({}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let result = exec(&app, &id, "cat hello.txt", json!({})).await;
    assert_eq!(result["stdout"], "world");

    // export and download
    let response = send_json(
        &app,
        "POST",
        &format!("/sessions/{}/snapshots/s1/export", id),
        json!({}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let manifest = body_json(response).await;
    let archive_name = manifest["name"].as_str().unwrap().to_string();
    assert_eq!(manifest["sha256"].as_str().unwrap().len(), 64);
    assert!(manifest["size_bytes"].as_u64().unwrap() > 0);

    let response = get(&app, &format!("/sessions/{}/exports/{}", id, archive_name)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/gzip"
    );
    let archive_bytes =
        axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(!archive_bytes.is_empty());

    // exports are deleted after download
    let response = get(&app, &format!("/sessions/{}/exports/{}", id, archive_name)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // import into a second session
    let other = create_session(&app).await;
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/sessions/{}/snapshots/imported", other))
                .header("content-type", "application/gzip")
                .body(Body::from(archive_bytes))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = send_json(
        &app,
        "POST",
        &format!("/sessions/{}/snapshots/imported/restore", other),
        json!({}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let result = exec(&app, &other, "cat hello.txt", json!({})).await;
    assert_eq!(result["stdout"], "world");
}

struct RpcClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RpcClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn call(&mut self, request: Value) -> Value {
        let mut line = request.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
        let response = self.lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&response).unwrap()
    }
}

#[tokio::test]
async fn rpc_hot_path_shares_the_registry_with_http() {
    let (_dir, state) = test_state();
    let app = router(state.clone());
    let rpc = RpcServer::bind("127.0.0.1:0".parse().unwrap(), state)
        .await
        .unwrap();
    let addr = rpc.local_addr().unwrap();
    tokio::spawn(rpc.run());

    // session created over HTTP is visible over RPC
    let id = create_session(&app).await;
    let mut client = RpcClient::connect(addr).await;

    let pong = client.call(json!({"op": "ping"})).await;
    assert_eq!(pong["type"], "pong");

    let result = client
        .call(json!({
            "op": "run_command",
            "session_id": id,
            "command": ["/bin/sh", "-c", "echo hi"],
            "time_ms": 5000
        }))
        .await;
    assert_eq!(result["type"], "command");
    assert_eq!(result["stdout"], "hi\n");
    assert_eq!(result["exit_code"], 0);
    assert_eq!(result["signal"], 0);

    let content = base64::engine::general_purpose::STANDARD.encode(b"from rpc");
    let result = client
        .call(json!({
            "op": "write_file",
            "session_id": id,
            "path": "/note.txt",
            "content": content
        }))
        .await;
    assert_eq!(result["type"], "file_written");

    let result = client
        .call(json!({"op": "read_file", "session_id": id, "path": "/note.txt"}))
        .await;
    assert_eq!(result["type"], "file_content");
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(result["content"].as_str().unwrap())
        .unwrap();
    assert_eq!(bytes, b"from rpc");

    let result = client
        .call(json!({"op": "list_dir", "session_id": id, "path": "/"}))
        .await;
    assert_eq!(result["type"], "dir_listing");
    assert_eq!(result["entries"][0]["name"], "note.txt");
    assert_eq!(result["entries"][0]["type"], "file");

    let result = client
        .call(json!({"op": "set_env", "session_id": id, "env": {"FOO": "rpc"}}))
        .await;
    assert_eq!(result["type"], "env_set");
    let result = client
        .call(json!({
            "op": "run_command",
            "session_id": id,
            "command": ["/bin/sh", "-c", "echo $FOO"]
        }))
        .await;
    assert_eq!(result["stdout"], "rpc\n");

    // traversal is rejected without touching anything
    let result = client
        .call(json!({"op": "read_file", "session_id": id, "path": "../../etc/passwd"}))
        .await;
    assert_eq!(result["type"], "error");
    assert_eq!(result["kind"], "PathEscape");

    // unknown sessions surface the right kind
    let result = client
        .call(json!({"op": "read_file", "session_id": "missing", "path": "/x"}))
        .await;
    assert_eq!(result["type"], "error");
    assert_eq!(result["kind"], "SessionNotFound");

    // malformed requests do not kill the connection
    let mut line = String::from("{\"op\": \"nonsense\"}\n");
    client.writer.write_all(line.as_bytes()).await.unwrap();
    line = client.lines.next_line().await.unwrap().unwrap();
    let result: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(result["type"], "error");
    assert_eq!(result["kind"], "InvalidArgument");

    let pong = client.call(json!({"op": "ping"})).await;
    assert_eq!(pong["type"], "pong");
}
