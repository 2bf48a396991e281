//! HTTP-boundary tests: spawn the real `plugin-server` binary (which in turn
//! spawns `plugin-worker` child processes) against a fixture plugin module
//! and drive it with `reqwest`. Grounded on the teacher's
//! `hyperlight-js-runtime/tests/native_cli.rs` pattern of building a sibling
//! binary once with `escargot` and driving it as a subprocess, extended here
//! to also assert on the HTTP responses it serves.

use std::fs::write;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tempfile::tempdir;

fn built_binary(bin: &str) -> PathBuf {
    escargot::CargoBuild::new()
        .manifest_path(env!("CARGO_MANIFEST_PATH"))
        .bin(bin)
        .package(bin)
        .current_release()
        .current_target()
        .run()
        .unwrap_or_else(|e| panic!("failed to build {bin}: {e}"))
        .path()
        .to_path_buf()
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

struct ServerGuard(Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_server(server_bin: &PathBuf, module: &std::path::Path, port: u16) -> ServerGuard {
    let child = Command::new(server_bin)
        .arg("--port")
        .arg(port.to_string())
        .arg(module)
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("failed to spawn plugin-server");
    ServerGuard(child)
}

async fn wait_until_ready(client: &reqwest::Client, base: &str) {
    for _ in 0..100 {
        if let Ok(resp) = client.get(format!("{base}/status")).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("plugin-server never reported OK status");
}

#[tokio::test]
async fn status_and_invoke_round_trip_over_http() {
    // Ensure plugin-worker is built into the same target directory the
    // plugin-server binary will look for it in, alongside its own exe.
    let worker_bin = built_binary("plugin-worker");
    let server_bin = built_binary("plugin-server");
    assert_eq!(
        worker_bin.parent(),
        server_bin.parent(),
        "plugin-worker and plugin-server must land in the same target dir"
    );

    let dir = tempdir().unwrap();
    let module = dir.path().join("index.js");
    write(
        &module,
        r#"
            export function handler(event) {
                return { doubled: event.n * 2 };
            }
        "#,
    )
    .unwrap();

    let port = free_port();
    let _server = spawn_server(&server_bin, &module, port);
    let base = format!("http://127.0.0.1:{port}");
    let client = reqwest::Client::new();

    wait_until_ready(&client, &base).await;

    let status: serde_json::Value = client
        .get(format!("{base}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "OK");

    let response = client
        .post(format!("{base}/invoke/handler"))
        .json(&serde_json::json!({"n": 5}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "OK");
    assert_eq!(body["result"]["doubled"], 10);
}

#[tokio::test]
async fn invoking_an_unexported_function_returns_not_found() {
    let worker_bin = built_binary("plugin-worker");
    let server_bin = built_binary("plugin-server");
    let _ = worker_bin;

    let dir = tempdir().unwrap();
    let module = dir.path().join("index.js");
    write(
        &module,
        r#"
            export function handler(event) {
                return event;
            }
        "#,
    )
    .unwrap();

    let port = free_port();
    let _server = spawn_server(&server_bin, &module, port);
    let base = format!("http://127.0.0.1:{port}");
    let client = reqwest::Client::new();

    wait_until_ready(&client, &base).await;

    let response = client
        .post(format!("{base}/invoke/missing"))
        .json(&serde_json::json!(null))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
