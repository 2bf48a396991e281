//! End-to-end tests that spawn real `plugin-worker` processes against small
//! fixture plugins. Grounded on the teacher's `native_cli.rs` smoke test:
//! write fixture JS into a tempdir, build the worker binary once with
//! `escargot`, and drive it as a subprocess.

use std::fs::write;
use std::path::PathBuf;
use std::time::Duration;

use plugin_host::PluginHost;
use plugin_protocol::PluginDescriptor;
use tempfile::tempdir;

fn worker_binary() -> PathBuf {
    escargot::CargoBuild::new()
        .manifest_path(env!("CARGO_MANIFEST_PATH"))
        .bin("plugin-worker")
        .package("plugin-worker")
        .current_release()
        .current_target()
        .run()
        .expect("failed to build plugin-worker binary")
        .path()
        .to_path_buf()
}

fn descriptor(entry: &std::path::Path, concurrency: u32) -> PluginDescriptor {
    PluginDescriptor {
        id: "test-plugin".to_string(),
        module: entry.to_string_lossy().to_string(),
        globals: Default::default(),
        concurrency,
    }
}

#[tokio::test]
async fn echoes_the_event_back_through_a_handler() {
    let dir = tempdir().unwrap();
    write(
        dir.path().join("index.js"),
        r#"
            export function handler(event) {
                return { echoed: event };
            }
        "#,
    )
    .unwrap();

    let host = PluginHost::start(descriptor(&dir.path().join("index.js"), 1), worker_binary()).await;

    let result = host
        .invoke("handler", serde_json::json!({"a": 1}), None, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert!(result.ok, "{:?}", result.error);
    assert_eq!(result.value, Some(serde_json::json!({"echoed": {"a": 1}})));

    host.shutdown().await;
}

#[tokio::test]
async fn a_thrown_error_is_reported_as_a_runtime_error() {
    let dir = tempdir().unwrap();
    write(
        dir.path().join("index.js"),
        r#"
            export function handler(event) {
                throw new TypeError("bad event: " + JSON.stringify(event));
            }
        "#,
    )
    .unwrap();

    let host = PluginHost::start(descriptor(&dir.path().join("index.js"), 1), worker_binary()).await;

    let result = host
        .invoke("handler", serde_json::json!(null), None, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert!(!result.ok);
    assert!(matches!(result.error, Some(plugin_protocol::ErrorDetails::Runtime { .. })));

    host.shutdown().await;
}

#[tokio::test]
async fn an_infinite_loop_is_aborted_on_timeout() {
    let dir = tempdir().unwrap();
    write(
        dir.path().join("index.js"),
        r#"
            export function handler(event) {
                while (true) {}
            }
        "#,
    )
    .unwrap();

    let host = PluginHost::start(descriptor(&dir.path().join("index.js"), 1), worker_binary()).await;

    let result = host
        .invoke("handler", serde_json::json!(null), None, Some(Duration::from_millis(200)))
        .await
        .unwrap();

    assert!(!result.ok);
    assert!(matches!(result.error, Some(plugin_protocol::ErrorDetails::Abort { .. })));

    host.shutdown().await;
}

#[tokio::test]
async fn concurrent_invocations_share_the_pool() {
    let dir = tempdir().unwrap();
    write(
        dir.path().join("index.js"),
        r#"
            export function handler(event) {
                return event.n * 2;
            }
        "#,
    )
    .unwrap();

    let host = PluginHost::start(descriptor(&dir.path().join("index.js"), 2), worker_binary()).await;

    let a = host.invoke("handler", serde_json::json!({"n": 1}), None, Some(Duration::from_secs(5)));
    let b = host.invoke("handler", serde_json::json!({"n": 2}), None, Some(Duration::from_secs(5)));
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a.unwrap().value, Some(serde_json::json!(2)));
    assert_eq!(b.unwrap().value, Some(serde_json::json!(4)));

    host.shutdown().await;
}

#[tokio::test]
async fn status_reports_idle_and_active_workers() {
    let dir = tempdir().unwrap();
    write(
        dir.path().join("index.js"),
        r#"
            export function handler(event) {
                return event;
            }
        "#,
    )
    .unwrap();

    let host = PluginHost::start(descriptor(&dir.path().join("index.js"), 1), worker_binary()).await;

    let status = host.status().await;
    assert_eq!(status.idle_workers, 1);
    assert_eq!(status.active_workers, 0);

    host.shutdown().await;
}

#[tokio::test]
async fn an_aborted_worker_is_replaced_rather_than_reused() {
    let dir = tempdir().unwrap();
    write(
        dir.path().join("index.js"),
        r#"
            export function spin(event) {
                while (true) {}
            }
            export function echo(event) {
                return event;
            }
        "#,
    )
    .unwrap();

    let host = PluginHost::start(descriptor(&dir.path().join("index.js"), 1), worker_binary()).await;

    let aborted = host
        .invoke("spin", serde_json::json!(null), None, Some(Duration::from_millis(200)))
        .await
        .unwrap();

    assert!(!aborted.ok);
    match aborted.error {
        Some(plugin_protocol::ErrorDetails::Abort { message }) => {
            assert_eq!(message, "Invocation was aborted");
        }
        other => panic!("expected Abort, got {other:?}"),
    }

    // With concurrency 1 this can only succeed once the maintenance loop
    // has built a replacement for the worker that just ran `spin` forever —
    // the poisoned worker is never handed back to `idle`.
    let replaced = host
        .invoke("echo", serde_json::json!({"ok": true}), None, Some(Duration::from_secs(10)))
        .await
        .unwrap();

    assert!(replaced.ok, "{:?}", replaced.error);
    assert_eq!(replaced.value, Some(serde_json::json!({"ok": true})));

    host.shutdown().await;
}

#[tokio::test]
async fn terminate_synthesizes_a_terminate_error_for_an_in_flight_invocation() {
    let dir = tempdir().unwrap();
    write(
        dir.path().join("index.js"),
        r#"
            export function spin(event) {
                while (true) {}
            }
        "#,
    )
    .unwrap();

    let host = PluginHost::start(descriptor(&dir.path().join("index.js"), 1), worker_binary()).await;

    let invoking = {
        let host = host.clone();
        tokio::spawn(async move { host.invoke("spin", serde_json::json!(null), None, None).await })
    };

    // Give the invocation time to actually reach the worker before
    // terminating the pool out from under it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    host.terminate().await;

    let result = invoking.await.unwrap().unwrap();
    assert!(!result.ok);
    match result.error {
        Some(plugin_protocol::ErrorDetails::Terminate { message }) => {
            assert_eq!(message, "Worker was terminated");
        }
        other => panic!("expected Terminate, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_does_not_cancel_an_in_flight_invocation() {
    let dir = tempdir().unwrap();
    write(
        dir.path().join("index.js"),
        r#"
            export function handler(event) {
                let x = 0;
                for (let i = 0; i < 50000000; i++) {
                    x += i;
                }
                return x;
            }
        "#,
    )
    .unwrap();

    let host = PluginHost::start(descriptor(&dir.path().join("index.js"), 1), worker_binary()).await;

    let invoking = {
        let host = host.clone();
        tokio::spawn(async move {
            host.invoke("handler", serde_json::json!(null), None, Some(Duration::from_secs(10))).await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    host.shutdown().await;

    let result = invoking.await.unwrap().unwrap();
    assert!(result.ok, "shutdown must let the in-flight invocation finish: {:?}", result.error);
}
