//! Worker process entry point. Reads `HostMessage`s as newline-delimited
//! JSON from stdin, runs them against a single `JsRuntime`, and writes
//! `WorkerMessage`s back on stdout — the process-level analogue of the
//! teacher's host/guest flatbuffer loop in `main/native.rs`, except here
//! the "guest" is this whole OS process rather than a Hyperlight VM.
//!
//! Deliberately synchronous/std, no tokio: a worker handles one message at
//! a time (the pool manager owns concurrency across workers), so a plain
//! blocking stdio loop is simpler than threading an async runtime through
//! the `rquickjs::Context`, which isn't `Send`-safe to share across an
//! executor's worker threads anyway. A second thread reads stdin so an
//! `Abort` for the in-flight invocation can flip the runtime's interrupt
//! flag without waiting for the main thread to become free.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use plugin_protocol::{ErrorDetails, HostMessage, InvokeResult, LoadResult, WorkerMessage};
use plugin_worker::JsRuntime;
use uuid::Uuid;

/// Work handed from the stdin reader thread to the main execution loop.
/// `Abort` is also acted on directly by the reader thread (see below); it
/// is forwarded here too only so it shows up in logs in delivery order.
enum Job {
    Load(plugin_protocol::PluginDescriptor),
    Invoke {
        token: Uuid,
        invocation_id: Option<String>,
        function: String,
        args: serde_json::Value,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Shared with the reader thread so an `Abort` for the in-flight
    // invocation can be actioned immediately, even while the main thread
    // is blocked inside `JsRuntime::invoke`.
    let active: Arc<Mutex<Option<(Uuid, Arc<AtomicBool>)>>> = Arc::new(Mutex::new(None));
    let (tx, rx) = mpsc::channel::<Job>();

    spawn_stdin_reader(tx, active.clone());

    let mut runtime: Option<JsRuntime> = None;
    let stdout = std::io::stdout();

    for job in rx {
        match job {
            Job::Load(plugin) => {
                if runtime.is_some() {
                    let result = LoadResult {
                        ok: false,
                        error: Some(ErrorDetails::Load { message: "plugin is already loaded".to_string() }),
                        exports: vec![],
                    };
                    write_message(&stdout, &WorkerMessage::Loaded { result })?;
                    continue;
                }
                match JsRuntime::new() {
                    Ok(mut js_runtime) => {
                        let result = js_runtime.load(&plugin);
                        runtime = Some(js_runtime);
                        write_message(&stdout, &WorkerMessage::Loaded { result })?;
                    }
                    Err(e) => {
                        let result = LoadResult {
                            ok: false,
                            error: Some(ErrorDetails::internal(e.to_string())),
                            exports: vec![],
                        };
                        write_message(&stdout, &WorkerMessage::Loaded { result })?;
                    }
                }
            }
            Job::Invoke { token, invocation_id, function, args } => {
                let result = match runtime.as_mut() {
                    Some(rt) => {
                        *active.lock().unwrap() = Some((token, rt.abort_handle()));
                        let result = rt.invoke(token, &function, args, invocation_id);
                        *active.lock().unwrap() = None;
                        result
                    }
                    None => InvokeResult::failure(
                        ErrorDetails::internal("no plugin has been loaded"),
                        vec![],
                        vec![],
                    ),
                };
                write_message(&stdout, &WorkerMessage::Invoked { token, result })?;
            }
        }
    }

    Ok(())
}

fn spawn_stdin_reader(
    tx: mpsc::Sender<Job>,
    active: Arc<Mutex<Option<(Uuid, Arc<AtomicBool>)>>>,
) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.is_empty() {
                continue;
            }
            let message: HostMessage = match serde_json::from_str(&line) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode host message");
                    continue;
                }
            };
            match message {
                HostMessage::Load { plugin } => {
                    if tx.send(Job::Load(plugin)).is_err() {
                        break;
                    }
                }
                HostMessage::Invoke { token, invocation_id, function, args } => {
                    if tx.send(Job::Invoke { token, invocation_id, function, args }).is_err() {
                        break;
                    }
                }
                HostMessage::Abort { token } => {
                    let guard = active.lock().unwrap();
                    if let Some((running_token, flag)) = guard.as_ref() {
                        if *running_token == token {
                            flag.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    });
}

fn write_message(mut stdout: &std::io::Stdout, message: &WorkerMessage) -> anyhow::Result<()> {
    let mut encoded = serde_json::to_string(message)?;
    encoded.push('\n');
    stdout.write_all(encoded.as_bytes())?;
    stdout.flush()?;
    Ok(())
}
