//! One worker: a spawned `plugin-worker` child process plus the bookkeeping
//! to talk to it. Grounded on the request/response dispatch shape used by
//! V8-isolate worker threads in the wider pack (a background task reads
//! responses off the child and routes each one to the `oneshot` the caller
//! is awaiting, keyed by invocation token) — adapted here to a real OS
//! process boundary instead of an in-process thread boundary.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use plugin_protocol::{
    read_message, write_message, HostMessage, InvokeResult, LoadResult, PluginDescriptor,
    WorkerMessage,
};
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::error::HostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Loading,
    Ready,
    Busy,
    Failed,
    Closing,
    Closed,
}

type PendingInvocations = Arc<Mutex<HashMap<Uuid, oneshot::Sender<InvokeResult>>>>;

/// A live `plugin-worker` child process.
pub struct Worker {
    pub id: Uuid,
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: PendingInvocations,
    /// Resolved once the single outstanding `Load` reply arrives.
    load_reply: Arc<Mutex<Option<oneshot::Sender<LoadResult>>>>,
    reader_task: tokio::task::JoinHandle<()>,
    crashed: Arc<tokio::sync::Notify>,
}

impl Worker {
    pub fn spawn(binary: &std::path::Path) -> Result<Self, HostError> {
        let mut child = Command::new(binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(HostError::Spawn)?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let pending: PendingInvocations = Arc::new(Mutex::new(HashMap::new()));
        let load_reply = Arc::new(Mutex::new(None));
        let crashed = Arc::new(tokio::sync::Notify::new());

        let reader_task = tokio::spawn(read_loop(stdout, pending.clone(), load_reply.clone(), crashed.clone()));

        Ok(Self {
            id: Uuid::new_v4(),
            child,
            stdin: Arc::new(Mutex::new(stdin)),
            pending,
            load_reply,
            reader_task,
            crashed,
        })
    }

    pub async fn load(&self, plugin: PluginDescriptor) -> Result<LoadResult, HostError> {
        let (tx, rx) = oneshot::channel();
        *self.load_reply.lock().await = Some(tx);
        self.send(HostMessage::Load { plugin }).await?;
        rx.await.map_err(|_| HostError::WorkerCrashed)
    }

    pub async fn invoke(
        &self,
        token: Uuid,
        invocation_id: Option<String>,
        function: String,
        args: serde_json::Value,
    ) -> Result<InvokeResult, HostError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(token, tx);
        self.send(HostMessage::Invoke { token, invocation_id, function, args }).await?;
        rx.await.map_err(|_| HostError::WorkerCrashed)
    }

    pub async fn abort(&self, token: Uuid) -> Result<(), HostError> {
        self.send(HostMessage::Abort { token }).await
    }

    async fn send(&self, message: HostMessage) -> Result<(), HostError> {
        let mut stdin = self.stdin.lock().await;
        write_message(&mut *stdin, &message).await.map_err(HostError::Io)
    }

    /// Completes once the worker's stdout has closed (the process exited
    /// or crashed), letting the pool manager treat the worker as poisoned.
    pub async fn wait_for_crash(&self) {
        self.crashed.notified().await
    }

    pub async fn terminate(mut self) {
        self.reader_task.abort();
        let _ = self.child.kill().await;
    }
}

async fn read_loop(
    stdout: ChildStdout,
    pending: PendingInvocations,
    load_reply: Arc<Mutex<Option<oneshot::Sender<LoadResult>>>>,
    crashed: Arc<tokio::sync::Notify>,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_message::<_, WorkerMessage>(&mut reader).await {
            Ok(WorkerMessage::Loaded { result }) => {
                if let Some(tx) = load_reply.lock().await.take() {
                    let _ = tx.send(result);
                }
            }
            Ok(WorkerMessage::Invoked { token, result }) => {
                if let Some(tx) = pending.lock().await.remove(&token) {
                    let _ = tx.send(result);
                }
            }
            Err(_) => {
                crashed.notify_waiters();
                break;
            }
        }
    }
}
