//! The pool manager: owns every worker process for one loaded plugin,
//! dispatches invocations to an idle worker (or makes a waiter wait for
//! one), and keeps the pool at its configured size by reloading workers
//! that crash or exhaust their load retries.
//!
//! Grounded on the teacher's sandbox lifecycle/guard conventions
//! (`SandboxMetricsGuard`, `MaybeRunGcGuard`): state transitions are
//! narrated with `tracing`, and cleanup on every exit path — success,
//! error, abort, crash — goes through the same few functions rather than
//! being repeated at each call site.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plugin_protocol::{ErrorDetails, InvokeResult, PluginDescriptor};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout as tokio_timeout;
use uuid::Uuid;

use crate::error::HostError;
use crate::worker::Worker;

/// Consecutive `Load` failures the pool tolerates while trying to fill its
/// worker slots before giving up and moving to `failed`.
pub const MAX_LOAD_FAILURES: u32 = 3;
/// Backoff between rebuild rounds once at least one worker is still alive;
/// an empty pool retries immediately instead of waiting this long.
pub const RELOAD_DELAY: Duration = Duration::from_secs(30);

/// How often the maintenance loop re-checks an empty pool instead of
/// waiting the full `RELOAD_DELAY`.
const EMPTY_POOL_RETRY: Duration = Duration::from_millis(200);
/// Poll interval for the plain wait loops below (`ensureLoaded`, shutdown
/// drain, shutdown re-entrancy). Kept short enough that tests with
/// multi-second timeouts never notice it.
const POLL_INTERVAL: Duration = Duration::from_millis(15);

/// Mirrors the state machine in spec §4.5: `loading` until the first worker
/// loads, then `ready`; `failed` if the pool exhausts `MAX_LOAD_FAILURES`
/// with no workers left alive; `closing`/`closed` once shutdown begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolLifecycle {
    Loading,
    Ready,
    Failed,
    Closing,
    Closed,
}

pub struct PoolStatus {
    pub lifecycle: PoolLifecycle,
    pub idle_workers: usize,
    pub active_workers: usize,
    pub waiters: usize,
    pub load_error: Option<ErrorDetails>,
    pub function_names: Vec<String>,
}

/// Owns the fixed-size worker pool for a single loaded plugin.
pub struct PluginHost {
    plugin: PluginDescriptor,
    worker_binary: PathBuf,
    concurrency: usize,
    idle: Mutex<VecDeque<Worker>>,
    waiters: Mutex<VecDeque<oneshot::Sender<Worker>>>,
    active_count: AtomicUsize,
    lifecycle: Mutex<PoolLifecycle>,
    load_error: Mutex<Option<ErrorDetails>>,
    function_names: Mutex<Vec<String>>,
    /// Consecutive `Load` failures since the last success, shared across
    /// the whole pool rather than tracked per slot (spec §4.5).
    failure_count: AtomicU32,
    maintenance: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// One entry per registered-but-not-yet-completed invocation, keyed by
    /// its token. `terminate()` drains this, sending on every sender to
    /// synthesize a `TerminateError` completion for that invocation's
    /// `invoke()` call, which then tears down its assigned worker itself.
    invocations: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
}

impl PluginHost {
    /// Build the pool and start the maintenance loop that fills it to
    /// `plugin.concurrency` workers, resolving once the host first leaves
    /// `loading` (`ensureLoaded` in spec terms). A pool that can't load a
    /// single worker still comes up, parked in `failed`, so the façade can
    /// report `LoadFailed` rather than the whole process refusing to start.
    pub async fn start(plugin: PluginDescriptor, worker_binary: PathBuf) -> Arc<Self> {
        let concurrency = plugin.concurrency.max(1) as usize;

        let host = Arc::new(Self {
            plugin,
            worker_binary,
            concurrency,
            idle: Mutex::new(VecDeque::new()),
            waiters: Mutex::new(VecDeque::new()),
            active_count: AtomicUsize::new(0),
            lifecycle: Mutex::new(PoolLifecycle::Loading),
            load_error: Mutex::new(None),
            function_names: Mutex::new(Vec::new()),
            failure_count: AtomicU32::new(0),
            maintenance: Mutex::new(None),
            invocations: Mutex::new(HashMap::new()),
        });

        let maintenance_handle = tokio::spawn(maintenance_loop(host.clone()));
        *host.maintenance.lock().await = Some(maintenance_handle);

        metrics::gauge!("plugin_host_pool_size").set(host.concurrency as f64);

        // ensureLoaded(): wait for the maintenance loop's first round to
        // move the host out of `loading`, to either `ready` or `failed`.
        while matches!(*host.lifecycle.lock().await, PoolLifecycle::Loading) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        host
    }

    async fn alive_count(&self) -> usize {
        self.idle.lock().await.len() + self.active_count.load(Ordering::Relaxed)
    }

    /// Spawn and load a single worker. Returns `true` on success.
    async fn load_one_worker(&self) -> bool {
        let worker = match Worker::spawn(&self.worker_binary) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(error = %e, "failed to spawn worker process");
                return false;
            }
        };

        match worker.load(self.plugin.clone()).await {
            Ok(result) if result.ok => {
                *self.load_error.lock().await = None;
                if !result.exports.is_empty() {
                    *self.function_names.lock().await = result.exports.clone();
                }
                tracing::info!(plugin = %self.plugin.id, "worker loaded");
                self.idle.lock().await.push_back(worker);
                self.wake_one_waiter().await;
                true
            }
            Ok(result) => {
                tracing::warn!(error = ?result.error, "plugin load reported failure");
                *self.load_error.lock().await = result.error;
                worker.terminate().await;
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "worker crashed while loading");
                *self.load_error.lock().await = Some(ErrorDetails::internal(e.to_string()));
                false
            }
        }
    }

    async fn wake_one_waiter(&self) {
        let mut waiters = self.waiters.lock().await;
        while let Some(waiter) = waiters.pop_front() {
            let mut idle = self.idle.lock().await;
            if let Some(worker) = idle.pop_front() {
                drop(idle);
                if waiter.send(worker).is_ok() {
                    return;
                }
            } else {
                waiters.push_front(waiter);
                return;
            }
        }
    }

    async fn reserve_worker(&self) -> Result<Worker, HostError> {
        {
            let mut idle = self.idle.lock().await;
            if let Some(worker) = idle.pop_front() {
                return Ok(worker);
            }
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.push_back(tx);
        rx.await.map_err(|_| HostError::PoolExhausted)
    }

    async fn release_worker(&self, worker: Worker) {
        let mut waiters = self.waiters.lock().await;
        if let Some(waiter) = waiters.pop_front() {
            if let Err(worker) = waiter.send(worker) {
                self.idle.lock().await.push_back(worker);
            }
            return;
        }
        drop(waiters);
        self.idle.lock().await.push_back(worker);
    }

    /// Run `function(args)` against this plugin.
    ///
    /// The invocation is registered (spec §4.5 `invoke` steps 1-2) before a
    /// worker is reserved, so a `terminate()` that lands while the caller
    /// is still waiting for a worker still resolves it with a
    /// `TerminateError` rather than leaving it stuck forever. Once a
    /// worker is assigned, the reply races against an optional caller
    /// timeout and against the same terminate signal. Any outcome other
    /// than a clean reply — abort, host-issued terminate, or a crash —
    /// terminates the assigned worker instead of returning it to `idle`,
    /// forcing the maintenance loop to build a replacement.
    pub async fn invoke(
        &self,
        function: &str,
        args: serde_json::Value,
        invocation_id: Option<String>,
        call_timeout: Option<Duration>,
    ) -> Result<InvokeResult, HostError> {
        match *self.lifecycle.lock().await {
            PoolLifecycle::Ready => {}
            PoolLifecycle::Loading | PoolLifecycle::Failed => return Err(HostError::NotReady),
            PoolLifecycle::Closing | PoolLifecycle::Closed => return Err(HostError::ShuttingDown),
        }

        let token = Uuid::new_v4();
        let (terminate_tx, mut terminate_rx) = oneshot::channel();
        self.invocations.lock().await.insert(token, terminate_tx);
        metrics::counter!("plugin_host_invocations_total").increment(1);

        let worker = tokio::select! {
            result = self.reserve_worker() => match result {
                Ok(worker) => worker,
                Err(e) => {
                    self.invocations.lock().await.remove(&token);
                    return Err(e);
                }
            },
            _ = &mut terminate_rx => {
                self.invocations.lock().await.remove(&token);
                return Ok(InvokeResult::failure(
                    ErrorDetails::Terminate { message: "Worker was terminated".to_string() },
                    vec![],
                    vec![],
                ));
            }
        };

        self.active_count.fetch_add(1, Ordering::Relaxed);

        let invocation = worker.invoke(token, invocation_id, function.to_string(), args);

        let outcome = match call_timeout {
            Some(duration) => tokio::select! {
                result = invocation => result,
                _ = &mut terminate_rx => Ok(terminate_result()),
                _ = tokio::time::sleep(duration) => {
                    let _ = worker.abort(token).await;
                    // Give the worker a short grace period to honor the
                    // abort and reply before we give up and poison it.
                    let _ = tokio_timeout(Duration::from_millis(500), worker.wait_for_crash()).await;
                    Ok(InvokeResult::failure(
                        ErrorDetails::Abort { message: "Invocation was aborted".to_string() },
                        vec![],
                        vec![],
                    ))
                }
            },
            None => tokio::select! {
                result = invocation => result,
                _ = &mut terminate_rx => Ok(terminate_result()),
            },
        };

        self.invocations.lock().await.remove(&token);
        self.active_count.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(result) => {
                if !result.ok {
                    metrics::counter!("plugin_host_invocation_errors_total").increment(1);
                }
                if matches!(result.error, Some(ErrorDetails::Abort { .. }) | Some(ErrorDetails::Terminate { .. })) {
                    worker.terminate().await;
                } else {
                    self.release_worker(worker).await;
                }
                Ok(result)
            }
            Err(e) => {
                metrics::counter!("plugin_host_invocation_errors_total").increment(1);
                worker.terminate().await;
                Err(e)
            }
        }
    }

    pub async fn status(&self) -> PoolStatus {
        PoolStatus {
            lifecycle: *self.lifecycle.lock().await,
            idle_workers: self.idle.lock().await.len(),
            active_workers: self.active_count.load(Ordering::Relaxed),
            waiters: self.waiters.lock().await.len(),
            load_error: self.load_error.lock().await.clone(),
            function_names: self.function_names.lock().await.clone(),
        }
    }

    /// Gracefully drain the pool: stop accepting new invocations, wait for
    /// every registered invocation to finish on its own (shutdown never
    /// cancels in-flight work), then terminate. Fails fast — by returning
    /// immediately once the closing pool reaches `closed` — if called
    /// again while already `closing`, per spec §4.5.
    pub async fn shutdown(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if matches!(*lifecycle, PoolLifecycle::Closing | PoolLifecycle::Closed) {
                drop(lifecycle);
                while !matches!(*self.lifecycle.lock().await, PoolLifecycle::Closed) {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                return;
            }
            *lifecycle = PoolLifecycle::Closing;
        }

        if let Some(handle) = self.maintenance.lock().await.take() {
            handle.abort();
        }

        while !self.invocations.lock().await.is_empty() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        self.terminate_inner().await;
    }

    /// Synthesize a `TerminateError` for every still-registered invocation,
    /// kill every idle worker, and drop the waiter queue. Idempotent.
    pub async fn terminate(&self) {
        self.terminate_inner().await;
    }

    async fn terminate_inner(&self) {
        *self.lifecycle.lock().await = PoolLifecycle::Closed;
        if let Some(handle) = self.maintenance.lock().await.take() {
            handle.abort();
        }

        let pending = std::mem::take(&mut *self.invocations.lock().await);
        for (_, terminate_tx) in pending {
            let _ = terminate_tx.send(());
        }

        self.waiters.lock().await.clear();

        while let Some(worker) = self.idle.lock().await.pop_front() {
            worker.terminate().await;
        }
    }
}

fn terminate_result() -> InvokeResult {
    InvokeResult::failure(ErrorDetails::Terminate { message: "Worker was terminated".to_string() }, vec![], vec![])
}

/// Background loop started at construction that keeps the pool filled to
/// `concurrency` workers (spec §4.5 "Pool maintenance loop"). While the
/// host is `loading` or `ready`, it repeatedly tries to build missing
/// workers, tracking one pool-wide `failure_count` that resets on any
/// success and that flips the host to `failed` once it reaches
/// `MAX_LOAD_FAILURES` (with no workers left alive, if already `ready`).
/// Between rounds it backs off `RELOAD_DELAY` if at least one worker
/// survived, or retries almost immediately if the pool is empty. Both
/// `shutdown()` and `terminate()` cancel this task outright via
/// `JoinHandle::abort`, so it carries no explicit shutdown signal.
async fn maintenance_loop(host: Arc<PluginHost>) {
    loop {
        match *host.lifecycle.lock().await {
            PoolLifecycle::Loading | PoolLifecycle::Ready => {}
            PoolLifecycle::Failed | PoolLifecycle::Closing | PoolLifecycle::Closed => return,
        }

        loop {
            let alive = host.alive_count().await;
            if alive >= host.concurrency {
                break;
            }
            match *host.lifecycle.lock().await {
                PoolLifecycle::Loading | PoolLifecycle::Ready => {}
                _ => return,
            }

            if host.load_one_worker().await {
                host.failure_count.store(0, Ordering::Relaxed);
                let mut lifecycle = host.lifecycle.lock().await;
                if *lifecycle == PoolLifecycle::Loading {
                    *lifecycle = PoolLifecycle::Ready;
                    tracing::info!("pool ready after first worker load");
                }
            } else {
                let failures = host.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= MAX_LOAD_FAILURES {
                    let alive_now = host.alive_count().await;
                    let mut lifecycle = host.lifecycle.lock().await;
                    let should_fail = matches!(*lifecycle, PoolLifecycle::Loading)
                        || (matches!(*lifecycle, PoolLifecycle::Ready) && alive_now == 0);
                    if should_fail {
                        *lifecycle = PoolLifecycle::Failed;
                        tracing::warn!(failures, "pool failed: exhausted load retries with no workers alive");
                    }
                    drop(lifecycle);
                    break;
                }
            }
        }

        match *host.lifecycle.lock().await {
            PoolLifecycle::Loading | PoolLifecycle::Ready => {}
            PoolLifecycle::Failed | PoolLifecycle::Closing | PoolLifecycle::Closed => return,
        }

        let alive = host.alive_count().await;
        let delay = if alive > 0 { RELOAD_DELAY } else { EMPTY_POOL_RETRY };
        tokio::time::sleep(delay).await;
    }
}
