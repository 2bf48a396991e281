//! Per-invocation sandbox state: captured logs, captured outbound fetches,
//! and the timer queue, all scoped to one `Invoke` message.
//!
//! Grounded on the teacher's RAII guard pattern (`FlushGuard`,
//! `MaybeRunGcGuard`, `SandboxMetricsGuard` in `hyperlight-js`): state that
//! must be torn down exactly once, regardless of which return path is
//! taken, is owned by a guard whose `Drop` impl does the teardown.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::Utc;
use plugin_protocol::{FetchRecord, LogLevel, LogRecord};
use rquickjs::{Ctx, Function, Object};

use crate::policy::{forbid_all, GlobalSnapshot, FORBIDDEN_GLOBALS};

/// A queued `setTimeout`/`setInterval` callback. The worker has no real
/// event loop (handlers run to completion synchronously, same as the
/// teacher's `run_handler`), so timers are modeled as a macrotask queue
/// drained, in declared-delay order, once the handler's returned promise
/// has settled — not as wall-clock-accurate scheduling. This is enough to
/// let plugin code rely on "defer this until after I return" without
/// requiring an async JS engine.
struct QueuedTimer {
    id: u32,
    delay_ms: f64,
    callback: rquickjs::Persistent<Function<'static>>,
}

#[derive(Default)]
pub struct TimerRegistry {
    next_id: u32,
    queue: Vec<QueuedTimer>,
    cancelled: std::collections::HashSet<u32>,
}

impl TimerRegistry {
    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn cancel(&mut self, id: u32) {
        self.cancelled.insert(id);
    }

    /// Run every still-live queued callback, in declared-delay order,
    /// clearing the queue afterward. Must be called with the same `Ctx`
    /// the timers were registered against.
    fn drain(&mut self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let mut pending = std::mem::take(&mut self.queue);
        pending.sort_by(|a, b| a.delay_ms.total_cmp(&b.delay_ms));
        for timer in pending {
            if self.cancelled.contains(&timer.id) {
                continue;
            }
            let callback = timer.callback.restore(ctx)?;
            callback.call::<_, ()>(())?;
        }
        Ok(())
    }
}

/// Holds everything a single invocation needs that must not leak into the
/// next one: the log sink, the fetch-instrumentation sink, and the timer
/// queue. Lives only as long as the `Invoke` message being handled.
pub struct InvocationContext {
    logs: Rc<RefCell<Vec<LogRecord>>>,
    fetches: Rc<RefCell<Vec<FetchRecord>>>,
    timers: Rc<RefCell<TimerRegistry>>,
    snapshot: Option<GlobalSnapshot>,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self {
            logs: Rc::new(RefCell::new(Vec::new())),
            fetches: Rc::new(RefCell::new(Vec::new())),
            timers: Rc::new(RefCell::new(TimerRegistry::default())),
            snapshot: None,
        }
    }

    /// Install the invocation's ambient surface: snapshot the current
    /// globals, strip forbidden capabilities, and replace `console` with a
    /// wrapper that appends to this context's log sink instead of writing
    /// to stdout directly (stdout is the worker's message channel back to
    /// the host and must stay reserved for protocol frames).
    pub fn set(&mut self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let snapshot = GlobalSnapshot::capture(ctx)?;
        forbid_all(ctx, FORBIDDEN_GLOBALS)?;
        self.install_console(ctx)?;
        self.install_timers(ctx)?;
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Tear down the ambient surface, restoring the pre-`set` globals
    /// verbatim. Called exactly once per invocation, from the worker's
    /// message loop, regardless of whether the invocation succeeded,
    /// threw, or was aborted.
    pub fn close(&mut self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        if let Some(snapshot) = self.snapshot.take() {
            snapshot.restore(ctx)?;
        }
        self.timers.borrow_mut().cancelled.clear();
        Ok(())
    }

    pub fn take_logs(&self) -> Vec<LogRecord> {
        std::mem::take(&mut self.logs.borrow_mut())
    }

    pub fn take_fetches(&self) -> Vec<FetchRecord> {
        std::mem::take(&mut self.fetches.borrow_mut())
    }

    /// Run any timers queued during the handler call. The worker calls
    /// this once, after the handler's promise has settled but before
    /// `close` tears down the ambient surface, so timer callbacks still see
    /// the invocation's `console`/`fetch` wrappers.
    pub fn drain_timers(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        self.timers.borrow_mut().drain(ctx)
    }

    fn install_console(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let console = Object::new(ctx.clone())?;
        for (name, level) in [
            ("log", LogLevel::Log),
            ("info", LogLevel::Info),
            ("warn", LogLevel::Warn),
            ("error", LogLevel::Error),
            ("debug", LogLevel::Debug),
        ] {
            let sink = self.logs.clone();
            console.set(
                name,
                Function::new(ctx.clone(), move |parts: rquickjs::function::Rest<String>| {
                    let message = parts.0.join(" ");
                    sink.borrow_mut().push(LogRecord {
                        level,
                        message,
                        timestamp: Utc::now(),
                    });
                })?,
            )?;
        }
        ctx.globals().set("console", console)?;
        Ok(())
    }

    fn install_timers(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let timers = self.timers.clone();
        let globals = ctx.globals();

        {
            let timers = timers.clone();
            globals.set(
                "setTimeout",
                Function::new(ctx.clone(), move |ctx: Ctx<'_>, cb: Function<'_>, delay: Option<f64>| -> rquickjs::Result<u32> {
                    let mut registry = timers.borrow_mut();
                    let id = registry.allocate_id();
                    registry.queue.push(QueuedTimer {
                        id,
                        delay_ms: delay.unwrap_or(0.0),
                        callback: rquickjs::Persistent::save(&ctx, cb),
                    });
                    Ok(id)
                })?,
            )?;
        }

        globals.set(
            "clearTimeout",
            Function::new(ctx.clone(), move |id: u32| {
                timers.borrow_mut().cancel(id);
            })?,
        )?;

        Ok(())
    }
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    #[test]
    fn console_log_is_captured_instead_of_printed() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let mut invocation = InvocationContext::new();
            invocation.set(&ctx).unwrap();
            ctx.eval::<(), _>("console.log('hello', 'world')").unwrap();
            invocation.close(&ctx).unwrap();
            let logs = invocation.take_logs();
            assert_eq!(logs.len(), 1);
            assert_eq!(logs[0].message, "hello world");
        });
    }

    #[test]
    fn close_restores_the_native_console_global() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let mut invocation = InvocationContext::new();
            invocation.set(&ctx).unwrap();
            invocation.close(&ctx).unwrap();
            assert!(ctx.globals().get::<_, rquickjs::Value>("setTimeout").is_err());
        });
    }
}
