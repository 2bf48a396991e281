//! Ambient-surface capability policy for the JS global namespace.
//!
//! The teacher isolates plugin code with a VM boundary, so the guest's
//! global namespace is whatever the guest runtime decides to expose and
//! nothing more. We have no VM boundary here — the worker process runs
//! one real `rquickjs::Context` per plugin — so the sandbox instead
//! enumerates the global object and assigns each property a policy,
//! following the snapshot/restore discipline the teacher uses for
//! `Persistent` handlers and `MaybeRunGcGuard`: capture state on `set`,
//! restore it verbatim on `close`.

use rquickjs::{Ctx, Object};

/// Globals installed as throwing accessors before a plugin runs: dynamic
/// code evaluation, WebAssembly compilation, microtask enqueueing, and the
/// worker-lifecycle surface a plugin has no business touching directly.
pub const FORBIDDEN_GLOBALS: &[&str] = &[
    "eval",
    "Function",
    "WebAssembly",
    "queueMicrotask",
    "close",
    "postMessage",
    "onmessage",
    "onerror",
    "navigator",
];

/// Replace each name in `names` with a getter that throws `"<name> is not
/// supported"` on any read (and therefore on any invocation too, since a
/// call expression reads the callee before invoking it). Evaluated as plain
/// script rather than built through rquickjs's object-property bindings so
/// the accessor semantics (throwing getter, `configurable` for re-install
/// across invocations) come straight from the engine instead of being
/// hand-rolled against its native-binding API.
pub fn forbid_all(ctx: &Ctx<'_>, names: &[&str]) -> rquickjs::Result<()> {
    for name in names {
        let message = format!("{name} is not supported");
        let source = format!(
            "Object.defineProperty(globalThis, {name:?}, {{ get() {{ throw new Error({message:?}); }}, configurable: true }});"
        );
        ctx.eval::<(), _>(source)?;
    }
    Ok(())
}

/// Snapshot of the global object's own enumerable property names before an
/// invocation-specific policy is applied, so `close` can restore them.
pub struct GlobalSnapshot {
    names: Vec<String>,
}

impl GlobalSnapshot {
    pub fn capture(ctx: &Ctx<'_>) -> rquickjs::Result<Self> {
        let globals: Object = ctx.globals();
        let names: Vec<String> = globals.keys::<String>().collect::<Result<_, _>>()?;
        Ok(Self { names })
    }

    /// Remove any own property installed since the snapshot was taken that
    /// wasn't part of the original set. Properties named in the original
    /// snapshot are left as-is: per-invocation `Replace`/`Wrap` overwrite a
    /// descriptor temporarily, and are torn down by the caller re-installing
    /// the engine default, not by this restore pass.
    pub fn restore(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let globals: Object = ctx.globals();
        let current: Vec<String> = globals.keys::<String>().collect::<Result<_, _>>()?;
        for name in current {
            if !self.names.contains(&name) {
                globals.remove(name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime, Value};

    #[test]
    fn restore_removes_globals_added_after_the_snapshot() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let snapshot = GlobalSnapshot::capture(&ctx).unwrap();
            ctx.globals().set("injected", 1).unwrap();
            assert!(ctx.globals().get::<_, i32>("injected").is_ok());
            snapshot.restore(&ctx).unwrap();
            assert!(ctx.globals().get::<_, i32>("injected").is_err());
        });
    }

    #[test]
    fn forbid_all_installs_throwing_getters() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            assert!(ctx.globals().get::<_, Value>("eval").is_ok());
            forbid_all(&ctx, FORBIDDEN_GLOBALS).unwrap();
            assert!(ctx.globals().get::<_, Value>("eval").is_err());
        });
    }

    #[test]
    fn forbidden_global_throws_the_exact_not_supported_message() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            forbid_all(&ctx, FORBIDDEN_GLOBALS).unwrap();
            let result: rquickjs::Result<Value> = ctx.eval("eval('1')");
            assert!(result.is_err());
            let thrown: Value = ctx.catch();
            let message: String = thrown
                .as_object()
                .and_then(|o| o.get::<_, String>("message").ok())
                .unwrap_or_default();
            assert_eq!(message, "eval is not supported");
        });
    }
}
