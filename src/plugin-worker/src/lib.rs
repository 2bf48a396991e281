//! In-process JS engine for one worker. Ported from
//! `hyperlight-js-runtime`'s `JsRuntime`: same `rquickjs::Context`-per-engine
//! shape, same module-loader composition, same `Persistent<Function>`
//! handler storage — generalized from "one registered handler" to "every
//! function a plugin module exports", and with per-invocation ambient
//! policy (`context::InvocationContext`) layered around each call instead
//! of the teacher's VM memory boundary.

mod context;
pub mod fetch;
mod globals;
mod modules;
pub mod policy;
pub mod resolver;
mod utils;

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use plugin_protocol::{ErrorDetails, FetchRecord, InvokeResult, LoadResult, PluginDescriptor};
use rquickjs::loader::{Loader, Resolver as JsResolver};
use rquickjs::promise::MaybePromise;
use rquickjs::{Context, Ctx, Module, Persistent, Runtime, Value};
use tracing::instrument;
use uuid::Uuid;

/// Turns a caught `rquickjs` error (an uncaught JS exception or an engine
/// fault) into an `anyhow::Error` carrying a readable message, the same
/// role the teacher's private `CatchJsErrorExt` plays in
/// `hyperlight-js-runtime::lib`.
trait CatchJsErrorExt {
    type Ok;
    fn catch_js(self, ctx: &Ctx<'_>) -> anyhow::Result<Self::Ok>;
}

impl<T> CatchJsErrorExt for rquickjs::Result<T> {
    type Ok = T;
    fn catch_js(self, ctx: &Ctx<'_>) -> anyhow::Result<T> {
        match rquickjs::CatchResultExt::catch(self, ctx) {
            Ok(v) => Ok(v),
            Err(e) => Err(anyhow::anyhow!("{e:#?}")),
        }
    }
}

use crate::context::InvocationContext;
use crate::modules::NativeModuleLoader;
use crate::resolver::FileModuleLoader;

/// Drives one plugin module inside one worker process. A worker loads
/// exactly one plugin in its lifetime (spec §4.4): `load` may be called
/// only once, and every `invoke` after that runs against the same
/// `rquickjs::Context`.
pub struct JsRuntime {
    context: Context,
    exports: HashMap<String, Persistent<rquickjs::Function<'static>>>,
    abort_flag: Arc<AtomicBool>,
}

// SAFETY: see the identical justification in the teacher's `JsRuntime`:
// `rquickjs::Context` is not auto-`Send` only because it holds a raw
// pointer, not because of any real aliasing hazard, and every public
// method here takes `&mut self`, so there is never concurrent access.
unsafe impl Send for JsRuntime {}

impl JsRuntime {
    #[instrument(skip_all, level = "info")]
    pub fn new() -> anyhow::Result<Self> {
        let runtime = Runtime::new()?;
        let context = Context::full(&runtime)?;

        let file_loader = Rc::new(FileModuleLoader::new());
        let module_loader = ModuleLoader {
            loader: file_loader,
        };
        let native_loader = NativeModuleLoader;
        let loader = (native_loader, module_loader);
        runtime.set_loader(loader.clone(), loader);

        let abort_flag = Arc::new(AtomicBool::new(false));
        {
            let abort_flag = abort_flag.clone();
            runtime.set_interrupt_handler(Some(Box::new(move || {
                abort_flag.load(Ordering::Relaxed)
            })));
        }

        context.with(|ctx| globals::setup(&ctx))?;

        Ok(Self {
            context,
            exports: HashMap::new(),
            abort_flag,
        })
    }

    /// Load the plugin's entry module: resolve it on the real filesystem,
    /// evaluate it, snapshot every exported function, and merge
    /// `plugin.globals` onto the context's global object.
    #[instrument(skip_all, fields(plugin = %plugin.id), level = "info")]
    pub fn load(&mut self, plugin: &PluginDescriptor) -> LoadResult {
        match self.try_load(plugin) {
            Ok(exports) => LoadResult {
                ok: true,
                error: None,
                exports,
            },
            Err(error) => LoadResult {
                ok: false,
                error: Some(error),
                exports: vec![],
            },
        }
    }

    /// Loading runs under the same sandbox a later `invoke` would use (spec
    /// §4.4 step 2: "open a sandbox with empty callId and the plugin's
    /// globals, then dynamically import ... then close"), so top-level
    /// module code sees the forbidden-globals policy and the restricted
    /// console/timers surface exactly as an invocation would, rather than
    /// the engine's native, unrestricted globals.
    fn try_load(&mut self, plugin: &PluginDescriptor) -> Result<Vec<String>, ErrorDetails> {
        let entry = FileModuleLoader::canonicalize_entry(&plugin.module)
            .map_err(|e| ErrorDetails::Load { message: format!("resolving entry module: {e}") })?;
        let entry_path = entry.to_string_lossy().replace('\\', "/");
        let source = std::fs::read_to_string(&entry)
            .map_err(|e| ErrorDetails::Load { message: format!("reading entry module: {e}") })?;

        self.context
            .with(|ctx| -> Result<Vec<String>, ErrorDetails> {
                let mut sandbox = InvocationContext::new();
                sandbox.set(&ctx).map_err(|e| ErrorDetails::Load { message: e.to_string() })?;

                let outcome = (|| -> Result<Vec<String>, ErrorDetails> {
                    for (key, value) in &plugin.globals {
                        let encoded = serde_json::to_string(value)
                            .map_err(|e| ErrorDetails::Load { message: e.to_string() })?;
                        let js_value = ctx.json_parse(encoded).catch_js(&ctx).map_err(load_err)?;
                        ctx.globals()
                            .set(key.as_str(), js_value)
                            .map_err(|e| ErrorDetails::Load { message: e.to_string() })?;
                    }

                    let module = Module::declare(ctx.clone(), entry_path.as_str(), source)
                        .catch_js(&ctx)
                        .map_err(load_err)?;
                    let (module, promise) = module.eval().catch_js(&ctx).map_err(load_err)?;
                    promise.finish::<()>().catch_js(&ctx).map_err(load_err)?;

                    let mut exports = Vec::new();
                    for name in module.names::<String>() {
                        if let Ok(func) = module.get::<_, rquickjs::Function>(name.as_str()) {
                            self.exports.insert(name.clone(), Persistent::save(&ctx, func));
                            exports.push(name);
                        }
                    }
                    Ok(exports)
                })();

                let _ = sandbox.close(&ctx);
                outcome
            })
    }

    /// Run one exported function to completion (or to abort/failure),
    /// isolating its ambient surface with a fresh `InvocationContext`.
    #[instrument(skip_all, fields(token = %token, function = %function), level = "info")]
    pub fn invoke(
        &mut self,
        token: Uuid,
        function: &str,
        args: serde_json::Value,
        invocation_id: Option<String>,
    ) -> InvokeResult {
        self.abort_flag.store(false, Ordering::Relaxed);

        let Some(handler) = self.exports.get(function).cloned() else {
            return InvokeResult::failure(
                ErrorDetails::NotFound {
                    message: format!("function '{function}' is not exported by this plugin"),
                },
                vec![],
                vec![],
            );
        };

        let fetches: Rc<std::cell::RefCell<Vec<FetchRecord>>> = Rc::new(std::cell::RefCell::new(Vec::new()));

        self.context.with(|ctx| {
            let mut invocation = InvocationContext::new();
            if let Err(e) = invocation.set(&ctx) {
                return InvokeResult::failure(ErrorDetails::internal(e.to_string()), vec![], vec![]);
            }
            if let Err(e) = fetch::install(&ctx, invocation_id.clone(), fetches.clone()) {
                return InvokeResult::failure(ErrorDetails::internal(e.to_string()), vec![], vec![]);
            }

            let result = run_handler(&ctx, &handler, args);

            let _ = invocation.drain_timers(&ctx);
            let _ = fetch::remove(&ctx);
            let invocation_logs = invocation.take_logs();
            let invocation_fetches = invocation.take_fetches();
            let _ = invocation.close(&ctx);

            let aborted = self.abort_flag.swap(false, Ordering::Relaxed);

            match result {
                Ok(value) => InvokeResult::success(value, invocation_logs, invocation_fetches),
                Err(_) if aborted => InvokeResult::failure(
                    ErrorDetails::Abort { message: "Invocation was aborted".into() },
                    invocation_logs,
                    invocation_fetches,
                ),
                Err(error) => InvokeResult::failure(error, invocation_logs, invocation_fetches),
            }
        })
    }

    /// Request that the currently running invocation stop at the next
    /// interrupt check. Safe to call from another thread while `invoke` is
    /// blocking the thread that owns this `JsRuntime`.
    pub fn request_abort(&self) {
        self.abort_flag.store(true, Ordering::Relaxed);
    }

    /// A cloneable handle to this runtime's abort flag, so a second thread
    /// (e.g. the worker binary's stdin reader) can request an abort while
    /// `invoke` is blocking the thread that owns the `JsRuntime` itself.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort_flag.clone()
    }
}

fn run_handler(
    ctx: &Ctx<'_>,
    handler: &Persistent<rquickjs::Function<'static>>,
    args: serde_json::Value,
) -> Result<serde_json::Value, ErrorDetails> {
    let func = handler.clone().restore(ctx).catch_js(ctx).map_err(runtime_err)?;
    let encoded =
        serde_json::to_string(&args).map_err(|e| ErrorDetails::InvalidArgument { message: e.to_string() })?;
    let arg: Value = ctx.json_parse(encoded).catch_js(ctx).map_err(runtime_err)?;
    let promise: MaybePromise = func
        .call((arg,))
        .map_err(|_| extract_thrown_error(ctx))?;
    let value: Value = promise.finish().map_err(|_| extract_thrown_error(ctx))?;
    let stringified = ctx
        .json_stringify(value)
        .catch_js(ctx)
        .map_err(runtime_err)?
        .map(|s| s.to_string().catch_js(ctx).map_err(runtime_err))
        .transpose()?
        .unwrap_or_else(|| "null".to_string());
    serde_json::from_str(&stringified).map_err(|e| ErrorDetails::Internal { message: e.to_string() })
}

/// Pull the thrown JS value off the context after a failed call and shape it
/// into `ErrorDetails`, preserving the exception's own `name` (e.g.
/// `"TypeError"`) rather than collapsing everything to a generic message —
/// this is what lets callers observe `error.name == "TypeError"` per the
/// testable invariants.
fn extract_thrown_error(ctx: &Ctx<'_>) -> ErrorDetails {
    let thrown: Value = ctx.catch();
    if let Some(obj) = thrown.as_object() {
        let name = obj.get::<_, String>("name").unwrap_or_else(|_| "Error".to_string());
        let message = obj.get::<_, String>("message").unwrap_or_default();
        let stack = obj.get::<_, String>("stack").ok();
        return ErrorDetails::runtime_named(name, message, stack);
    }
    if let Some(s) = thrown.as_string() {
        return ErrorDetails::runtime(s.to_string().unwrap_or_default(), None);
    }
    ErrorDetails::runtime(format!("{thrown:?}"), None)
}

fn load_err(e: anyhow::Error) -> ErrorDetails {
    ErrorDetails::Load { message: e.to_string() }
}

fn runtime_err(e: anyhow::Error) -> ErrorDetails {
    ErrorDetails::runtime(e.to_string(), None)
}

#[derive(Clone)]
struct ModuleLoader {
    loader: Rc<FileModuleLoader>,
}

impl JsResolver for ModuleLoader {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        let (dir, _) = base.rsplit_once('/').unwrap_or((".", ""));
        self.loader
            .resolve(dir, name)
            .map_err(|_| rquickjs::Error::new_resolving(base, name))
    }
}

impl Loader for ModuleLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js>> {
        let source = self
            .loader
            .load(name)
            .map_err(|_| rquickjs::Error::new_loading(name))?;
        Module::declare(ctx.clone(), name, source)
    }
}
