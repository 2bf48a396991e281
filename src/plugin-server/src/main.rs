//! CLI entry point and thin HTTP façade over a `PluginHost`. This is the
//! external-collaborator layer the core spec calls out as out of scope for
//! the pool/sandbox design itself: it only maps host state and invocation
//! results onto HTTP status codes. Grounded on the teacher's
//! `main/native.rs` for CLI shape (`clap::Parser`, a single positional
//! module argument) and on the pack's axum usage (`Router::new().route(...)`,
//! `impl IntoResponse`) for the HTTP side.

mod facade;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use plugin_host::PluginHost;
use plugin_protocol::PluginDescriptor;

const EXAMPLES: &str = "\u{001b}[1;4mExamples:\u{001b}[0m
  Serve a plugin at ./handler.js on port 8080:
    $ plugin-server --port 8080 ./handler.js

  Serve with a concurrency override from a config file:
    $ cat ./plugin.json
    {\"concurrency\": 4}
    $ plugin-server --config ./plugin.json ./handler.js
";

/// Serve a JavaScript plugin module's exported functions over HTTP.
#[derive(clap::Parser)]
#[command(version, about)]
#[clap(after_help = EXAMPLES)]
struct Cli {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// JSON file merged into the plugin descriptor (`id`, `globals`,
    /// `concurrency`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the plugin module.
    module: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let plugin = build_descriptor(&cli).context("building plugin descriptor")?;
    let worker_binary = worker_binary_path().context("locating plugin-worker binary")?;

    let host = PluginHost::start(plugin.clone(), worker_binary).await;

    let app = facade::router(Arc::new(facade::AppState { host, plugin }));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("binding to port {}", cli.port))?;

    tracing::info!(port = cli.port, "listening");
    axum::serve(listener, app).await.context("serving HTTP")?;

    Ok(())
}

fn build_descriptor(cli: &Cli) -> Result<PluginDescriptor> {
    let module = cli
        .module
        .canonicalize()
        .with_context(|| format!("resolving module path {:?}", cli.module))?;

    let mut descriptor = PluginDescriptor {
        id: module.to_string_lossy().to_string(),
        module: module.to_string_lossy().to_string(),
        globals: Default::default(),
        concurrency: 1,
    };

    if let Some(config_path) = &cli.config {
        let raw = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading config file {config_path:?}"))?;
        let overrides: serde_json::Value =
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {config_path:?}"))?;

        if let Some(id) = overrides.get("id").and_then(|v| v.as_str()) {
            descriptor.id = id.to_string();
        }
        if let Some(concurrency) = overrides.get("concurrency").and_then(|v| v.as_u64()) {
            descriptor.concurrency = concurrency.max(1) as u32;
        }
        if let Some(globals) = overrides.get("globals").and_then(|v| v.as_object()) {
            for (key, value) in globals {
                descriptor.globals.insert(key.clone(), value.clone());
            }
        }
    }

    Ok(descriptor)
}

/// The worker binary lives alongside this one in the same build output
/// directory; resolved relative to the running executable rather than
/// assumed to be on `PATH`.
fn worker_binary_path() -> Result<PathBuf> {
    let mut path = std::env::current_exe().context("resolving current executable path")?;
    path.set_file_name(if cfg!(windows) { "plugin-worker.exe" } else { "plugin-worker" });
    Ok(path)
}
