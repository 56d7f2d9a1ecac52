//! Entry point. Wires config → channel → queue → dispatcher → tools →
//! sessions, and handles PID file, control FIFO, Unix signals, and the
//! optional HTTP API.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use futures_util::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lucyd_agent::providers::AnthropicProvider;
use lucyd_agent::ToolRegistry;
use lucyd_channels::{Channel, CliChannel};
use lucyd_core::provider::Provider;
use lucyd_core::LucydConfig;

use lucyd_daemon::app::{self, AppState};
use lucyd_daemon::dispatch::{Dispatcher, Ingress};
use lucyd_daemon::{fifo, http, monitor, pid, tools};

/// Ingress queue capacity — the single backpressure point.
const QUEUE_CAPACITY: usize = 1000;

#[derive(Parser)]
#[command(name = "lucyd", about = "Lucyd — a daemon for persona-rich AI agents")]
struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "./lucyd.toml", env = "LUCYD_CONFIG")]
    config: PathBuf,

    /// Override the channel type (e.g. "cli" for testing).
    #[arg(long)]
    channel: Option<String>,
}

fn build_providers(config: &LucydConfig) -> HashMap<String, Arc<dyn Provider>> {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    for (name, model_cfg) in &config.models {
        if model_cfg.provider != "anthropic-compat" {
            warn!(
                model = %name,
                provider = %model_cfg.provider,
                "unknown provider type, skipping"
            );
            continue;
        }
        let api_key = std::env::var(&model_cfg.api_key_env).unwrap_or_default();
        if api_key.is_empty() {
            warn!(model = %name, env = %model_cfg.api_key_env, "no API key, skipping model");
            continue;
        }
        providers.insert(
            name.clone(),
            Arc::new(AnthropicProvider::new(
                &model_cfg.model,
                &api_key,
                model_cfg.base_url.as_deref(),
                model_cfg.max_tokens,
            )),
        );
        info!(model = %name, wire_model = %model_cfg.model, "provider ready");
    }
    providers
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LUCYD_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = LucydConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if let Some(channel_type) = args.channel {
        config.channel.channel_type = channel_type;
    }

    info!(agent = %config.agent.name, "starting Lucyd daemon");

    let pid_path = config.state_dir().join("lucyd.pid");
    pid::check_pid_file(&pid_path)?;
    pid::write_pid_file(&pid_path).context("write PID file")?;

    let result = run(config).await;

    pid::remove_pid_file(&pid_path);
    if let Err(e) = &result {
        error!(error = %e, "fatal error");
    }
    info!("Lucyd daemon stopped");
    result
}

async fn run(config: LucydConfig) -> anyhow::Result<()> {
    let providers = build_providers(&config);
    if !providers.contains_key("primary") {
        bail!("no usable primary provider (check API key env vars)");
    }

    let channel: Arc<dyn Channel> = match config.channel.channel_type.as_str() {
        "cli" => Arc::new(CliChannel::new()),
        other => bail!("unknown channel type: {other:?}"),
    };
    channel.connect().await?;
    info!(channel = %channel.name(), "channel connected");

    let (tx, rx) = mpsc::channel::<Ingress>(QUEUE_CAPACITY);

    let memory = app::open_memory(&config)?;
    let mut registry = ToolRegistry::new(config.behavior.output_truncation);
    if let Some(store) = &memory {
        registry.register_many(tools::memory_tools(
            Arc::clone(store),
            config.memory.recall.clone(),
        ));
    }
    info!(tools = %registry.tool_names().join(", "), "tools registered");

    let state = AppState::build(
        config,
        providers,
        Arc::clone(&channel),
        registry,
        memory,
        tx.clone(),
    )?;

    // Control FIFO reader
    let fifo_path = state.config.state_dir().join("control.pipe");
    fifo::create_fifo(&fifo_path).context("create control FIFO")?;
    let fifo_task = tokio::spawn(fifo::run_reader(fifo_path.clone(), tx.clone()));

    // Channel reader — stream end means the transport is done, which
    // shuts the daemon down after draining pending work.
    let reader_tx = tx.clone();
    let reader_channel = Arc::clone(&channel);
    let reader_task = tokio::spawn(async move {
        let mut stream = reader_channel.receive();
        while let Some(msg) = stream.next().await {
            if reader_tx.send(Ingress::Inbound(msg)).await.is_err() {
                return;
            }
        }
        let _ = reader_tx.send(Ingress::Shutdown).await;
    });

    // HTTP API
    let http_task = if state.config.http.enabled {
        let http_state = http::HttpState {
            app: Arc::clone(&state),
            tx: tx.clone(),
        };
        Some(tokio::spawn(async move {
            if let Err(e) = http::serve(http_state).await {
                error!(error = %e, "HTTP API failed");
            }
        }))
    } else {
        None
    };

    spawn_signal_handlers(Arc::clone(&state), tx.clone());

    info!(pid = std::process::id(), "Lucyd daemon running");
    Dispatcher::new(Arc::clone(&state), rx).run().await;

    // Shutdown: checkpoint live sessions (no close hooks — sessions
    // resume from their checkpoints on next startup), then tear down.
    state.sessions.checkpoint_all();
    if let Some(task) = http_task {
        task.abort();
    }
    reader_task.abort();
    fifo_task.abort();
    if let Err(e) = channel.disconnect().await {
        warn!(error = %e, "channel disconnect failed");
    }
    fifo::remove_fifo(&fifo_path);
    Ok(())
}

fn spawn_signal_handlers(state: Arc<AppState>, tx: mpsc::Sender<Ingress>) {
    // SIGTERM / SIGINT: graceful shutdown through the sentinel.
    for kind in [SignalKind::terminate(), SignalKind::interrupt()] {
        let tx = tx.clone();
        tokio::spawn(async move {
            let Ok(mut sig) = signal(kind) else { return };
            sig.recv().await;
            info!("shutdown signal received");
            let _ = tx.send(Ingress::Shutdown).await;
        });
    }

    // SIGUSR1: reload workspace files and rescan skills.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let Ok(mut sig) = signal(SignalKind::user_defined1()) else {
                return;
            };
            while sig.recv().await.is_some() {
                info!("SIGUSR1: reloading workspace files");
                state.assembler.reload();
                state.skills.scan();
            }
        });
    }

    // SIGUSR2: dump status.json.
    tokio::spawn(async move {
        let Ok(mut sig) = signal(SignalKind::user_defined2()) else {
            return;
        };
        while sig.recv().await.is_some() {
            info!("SIGUSR2: writing status");
            let path = state.config.state_dir().join("status.json");
            let status = serde_json::json!({
                "pid": std::process::id(),
                "uptime_s": state.started_at.elapsed().as_secs(),
                "tools": state.registry.tool_names(),
                "channel": state.channel.name(),
                "models": state.providers.keys().collect::<Vec<_>>(),
            });
            if let Err(e) = monitor::write_atomic(&path, &status) {
                warn!(error = %e, "status write failed");
            }
        }
    });
}
