// crates/live-server/src/main.rs

//! Demo live server: a shared counter with a clock tick.
//!
//! Connect with any line-JSON client, e.g.
//! `{"t":"connect","d":{"session":"demo"}}` then `{"t":"inc","i":1}`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use live_protocol::Event;
use live_server::{shutdown, Engine, EngineConfig, Handler, LocalTransport, PubSub, Shutdown};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TOPIC: &str = "counter";

#[derive(Parser)]
#[clap(name = "live-server")]
#[clap(about = "Server-rendered live views over a line-JSON realtime channel")]
struct Cli {
    /// TOML config file; environment variables are used when absent
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Counter {
    value: i64,
    ticks: u64,
}

fn counter_handler() -> Handler<Counter> {
    Handler::<Counter>::new()
        .with_render(|ctx| {
            let c = ctx.assigns;
            Ok(format!(
                "<main><h1>{}</h1><button live-click=\"dec\">-</button>\
                 <button live-click=\"inc\">+</button><p>ticks: {}</p></main>",
                c.value, c.ticks
            ))
        })
        .handle_event("inc", |_socket, c, params| {
            Ok(Counter {
                value: c.value + params.int("by").max(1),
                ..c.clone()
            })
        })
        .handle_event("dec", |_socket, c, params| {
            Ok(Counter {
                value: c.value - params.int("by").max(1),
                ..c.clone()
            })
        })
        .handle_self("tick", |_socket, c, _payload| {
            Ok(Counter {
                ticks: c.ticks + 1,
                ..c.clone()
            })
        })
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => EngineConfig::from_env().context("loading config from environment"),
    }
}

/// Broadcast a `tick` to every subscribed engine once a second.
async fn run_ticker(engine: Arc<Engine<Counter>>, mut shutdown: Shutdown) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = engine.broadcast(Event::self_event("tick", serde_json::Value::Null)).await {
                    warn!(error = %err, "tick broadcast failed");
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&cli)?;
    info!(
        addr = %config.socket_addr_string(),
        max_connections = config.max_connections,
        "starting live-server"
    );

    let (trigger, signal) = shutdown::channel();
    let pubsub = PubSub::from_config(LocalTransport::new(), &config, signal.clone());
    let engine = Engine::new(counter_handler(), config, signal.clone());
    pubsub.subscribe(TOPIC, engine.clone());

    tokio::spawn(run_ticker(engine.clone(), signal.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
        }
        trigger.trigger();
    });

    live_server::server::run(engine, signal).await?;
    Ok(())
}
