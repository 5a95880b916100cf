use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use teloxide::Bot;
use tokio::sync::watch;
use tracing::{error, info, warn};

use fabula_bus::RedisTransport;
use fabula_core::config::{FabulaConfig, LogFormat};
use fabula_store::AdminLog;
use fabula_telegram::{TelegramAdapter, TeloxideTransport};

mod app;
mod audit;
mod dlq;
mod http;

#[derive(Parser, Debug)]
#[command(name = "fabula-gateway", about = "Fabula narrative bot gateway")]
struct Args {
    /// Path to fabula.toml (default: ~/.fabula/fabula.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Config first: the log format comes from it.
    let config = FabulaConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("config load failed ({}), using defaults", e);
        FabulaConfig::default()
    });
    init_tracing(&config);

    // External collaborators.
    let bus_transport = Arc::new(RedisTransport::new(
        &config.bus.uri,
        config.bus.password.as_deref(),
    )?);
    let bot = Bot::new(&config.transport.token);
    let chat_transport = Arc::new(TeloxideTransport::new(bot));

    // The whole object graph in one place.
    let (core, dlq_rx) = app::Core::build(config, bus_transport, chat_transport)?;

    // Recover workflows interrupted by the previous shutdown.
    match core.coordinator.replay_incomplete().await {
        Ok(0) => {}
        Ok(n) => info!(count = n, "interrupted workflows recovered"),
        Err(e) => error!(error = %e, "workflow recovery failed"),
    }

    // Shutdown fan-out: ctrl-c flips the watch, every loop drains and exits.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        Arc::clone(&core.bus).run(Arc::clone(&core.health), shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(
        Arc::clone(&core.stores).run_probes(Arc::clone(&core.health), shutdown_rx.clone()),
    ));
    {
        let coordinator = Arc::clone(&core.coordinator);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { coordinator.run(rx).await }));
    }
    tasks.push(tokio::spawn(
        Arc::clone(&core.scheduler).run(shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(
        Arc::clone(&core.surface).run_cleanup(shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(dlq::run_dlq_drain(
        Arc::clone(&core.docs),
        AdminLog::new(Arc::clone(&core.docs)),
        dlq_rx,
    )));

    // Telegram long-polling adapter.
    {
        let adapter = TelegramAdapter::new(&core.config.transport, Arc::clone(&core.bot_ctx));
        tasks.push(tokio::spawn(adapter.run()));
    }

    // Admin API.
    let addr: SocketAddr = format!("{}:{}", core.config.api.bind, core.config.api.port).parse()?;
    let router = app::build_router(Arc::clone(&core));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("fabula gateway listening on {}", addr);
    {
        let mut rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "admin api server error");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    // Engines exit on the watch; the Telegram dispatcher and any stuck task
    // get a grace period before we stop waiting.
    let join_all = futures_util::future::join_all(tasks);
    if tokio::time::timeout(std::time::Duration::from_secs(5), join_all)
        .await
        .is_err()
    {
        warn!("some tasks did not stop in time, exiting anyway");
    }
    info!("goodbye");
    Ok(())
}

fn init_tracing(config: &FabulaConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
