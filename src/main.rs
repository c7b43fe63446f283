//! Celery bridge entry point
//!
//! Resolves configuration and trust material, connects to the broker, then
//! serves the task API until SIGINT or SIGTERM.

use celery_bridge::error::BridgeResult;
use celery_bridge::gateway::{PublishGateway, TaskPublisher};
use celery_bridge::http;
use celery_bridge::observability::logging::parse_level;
use celery_bridge::observability::{init_default_logging, init_logging, LogFormat};
use celery_bridge::transport::amqp::AmqpBroker;
use celery_bridge::transport::{SessionManager, TransportConfigResolver};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, Level};

/// HTTP to AMQP celery task bridge
#[derive(Parser)]
#[command(name = "celery-bridge")]
#[command(about = "Publish HTTP task submissions to a celery broker over mutual TLS")]
#[command(version)]
struct Cli {
    /// Configuration file path (JSON, or TOML with a .toml extension)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge (default)
    Run,
    /// Validate configuration and trust material
    Config {
        /// Print the effective configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_cli_logging(cli.verbose);

    info!("Starting celery-bridge v{}", env!("CARGO_PKG_VERSION"));

    let resolver = match TransportConfigResolver::from_path(cli.config.as_deref()) {
        Ok(resolver) => resolver,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result: Result<(), Box<dyn std::error::Error>> =
        match cli.command.unwrap_or(Commands::Run) {
            Commands::Run => run_bridge(resolver).await.map_err(Into::into),
            Commands::Config { show } => handle_config_command(&resolver, show),
        };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn init_cli_logging(verbose: u8) {
    let level = match verbose {
        0 => return init_default_logging(),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let format = std::env::var("LOG_FORMAT")
        .map(|f| LogFormat::parse(&f))
        .unwrap_or(LogFormat::Json);
    let spans = std::env::var("LOG_SPANS").is_ok_and(|v| v.eq_ignore_ascii_case("true"));

    // An explicit LOG_LEVEL more verbose than the flag still wins
    let level = std::env::var("LOG_LEVEL")
        .map(|l| parse_level(&l).max(level))
        .unwrap_or(level);

    init_logging(level, format, spans);
}

async fn run_bridge(resolver: TransportConfigResolver) -> BridgeResult<()> {
    // Trust material problems are fatal before anything is bound
    let transport = resolver.resolve()?;
    let bridge = resolver.bridge_config();
    let listen = bridge.listen_addr()?;

    let shutdown = listen_for_signals()?;

    let sessions = SessionManager::new(
        AmqpBroker::new(Arc::clone(&transport)),
        bridge.reconnect_config(),
    );

    info!(broker = %transport.redacted_uri(), "Connecting to broker");
    tokio::select! {
        result = sessions.connect() => {
            result?;
        }
        _ = wait_for_shutdown(shutdown.clone()) => {
            info!("Shutdown requested before the broker session was established");
            sessions.shutdown().await;
            return Ok(());
        }
    }

    let gateway = PublishGateway::new(
        sessions.clone(),
        transport.route.clone(),
        bridge.publish_timeout(),
    );
    let publisher: Arc<dyn TaskPublisher> = Arc::new(gateway);

    let (addr, server) = match http::bind(listen, publisher, wait_for_shutdown(shutdown)) {
        Ok(bound) => bound,
        Err(e) => {
            sessions.shutdown().await;
            return Err(e);
        }
    };

    info!(address = %addr, "Bridge is accepting tasks");
    server.await;

    info!("HTTP listener drained, closing broker session");
    sessions.shutdown().await;
    Ok(())
}

fn handle_config_command(
    resolver: &TransportConfigResolver,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = resolver.resolve()?;

    if show {
        println!("# Effective configuration");
        println!("{}", toml::to_string_pretty(&resolver.bridge_config().redacted())?);
        println!("# Broker URI: {}", transport.redacted_uri());
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Flip to true on the first SIGINT or SIGTERM
fn listen_for_signals() -> std::io::Result<watch::Receiver<bool>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
        tx.send_replace(true);
    });

    Ok(rx)
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
