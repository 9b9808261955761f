//! Netblock - forwarding HTTP/HTTPS proxy that blocks blacklisted domains.
//!
//! `netblock run` starts the proxy in the foreground. The other subcommands
//! edit or inspect the configuration file; a running proxy picks up blacklist
//! edits on its own.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use netblock_core::{default_config_path, project_dirs, tracing_sink, Config, RuleEngine};
use netblock_proxy::{BlacklistReloader, ProxyConfig, ProxyServer};

mod commands;

/// Netblock - blacklist proxy for HTTP and HTTPS traffic
#[derive(Parser, Debug)]
#[command(name = "netblock", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy in the foreground (default)
    Run,
    /// Add a pattern to the blacklist
    Add {
        /// Domain pattern (e.g. example.com, *.example.com, google.*)
        pattern: String,
    },
    /// Remove a pattern from the blacklist
    Remove {
        /// Pattern to remove
        pattern: String,
    },
    /// List blacklist patterns
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show configuration and whether the proxy is reachable
    Status,
    /// Print recent log lines
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
        /// Keep printing new lines as they are written
        #[arg(short, long)]
        follow: bool,
    },
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("logs"))
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("netblock={},warn", level)))
}

/// Daily rotating log file in `dir`, keeping the last five days.
fn rolling_appender(dir: &Path) -> Option<RollingFileAppender> {
    std::fs::create_dir_all(dir).ok()?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(5)
        .filename_prefix("netblock")
        .filename_suffix("log")
        .build(dir)
        .ok()
}

/// Initialize proxy logging: console plus, when the data dir is writable, a
/// rotating file.
///
/// The returned guard flushes the file writer and must outlive the proxy.
fn init_logging(args: &Args, level: &str) -> Option<WorkerGuard> {
    let level = if args.debug { "debug" } else { level };
    let file = logs_dir().and_then(|dir| rolling_appender(&dir).map(|appender| (dir, appender)));

    let (log_dir, file_layer, guard) = match file {
        Some((dir, appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(dir), Some(layer), Some(guard))
        }
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(file_layer)
        .init();

    match log_dir {
        Some(dir) => tracing::info!("Logging to {}", dir.display()),
        None => tracing::warn!("File logging unavailable, using console only"),
    }
    guard
}

/// Console-only logging on stderr for the management subcommands.
fn init_cli_logging(args: &Args) {
    let level = if args.debug {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .init();
}

/// Resolves when Ctrl+C or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Runs the proxy until a shutdown signal arrives.
async fn run_proxy(args: &Args, config_path: PathBuf) -> anyhow::Result<()> {
    // Settings are read before logging starts so the file's level applies.
    let created = Config::ensure_exists(&config_path)
        .with_context(|| format!("Failed to create {}", config_path.display()))?;
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let _log_guard = init_logging(args, &level);

    tracing::info!("Netblock v{} starting", env!("CARGO_PKG_VERSION"));
    if created {
        tracing::info!("Wrote sample configuration to {}", config_path.display());
    }

    let engine = Arc::new(RuleEngine::with_sink(tracing_sink(), config.logging.flags()));
    engine.replace_rules(&config.blacklist);
    tracing::info!(
        "Loaded {} blacklist patterns from {}",
        engine.pattern_count(),
        config_path.display()
    );

    let proxy_config = ProxyConfig::from_config(&config)?;
    let server = ProxyServer::bind(proxy_config, engine.clone())
        .with_context(|| format!("Failed to start proxy on {}", proxy_config.addr))?;
    tracing::info!(
        "Configure clients to use HTTP proxy {} for HTTP and HTTPS",
        server.local_addr()
    );

    let shutdown = server.shutdown_token();
    let reloader = Arc::new(BlacklistReloader::new(&config_path, engine.clone()));
    let reload_task = tokio::spawn(reloader.run(shutdown.clone()));

    let signal_token = shutdown.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutting down proxy...");
        signal_token.cancel();
    });

    let result = server.run().await;

    shutdown.cancel();
    signal_task.abort();
    let _ = reload_task.await;

    let stats = engine.stats();
    tracing::info!(
        blocked = stats.blocked,
        allowed = stats.allowed,
        "Final stats: {} blocked, {} allowed",
        stats.blocked,
        stats.allowed
    );

    result.context("Proxy server failed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(default_config_path);

    if matches!(args.command, None | Some(Command::Run)) {
        return run_proxy(&args, config_path).await;
    }

    init_cli_logging(&args);
    match &args.command {
        Some(Command::Add { pattern }) => commands::add(&config_path, pattern),
        Some(Command::Remove { pattern }) => commands::remove(&config_path, pattern),
        Some(Command::List { json }) => commands::list(&config_path, *json),
        Some(Command::Status) => commands::status(&config_path, logs_dir()).await,
        Some(Command::Logs { lines, follow }) => {
            let dir = logs_dir().context("Could not determine the logs directory")?;
            commands::logs(&dir, *lines, *follow).await
        }
        None | Some(Command::Run) => Ok(()),
    }
}
