//! TRADEQUEUE: concurrent work-queue runner for exchange accounts
//!
//! Entry point. Loads configuration, initialises structured logging,
//! then either provisions a fresh queue from the input files or drives
//! the queued work through the orchestrator with graceful shutdown.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::{Stream, StreamExt};
use secrecy::SecretString;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tradequeue::config::AppConfig;
use tradequeue::engine::executor::DryRunExecutor;
use tradequeue::engine::orchestrator::Orchestrator;
use tradequeue::notify::{NoopSink, NotificationSink, TelegramSink};
use tradequeue::provision;
use tradequeue::storage::{ReportStore, WorkStore};
use tradequeue::types::{ProvisionKind, RunMode};
use tradequeue::vault::Vault;

const BANNER: &str = r#"
 _____ ____      _    ____  _____ ___  _   _ _____ _   _ _____
|_   _|  _ \    / \  |  _ \| ____/ _ \| | | | ____| | | | ____|
  | | | |_) |  / _ \ | | | |  _|| | | | | | |  _| | | | |  _|
  | | |  _ <  / ___ \| |_| | |__| |_| | |_| | |___| |_| | |___
  |_| |_| \_\/_/   \_\____/|_____\__\_\\___/|_____|\___/|_____|

  Concurrent account queue runner
  v0.1.0
"#;

#[derive(Parser)]
#[command(name = "tradequeue", version, about = "Concurrent account queue runner")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rebuild the work queue from the credentials file.
    Provision {
        /// `single` or `pairs`.
        kind: ProvisionKind,
    },
    /// Run every queued item in the given mode.
    Run {
        /// `market`, `limit`, `pair`, `cancel` or `stats`.
        mode: RunMode,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let cfg = AppConfig::load(&cli.config)?;

    init_logging();
    println!("{BANNER}");

    let store = Arc::new(WorkStore::open(&cfg.storage.queue_path)?);
    let reports = Arc::new(ReportStore::open(&cfg.storage.report_path)?);

    let amounts = store.amounts().await?;
    info!(queue = %cfg.storage.queue_path, "Loaded {amounts}");

    let passphrase = read_passphrase(&cfg);

    match cli.command {
        Command::Provision { kind } => {
            if passphrase.is_none() {
                warn!("No vault passphrase set, encrypting with the default one");
            }
            let vault = Vault::unlock(passphrase.as_ref(), None)?;
            let amounts = provision::provision(kind, &cfg.provision, &vault, &store, &reports)
                .await
                .context("Provisioning failed")?;
            info!(
                accounts = amounts.accounts,
                groups = amounts.groups,
                modules = amounts.modules,
                "Provisioning complete"
            );
        }
        Command::Run { mode } => {
            let probe = store.credential_probe().await?;
            let vault = Vault::unlock(passphrase.as_ref(), probe.as_deref())?;

            let retry = cfg.retry_policy();
            let sink: Arc<dyn NotificationSink> =
                match TelegramSink::from_config(&cfg.alerts, retry)? {
                    Some(telegram) => {
                        info!("Telegram notifications enabled");
                        Arc::new(telegram)
                    }
                    None => {
                        warn!("No Telegram token or chat ids configured, notifications disabled");
                        Arc::new(NoopSink)
                    }
                };

            let shutdown = CancellationToken::new();
            let orchestrator = Orchestrator::new(
                store,
                reports,
                Arc::new(vault),
                Arc::new(DryRunExecutor),
                sink,
                cfg.orchestrator_settings(),
            )
            .with_shutdown(shutdown.clone());

            tokio::spawn(async move {
                if watch_signals(ctrl_c_stream(), shutdown).await {
                    warn!("Second shutdown signal received, exiting immediately");
                    std::process::exit(130);
                }
            });

            let summary = orchestrator.run(mode).await?;
            info!(
                run_id = %summary.run_id,
                total = summary.total,
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                "{summary}"
            );
        }
    }

    Ok(())
}

/// Ctrl-C presses as a stream. Ends if the handler cannot be installed.
fn ctrl_c_stream() -> impl Stream<Item = ()> + Unpin {
    Box::pin(futures::stream::unfold((), |()| async {
        tokio::signal::ctrl_c().await.ok().map(|()| ((), ()))
    }))
}

/// Cancel `shutdown` on the first signal. Returns `true` on a second
/// signal, `false` if the stream ends first.
async fn watch_signals<S>(mut signals: S, shutdown: CancellationToken) -> bool
where
    S: Stream<Item = ()> + Unpin,
{
    if signals.next().await.is_none() {
        return false;
    }
    info!("Shutdown signal received, finishing in-flight items. Press Ctrl+C again to force exit.");
    shutdown.cancel();
    signals.next().await.is_some()
}

/// Read the vault passphrase from the configured environment variable.
fn read_passphrase(cfg: &AppConfig) -> Option<SecretString> {
    cfg.vault
        .passphrase_env
        .as_deref()
        .and_then(|env| AppConfig::resolve_env(env).ok())
        .filter(|p| !p.is_empty())
        .map(SecretString::new)
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tradequeue=info"));

    let json_logging = std::env::var("TRADEQUEUE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
