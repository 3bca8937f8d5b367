use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use aquaman::config::ProxyConfig;
use aquaman::proxy::ProxyServer;
use aquaman::utils::paths;
use aquaman::audit;

#[derive(Parser)]
#[command(name = "aquaman")]
#[command(version)]
#[command(about = "Local credential brokering proxy for agent processes")]
#[command(long_about = "\
aquaman keeps third-party API secrets out of agent processes.

Agents send ordinary HTTP requests to the broker with a service-prefixed
path (e.g. POST /anthropic/v1/messages); the broker authenticates the
caller, injects the real credential, streams the upstream response back,
and records a hash-chained audit entry.")]
#[command(after_long_help = "\
ENVIRONMENT VARIABLES:
    AQUAMAN_SOCKET              Unix socket path (preferred endpoint)
    AQUAMAN_HOST, AQUAMAN_PORT  Loopback TCP endpoint (port 0 = ephemeral)
    AQUAMAN_TLS_CERT/_TLS_KEY   PEM paths; enables TLS on the TCP endpoint
    AQUAMAN_CLIENT_TOKEN        Shared secret required from clients
    AQUAMAN_BACKEND             memory | encrypted-file | cli-vault
    AQUAMAN_STORE_PATH          encrypted-file ciphertext path
    AQUAMAN_STORE_PASSWORD      encrypted-file passphrase
    AQUAMAN_VAULT_CLI           password-manager CLI path (cli-vault)
    AQUAMAN_AUDIT_DIR           audit log root (default ~/.aquaman/audit)
    AQUAMAN_AUDIT_DISABLED      disable audit logging
    AQUAMAN_SERVICES_FILE       user service-definition TOML
    AQUAMAN_ALLOWED_SERVICES    comma-separated service allowlist
    AQUAMAN_CONNECT_TIMEOUT_SECS  upstream connect timeout (default 10)
    AQUAMAN_LOG_FORMAT          'text' (stderr, default) or 'json' (stdout)
    RUST_LOG                    log filter (default: aquaman=info)

FILE LOCATIONS:
    ~/.aquaman/                 Base directory for all data
    ~/.aquaman/aquaman.sock     Default Unix socket
    ~/.aquaman/credentials.enc  Default encrypted credential store
    ~/.aquaman/audit/           Audit segments, archive, integrity anchor
    ~/.aquaman/logs/            Log files (daily rotation)

The broker prints a single JSON handshake line on stdout once it is ready;
stderr carries human diagnostics.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the credential broker
    ///
    /// Binds the configured endpoint, emits the connection-info handshake on
    /// stdout, and serves until SIGTERM/SIGINT.
    Proxy,

    /// Audit log maintenance
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Recompute the hash chain across all segments
    Verify {
        /// Audit directory (default: AQUAMAN_AUDIT_DIR or ~/.aquaman/audit)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("aquaman=info"));

    let (file_writer, guard) = match paths::create_private_dir(&paths::logs_dir()) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(paths::logs_dir(), "aquaman.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        Err(_) => (None, None),
    };
    let file_layer = file_writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
    });

    let json = std::env::var("AQUAMAN_LOG_FORMAT").is_ok_and(|v| v == "json");
    if json {
        // Structured log lines share stdout with the handshake record; the
        // lifecycle manager skips anything that is not the handshake.
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stdout),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    guard
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate.recv() => {}
    }
    tracing::info!("shutdown signal received");
}

async fn run_proxy() -> anyhow::Result<()> {
    let config = ProxyConfig::from_env()?;
    let server = ProxyServer::bind(config).await?;
    let info = server.connection_info()?;

    #[expect(
        clippy::print_stdout,
        reason = "the handshake contract is a single stdout line"
    )]
    {
        println!("{}", serde_json::to_string(&info)?);
    }

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    server.serve(shutdown).await
}

fn run_audit_verify(dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = dir
        .or_else(|| std::env::var("AQUAMAN_AUDIT_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(paths::audit_dir);

    let report = audit::verify_directory(&dir)?;

    #[expect(clippy::print_stderr, reason = "operator-facing diagnostics")]
    {
        for error in &report.errors {
            eprintln!("{}[{}]: {}", error.segment, error.index, error.detail);
        }
        eprintln!(
            "{} entries, final hash {}",
            report.entry_count, report.final_hash
        );
    }

    if report.valid {
        Ok(())
    } else {
        anyhow::bail!(
            "audit chain verification failed with {} error(s)",
            report.errors.len()
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing();

    match cli.command {
        Commands::Proxy => run_proxy().await,
        Commands::Audit {
            command: AuditCommands::Verify { dir },
        } => run_audit_verify(dir),
    }
}
