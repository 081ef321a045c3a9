use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use relay_core::{QuotaPolicy, RelayLimits};
use relay_server::{start, ServerConfig, StoreVerifier};
use relay_store::{Database, UserRepo};

/// Bounded-history chat relay.
#[derive(Parser, Debug)]
#[command(name = "relay", version, about)]
struct Cli {
    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Path to the SQLite database. Omit for an in-memory store that
    /// vanishes on exit.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Minimum milliseconds between accepted submissions per identity.
    #[arg(long, default_value_t = 3000)]
    cooldown_ms: u64,

    /// Upper bound on retained history.
    #[arg(long, default_value_t = 200)]
    max_total_messages: u32,

    /// Upper bound on one identity's retained messages.
    #[arg(long, default_value_t = 20)]
    max_messages_per_user: u32,

    /// What to do at the per-user quota: evict | reject.
    #[arg(long, default_value = "evict")]
    quota_policy: QuotaPolicyArg,

    /// Require identity/secret credentials on the hello handshake.
    #[arg(long, default_value_t = false)]
    require_auth: bool,
}

#[derive(Clone, Debug)]
struct QuotaPolicyArg(QuotaPolicy);

impl std::str::FromStr for QuotaPolicyArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(QuotaPolicyArg)
    }
}

#[tokio::main]
async fn main() {
    relay_telemetry::init_logging("info,relay=debug");

    let cli = Cli::parse();

    let db = match &cli.db {
        Some(path) => match Database::open(path) {
            Ok(db) => {
                info!(path = %path.display(), "opened database");
                db
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "failed to open database");
                std::process::exit(1);
            }
        },
        None => match Database::in_memory() {
            Ok(db) => {
                info!("using in-memory database");
                db
            }
            Err(err) => {
                error!(error = %err, "failed to initialize in-memory database");
                std::process::exit(1);
            }
        },
    };

    let limits = RelayLimits {
        cooldown: Duration::from_millis(cli.cooldown_ms),
        max_total_messages: cli.max_total_messages,
        max_messages_per_user: cli.max_messages_per_user,
        quota_policy: cli.quota_policy.0,
    };

    let verifier: Option<Arc<dyn relay_server::CredentialVerifier>> = if cli.require_auth {
        Some(Arc::new(StoreVerifier::new(UserRepo::new(db.clone()))))
    } else {
        None
    };

    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        limits,
        ..Default::default()
    };

    let handle = match start(config, db, verifier).await {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "failed to start relay");
            std::process::exit(1);
        }
    };

    info!(port = handle.port, "relay started, ctrl-c to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
    handle.shutdown();
}
