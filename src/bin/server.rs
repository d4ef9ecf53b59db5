//! SMTP Server Binary

use anyhow::Result;
use clap::Parser;
use smtpd::config::{generate_example_config, generate_example_users, Config, UsersConfig};
use smtpd::Server;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// SMTP receiving server
#[derive(Parser, Debug)]
#[command(name = "smtpd")]
#[command(about = "SMTP server that accepts mail and stores it")]
#[command(version = smtpd::VERSION)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Users file (overrides users_file from the configuration)
    #[arg(short, long)]
    users: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log filter directives, e.g. "smtpd=trace"
    #[arg(long)]
    log_filter: Option<String>,

    /// Seconds to let sessions finish after the first Ctrl-C
    #[arg(long, default_value_t = 30)]
    shutdown_timeout: u64,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Print an example users file and exit
    #[arg(long)]
    example_users: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.example_config {
        print!("{}", generate_example_config());
        return Ok(());
    }
    if args.example_users {
        print!("{}", generate_example_users());
        return Ok(());
    }

    // Initialize logging
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = match &args.log_filter {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load config
    let config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else {
        info!("No config file found, using defaults");
        Config::default()
    };

    // Load users
    let users_file = args
        .users
        .or_else(|| config.server.users_file.as_ref().map(PathBuf::from));
    let users = match users_file {
        Some(path) if path.exists() => Some(UsersConfig::from_file(&path)?),
        Some(path) => {
            eprintln!("Error: Users file not found: {}", path.display());
            eprintln!("Create users with: smtpd-adduser <username>");
            std::process::exit(1);
        }
        None => None,
    };
    if users.as_ref().is_some_and(|users| users.users.is_empty()) {
        warn!("No users configured, every AUTH attempt will fail");
    }

    if let Some((cert_file, key_file)) = config.server.tls_files() {
        for file in [&cert_file, &key_file] {
            if !file.exists() {
                eprintln!("Error: TLS file not found: {}", file.display());
                eprintln!("Generate certificates with: smtpd-gen-certs");
                std::process::exit(1);
            }
        }
    }

    info!("smtpd {}", smtpd::VERSION);

    let server = Server::new(config.server, users).await?;

    // First Ctrl-C drains, a second one or the grace period ends the rest
    let shutdown = CancellationToken::new();
    let cancel = CancellationToken::new();
    let grace = Duration::from_secs(args.shutdown_timeout);
    let (on_signal, on_deadline) = (shutdown.clone(), cancel.clone());
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutting down, waiting up to {:?} for sessions", grace);
        on_signal.cancel();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Cancelling remaining sessions"),
            _ = tokio::time::sleep(grace) => info!("Grace period over, cancelling remaining sessions"),
        }
        on_deadline.cancel();
    });

    // Run server
    server.run(shutdown, cancel).await?;

    Ok(())
}
