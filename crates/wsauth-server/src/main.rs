//! wsauth gateway entry point.
//!
//! Two subcommands share one configuration:
//!
//! - `serve` runs the WebSocket gateway.
//! - `mint` prints a fresh token for an identity and client IP, which is what
//!   a page-rendering backend does before handing the token to the browser.
//!
//! # Usage
//!
//! ```text
//! wsauth-server [--config FILE] [--secret-key KEY] [--identities FILE] serve [--bind ADDR] [--trust-forwarded-for]
//! wsauth-server [--config FILE] [--secret-key KEY] [--identities FILE] mint --id ID --ip IP
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                      | Description                         |
//! |-------------------------------|-------------------------------------|
//! | `WSAUTH_CONFIG`               | TOML config file                    |
//! | `WSAUTH_SECRET_KEY`           | Token signing secret                |
//! | `WSAUTH_IDENTITIES`           | TOML identity file                  |
//! | `WSAUTH_BIND`                 | Listener address (`serve` only)     |
//! | `WSAUTH_TRUST_FORWARDED_FOR`  | Use `X-Forwarded-For` (`serve` only)|
//!
//! CLI args take precedence over the environment, which takes precedence
//! over the config file.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::SystemTime;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wsauth_core::{IdentityId, IdentityLookup, InMemoryIdentityStore, TokenCodec};
use wsauth_server::application::{ConnectionRegistry, HandshakeAuthenticator, LoggingLatencyHandler};
use wsauth_server::domain::{SecretKey, ServerConfig};
use wsauth_server::infrastructure::{load_identity_store, run_server, ServerDeps};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Token-authenticated WebSocket gateway.
#[derive(Debug, Parser)]
#[command(
    name = "wsauth-server",
    about = "Token-authenticated WebSocket gateway with a shared connection registry",
    version
)]
struct Cli {
    /// TOML configuration file.  Every setting has a default.
    #[arg(long, short, env = "WSAUTH_CONFIG")]
    config: Option<PathBuf>,

    /// Secret used to sign and verify tokens.
    #[arg(long, env = "WSAUTH_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// TOML file with `[[identity]]` records.
    #[arg(long, env = "WSAUTH_IDENTITIES")]
    identities: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the WebSocket gateway.
    Serve {
        /// Listener address, e.g. `127.0.0.1:8001`.
        #[arg(long, env = "WSAUTH_BIND")]
        bind: Option<SocketAddr>,

        /// Bind tokens to the first `X-Forwarded-For` hop instead of the peer.
        #[arg(long, env = "WSAUTH_TRUST_FORWARDED_FOR")]
        trust_forwarded_for: bool,
    },

    /// Print a token for an identity and the client IP it will connect from.
    Mint {
        /// Identity id in the identity file.
        #[arg(long)]
        id: IdentityId,

        /// Client IP address the token is bound to.
        #[arg(long)]
        ip: IpAddr,
    },
}

impl Cli {
    /// Loads the config file (or defaults) and applies the global overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    fn load_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(secret) = &self.secret_key {
            config.secret_key = Some(SecretKey::new(secret.clone()));
        }
        if let Some(path) = &self.identities {
            config.identities_path = Some(path.clone());
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Builds the token codec; refuses to run without a secret.
fn build_codec(config: &ServerConfig) -> anyhow::Result<TokenCodec> {
    let secret = config
        .secret_key
        .as_ref()
        .context("no secret key configured: set WSAUTH_SECRET_KEY, --secret-key or secret_key")?;
    Ok(TokenCodec::new(secret.expose()).with_validity_secs(config.token_validity_secs))
}

fn build_identity_store(config: &ServerConfig) -> anyhow::Result<InMemoryIdentityStore> {
    match &config.identities_path {
        Some(path) => load_identity_store(path)
            .with_context(|| format!("failed to load identities from {}", path.display())),
        None => {
            warn!("no identity file configured; only anonymous connections can succeed");
            Ok(InMemoryIdentityStore::new())
        }
    }
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn serve(
    mut config: ServerConfig,
    bind: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> anyhow::Result<()> {
    if let Some(addr) = bind {
        config.bind_addr = addr;
    }
    config.trust_forwarded_for |= trust_forwarded_for;

    let codec = build_codec(&config)?;
    let identities = Arc::new(build_identity_store(&config)?);
    info!(
        "wsauth gateway starting: bind={}, identities={}, token validity={}s",
        config.bind_addr,
        identities.len().await,
        codec.validity_secs()
    );

    let deps = ServerDeps {
        authenticator: Arc::new(HandshakeAuthenticator::new(
            codec,
            identities,
            config.anon_sentinel.clone(),
        )),
        registry: Arc::new(ConnectionRegistry::new()),
        latency: Arc::new(LoggingLatencyHandler),
    };

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    run_server(config, deps, running).await?;

    info!("wsauth gateway stopped");
    Ok(())
}

async fn mint(config: ServerConfig, id: IdentityId, ip: IpAddr) -> anyhow::Result<String> {
    let codec = build_codec(&config)?;
    let identities = build_identity_store(&config)?;
    let identity = identities
        .find_by_id(id)
        .await
        .with_context(|| format!("cannot mint a token for identity {id}"))?;
    Ok(codec.mint(&identity, ip, SystemTime::now()))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `RUST_LOG` controls verbosity; absent or invalid falls back to `info`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    match cli.command {
        Command::Serve {
            bind,
            trust_forwarded_for,
        } => serve(config, bind, trust_forwarded_for).await,
        Command::Mint { id, ip } => {
            let token = mint(config, id, ip).await?;
            println!("{token}");
            Ok(())
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
