//! CLI surface: `serve` plus token management.
//!
//! Token subcommands talk to the store directly; only `serve` brings up the
//! hub and HTTP surface. The plaintext of a new token is printed exactly
//! once, at creation.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tabrelay_core::config::Config;
use tabrelay_core::ratelimit::RateLimiter;
use tabrelay_core::token::TokenStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::hub::Hub;
use crate::screenshots::ScreenshotStore;
use crate::server::{self, AppState};

/// tabrelay: a relay between API agents and live browser sessions.
#[derive(Parser, Debug)]
#[command(name = "tabrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// What to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the relay server
    Serve,

    /// API token management
    #[command(subcommand)]
    Token(TokenCommands),

    /// Print the version
    Version,
}

/// Token management subcommands.
#[derive(Subcommand, Debug)]
pub enum TokenCommands {
    /// Create a new token and print it once
    Create {
        /// Display name for the token
        #[arg(default_value = "default")]
        name: String,
    },

    /// List tokens (never shows digests)
    List,

    /// Revoke a token by id
    Revoke {
        /// Token id from `token list`
        id: i64,
    },
}

/// Runs the relay server until interrupted.
///
/// # Errors
///
/// Returns an error if a component fails to initialize or the server dies.
pub async fn serve(config: Config) -> Result<()> {
    let tokens = TokenStore::open(&config.db_path).context("failed to open token store")?;
    let hub = Arc::new(Hub::new(config.clone(), crate::VERSION));
    let limiter = Arc::new(RateLimiter::new());
    let screenshots = Arc::new(ScreenshotStore::new(
        config.screenshot_dir.clone(),
        config.screenshot_ttl(),
        config.max_screenshot_bytes(),
    ));

    let state = AppState {
        config: Arc::new(config),
        hub,
        tokens,
        limiter: Arc::clone(&limiter),
        screenshots,
        started_at: std::time::Instant::now(),
        version: crate::VERSION.to_string(),
    };

    let stop = CancellationToken::new();
    server::spawn_rate_sweeper(limiter, stop.clone());

    let shutdown = {
        let stop = stop.clone();
        async move {
            wait_for_signal().await;
            stop.cancel();
        }
    };

    let result = server::serve(state, shutdown).await;
    stop.cancel();
    info!("server stopped");
    result
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt");
    }
}

/// Runs a token management subcommand.
///
/// # Errors
///
/// Returns an error for store failures, including revoking a token that does
/// not exist or was already revoked.
pub fn token(config: &Config, command: TokenCommands) -> Result<()> {
    let store = TokenStore::open(&config.db_path).context("failed to open token store")?;

    match command {
        TokenCommands::Create { name } => {
            let plaintext = store
                .create(&name, config.default_rate_limit)
                .context("failed to create token")?;

            println!();
            println!("Token created.");
            println!();
            println!("  Token: {plaintext}");
            println!("  Name:  {name}");
            println!();
            println!("Save this token now. It will not be shown again.");
            println!();
            println!("To connect the extension:");
            println!("  Relay URL: http://localhost:{}", config.port);
            println!("  Token:     {plaintext}");
            Ok(())
        }

        TokenCommands::List => {
            let tokens = store.list().context("failed to list tokens")?;
            if tokens.is_empty() {
                println!("No tokens found. Create one with: tabrelay token create <name>");
                return Ok(());
            }

            println!(
                "{:<6} {:<20} {:<10} {:<12} {:<18} {:<8}",
                "ID", "NAME", "RPM", "CREATED", "LAST USED", "STATUS"
            );
            for t in tokens {
                let last_used = t
                    .last_used_at
                    .map_or_else(|| "never".to_string(), |ts| {
                        ts.format("%Y-%m-%d %H:%M").to_string()
                    });
                let status = if t.revoked_at.is_some() {
                    "revoked"
                } else {
                    "active"
                };
                println!(
                    "{:<6} {:<20} {:<10} {:<12} {:<18} {:<8}",
                    t.id,
                    t.name,
                    format!("{}/min", t.rate_limit),
                    t.created_at.format("%Y-%m-%d").to_string(),
                    last_used,
                    status
                );
            }
            Ok(())
        }

        TokenCommands::Revoke { id } => {
            store
                .revoke(id)
                .with_context(|| format!("failed to revoke token {id}"))?;
            println!("Token {id} revoked.");
            Ok(())
        }
    }
}
