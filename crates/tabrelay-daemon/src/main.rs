//! tabrelay binary entry point.
//!
//! `serve` runs the relay; `token` subcommands manage credentials against
//! the same database the server uses. Logs go to stderr so token plaintext
//! printed by the CLI never interleaves with log output.

use anyhow::{Context, Result};
use clap::Parser;
use tabrelay_core::config::Config;
use tabrelay_daemon::cli::{self, Cli, Commands};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Usage problems exit 1, like any other failure.
            let _ = err.print();
            std::process::exit(1);
        }
    };

    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Serve => cli::serve(config).await,
        Commands::Token(command) => cli::token(&config, command),
        Commands::Version => {
            println!("tabrelay {}", tabrelay_daemon::VERSION);
            Ok(())
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
