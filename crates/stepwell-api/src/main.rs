//! Stepwell CLI and REST API entry point.
//!
//! Binary name: `swell`
//!
//! Parses CLI arguments, initializes the database and engine services,
//! then dispatches to the appropriate command handler or starts the REST
//! API server with its embedded worker loop.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions and file-local commands don't need app state.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "swell", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => {
            init_cli_tracing(&cli);
            return cli::workflow::handle_validate(file, cli.json);
        }
        Commands::Simulate { file, input } => {
            init_cli_tracing(&cli);
            return cli::workflow::handle_simulate(file, input, cli.json);
        }
        Commands::Serve { .. } => {}
    }

    let Commands::Serve { addr, otel } = cli.command else {
        unreachable!("all other commands handled above");
    };

    stepwell_observe::tracing_setup::init_tracing(otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init().await?;
    let scheduler_token = state.spawn_scheduler();

    // Mirror engine change notifications into the structured log.
    let mut events = state.events.subscribe();
    tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(?event, "engine event"),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "engine event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let router = http::router::build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "stepwell API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    scheduler_token.cancel();
    stepwell_observe::tracing_setup::shutdown_tracing();
    Ok(())
}

/// Verbosity-mapped tracing for one-shot CLI commands.
fn init_cli_tracing(cli: &Cli) {
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stepwell=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}
