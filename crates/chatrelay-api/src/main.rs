//! chatrelay CLI and REST API entry point.
//!
//! Binary name: `chatrelay`
//!
//! Parses CLI arguments, initializes database and services, then dispatches
//! to the appropriate command handler or starts the API server.

mod cli;
mod http;
mod state;

use clap::Parser;

use chatrelay_observe::tracing_setup::{
    TracingOptions, filter_for_verbosity, init_tracing, shutdown_tracing,
};
use cli::{Cli, Commands, KeysCommand, QuotaCommand};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingOptions {
        default_filter: filter_for_verbosity(cli.verbose, cli.quiet).to_string(),
        json: cli.log_json,
        otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Initialize application state (DB, snapshot writer, services)
    let state = AppState::init().await?;

    let result = run(&state, cli).await;
    state.shutdown().await;
    shutdown_tracing();
    result
}

async fn run(state: &AppState, cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { port, host } => serve(state, &host, port, cli.quiet).await?,

        Commands::Snapshots => cli::snapshots::list_snapshots(state, cli.json).await?,

        Commands::Purge => cli::snapshots::purge(state, cli.json).await?,

        Commands::Keys { command } => match command {
            KeysCommand::Create { user, name } => {
                cli::keys::create_key(state, user, &name, cli.json).await?;
            }
        },

        Commands::Quota { command } => match command {
            QuotaCommand::Grant { user, amount } => {
                cli::quota::grant(state, user, amount, cli.json).await?;
            }
            QuotaCommand::Subscribe { user, model, limit } => {
                cli::quota::subscribe(state, user, &model, limit, cli.json).await?;
            }
            QuotaCommand::Show { user, model } => {
                cli::quota::show(state, user, model.as_deref(), cli.json).await?;
            }
        },
    }

    Ok(())
}

async fn serve(state: &AppState, host: &str, port: u16, quiet: bool) -> anyhow::Result<()> {
    let report = state.start_background().await;

    if state.api_keys.count().await? == 0 && !quiet {
        println!(
            "  {} No API keys yet. Create one with: {}",
            console::style("i").blue().bold(),
            console::style("chatrelay keys create --user <ID>").yellow()
        );
    }

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    if !quiet {
        println!(
            "  {} Recovered {} session{} ({} expired, {} skipped)",
            console::style("↻").bold(),
            report.recovered,
            if report.recovered == 1 { "" } else { "s" },
            report.expired,
            report.skipped
        );
        println!(
            "  {} chatrelay API listening on {}",
            console::style("⚡").bold(),
            console::style(format!("http://{addr}")).cyan()
        );
        println!(
            "  {}",
            console::style(format!("Data directory: {}", state.data_dir.display())).dim()
        );
        println!("  {}", console::style("Press Ctrl+C to stop").dim());
    }

    let router = http::router::build_router(state.clone());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if !quiet {
        println!("\n  Server stopped.");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
