//! NCP Gateway - N-to-1 MCP gateway with semantic tool discovery

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use ncp_gateway::{
    cli::{Cli, Command, run_command},
    config::{self, Settings},
    facade::Facade,
    orchestrator::Orchestrator,
    setup_tracing,
    sync::AutoSync,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Profile-management subcommands run and exit
    if let Some(command) = &cli.command
        && !matches!(command, Command::Serve)
    {
        return match run_command(&cli, command).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let data_dir = match config::resolve_data_dir(cli.data_dir.as_deref()) {
        Ok(dir) => dir,
        Err(e) => {
            error!("Failed to resolve data directory: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut settings = match Settings::load(&data_dir) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load settings: {e}");
            return ExitCode::FAILURE;
        }
    };
    if cli.no_confirm {
        settings.no_confirm = true;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        profile = %cli.profile,
        data_dir = %data_dir.display(),
        "Starting NCP Gateway"
    );

    let orchestrator = match Orchestrator::initialize(&data_dir, settings, &cli.profile).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("Failed to initialize: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Additive import from detected upstream clients; each addition goes
    // through the orchestrator so caches stay coherent. Transient sync
    // failures never abort startup.
    if !cli.no_sync {
        let discovered = AutoSync::new().discover().await;
        for provider in discovered {
            match orchestrator.add_provider(&provider.name, provider.spec).await {
                Ok(()) => info!(provider = %provider.name, "Auto-sync imported provider"),
                Err(e) if e.kind() == "config_error" => {
                    // Already present; additive sync skips it
                }
                Err(e) => warn!(provider = %provider.name, error = %e, "Auto-sync import failed"),
            }
        }
    }

    let facade = Arc::new(Facade::new(Arc::clone(&orchestrator)));

    // Serve until client disconnect or termination signal. Supervisors and
    // container runtimes stop processes with SIGTERM, so it gets the same
    // cleanup path as ctrl-c.
    let outcome = tokio::select! {
        result = Arc::clone(&facade).serve() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            orchestrator.cleanup().await;
            Ok(())
        }
        () = terminate() => {
            info!("Termination signal received, shutting down");
            orchestrator.cleanup().await;
            Ok(())
        }
    };

    match outcome {
        Ok(()) => {
            info!("Gateway shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Gateway error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolve when SIGTERM arrives. On platforms without it, or if the handler
/// cannot be installed, pend forever so ctrl-c remains the only signal path.
#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
