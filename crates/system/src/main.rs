use std::process::ExitCode;

use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use studio_system::config::StudioConfig;
use studio_system::console;
use studio_system::system::SystemManager;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = match StudioConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        comfyui = %config.comfyui.api_url(),
        managed = config.comfyui.launch.is_some(),
        workflows_dir = %config.workflow.workflows_dir.display(),
        "Starting studio",
    );

    let system = SystemManager::new(config);
    if let Err(e) = system.start().await {
        tracing::error!(error = %e, "Failed to start system");
        return ExitCode::FAILURE;
    }

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = console::run(&system, stdin, tokio::io::stdout()) => {
            match result {
                Ok(()) => tracing::info!("Console closed, shutting down"),
                Err(e) => tracing::error!(error = %e, "Console I/O failed, shutting down"),
            }
        }
        () = shutdown_signal() => {}
    }

    system.stop().await;
    tracing::info!("Graceful shutdown complete");
    ExitCode::SUCCESS
}

/// `LOG_FORMAT=json` switches to JSON output; `RUST_LOG` overrides the
/// default filter.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "studio=info,studio_system=info,studio_comfyui=info,studio_workflow=info".into()
    });
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for a termination signal to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
