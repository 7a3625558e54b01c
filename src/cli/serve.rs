//! Serve command implementation

use crate::api::{create_router, AppState};
use crate::cli::ServeArgs;
use crate::config::PorticoConfig;
use crate::tailer::LogTailer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Load configuration with CLI overrides
pub fn load_config_with_overrides(
    args: &ServeArgs,
) -> Result<PorticoConfig, Box<dyn std::error::Error>> {
    // Load from file if it exists, otherwise use defaults
    let mut config = if args.config.exists() {
        PorticoConfig::load(Some(&args.config))?
    } else {
        tracing::debug!("Config file not found, using defaults");
        PorticoConfig::default()
    };

    // Apply environment variable overrides
    config = config.with_env_overrides();

    // Apply CLI overrides (highest priority)
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(ref host) = args.host {
        config.server.host = host.clone();
    }
    if let Some(ref url) = args.backend_url {
        config.upstream.base_url = url.clone();
    }
    if let Some(ref log_level) = args.log_level {
        config.logging.level = log_level.clone();
    }
    if args.no_log_monitoring {
        config.monitor.enabled = false;
    }

    Ok(config)
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
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
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }

    cancel_token.cancel();
}

/// Main serve command handler
pub async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load and merge configuration
    let config = load_config_with_overrides(&args)?;
    config.validate()?;

    // 2. Initialize tracing
    crate::logging::init_tracing(&config.logging)?;

    tracing::info!("Starting Portico gateway");
    tracing::debug!(?config, "Loaded configuration");

    // 3. Build application state and router
    let config = Arc::new(config);
    let app_state = Arc::new(AppState::new(Arc::clone(&config)));
    let app = create_router(Arc::clone(&app_state));

    // 4. Start the log tailer (if enabled)
    let cancel_token = CancellationToken::new();
    let tailer_handle = match (config.monitor.enabled, &config.monitor.log_dir) {
        (true, Some(log_dir)) => {
            tracing::info!(log_dir = %log_dir.display(), "Starting backend log tailer");
            let tailer = LogTailer::new(log_dir.clone(), app_state.bus.clone());
            Some(tailer.spawn(cancel_token.clone()))
        }
        _ => {
            tracing::info!("Backend log monitoring disabled");
            None
        }
    };

    // 5. Bind and serve
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %addr, backend = %config.upstream.base_url, "Portico listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel_token.clone()))
    .await?;

    // 6. Cleanup
    cancel_token.cancel();
    if let Some(handle) = tailer_handle {
        tracing::info!("Waiting for log tailer to stop");
        handle.await?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
