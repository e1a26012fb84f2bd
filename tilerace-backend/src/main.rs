use std::net::SocketAddr;
use tilerace_backend::config::Config;
use tilerace_backend::{AppState, create_app};
use tilerace_db::Database;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    // Initialize tracing for structured logging
    #[cfg(debug_assertions)]
    let log_level = tracing::Level::DEBUG;
    #[cfg(not(debug_assertions))]
    let log_level = tracing::Level::INFO;

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();
    tracing::info!("Starting Tilerace backend server...");

    // Load configuration from environment variables or use defaults
    let config = Config::from_env();
    tracing::info!(
        "Configuration: port={}, db_path={}, body_limit={}KB, timeout={}s, impersonation={}",
        config.port,
        config.database_path,
        config.request_body_limit / 1024,
        config.request_timeout.as_secs(),
        config.allow_impersonation
    );
    tracing::info!(
        "Rate limits: auth={}/min (burst {}), general={}/sec (burst {})",
        config.rate_limit_auth_per_min,
        config.rate_limit_auth_burst,
        config.rate_limit_general_per_sec,
        config.rate_limit_general_burst
    );
    if config.allow_impersonation {
        tracing::warn!("Insecure impersonation is enabled");
    }

    let db = match Database::open(&config.database_path).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to open database {}: {}", config.database_path, e);
            std::process::exit(1);
        }
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let app = create_app(AppState::new(db, config));
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("Server listening on {}", addr);

    if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await {
        tracing::error!("Axum server error: {}", e);
    }
}
