pub mod client_data;
pub mod config;
pub mod connections;
mod error;
pub mod helpers;
pub mod protocol;
pub mod queue;
pub mod races;
mod routes;
pub mod session;
pub mod tickets;
mod tracks;
pub mod validation;

pub use error::{AppError, ErrorResponse, SessionError};
pub use routes::XTicket;

use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use client_data::ClientDataCache;
use config::Config;
use connections::ConnectionRegistry;
use queue::RaceQueue;
use races::RaceSessions;
use std::sync::Arc;
use tickets::TicketStore;
use tilerace_db::Database;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Shared state of the server. Every shared mutable resource lives behind
/// its own lock inside the component that owns it.
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub tickets: TicketStore,
    pub connections: Arc<ConnectionRegistry>,
    pub races: Arc<RaceSessions>,
    pub client_data: Arc<ClientDataCache>,
    pub queue: RaceQueue,
}

impl AppState {
    pub fn new(db: Database, config: Config) -> Arc<Self> {
        let connections = Arc::new(ConnectionRegistry::new());
        let races = Arc::new(RaceSessions::new(connections.clone()));
        let client_data = Arc::new(ClientDataCache::new(db.clone()));
        let queue = RaceQueue::new(
            db.clone(),
            connections.clone(),
            races.clone(),
            client_data.clone(),
        );

        Arc::new(Self {
            tickets: TicketStore::new(db.clone()),
            db,
            config,
            connections,
            races,
            client_data,
            queue,
        })
    }
}

/// Create the application router for the given state
pub fn create_app(state: Arc<AppState>) -> Router {
    let config = &state.config;

    // Strict rate limit for /auth - tickets are handed out here
    let auth_governor = GovernorConfigBuilder::default()
        .per_second(config.rate_limit_auth_per_min / 60 + 1) // Convert per-min to per-sec, min 1
        .burst_size(config.rate_limit_auth_burst)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("auth rate limit must be non-zero");

    let general_governor = GovernorConfigBuilder::default()
        .per_second(config.rate_limit_general_per_sec)
        .burst_size(config.rate_limit_general_burst)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("general rate limit must be non-zero");

    let auth_routes = Router::new()
        .route("/auth/guest", get(routes::guest))
        .route("/auth/state", get(routes::auth_state))
        .route("/auth/clear", get(routes::clear))
        .route("/auth/impersonate", post(routes::impersonate))
        .layer(GovernorLayer::new(auth_governor));

    let track_routes = Router::new()
        .route(
            "/track",
            get(routes::get_track)
                .post(routes::create_track)
                .put(routes::update_track)
                .delete(routes::delete_track),
        )
        .route("/track/play", get(routes::play_track))
        .layer(GovernorLayer::new(general_governor));

    let http_routes = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .merge(auth_routes)
        .merge(track_routes)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(RequestBodyLimitLayer::new(config.request_body_limit));

    Router::new()
        .route("/ws", get(routes::ws))
        .merge(http_routes)
        .with_state(state)
}
