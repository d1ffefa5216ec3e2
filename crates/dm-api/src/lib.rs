//! HTTP + WebSocket surface: typed JSON API with cookie sessions or bearer
//! API keys, a UI event socket at `/ws`, and the agent socket at
//! `/agent/ws`.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use axum::Router;
use state::ApiState;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the complete router with all `/api/*` routes and both sockets.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .merge(routes::ws::router())
        .merge(routes::agent_ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<ApiState> {
    Router::new()
        .nest("/v2/auth", routes::auth::router())
        .nest("/v2/api-keys", routes::api_keys::router())
        .nest("/hosts", routes::hosts::router())
        .nest("/containers", routes::containers::router())
        .nest("/alerts", routes::alerts::router())
        .nest("/updates", routes::updates::router())
        .nest("/deployments", routes::deployments::router())
        .nest("/batch", routes::batch::router())
        .nest("/notification-channels", routes::channels::router())
        .merge(routes::stats::router())
        .merge(routes::system::router())
}
