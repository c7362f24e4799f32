//! HTTP query surface.

pub mod handlers;

pub use self::handlers::AppState;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/prices/latest/{symbol}", get(handlers::get_latest))
        .route(
            "/prices/latest/{exchange}/{symbol}",
            get(handlers::get_latest_for_exchange),
        )
        .route("/prices/highest/{symbol}", get(handlers::get_highest))
        .route(
            "/prices/highest/{exchange}/{symbol}",
            get(handlers::get_highest_for_exchange),
        )
        .route("/prices/lowest/{symbol}", get(handlers::get_lowest))
        .route(
            "/prices/lowest/{exchange}/{symbol}",
            get(handlers::get_lowest_for_exchange),
        )
        .route("/prices/average/{symbol}", get(handlers::get_average))
        .route(
            "/prices/average/{exchange}/{symbol}",
            get(handlers::get_average_for_exchange),
        )
        .route("/mode/live", post(handlers::switch_to_live))
        .route("/mode/test", post(handlers::switch_to_test))
        .route("/health", get(handlers::health))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            crate::middleware::logging::request_logging,
        ))
        .with_state(state)
}
