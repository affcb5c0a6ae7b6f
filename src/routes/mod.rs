//! HTTP query API gateway.
//!
//! Each sibling module exports a subrouter; this module merges them and binds
//! the shared `(SqlitePool, Config)` state, so `main.rs` never sees individual
//! endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::Config;

mod commute;
mod health;
mod traffic;

// ---

pub fn router(pool: SqlitePool, config: Config) -> Router {
    // ---
    Router::new()
        .merge(traffic::router())
        .merge(commute::router())
        .merge(health::router())
        .with_state((pool, config))
}

/// Turn a query result into a JSON response, logging failures.
fn json_or_500<T: Serialize>(endpoint: &str, result: crate::Result<T>) -> Response {
    // ---
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => {
            tracing::error!("{} failed: {}", endpoint, e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json("query failed")).into_response()
        }
    }
}
