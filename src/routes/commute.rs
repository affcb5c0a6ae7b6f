//! Commute estimate endpoint.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::debug;

use super::json_or_500;
use crate::commute::{commute_status, CommuteDirection};
use crate::Config;

// ---

pub fn router() -> Router<(SqlitePool, Config)> {
    Router::new().route("/commute/{direction}", get(handler))
}

#[derive(Debug, Deserialize)]
struct CommuteQuery {
    hours: Option<f64>,
}

/// `GET /commute/{morning|evening}`: routes ranked by estimated travel time.
async fn handler(
    Path(direction): Path<String>,
    Query(params): Query<CommuteQuery>,
    State((pool, _)): State<(SqlitePool, Config)>,
) -> Response {
    // ---
    let direction: CommuteDirection = match direction.parse() {
        Ok(d) => d,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(e)).into_response(),
    };
    let hours = params.hours.unwrap_or(0.5);
    debug!("GET /commute/{:?} hours={}", direction, hours);

    json_or_500(
        "GET /commute",
        commute_status(&pool, direction, hours, Utc::now()).await,
    )
}
