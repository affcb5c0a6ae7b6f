//! Read-only endpoints over the recorded speeds and incidents.

use axum::{
    extract::{Path, Query, State},
    response::Response,
    routing::get,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use super::json_or_500;
use crate::query::{self, SensorAverage};
use crate::Config;

// ---

pub fn router() -> Router<(SqlitePool, Config)> {
    // ---
    Router::new()
        .route("/routes", get(routes))
        .route("/routes/{route}/{direction}/speeds", get(route_speeds))
        .route("/slowdowns", get(slowdowns))
        .route("/incidents", get(incidents))
        .route("/stats", get(stats))
}

/// Trailing window, in hours.
#[derive(Debug, Deserialize)]
struct WindowQuery {
    hours: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SlowdownQuery {
    threshold: Option<f64>,
    hours: Option<f64>,
}

#[derive(Debug, Serialize)]
struct RouteSpeeds {
    route: String,
    direction: String,
    hours: f64,
    avg_speed: Option<f64>,
    sensors: Vec<SensorAverage>,
}

async fn routes(State((pool, _)): State<(SqlitePool, Config)>) -> Response {
    // ---
    debug!("GET /routes");
    json_or_500("GET /routes", query::list_routes(&pool).await)
}

async fn route_speeds(
    Path((route, direction)): Path<(String, String)>,
    Query(params): Query<WindowQuery>,
    State((pool, _)): State<(SqlitePool, Config)>,
) -> Response {
    // ---
    let hours = params.hours.unwrap_or(1.0);
    let now = Utc::now();
    debug!("GET /routes/{}/{}/speeds hours={}", route, direction, hours);

    let result = async {
        let sensors = query::route_average_speeds(&pool, &route, &direction, hours, now).await?;
        let avg_speed = query::average_speed(&pool, &route, &direction, hours, now).await?;
        Ok::<_, crate::Error>(RouteSpeeds {
            route: route.clone(),
            direction: direction.clone(),
            hours,
            avg_speed,
            sensors,
        })
    }
    .await;
    json_or_500("GET /routes/{route}/{direction}/speeds", result)
}

async fn slowdowns(
    Query(params): Query<SlowdownQuery>,
    State((pool, config)): State<(SqlitePool, Config)>,
) -> Response {
    // ---
    let threshold = params.threshold.unwrap_or(config.slowdown_threshold_mph);
    let hours = params.hours.unwrap_or(1.0);
    debug!("GET /slowdowns threshold={} hours={}", threshold, hours);
    json_or_500(
        "GET /slowdowns",
        query::find_slowdowns(&pool, threshold, hours, Utc::now()).await,
    )
}

async fn incidents(
    Query(params): Query<WindowQuery>,
    State((pool, _)): State<(SqlitePool, Config)>,
) -> Response {
    // ---
    let hours = params.hours.unwrap_or(24.0);
    debug!("GET /incidents hours={}", hours);
    json_or_500(
        "GET /incidents",
        query::recent_incidents(&pool, hours, Utc::now()).await,
    )
}

async fn stats(State((pool, _)): State<(SqlitePool, Config)>) -> Response {
    // ---
    debug!("GET /stats");
    json_or_500("GET /stats", query::data_stats(&pool).await)
}
