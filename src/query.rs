//! Read-only aggregate queries over the accumulated readings.
//!
//! Windows are trailing from `now`, which callers pass in. Timestamps are
//! compared as ISO-8601 text, which orders correctly for the single UTC
//! format the recorder writes.

use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::models::{format_timestamp, Incident};

// ---

/// Sensors per route/direction.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RouteSummary {
    pub route: String,
    pub direction: Option<String>,
    pub sensor_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SensorPoint {
    pub timestamp: String,
    pub speed_mph: Option<i64>,
    pub has_incident: bool,
}

/// Trailing average for one sensor; `avg_speed` is `None` when every reading
/// in the window was null.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SensorAverage {
    pub idx: i64,
    pub name: String,
    pub avg_speed: Option<f64>,
    pub readings: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Slowdown {
    pub idx: i64,
    pub name: String,
    pub route: Option<String>,
    pub direction: Option<String>,
    pub avg_speed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataStats {
    pub total_readings: i64,
    pub sensor_count: i64,
    pub incident_count: i64,
    pub first_reading: Option<String>,
    pub last_reading: Option<String>,
    pub days_of_data: i64,
    pub readings_per_hour: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ExportRow {
    timestamp: String,
    sensor_idx: i64,
    sensor_name: String,
    speed_mph: Option<i64>,
    has_incident: bool,
}

/// Cutoff string for a window of `hours` ending at `now`.
///
/// Negative and NaN windows are empty. A window reaching back past the Unix
/// epoch starts at the epoch.
pub fn cutoff(now: DateTime<Utc>, hours: f64) -> String {
    // ---
    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    let millis = (hours * 3_600_000.0).max(0.0);
    let start = TimeDelta::try_milliseconds(millis as i64)
        .and_then(|window| now.checked_sub_signed(window))
        .map_or(epoch, |at| at.max(epoch));
    format_timestamp(start)
}

pub async fn list_routes(pool: &SqlitePool) -> Result<Vec<RouteSummary>> {
    // ---
    let rows = sqlx::query_as(
        r#"
        SELECT route, direction, COUNT(*) AS sensor_count
        FROM sensors
        WHERE route IS NOT NULL
        GROUP BY route, direction
        ORDER BY route, direction
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn sensor_history(
    pool: &SqlitePool,
    sensor_idx: i64,
    hours: f64,
    now: DateTime<Utc>,
) -> Result<Vec<SensorPoint>> {
    // ---
    let rows = sqlx::query_as(
        r#"
        SELECT timestamp, speed_mph, has_incident
        FROM speed_readings
        WHERE sensor_idx = ? AND timestamp > ?
        ORDER BY timestamp
        "#,
    )
    .bind(sensor_idx)
    .bind(cutoff(now, hours))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Per-sensor averages along one route and direction.
pub async fn route_average_speeds(
    pool: &SqlitePool,
    route: &str,
    direction: &str,
    hours: f64,
    now: DateTime<Utc>,
) -> Result<Vec<SensorAverage>> {
    // ---
    let rows = sqlx::query_as(
        r#"
        SELECT s.idx, s.name, AVG(r.speed_mph) AS avg_speed, COUNT(*) AS readings
        FROM sensors s
        JOIN speed_readings r ON s.idx = r.sensor_idx
        WHERE s.route = ? AND s.direction = ? AND r.timestamp > ?
        GROUP BY s.idx
        ORDER BY s.idx
        "#,
    )
    .bind(route)
    .bind(direction)
    .bind(cutoff(now, hours))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Average speed over a whole route and direction.
///
/// `None` means no sensor reported a speed in the window.
pub async fn average_speed(
    pool: &SqlitePool,
    route: &str,
    direction: &str,
    hours: f64,
    now: DateTime<Utc>,
) -> Result<Option<f64>> {
    // ---
    let avg: Option<f64> = sqlx::query_scalar(
        r#"
        SELECT AVG(r.speed_mph)
        FROM speed_readings r
        JOIN sensors s ON r.sensor_idx = s.idx
        WHERE s.route = ? AND s.direction = ? AND r.timestamp > ?
        "#,
    )
    .bind(route)
    .bind(direction)
    .bind(cutoff(now, hours))
    .fetch_one(pool)
    .await?;
    Ok(avg)
}

/// Sensors whose trailing average of reported speeds is below `threshold`.
pub async fn find_slowdowns(
    pool: &SqlitePool,
    threshold: f64,
    hours: f64,
    now: DateTime<Utc>,
) -> Result<Vec<Slowdown>> {
    // ---
    let rows = sqlx::query_as(
        r#"
        SELECT s.idx, s.name, s.route, s.direction, AVG(r.speed_mph) AS avg_speed
        FROM sensors s
        JOIN speed_readings r ON s.idx = r.sensor_idx
        WHERE r.timestamp > ? AND r.speed_mph IS NOT NULL
        GROUP BY s.idx
        HAVING AVG(r.speed_mph) < ?
        ORDER BY avg_speed, s.idx
        "#,
    )
    .bind(cutoff(now, hours))
    .bind(threshold)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Incidents first seen inside the window, newest start first.
///
/// Incidents are never closed, so this can include ones that have already
/// cleared; compare `last_seen` with the latest reading to tell.
pub async fn recent_incidents(
    pool: &SqlitePool,
    hours: f64,
    now: DateTime<Utc>,
) -> Result<Vec<Incident>> {
    // ---
    let rows = sqlx::query_as(
        r#"
        SELECT * FROM incidents
        WHERE first_seen > ?
        ORDER BY start_time DESC, id
        "#,
    )
    .bind(cutoff(now, hours))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn data_stats(pool: &SqlitePool) -> Result<DataStats> {
    // ---
    let (total_readings, first_reading, last_reading, days_of_data): (
        i64,
        Option<String>,
        Option<String>,
        i64,
    ) = sqlx::query_as(
        r#"
        SELECT COUNT(*), MIN(timestamp), MAX(timestamp), COUNT(DISTINCT date(timestamp))
        FROM speed_readings
        "#,
    )
    .fetch_one(pool)
    .await?;

    let sensor_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensors")
        .fetch_one(pool)
        .await?;
    let incident_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM incidents")
        .fetch_one(pool)
        .await?;

    let readings_per_hour = match (&first_reading, &last_reading) {
        (Some(first), Some(last)) => {
            let first = DateTime::parse_from_rfc3339(first).ok();
            let last = DateTime::parse_from_rfc3339(last).ok();
            first.zip(last).map(|(f, l)| {
                let hours = ((l - f).num_seconds() as f64 / 3600.0).max(1.0);
                (total_readings as f64 / hours) as i64
            })
        }
        _ => None,
    };

    Ok(DataStats {
        total_readings,
        sensor_count,
        incident_count,
        first_reading,
        last_reading,
        days_of_data,
        readings_per_hour,
    })
}

/// Write a route's readings in the window to a CSV file.
///
/// Returns the number of rows written.
pub async fn export_route_csv(
    pool: &SqlitePool,
    route: &str,
    direction: &str,
    hours: f64,
    now: DateTime<Utc>,
    path: &Path,
) -> Result<usize> {
    // ---
    let rows: Vec<(String, i64, String, Option<i64>, bool)> = sqlx::query_as(
        r#"
        SELECT r.timestamp, s.idx, s.name, r.speed_mph, r.has_incident
        FROM speed_readings r
        JOIN sensors s ON r.sensor_idx = s.idx
        WHERE s.route = ? AND s.direction = ? AND r.timestamp > ?
        ORDER BY r.timestamp, s.idx
        "#,
    )
    .bind(route)
    .bind(direction)
    .bind(cutoff(now, hours))
    .fetch_all(pool)
    .await?;

    let mut writer = csv::Writer::from_path(path)?;
    for (timestamp, sensor_idx, sensor_name, speed_mph, has_incident) in &rows {
        writer.serialize(ExportRow {
            timestamp: timestamp.clone(),
            sensor_idx: *sensor_idx,
            sensor_name: sensor_name.clone(),
            speed_mph: *speed_mph,
            has_incident: *has_incident,
        })?;
    }
    writer.flush()?;

    tracing::info!("Exported {} rows to {}", rows.len(), path.display());
    Ok(rows.len())
}

#[cfg(test)]
pub(crate) mod tests {
    // ---
    use super::*;
    use crate::models::{RoadSection, Snapshot, StaticMetadata};
    use crate::recorder::{populate_sensors, record_snapshot};
    use crate::store::SqliteStore;
    use chrono::TimeZone;
    use serde_json::json;

    pub(crate) fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 13, 16, 0, 0).unwrap()
    }

    /// Four sensors: 0-1 on 405 South, 2 on 405 North, 3 uncovered.
    pub(crate) async fn seeded() -> SqliteStore {
        // ---
        let store = SqliteStore::open_in_memory().await.unwrap();
        let meta = StaticMetadata {
            sensor_names: vec![
                "Culver".into(),
                "Sepulveda".into(),
                "Venice".into(),
                "Nowhere".into(),
            ],
            road_sections: vec![
                RoadSection {
                    id: 1,
                    direction: Some("South".into()),
                    route: Some("405".into()),
                    start_idx: 0,
                    end_idx: 1,
                },
                RoadSection {
                    id: 2,
                    direction: Some("North".into()),
                    route: Some("405".into()),
                    start_idx: 2,
                    end_idx: 2,
                },
            ],
        };
        populate_sensors(&store, &meta).await.unwrap();

        let snaps = [
            (
                "2026-01-13T15:30:00Z",
                json!([[60, null, []], [20, null, [[1, 5]]], [null, null, []], [30, null, []]]),
            ),
            (
                "2026-01-13T15:45:00Z",
                json!([[50, null, []], [10, null, [[1, 5]]], [null, null, []], [30, null, []]]),
            ),
            // outside a one-hour window
            (
                "2026-01-13T12:00:00Z",
                json!([[5, null, []], [5, null, []], [70, null, []], [5, null, []]]),
            ),
        ];
        for (ts, speeds) in snaps {
            let incidents = json!([[
                1,
                5,
                "7:30",
                "I-405 S at Sepulveda",
                "Crash",
                2,
                1,
                1,
                "2026-01-13T07:30",
                "2026-01-13T07:40"
            ]]);
            let document = json!({"speeds": speeds, "incidents": incidents});
            let snap = Snapshot::from_live(document).unwrap();
            record_snapshot(&store, &snap, ts, Some(4)).await.unwrap();
        }
        store
    }

    #[test]
    fn test_cutoff() {
        // ---
        assert_eq!(cutoff(now(), 1.0), "2026-01-13T15:00:00Z");
        assert_eq!(cutoff(now(), 0.5), "2026-01-13T15:30:00Z");
    }

    #[test]
    fn test_cutoff_out_of_range_windows() {
        // ---
        let weeks = f64::from(u32::MAX) * 7.0 * 24.0;
        for hours in [1e12, weeks, f64::INFINITY] {
            assert_eq!(cutoff(now(), hours), "1970-01-01T00:00:00Z", "hours = {hours}");
        }
        for hours in [-1.0, -1e300, f64::NEG_INFINITY, f64::NAN] {
            assert_eq!(cutoff(now(), hours), "2026-01-13T16:00:00Z", "hours = {hours}");
        }
    }

    #[tokio::test]
    async fn test_huge_window_covers_all_readings() {
        // ---
        let store = seeded().await;
        let history = sensor_history(store.pool(), 1, 1e12, now()).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(sensor_history(store.pool(), 1, -1e300, now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_routes() {
        // ---
        let store = seeded().await;
        let routes = list_routes(store.pool()).await.unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].direction.as_deref(), Some("North"));
        assert_eq!(routes[1].sensor_count, 2);
    }

    #[tokio::test]
    async fn test_route_averages_and_history() {
        // ---
        let store = seeded().await;
        let avgs = route_average_speeds(store.pool(), "405", "South", 1.0, now()).await.unwrap();
        assert_eq!(avgs.len(), 2);
        assert_eq!(avgs[0].avg_speed, Some(55.0));
        assert_eq!(avgs[1].avg_speed, Some(15.0));
        assert_eq!(avgs[1].readings, 2);

        let history = sensor_history(store.pool(), 1, 24.0, now()).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].timestamp, "2026-01-13T12:00:00Z");
        assert!(history[2].has_incident);
    }

    #[tokio::test]
    async fn test_average_of_only_nulls_is_no_data() {
        // ---
        let store = seeded().await;
        let north = average_speed(store.pool(), "405", "North", 1.0, now()).await.unwrap();
        assert_eq!(north, None);

        let south = average_speed(store.pool(), "405", "South", 1.0, now()).await.unwrap();
        assert_eq!(south, Some(35.0));

        let nothing = average_speed(store.pool(), "5", "North", 1.0, now()).await.unwrap();
        assert_eq!(nothing, None);
    }

    #[tokio::test]
    async fn test_find_slowdowns() {
        // ---
        let store = seeded().await;
        let slow = find_slowdowns(store.pool(), 25.0, 1.0, now()).await.unwrap();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].name, "Sepulveda");
        assert_eq!(slow[0].avg_speed, 15.0);

        let slow = find_slowdowns(store.pool(), 35.0, 1.0, now()).await.unwrap();
        assert_eq!(slow.iter().map(|s| s.idx).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(slow[1].route, None, "uncovered sensors still report");
    }

    #[tokio::test]
    async fn test_recent_incidents_and_stats() {
        // ---
        let store = seeded().await;

        // first seen at 15:30, last seen at 12:00 (replayed out of order)
        let recent = recent_incidents(store.pool(), 1.0, now()).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, 5);
        assert_eq!(recent[0].first_seen, "2026-01-13T15:30:00Z");
        assert!(recent_incidents(store.pool(), 0.25, now()).await.unwrap().is_empty());

        let stats = data_stats(store.pool()).await.unwrap();
        assert_eq!(stats.total_readings, 12);
        assert_eq!(stats.sensor_count, 4);
        assert_eq!(stats.incident_count, 1);
        assert_eq!(stats.days_of_data, 1);
        assert_eq!(stats.first_reading.as_deref(), Some("2026-01-13T12:00:00Z"));
        // 12 readings over 3h45m
        assert_eq!(stats.readings_per_hour, Some(3));
    }

    #[tokio::test]
    async fn test_export_route_csv() {
        // ---
        let store = seeded().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("405s.csv");

        let n = export_route_csv(store.pool(), "405", "South", 1.0, now(), &path)
            .await
            .unwrap();
        assert_eq!(n, 4);

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("timestamp,sensor_idx,sensor_name,speed_mph,has_incident"));
        assert_eq!(lines.next(), Some("2026-01-13T15:30:00Z,0,Culver,60,false"));
    }
}
