//! SQLite-backed [`TrafficStore`] over a sqlx pool.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};

use super::{BatchOutcome, ConflictPolicy, TrafficStore, WriteBatch};
use crate::error::Result;
use crate::models::{IncidentRecord, RoadSection, Sensor, SpeedReading};

// ---

/// Traffic store backed by a SQLite database file.
///
/// Cloning is cheap; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and ensure the schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        // ---
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        crate::schema::ensure_schema(&store.pool).await?;
        Ok(store)
    }

    /// Private in-memory database with the schema applied, for tests.
    ///
    /// Pinned to one connection: every `:memory:` connection is its own
    /// database.
    pub async fn open_in_memory() -> Result<Self> {
        // ---
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        crate::schema::ensure_schema(&store.pool).await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Release every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl TrafficStore for SqliteStore {
    async fn sensor_count(&self) -> Result<i64> {
        // ---
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensors")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn write_dimensions(
        &self,
        sections: &[RoadSection],
        sensors: &[Sensor],
        policy: ConflictPolicy,
    ) -> Result<()> {
        // ---
        let verb = match policy {
            ConflictPolicy::Ignore => "INSERT OR IGNORE",
            ConflictPolicy::Refresh | ConflictPolicy::Replace => "INSERT OR REPLACE",
        };

        let mut tx = self.pool.begin().await?;

        let section_sql = format!(
            "{verb} INTO road_sections (id, direction, route, start_idx, end_idx) \
             VALUES (?, ?, ?, ?, ?)"
        );
        for section in sections {
            sqlx::query(&section_sql)
                .bind(section.id)
                .bind(&section.direction)
                .bind(&section.route)
                .bind(section.start_idx)
                .bind(section.end_idx)
                .execute(&mut *tx)
                .await?;
        }

        let sensor_sql = format!(
            "{verb} INTO sensors (idx, name, road_section_id, direction, route) \
             VALUES (?, ?, ?, ?, ?)"
        );
        for sensor in sensors {
            sqlx::query(&sensor_sql)
                .bind(sensor.idx)
                .bind(&sensor.name)
                .bind(sensor.road_section_id)
                .bind(&sensor.direction)
                .bind(&sensor.route)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn write_batch(&self, batch: WriteBatch<'_>) -> Result<BatchOutcome> {
        // ---
        let mut tx = self.pool.begin().await?;
        let mut outcome = BatchOutcome::default();

        for reading in batch.readings {
            outcome.readings_written +=
                insert_reading(&mut *tx, reading, batch.reading_policy).await?;
        }

        for incident in batch.incidents {
            outcome.incidents_written +=
                upsert_incident(&mut *tx, incident, batch.timestamp, batch.incident_policy).await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

/// Insert one reading; uniqueness of `(timestamp, sensor_idx)` is checked
/// here rather than by a table constraint.
async fn insert_reading(
    conn: &mut SqliteConnection,
    reading: &SpeedReading,
    policy: ConflictPolicy,
) -> Result<u64> {
    // ---
    if policy == ConflictPolicy::Replace {
        sqlx::query("DELETE FROM speed_readings WHERE timestamp = ? AND sensor_idx = ?")
            .bind(&reading.timestamp)
            .bind(reading.sensor_idx)
            .execute(&mut *conn)
            .await?;
    }

    let done = sqlx::query(
        r#"
        INSERT INTO speed_readings (timestamp, sensor_idx, speed_mph, has_incident, incident_ids)
        SELECT ?1, ?2, ?3, ?4, ?5
        WHERE NOT EXISTS (
            SELECT 1 FROM speed_readings WHERE timestamp = ?1 AND sensor_idx = ?2
        )
        "#,
    )
    .bind(&reading.timestamp)
    .bind(reading.sensor_idx)
    .bind(reading.speed_mph)
    .bind(reading.has_incident)
    .bind(&reading.incident_ids)
    .execute(&mut *conn)
    .await?;

    Ok(done.rows_affected())
}

async fn upsert_incident(
    conn: &mut SqliteConnection,
    incident: &IncidentRecord,
    timestamp: &str,
    policy: ConflictPolicy,
) -> Result<u64> {
    // ---
    let (verb, on_conflict) = match policy {
        ConflictPolicy::Ignore => ("INSERT", "ON CONFLICT(id) DO NOTHING"),
        ConflictPolicy::Refresh => (
            "INSERT",
            r#"ON CONFLICT(id) DO UPDATE SET
                description = excluded.description,
                update_time = COALESCE(excluded.update_time, incidents.update_time),
                last_seen   = excluded.last_seen"#,
        ),
        ConflictPolicy::Replace => ("INSERT OR REPLACE", ""),
    };

    let sql = format!(
        r#"
        {verb} INTO incidents (
            id, road_section_id, time_str, location, description, severity,
            x, y, start_time, update_time, first_seen, last_seen
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        {on_conflict}
        "#
    );

    let done = sqlx::query(&sql)
        .bind(incident.id)
        .bind(incident.road_section_id)
        .bind(&incident.time_str)
        .bind(&incident.location)
        .bind(&incident.description)
        .bind(incident.severity)
        .bind(incident.x)
        .bind(incident.y)
        .bind(&incident.start_time)
        .bind(&incident.update_time)
        .bind(timestamp)
        .bind(timestamp)
        .execute(&mut *conn)
        .await?;

    Ok(done.rows_affected())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::Incident;

    fn reading(ts: &str, idx: i64, speed: Option<i64>) -> SpeedReading {
        SpeedReading {
            timestamp: ts.to_string(),
            sensor_idx: idx,
            speed_mph: speed,
            has_incident: false,
            incident_ids: None,
        }
    }

    fn batch<'a>(
        ts: &'a str,
        readings: &'a [SpeedReading],
        incidents: &'a [IncidentRecord],
        policy: ConflictPolicy,
    ) -> WriteBatch<'a> {
        WriteBatch {
            timestamp: ts,
            readings,
            reading_policy: policy,
            incidents,
            incident_policy: policy,
        }
    }

    #[tokio::test]
    async fn test_reading_conflicts_follow_policy() {
        // ---
        let store = SqliteStore::open_in_memory().await.unwrap();
        let first = [reading("t0", 0, Some(60)), reading("t0", 1, None)];
        let again = [reading("t0", 0, Some(10))];

        let out = store
            .write_batch(batch("t0", &first, &[], ConflictPolicy::Ignore))
            .await
            .unwrap();
        assert_eq!(out.readings_written, 2);

        let out = store
            .write_batch(batch("t0", &again, &[], ConflictPolicy::Ignore))
            .await
            .unwrap();
        assert_eq!(out.readings_written, 0);

        let speed: Option<i64> = sqlx::query_scalar(
            "SELECT speed_mph FROM speed_readings WHERE timestamp = 't0' AND sensor_idx = 0",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(speed, Some(60));

        store
            .write_batch(batch("t0", &again, &[], ConflictPolicy::Replace))
            .await
            .unwrap();
        let rows: Vec<SpeedReading> = sqlx::query_as(
            r#"
            SELECT timestamp, sensor_idx, speed_mph, has_incident, incident_ids
            FROM speed_readings
            WHERE sensor_idx = 0
            "#,
        )
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(rows, vec![reading("t0", 0, Some(10))]);
    }

    #[tokio::test]
    async fn test_incident_refresh_keeps_first_seen() {
        // ---
        let store = SqliteStore::open_in_memory().await.unwrap();
        let mut inc = IncidentRecord {
            id: 5,
            location: Some("I-110 N at Slauson".into()),
            description: Some("Stalled car".into()),
            update_time: Some("07:02".into()),
            ..IncidentRecord::default()
        };

        store
            .write_batch(batch(
                "2026-01-13T15:00:00Z",
                &[],
                &[inc.clone()],
                ConflictPolicy::Refresh,
            ))
            .await
            .unwrap();

        inc.description = Some("Stalled car, lane 2 blocked".into());
        inc.update_time = None;
        inc.location = Some("ignored on refresh".into());
        store
            .write_batch(batch("2026-01-13T15:02:00Z", &[], &[inc], ConflictPolicy::Refresh))
            .await
            .unwrap();

        let row: Incident = sqlx::query_as("SELECT * FROM incidents WHERE id = 5")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.first_seen, "2026-01-13T15:00:00Z");
        assert_eq!(row.last_seen, "2026-01-13T15:02:00Z");
        assert_eq!(row.description.as_deref(), Some("Stalled car, lane 2 blocked"));
        assert_eq!(row.update_time.as_deref(), Some("07:02"));
        assert_eq!(row.location.as_deref(), Some("I-110 N at Slauson"));
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_readings() {
        // ---
        let store = SqliteStore::open_in_memory().await.unwrap();
        sqlx::query(
            r#"
            CREATE TRIGGER reject_incidents BEFORE INSERT ON incidents
            BEGIN
                SELECT RAISE(ABORT, 'incident insert rejected');
            END
            "#,
        )
        .execute(store.pool())
        .await
        .unwrap();

        let readings = [reading("t0", 0, Some(60)), reading("t0", 1, Some(45))];
        let incident = IncidentRecord {
            id: 9,
            ..IncidentRecord::default()
        };
        let result = store
            .write_batch(batch("t0", &readings, &[incident], ConflictPolicy::Ignore))
            .await;
        assert!(result.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM speed_readings")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_dimensions_ignore_keeps_existing() {
        // ---
        let store = SqliteStore::open_in_memory().await.unwrap();
        let sensor = Sensor {
            idx: 0,
            name: "Culver Blvd".into(),
            road_section_id: None,
            direction: None,
            route: None,
        };
        store.write_dimensions(&[], &[sensor.clone()], ConflictPolicy::Replace).await.unwrap();

        let renamed = Sensor {
            name: "Renamed".into(),
            ..sensor.clone()
        };
        store.write_dimensions(&[], &[renamed], ConflictPolicy::Ignore).await.unwrap();

        let rows: Vec<Sensor> = sqlx::query_as("SELECT * FROM sensors")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, vec![sensor]);
        assert_eq!(store.sensor_count().await.unwrap(), 1);
    }
}
