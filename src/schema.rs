//! Database schema management for `sigalert-traffic`.
//!
//! Ensures the sensor, road section, reading and incident tables exist before
//! anything reads or writes them. Column names and types match existing
//! `traffic.db` files so old databases keep working.

use sqlx::SqlitePool;

use crate::error::Result;

// ---

/// Create the schema if it is missing (idempotent).
///
/// Safe to call on every startup; a no-op when all objects already exist.
/// Any SQL failure is returned to the caller, which treats it as fatal.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensors (
            idx             INTEGER PRIMARY KEY,
            name            TEXT NOT NULL,
            road_section_id INTEGER,
            direction       TEXT,
            route           TEXT
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS road_sections (
            id        INTEGER PRIMARY KEY,
            direction TEXT,
            route     TEXT,
            start_idx INTEGER,
            end_idx   INTEGER
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Append-only; one logical row per (timestamp, sensor_idx).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS speed_readings (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp    TEXT    NOT NULL,
            sensor_idx   INTEGER NOT NULL,
            speed_mph    INTEGER,
            has_incident INTEGER DEFAULT 0,
            incident_ids TEXT,
            FOREIGN KEY (sensor_idx) REFERENCES sensors(idx)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS incidents (
            id              INTEGER PRIMARY KEY,
            road_section_id INTEGER,
            time_str        TEXT,
            location        TEXT,
            description     TEXT,
            severity        INTEGER,
            x               INTEGER,
            y               INTEGER,
            start_time      TEXT,
            update_time     TEXT,
            first_seen      TEXT,
            last_seen       TEXT
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_readings_timestamp ON speed_readings (timestamp);",
        "CREATE INDEX IF NOT EXISTS idx_readings_sensor ON speed_readings (sensor_idx);",
        r#"
        CREATE INDEX IF NOT EXISTS idx_readings_ts_sensor
        ON speed_readings (timestamp, sensor_idx);
        "#,
    ] {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::SqliteStore;

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        // ---
        let store = SqliteStore::open_in_memory().await.unwrap();
        ensure_schema(store.pool()).await.unwrap();
        ensure_schema(store.pool()).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#,
        )
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(tables, vec!["incidents", "road_sections", "sensors", "speed_readings"]);

        let indexes: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sqlite_master
            WHERE type = 'index' AND name LIKE 'idx_readings_%'
            "#,
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(indexes, 3);
    }
}
