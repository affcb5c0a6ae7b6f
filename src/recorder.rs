//! Turns static metadata and snapshots into stored rows.
//!
//! Speeds are positional: `snapshot.speeds[i]` is sensor `i` of the static
//! `sensorNames` array. Nothing here reorders or filters that array.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::models::{IncidentRecord, Sensor, Snapshot, SpeedReading, StaticMetadata};
use crate::store::{ConflictPolicy, TrafficStore, WriteBatch};

// ---

/// Outcome of recording one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordReport {
    pub timestamp: String,
    pub total_sensors: usize,
    pub valid_readings: usize,
    pub readings_written: u64,
    pub incidents: usize,
    pub skipped_incidents: usize,
}

/// Fill the sensor and road section tables from static metadata.
///
/// Does nothing when sensors already exist. Returns whether rows were written.
pub async fn populate_sensors<S: TrafficStore>(store: &S, meta: &StaticMetadata) -> Result<bool> {
    // ---
    if store.sensor_count().await? > 0 {
        tracing::info!("Sensors already populated, skipping");
        return Ok(false);
    }

    // Section bounds come from the feed; only indexes of listed sensors matter.
    let last_idx = meta.sensor_names.len() as i64 - 1;
    let mut by_idx: HashMap<i64, usize> = HashMap::new();
    for (pos, section) in meta.road_sections.iter().enumerate() {
        for idx in section.start_idx.max(0)..=section.end_idx.min(last_idx) {
            by_idx.insert(idx, pos);
        }
    }

    let sensors: Vec<Sensor> = meta
        .sensor_names
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let idx = idx as i64;
            let section = by_idx.get(&idx).map(|&pos| &meta.road_sections[pos]);
            Sensor {
                idx,
                name: name.clone(),
                road_section_id: section.map(|s| s.id),
                direction: section.and_then(|s| s.direction.clone()),
                route: section.and_then(|s| s.route.clone()),
            }
        })
        .collect();

    store
        .write_dimensions(&meta.road_sections, &sensors, ConflictPolicy::Replace)
        .await?;

    tracing::info!(
        "Populated {} sensors and {} road sections",
        sensors.len(),
        meta.road_sections.len()
    );
    Ok(true)
}

/// Build the reading rows for every position in the snapshot.
pub fn readings_for(snapshot: &Snapshot, timestamp: &str) -> Vec<SpeedReading> {
    snapshot
        .speeds
        .iter()
        .enumerate()
        .map(|(idx, entry)| entry.to_reading(idx as i64, timestamp))
        .collect()
}

/// Extract the well-formed incidents, counting the ones skipped.
pub fn incidents_for(snapshot: &Snapshot) -> (Vec<IncidentRecord>, usize) {
    // ---
    let mut records = Vec::with_capacity(snapshot.incidents.len());
    let mut skipped = 0;
    for raw in &snapshot.incidents {
        match raw.parse(snapshot.format) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::debug!("Skipping incident record: {}", e);
                skipped += 1;
            }
        }
    }
    (records, skipped)
}

/// Record one reading per sensor; replays of the same timestamp are ignored.
///
/// Returns `(total_sensors, valid_readings)`.
pub async fn record_speeds<S: TrafficStore>(
    store: &S,
    snapshot: &Snapshot,
    timestamp: &str,
) -> Result<(usize, usize)> {
    // ---
    let readings = readings_for(snapshot, timestamp);
    store
        .write_batch(WriteBatch {
            timestamp,
            readings: &readings,
            reading_policy: ConflictPolicy::Ignore,
            incidents: &[],
            incident_policy: ConflictPolicy::Refresh,
        })
        .await?;

    Ok((snapshot.speeds.len(), snapshot.valid_speed_count()))
}

/// Upsert every well-formed incident in one transaction.
///
/// Returns the number of incidents recorded; short records are skipped.
pub async fn record_incidents<S: TrafficStore>(
    store: &S,
    snapshot: &Snapshot,
    timestamp: &str,
) -> Result<usize> {
    // ---
    let (incidents, skipped) = incidents_for(snapshot);
    if skipped > 0 {
        tracing::warn!("Skipped {} malformed incident records", skipped);
    }

    store
        .write_batch(WriteBatch {
            timestamp,
            readings: &[],
            reading_policy: ConflictPolicy::Ignore,
            incidents: &incidents,
            incident_policy: ConflictPolicy::Refresh,
        })
        .await?;

    Ok(incidents.len())
}

/// Record speeds and incidents of one snapshot in a single transaction.
///
/// With `expected_sensors` set, a snapshot whose speeds array differs in
/// length from the static sensor list is rejected before anything is written.
pub async fn record_snapshot<S: TrafficStore>(
    store: &S,
    snapshot: &Snapshot,
    timestamp: &str,
    expected_sensors: Option<usize>,
) -> Result<RecordReport> {
    // ---
    if let Some(expected) = expected_sensors {
        if snapshot.speeds.len() != expected {
            return Err(Error::DataShape(format!(
                "snapshot has {} speed entries but {} sensors are known",
                snapshot.speeds.len(),
                expected
            )));
        }
    }

    let readings = readings_for(snapshot, timestamp);
    let (incidents, skipped) = incidents_for(snapshot);
    if skipped > 0 {
        tracing::warn!("Skipped {} malformed incident records", skipped);
    }

    let outcome = store
        .write_batch(WriteBatch {
            timestamp,
            readings: &readings,
            reading_policy: ConflictPolicy::Ignore,
            incidents: &incidents,
            incident_policy: ConflictPolicy::Refresh,
        })
        .await?;

    Ok(RecordReport {
        timestamp: timestamp.to_string(),
        total_sensors: snapshot.speeds.len(),
        valid_readings: snapshot.valid_speed_count(),
        readings_written: outcome.readings_written,
        incidents: incidents.len(),
        skipped_incidents: skipped,
    })
}
