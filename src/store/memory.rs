//! In-process [`TrafficStore`] used by tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{BatchOutcome, ConflictPolicy, TrafficStore, WriteBatch};
use crate::error::Result;
use crate::models::{Incident, RoadSection, Sensor, SpeedReading};

// ---

#[derive(Debug, Default)]
struct Tables {
    road_sections: BTreeMap<i64, RoadSection>,
    sensors: BTreeMap<i64, Sensor>,
    readings: BTreeMap<(String, i64), SpeedReading>,
    incidents: BTreeMap<i64, Incident>,
}

/// Store that keeps every table in ordered maps behind a mutex.
///
/// A batch is applied under one lock acquisition, which gives the same
/// all-or-nothing visibility as a SQLite transaction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sensors(&self) -> Vec<Sensor> {
        self.lock().sensors.values().cloned().collect()
    }

    pub fn road_sections(&self) -> Vec<RoadSection> {
        self.lock().road_sections.values().cloned().collect()
    }

    /// Readings ordered by `(timestamp, sensor_idx)`.
    pub fn readings(&self) -> Vec<SpeedReading> {
        self.lock().readings.values().cloned().collect()
    }

    pub fn incident(&self, id: i64) -> Option<Incident> {
        self.lock().incidents.get(&id).cloned()
    }

    pub fn incident_count(&self) -> usize {
        self.lock().incidents.len()
    }
}

fn put<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, value: V, policy: ConflictPolicy) -> bool {
    // ---
    match policy {
        ConflictPolicy::Ignore if map.contains_key(&key) => false,
        _ => {
            map.insert(key, value);
            true
        }
    }
}

impl TrafficStore for MemoryStore {
    async fn sensor_count(&self) -> Result<i64> {
        Ok(self.lock().sensors.len() as i64)
    }

    async fn write_dimensions(
        &self,
        sections: &[RoadSection],
        sensors: &[Sensor],
        policy: ConflictPolicy,
    ) -> Result<()> {
        // ---
        let mut tables = self.lock();
        for section in sections {
            put(&mut tables.road_sections, section.id, section.clone(), policy);
        }
        for sensor in sensors {
            put(&mut tables.sensors, sensor.idx, sensor.clone(), policy);
        }
        Ok(())
    }

    async fn write_batch(&self, batch: WriteBatch<'_>) -> Result<BatchOutcome> {
        // ---
        let mut tables = self.lock();
        let mut outcome = BatchOutcome::default();

        let reading_policy = match batch.reading_policy {
            ConflictPolicy::Refresh => ConflictPolicy::Ignore,
            other => other,
        };
        for reading in batch.readings {
            let key = (reading.timestamp.clone(), reading.sensor_idx);
            if put(&mut tables.readings, key, reading.clone(), reading_policy) {
                outcome.readings_written += 1;
            }
        }

        for record in batch.incidents {
            let fresh = record.first_observed(batch.timestamp);
            let refreshed = batch.incident_policy == ConflictPolicy::Refresh
                && match tables.incidents.get_mut(&record.id) {
                    Some(stored) => {
                        stored.description = fresh.description.clone();
                        if fresh.update_time.is_some() {
                            stored.update_time = fresh.update_time.clone();
                        }
                        stored.last_seen = fresh.last_seen.clone();
                        true
                    }
                    None => false,
                };
            let written =
                refreshed || put(&mut tables.incidents, record.id, fresh, batch.incident_policy);
            if written {
                outcome.incidents_written += 1;
            }
        }

        Ok(outcome)
    }
}
