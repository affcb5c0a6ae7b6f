//! Storage seam for the recorder.
//!
//! Every write names its [`ConflictPolicy`] instead of baking conflict
//! handling into the call site, so the recorder runs unchanged against
//! [`SqliteStore`] in production and [`MemoryStore`] in tests.

use std::future::Future;

use crate::error::Result;
use crate::models::{IncidentRecord, RoadSection, Sensor, SpeedReading};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ---

/// What a write does when the row's key already exists.
///
/// Keys are `(timestamp, sensor_idx)` for readings, `id` for incidents and
/// road sections, `idx` for sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Keep the stored row and drop the incoming one.
    Ignore,
    /// Update the mutable columns and keep the rest. For incidents that is
    /// `description`, `update_time` and `last_seen`; `first_seen` never moves.
    /// Readings have no mutable columns, so this behaves like `Ignore`.
    /// Dimension rows are fully mutable, so this behaves like `Replace`.
    Refresh,
    /// Overwrite every column with the incoming row.
    Replace,
}

/// Fact rows captured from a single snapshot.
///
/// A store commits the whole batch or none of it.
#[derive(Debug, Clone, Copy)]
pub struct WriteBatch<'a> {
    // ---
    pub timestamp: &'a str,
    pub readings: &'a [SpeedReading],
    pub reading_policy: ConflictPolicy,
    pub incidents: &'a [IncidentRecord],
    pub incident_policy: ConflictPolicy,
}

/// Rows actually inserted or changed by a [`WriteBatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub readings_written: u64,
    pub incidents_written: u64,
}

/// Write side of the traffic store.
pub trait TrafficStore {
    /// Number of rows in the sensor dimension.
    fn sensor_count(&self) -> impl Future<Output = Result<i64>> + Send;

    /// Write road sections, then sensors, in one transaction.
    fn write_dimensions(
        &self,
        sections: &[RoadSection],
        sensors: &[Sensor],
        policy: ConflictPolicy,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Write one snapshot's readings and incidents atomically.
    fn write_batch(
        &self,
        batch: WriteBatch<'_>,
    ) -> impl Future<Output = Result<BatchOutcome>> + Send;
}
