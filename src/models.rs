//! Data models for the traffic pipeline.
//!
//! Wire documents from Sigalert are positional JSON arrays, so the raw side
//! is decoded from `serde_json::Value` and normalized into the row types that
//! the store persists.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// ---

/// Minimum positional fields for an incident in the live feed.
pub const LIVE_INCIDENT_FIELDS: usize = 10;

/// Minimum positional fields for an incident in an archived compact blob.
pub const COMPACT_INCIDENT_FIELDS: usize = 4;

/// Render a reading timestamp the way every row in the store carries it.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// --- static metadata

/// One-time metadata document: sensor names by index plus road sections.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticMetadata {
    // ---
    pub sensor_names: Vec<String>,
    pub road_sections: Vec<RoadSection>,
}

/// A contiguous run of sensors on one route/direction.
///
/// Arrives as `[id, direction, route, startIdx, endIdx]`; the range is
/// inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, sqlx::FromRow)]
#[serde(from = "RawRoadSection")]
pub struct RoadSection {
    // ---
    pub id: i64,
    pub direction: Option<String>,
    pub route: Option<String>,
    pub start_idx: i64,
    pub end_idx: i64,
}

#[derive(Deserialize)]
struct RawRoadSection(
    i64,
    #[serde(deserialize_with = "text_or_number")] Option<String>,
    #[serde(deserialize_with = "text_or_number")] Option<String>,
    i64,
    i64,
);

impl From<RawRoadSection> for RoadSection {
    fn from(raw: RawRoadSection) -> Self {
        let RawRoadSection(id, direction, route, start_idx, end_idx) = raw;
        RoadSection {
            id,
            direction,
            route,
            start_idx,
            end_idx,
        }
    }
}

impl RoadSection {
    pub fn covers(&self, idx: i64) -> bool {
        self.start_idx <= idx && idx <= self.end_idx
    }
}

fn text_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_text(&value))
}

// --- live and archived snapshots

/// Which positional layout a snapshot's incident records use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    /// `SoCalData.json` as served by the live endpoint.
    Live,
    /// The compact `{t, s, i}` blob written by the archiver.
    Compact,
}

impl SnapshotFormat {
    pub fn min_incident_fields(self) -> usize {
        match self {
            SnapshotFormat::Live => LIVE_INCIDENT_FIELDS,
            SnapshotFormat::Compact => COMPACT_INCIDENT_FIELDS,
        }
    }
}

/// A normalized snapshot ready for the recorder.
///
/// `speeds[i]` belongs to sensor index `i`; entries are never dropped or
/// reordered during decoding. Incidents stay raw until recording so that a
/// short record can be skipped without failing the batch.
#[derive(Debug, Clone)]
pub struct Snapshot {
    // ---
    pub format: SnapshotFormat,
    pub speeds: Vec<SpeedEntry>,
    pub incidents: Vec<RawIncident>,
}

/// Speed and incident references for a single sensor in one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeedEntry {
    // ---
    pub speed_mph: Option<i64>,
    pub has_incident: bool,
    pub incident_ids: Vec<i64>,
}

/// An incident record still in its positional wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawIncident(pub Vec<Value>);

#[derive(Deserialize)]
struct LiveDocument {
    speeds: Vec<Value>,
    #[serde(default)]
    incidents: Vec<Value>,
}

/// Archived snapshot blob: timestamp, `[speed, incidentRefs]` pairs and
/// `[id, location, description, startTime]` incidents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactSnapshot {
    // ---
    pub t: String,
    pub s: Vec<Value>,
    #[serde(default)]
    pub i: Vec<Value>,
}

impl Snapshot {
    /// Decode the live endpoint's document.
    pub fn from_live(document: Value) -> Result<Snapshot> {
        // ---
        let doc: LiveDocument = serde_json::from_value(document)
            .map_err(|e| Error::DataShape(format!("live snapshot: {e}")))?;

        Ok(Snapshot {
            format: SnapshotFormat::Live,
            speeds: doc.speeds.iter().map(SpeedEntry::from_value).collect(),
            incidents: doc.incidents.into_iter().map(raw_incident).collect(),
        })
    }

    /// Decode an archived blob, returning its capture timestamp alongside.
    pub fn from_compact(blob: CompactSnapshot) -> (String, Snapshot) {
        // ---
        let snapshot = Snapshot {
            format: SnapshotFormat::Compact,
            speeds: blob.s.iter().map(SpeedEntry::from_value).collect(),
            incidents: blob.i.into_iter().map(raw_incident).collect(),
        };
        (blob.t, snapshot)
    }

    /// Number of sensors reporting a speed in this snapshot.
    pub fn valid_speed_count(&self) -> usize {
        self.speeds.iter().filter(|s| s.speed_mph.is_some()).count()
    }

    /// Reduce a live snapshot to the archive blob layout.
    ///
    /// Incidents missing a field the blob carries are dropped.
    pub fn to_compact(&self, timestamp: &str) -> CompactSnapshot {
        // ---
        let s = self
            .speeds
            .iter()
            .map(|entry| {
                let refs: Vec<Value> = entry
                    .incident_ids
                    .iter()
                    .map(|id| Value::from(vec![Value::from(1), Value::from(*id)]))
                    .collect();
                Value::from(vec![
                    entry.speed_mph.map(Value::from).unwrap_or(Value::Null),
                    Value::from(refs),
                ])
            })
            .collect();

        let i = self
            .incidents
            .iter()
            .filter_map(|raw| raw.to_compact(self.format))
            .collect();

        CompactSnapshot {
            t: timestamp.to_string(),
            s,
            i,
        }
    }
}

fn raw_incident(value: Value) -> RawIncident {
    match value {
        Value::Array(fields) => RawIncident(fields),
        _ => RawIncident(Vec::new()),
    }
}

impl SpeedEntry {
    /// Decode one `speeds` element.
    ///
    /// Live entries are `[speed, _, refs, camera?]`, archived ones are
    /// `[speed, refs]`. Anything that is not an array becomes a no-data entry
    /// so positions stay aligned with sensor indexes.
    pub fn from_value(value: &Value) -> SpeedEntry {
        // ---
        let Some(fields) = value.as_array() else {
            return SpeedEntry::default();
        };

        let speed_mph = fields.first().and_then(value_int);
        let refs_slot = if fields.len() > 2 { 2 } else { 1 };
        let refs = fields
            .get(refs_slot)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let incident_ids = refs
            .iter()
            .filter_map(|r| r.as_array().and_then(|pair| pair.get(1)).and_then(value_int))
            .collect();

        SpeedEntry {
            speed_mph,
            has_incident: !refs.is_empty(),
            incident_ids,
        }
    }

    /// Build the reading row for sensor `idx` captured at `timestamp`.
    pub fn to_reading(&self, idx: i64, timestamp: &str) -> SpeedReading {
        // ---
        let incident_ids = if self.has_incident {
            serde_json::to_string(&self.incident_ids).ok()
        } else {
            None
        };

        SpeedReading {
            timestamp: timestamp.to_string(),
            sensor_idx: idx,
            speed_mph: self.speed_mph,
            has_incident: self.has_incident,
            incident_ids,
        }
    }
}

/// Incident fields extracted from either snapshot format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncidentRecord {
    // ---
    pub id: i64,
    pub road_section_id: Option<i64>,
    pub time_str: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub severity: Option<i64>,
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub start_time: Option<String>,
    pub update_time: Option<String>,
}

impl RawIncident {
    /// Extract the incident fields, failing on short or id-less records.
    pub fn parse(&self, format: SnapshotFormat) -> Result<IncidentRecord> {
        // ---
        let f = &self.0;
        let needed = format.min_incident_fields();
        if f.len() < needed {
            return Err(Error::DataShape(format!(
                "incident has {} fields, expected at least {}",
                f.len(),
                needed
            )));
        }

        let text = |i: usize| f.get(i).and_then(value_text);
        let int = |i: usize| f.get(i).and_then(value_int);
        let id_slot = match format {
            SnapshotFormat::Live => 1,
            SnapshotFormat::Compact => 0,
        };
        let id = int(id_slot).ok_or_else(|| {
            Error::DataShape(format!("incident id is not an integer: {}", f[id_slot]))
        })?;

        Ok(match format {
            SnapshotFormat::Live => IncidentRecord {
                id,
                road_section_id: int(0),
                time_str: text(2),
                location: text(3),
                description: text(4),
                severity: int(5),
                x: int(6),
                y: int(7),
                start_time: text(8),
                update_time: text(9),
            },
            SnapshotFormat::Compact => IncidentRecord {
                id,
                location: text(1),
                description: text(2),
                start_time: text(3),
                ..IncidentRecord::default()
            },
        })
    }

    /// The `[id, location, description, startTime]` blob form of this record.
    ///
    /// Only those four slots are read, so a live record without its trailing
    /// update time still archives.
    pub fn to_compact(&self, format: SnapshotFormat) -> Option<Value> {
        // ---
        let (id, location, description, start_time) = match format {
            SnapshotFormat::Live => (1, 3, 4, 8),
            SnapshotFormat::Compact => (0, 1, 2, 3),
        };
        let f = &self.0;
        if f.len() <= start_time {
            return None;
        }

        let text = |i: usize| f.get(i).and_then(value_text);
        let id = f.get(id).and_then(value_int)?;
        Some(serde_json::json!([id, text(location), text(description), text(start_time)]))
    }
}

fn value_int(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// --- stored rows

/// Sensor dimension row.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Sensor {
    // ---
    pub idx: i64,
    pub name: String,
    pub road_section_id: Option<i64>,
    pub direction: Option<String>,
    pub route: Option<String>,
}

/// One sensor's reading in one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SpeedReading {
    // ---
    pub timestamp: String,
    pub sensor_idx: i64,
    pub speed_mph: Option<i64>,
    pub has_incident: bool,
    pub incident_ids: Option<String>,
}

/// Stored incident with its observation window.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Incident {
    // ---
    pub id: i64,
    pub road_section_id: Option<i64>,
    pub time_str: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub severity: Option<i64>,
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub start_time: Option<String>,
    pub update_time: Option<String>,
    pub first_seen: String,
    pub last_seen: String,
}

impl IncidentRecord {
    /// Row for an incident observed for the first time at `timestamp`.
    pub fn first_observed(&self, timestamp: &str) -> Incident {
        // ---
        Incident {
            id: self.id,
            road_section_id: self.road_section_id,
            time_str: self.time_str.clone(),
            location: self.location.clone(),
            description: self.description.clone(),
            severity: self.severity,
            x: self.x,
            y: self.y,
            start_time: self.start_time.clone(),
            update_time: self.update_time.clone(),
            first_seen: timestamp.to_string(),
            last_seen: timestamp.to_string(),
        }
    }
}
