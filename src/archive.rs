//! Snapshot archive: compact JSON blobs on local disk, and replay of those
//! blobs through the recorder.
//!
//! Blobs live under `<dir>/data/{YYYY-MM-DD}/{HH}/{MMSS}.json`, keyed by the
//! UTC capture time.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Days, NaiveDate, Utc};

use crate::error::Result;
use crate::fetch::SnapshotSource;
use crate::models::{format_timestamp, CompactSnapshot, Snapshot};
use crate::recorder::record_snapshot;
use crate::store::TrafficStore;

// ---

/// Relative blob key for a capture time.
pub fn archive_key(now: DateTime<Utc>) -> String {
    now.format("data/%Y-%m-%d/%H/%M%S.json").to_string()
}

/// Write one blob under `dir`, creating parent directories as needed.
pub fn write_blob(dir: &Path, blob: &CompactSnapshot, now: DateTime<Utc>) -> Result<PathBuf> {
    // ---
    let path = dir.join(archive_key(now));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_vec(blob)?)?;
    Ok(path)
}

/// Fetch a live snapshot and archive it in compact form.
pub async fn archive_once<F: SnapshotSource>(
    source: &F,
    dir: &Path,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    // ---
    let snapshot = source.fetch_snapshot().await?;
    let blob = snapshot.to_compact(&format_timestamp(now));
    let path = write_blob(dir, &blob, now)?;
    tracing::info!(
        "Archived {} speeds, {} incidents to {}",
        blob.s.len(),
        blob.i.len(),
        path.display()
    );
    Ok(path)
}

/// Every `.json` blob under `dir/data`, optionally only one `YYYY-MM-DD`,
/// in key order.
pub fn blob_paths(dir: &Path, date: Option<&str>) -> Result<Vec<PathBuf>> {
    // ---
    let mut root = dir.join("data");
    if let Some(date) = date {
        root.push(date);
    }

    let mut paths = Vec::new();
    if root.is_dir() {
        collect_json(&root, &mut paths)?;
    }
    paths.sort();
    Ok(paths)
}

fn collect_json(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_json(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}

/// The last `days` UTC dates up to and including `today`, oldest first.
pub fn recent_dates(today: NaiveDate, days: u32) -> Vec<String> {
    // ---
    let mut dates: Vec<String> = (0..days)
        .map_while(|back| today.checked_sub_days(Days::new(u64::from(back))))
        .map(|date| date.format("%Y-%m-%d").to_string())
        .collect();
    dates.reverse();
    dates
}

/// Read a single archived blob.
pub fn read_blob(path: &Path) -> Result<CompactSnapshot> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub files: usize,
    pub recorded: usize,
    pub failed: usize,
    pub readings_written: u64,
}

/// Feed archived blobs through the recorder under their own timestamps.
///
/// `dates` limits the replay to those `YYYY-MM-DD` days, in the given order;
/// `None` replays every blob. A blob that cannot be read or recorded
/// is logged and counted; the rest of the replay continues. Replaying the
/// same blobs twice adds no readings.
pub async fn replay_dir<S: TrafficStore>(
    store: &S,
    dir: &Path,
    dates: Option<&[String]>,
) -> Result<ReplayReport> {
    // ---
    let paths = match dates {
        None => blob_paths(dir, None)?,
        Some(dates) => {
            let mut paths = Vec::new();
            for date in dates {
                paths.extend(blob_paths(dir, Some(date))?);
            }
            paths
        }
    };
    let mut report = ReplayReport {
        files: paths.len(),
        ..ReplayReport::default()
    };
    tracing::info!("Replaying {} archived snapshots from {}", paths.len(), dir.display());

    for path in &paths {
        let recorded = match read_blob(path) {
            Ok(blob) => {
                let (timestamp, snapshot) = Snapshot::from_compact(blob);
                record_snapshot(store, &snapshot, &timestamp, None).await
            }
            Err(e) => Err(e),
        };

        match recorded {
            Ok(r) => {
                report.recorded += 1;
                report.readings_written += r.readings_written;
                tracing::debug!(
                    "{}: {}/{} speeds",
                    path.display(),
                    r.valid_readings,
                    r.total_sensors
                );
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!("Skipping {}: {}", path.display(), e);
            }
        }
    }

    tracing::info!(
        "Replay done: {} recorded, {} failed, {} new readings",
        report.recorded,
        report.failed,
        report.readings_written
    );
    Ok(report)
}
