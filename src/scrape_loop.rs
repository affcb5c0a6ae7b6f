//! The scrape loop: classify, fetch, record, sleep, repeat.
//!
//! Loop state is an explicit [`LoopState`] value threaded through
//! [`run_cycle`], so a cycle can be driven with a fixed clock and a fake
//! source. A failed cycle never ends the loop; it sleeps the off-peak
//! interval and tries again.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::fetch::SnapshotSource;
use crate::models::format_timestamp;
use crate::recorder::{record_snapshot, RecordReport};
use crate::schedule::{Plan, Schedule, Window};
use crate::store::TrafficStore;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Recording,
    Sleeping(Duration),
    Stopped,
}

/// State carried from one cycle to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    pub phase: Phase,
    /// Last window announced in the log; changes are logged once.
    pub last_window: Option<Window>,
    pub cycles: u64,
    pub failures: u64,
}

impl Default for LoopState {
    fn default() -> Self {
        LoopState {
            phase: Phase::Idle,
            last_window: None,
            cycles: 0,
            failures: 0,
        }
    }
}

impl LoopState {
    pub fn sleep_for(&self) -> Option<Duration> {
        match self.phase {
            Phase::Sleeping(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    /// Reject snapshots whose speeds array differs from this length.
    pub expected_sensors: Option<usize>,
    /// Only log successful cycles at info level during peak windows.
    pub quiet: bool,
}

/// A recorded snapshot plus how long the fetch took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeReport {
    pub record: RecordReport,
    pub fetch_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Recorded(ScrapeReport),
    Failed(String),
    Skipped,
}

/// Fetch one snapshot and record it under `now`.
pub async fn scrape_once<S, F>(
    store: &S,
    source: &F,
    expected_sensors: Option<usize>,
    now: DateTime<Utc>,
) -> Result<ScrapeReport>
where
    S: TrafficStore,
    F: SnapshotSource,
{
    // ---
    let timestamp = format_timestamp(now);

    let started = Instant::now();
    let snapshot = source.fetch_snapshot().await?;
    let fetch_ms = started.elapsed().as_millis();

    let record = record_snapshot(store, &snapshot, &timestamp, expected_sensors).await?;
    Ok(ScrapeReport { record, fetch_ms })
}

/// Run one `Idle → Fetching → Recording → Sleeping` pass at time `now`.
///
/// The returned state is always `Sleeping`, carrying how long to wait.
pub async fn run_cycle<S, F>(
    store: &S,
    source: &F,
    schedule: &Schedule,
    options: &LoopOptions,
    mut state: LoopState,
    now: DateTime<Utc>,
) -> (LoopState, CycleOutcome)
where
    S: TrafficStore,
    F: SnapshotSource,
{
    // ---
    let class = schedule.classify(now);
    let plan = schedule.plan(class.window);

    if state.last_window != Some(class.window) {
        match plan {
            Plan::Scrape { interval } => tracing::info!(
                "Entering {} window ({:?} local {:02}:00, interval {}s)",
                class.window,
                class.weekday,
                class.local_hour,
                interval.as_secs()
            ),
            Plan::Skip { sleep } => tracing::info!(
                "{:?} is not a scrape day, checking again every {}s",
                class.weekday,
                sleep.as_secs()
            ),
        }
        state.last_window = Some(class.window);
    }

    let interval = match plan {
        Plan::Skip { sleep } => {
            state.phase = Phase::Sleeping(sleep);
            return (state, CycleOutcome::Skipped);
        }
        Plan::Scrape { interval } => interval,
    };

    state.phase = Phase::Fetching;
    let timestamp = format_timestamp(now);
    let started = Instant::now();
    let result = match source.fetch_snapshot().await {
        Ok(snapshot) => {
            let fetch_ms = started.elapsed().as_millis();
            state.phase = Phase::Recording;
            record_snapshot(store, &snapshot, &timestamp, options.expected_sensors)
                .await
                .map(|record| ScrapeReport { record, fetch_ms })
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(report) => {
            state.phase = Phase::Sleeping(interval);
            state.cycles += 1;
            let r = &report.record;
            if !options.quiet || class.window.is_peak() {
                tracing::info!(
                    "[{}] {}/{} speeds, {} incidents ({}ms)",
                    r.timestamp,
                    r.valid_readings,
                    r.total_sensors,
                    r.incidents,
                    report.fetch_ms
                );
            } else {
                tracing::debug!(
                    "[{}] {}/{} speeds, {} incidents ({}ms)",
                    r.timestamp,
                    r.valid_readings,
                    r.total_sensors,
                    r.incidents,
                    report.fetch_ms
                );
            }
            (state, CycleOutcome::Recorded(report))
        }
        Err(e) => {
            state.phase = Phase::Sleeping(schedule.off_peak_interval);
            state.failures += 1;
            if e.is_remote() {
                tracing::warn!("[{}] Request failed: {}", timestamp, e);
            } else {
                tracing::error!("[{}] Cycle failed: {}", timestamp, e);
            }
            (state, CycleOutcome::Failed(e.to_string()))
        }
    }
}

/// Drive cycles until `shutdown` resolves, then return the final state.
pub async fn run<S, F, D>(
    store: &S,
    source: &F,
    schedule: &Schedule,
    options: &LoopOptions,
    shutdown: D,
) -> LoopState
where
    S: TrafficStore,
    F: SnapshotSource,
    D: Future<Output = ()>,
{
    // ---
    tokio::pin!(shutdown);
    let mut state = LoopState::default();

    loop {
        let cycle = run_cycle(store, source, schedule, options, state.clone(), Utc::now());
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                state.phase = Phase::Stopped;
                break;
            }
            (next, _) = cycle => state = next,
        }

        let pause = state.sleep_for().unwrap_or(schedule.off_peak_interval);
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                state.phase = Phase::Stopped;
                break;
            }
            _ = tokio::time::sleep(pause) => state.phase = Phase::Idle,
        }
    }

    tracing::info!(
        "Scrape loop stopped after {} cycles ({} failed)",
        state.cycles,
        state.failures
    );
    state
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::error::Error;
    use crate::models::Snapshot;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Hands out queued results, counting calls.
    struct FakeSource {
        queue: Mutex<VecDeque<Result<Snapshot>>>,
        calls: Mutex<u32>,
    }

    impl FakeSource {
        fn with(results: Vec<Result<Snapshot>>) -> Self {
            FakeSource {
                queue: Mutex::new(results.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl SnapshotSource for FakeSource {
        async fn fetch_snapshot(&self) -> Result<Snapshot> {
            *self.calls.lock().unwrap() += 1;
            self.queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::DataShape("no snapshot queued".into())))
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot::from_live(json!({
            "speeds": [[61, null, []], [null, null, []]],
            "incidents": [[1, 9, "7:00", "I-405 S", "Crash", 1, 0, 0, "s", "u"]]
        }))
        .unwrap()
    }

    // Tuesday 2026-01-13, 07:00 and 13:00 local
    fn tuesday_peak() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 13, 15, 0, 0).unwrap()
    }

    fn tuesday_midday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 13, 21, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_successful_cycle_sleeps_window_interval() {
        // ---
        let store = MemoryStore::new();
        let source = FakeSource::with(vec![Ok(snapshot())]);
        let schedule = Schedule::default();

        let (state, outcome) = run_cycle(
            &store,
            &source,
            &schedule,
            &LoopOptions::default(),
            LoopState::default(),
            tuesday_peak(),
        )
        .await;

        assert_eq!(state.phase, Phase::Sleeping(schedule.peak_interval));
        assert_eq!(state.cycles, 1);
        assert_eq!(state.last_window, Some(Window::PeakMorning));
        let CycleOutcome::Recorded(report) = outcome else {
            panic!("expected a recorded cycle, got {outcome:?}");
        };
        assert_eq!(report.record.timestamp, "2026-01-13T15:00:00Z");
        assert_eq!(report.record.valid_readings, 1);
        assert_eq!(store.readings().len(), 2);
        assert_eq!(store.incident(9).unwrap().first_seen, "2026-01-13T15:00:00Z");
    }

    #[tokio::test]
    async fn test_failed_fetch_falls_back_to_off_peak() {
        // ---
        let store = MemoryStore::new();
        let source = FakeSource::with(vec![
            Err(Error::RemoteStatus {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                url: "http://upstream/live".into(),
            }),
            Ok(snapshot()),
        ]);
        let schedule = Schedule::default();
        let options = LoopOptions::default();

        let fresh = LoopState::default();
        let (state, outcome) =
            run_cycle(&store, &source, &schedule, &options, fresh, tuesday_peak()).await;
        assert!(matches!(outcome, CycleOutcome::Failed(_)));
        assert_eq!(state.phase, Phase::Sleeping(schedule.off_peak_interval));
        assert_eq!(state.failures, 1);
        assert!(store.readings().is_empty());

        // the next cycle carries on
        let (state, outcome) =
            run_cycle(&store, &source, &schedule, &options, state, tuesday_peak()).await;
        assert!(matches!(outcome, CycleOutcome::Recorded(_)));
        assert_eq!(state.cycles, 1);
        assert_eq!(state.failures, 1);
    }

    #[tokio::test]
    async fn test_record_failure_is_contained() {
        // ---
        let store = MemoryStore::new();
        let source = FakeSource::with(vec![Ok(snapshot())]);
        let schedule = Schedule::default();
        let options = LoopOptions {
            expected_sensors: Some(5),
            quiet: false,
        };

        let fresh = LoopState::default();
        let (state, outcome) =
            run_cycle(&store, &source, &schedule, &options, fresh, tuesday_midday()).await;
        assert!(matches!(outcome, CycleOutcome::Failed(ref msg) if msg.contains("speed entries")));
        assert_eq!(state.phase, Phase::Sleeping(schedule.off_peak_interval));
        assert!(store.readings().is_empty());
    }

    #[tokio::test]
    async fn test_non_scrape_day_does_not_fetch() {
        // ---
        let store = MemoryStore::new();
        let source = FakeSource::with(vec![Ok(snapshot())]);
        let schedule = Schedule::default();
        let saturday = Utc.with_ymd_and_hms(2026, 1, 17, 16, 0, 0).unwrap();

        let (state, outcome) = run_cycle(
            &store,
            &source,
            &schedule,
            &LoopOptions::default(),
            LoopState::default(),
            saturday,
        )
        .await;

        assert_eq!(outcome, CycleOutcome::Skipped);
        assert_eq!(state.phase, Phase::Sleeping(schedule.non_scrape_recheck));
        assert_eq!(state.last_window, Some(Window::NonScrapeDay));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        // ---
        let store = MemoryStore::new();
        let source = FakeSource::with(vec![Ok(snapshot())]);
        let mut schedule = Schedule::default();
        schedule.all_days = true;

        let state = run(
            &store,
            &source,
            &schedule,
            &LoopOptions::default(),
            std::future::ready(()),
        )
        .await;

        assert_eq!(state.phase, Phase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_records_then_sleeps_until_shutdown() {
        // ---
        let store = MemoryStore::new();
        let source = FakeSource::with(vec![Ok(snapshot())]);
        let mut schedule = Schedule::default();
        schedule.all_days = true;

        let shutdown = tokio::time::sleep(Duration::from_secs(3600));
        let state = run(&store, &source, &schedule, &LoopOptions::default(), shutdown).await;

        assert_eq!(state.phase, Phase::Stopped);
        assert_eq!(state.cycles, 1);
        assert!(state.failures >= 1, "later cycles find an empty queue");
        assert!(source.calls() >= 2);
        assert_eq!(store.readings().len(), 2);
    }
}
