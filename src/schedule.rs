//! Time-of-day classifier driving the scrape interval.
//!
//! Local time is UTC shifted by a fixed number of hours; daylight saving is
//! not modelled.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

// ---

/// Scrape bucket for a moment in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    PeakMorning,
    PeakEvening,
    OffPeak,
    NonScrapeDay,
}

impl Window {
    pub fn label(self) -> &'static str {
        match self {
            Window::PeakMorning => "peak-morning",
            Window::PeakEvening => "peak-evening",
            Window::OffPeak => "off-peak",
            Window::NonScrapeDay => "non-scrape-day",
        }
    }

    pub fn is_peak(self) -> bool {
        matches!(self, Window::PeakMorning | Window::PeakEvening)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Half-open local hour range, `start <= hour < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourRange {
    pub start: u32,
    pub end: u32,
}

impl HourRange {
    pub fn contains(&self, hour: u32) -> bool {
        self.start <= hour && hour < self.end
    }
}

impl FromStr for HourRange {
    type Err = String;

    /// Parse `"5-10"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("expected START-END, got '{s}'"))?;
        let start: u32 = start
            .trim()
            .parse()
            .map_err(|e| format!("bad start hour '{start}': {e}"))?;
        let end: u32 = end.trim().parse().map_err(|e| format!("bad end hour '{end}': {e}"))?;
        if start >= end || end > 24 {
            return Err(format!("hour range {start}-{end} is empty or past 24"));
        }
        Ok(HourRange { start, end })
    }
}

/// What to do on a day outside the scrape set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonScrapeDayMode {
    /// Do not fetch; wake up every recheck interval to look at the clock.
    Skip,
    /// Keep fetching, at the recheck interval.
    Poll,
}

impl FromStr for NonScrapeDayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(NonScrapeDayMode::Skip),
            "poll" => Ok(NonScrapeDayMode::Poll),
            other => Err(format!("expected 'skip' or 'poll', got '{other}'")),
        }
    }
}

/// Where a moment falls in local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub window: Window,
    pub local_hour: u32,
    pub weekday: Weekday,
}

/// Decision for the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Fetch now, then sleep `interval`.
    Scrape { interval: Duration },
    /// Do not fetch; sleep and re-evaluate.
    Skip { sleep: Duration },
}

/// Polling schedule: commute windows, scrape days and intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    // ---
    pub utc_offset_hours: i32,
    pub morning: HourRange,
    pub evening: HourRange,
    pub scrape_days: Vec<Weekday>,
    pub all_days: bool,
    pub non_scrape_day_mode: NonScrapeDayMode,
    pub peak_interval: Duration,
    pub off_peak_interval: Duration,
    pub non_scrape_recheck: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule {
            utc_offset_hours: -8,
            morning: HourRange { start: 5, end: 10 },
            evening: HourRange { start: 15, end: 20 },
            scrape_days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed],
            all_days: false,
            non_scrape_day_mode: NonScrapeDayMode::Skip,
            peak_interval: Duration::from_secs(120),
            off_peak_interval: Duration::from_secs(900),
            non_scrape_recheck: Duration::from_secs(3600),
        }
    }
}

impl Schedule {
    /// Bucket `now` by local hour and local weekday.
    pub fn classify(&self, now: DateTime<Utc>) -> Classification {
        // ---
        let local = now.naive_utc() + chrono::Duration::hours(i64::from(self.utc_offset_hours));
        let local_hour = local.hour();
        let weekday = local.weekday();

        let window = if !self.all_days && !self.scrape_days.contains(&weekday) {
            Window::NonScrapeDay
        } else if self.morning.contains(local_hour) {
            Window::PeakMorning
        } else if self.evening.contains(local_hour) {
            Window::PeakEvening
        } else {
            Window::OffPeak
        };

        Classification {
            window,
            local_hour,
            weekday,
        }
    }

    pub fn interval(&self, window: Window) -> Duration {
        match window {
            Window::PeakMorning | Window::PeakEvening => self.peak_interval,
            Window::OffPeak => self.off_peak_interval,
            Window::NonScrapeDay => self.non_scrape_recheck,
        }
    }

    pub fn plan(&self, window: Window) -> Plan {
        // ---
        let interval = self.interval(window);
        match (window, self.non_scrape_day_mode) {
            (Window::NonScrapeDay, NonScrapeDayMode::Skip) => Plan::Skip { sleep: interval },
            _ => Plan::Scrape { interval },
        }
    }
}
