//! Runtime configuration for `sigalert-traffic`.
//!
//! Every setting comes from an environment variable (with optional `.env`
//! support provided by the caller) and has a default, so a bare
//! `sigalert-traffic scrape` works against `traffic.db` in the current
//! directory. Command-line flags may override individual values afterwards.
//!
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Weekday;

use crate::schedule::{HourRange, NonScrapeDayMode, Schedule};

pub const DEFAULT_STATIC_URL: &str =
    "https://cdn-static.sigalert.com/240/Zip/RegionInfo/SoCalStatic.json";
pub const DEFAULT_DATA_URL: &str = "https://www.sigalert.com/Data/SoCal/4~j/SoCalData.json";

/// Parse an optional environment variable of any `FromStr` type with a default value.
macro_rules! parse_env {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Read an optional string environment variable with a default value.
macro_rules! env_or {
    ($var_name:expr, $default:expr) => {
        env::var($var_name).unwrap_or_else(|_| $default.to_string())
    };
}

/// Strongly typed application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// SQLite connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Static metadata document (sensor names, road sections).
    pub static_url: String,

    /// Live snapshot document.
    pub data_url: String,

    /// Per-request timeout for both remote documents.
    pub http_timeout: Duration,

    /// Commute windows, scrape days and polling intervals.
    pub schedule: Schedule,

    /// Reject live snapshots whose speeds array does not match the sensor list.
    pub strict_sensor_count: bool,

    /// Average speed below which a sensor counts as a slowdown.
    pub slowdown_threshold_mph: f64,

    /// Root directory for archived snapshot blobs.
    pub archive_dir: PathBuf,

    /// Listen address for `serve`.
    pub bind_addr: SocketAddr,
}

fn parse_days(list: &str) -> Result<Vec<Weekday>> {
    // ---
    list.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| d.parse::<Weekday>().map_err(|_| anyhow!("Invalid SCRAPE_DAYS entry: '{}'", d)))
        .collect()
}

fn parse_bool(var_name: &str, default: bool) -> Result<bool> {
    // ---
    match env::var(var_name).ok().as_deref().map(str::trim) {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(anyhow!("Invalid {}: '{}'", var_name, other)),
    }
}

/// Load configuration from environment variables with defaults.
///
/// Optional:
/// - `DATABASE_URL` – SQLite connection string (default: `sqlite://traffic.db`)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `SIGALERT_STATIC_URL`, `SIGALERT_DATA_URL` – remote documents
/// - `HTTP_TIMEOUT_SECS` – request timeout (default: 30)
/// - `UTC_OFFSET_HOURS` – fixed local offset (default: -8)
/// - `PEAK_INTERVAL_SECS` / `OFF_PEAK_INTERVAL_SECS` / `NON_SCRAPE_RECHECK_SECS`
///   (defaults: 120 / 900 / 3600)
/// - `MORNING_WINDOW` / `EVENING_WINDOW` – local hour ranges (defaults: `5-10` / `15-20`)
/// - `SCRAPE_DAYS` – comma separated weekdays (default: `mon,tue,wed`)
/// - `SCRAPE_ALL_DAYS` – ignore `SCRAPE_DAYS` (default: false)
/// - `NON_SCRAPE_DAY_MODE` – `skip` or `poll` (default: `skip`)
/// - `STRICT_SENSOR_COUNT` – length check on live snapshots (default: true)
/// - `SLOWDOWN_THRESHOLD_MPH` – slowdown report threshold (default: 25)
/// - `ARCHIVE_DIR` – blob directory (default: `data-archive`)
/// - `BIND_ADDR` – query API listen address (default: `0.0.0.0:8080`)
///
/// Returns an error if any variable is set but invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let defaults = Schedule::default();

    let scrape_days = match env::var("SCRAPE_DAYS") {
        Ok(list) => parse_days(&list)?,
        Err(_) => defaults.scrape_days.clone(),
    };

    let schedule = Schedule {
        utc_offset_hours: parse_env!("UTC_OFFSET_HOURS", i32, defaults.utc_offset_hours),
        morning: parse_env!("MORNING_WINDOW", HourRange, defaults.morning),
        evening: parse_env!("EVENING_WINDOW", HourRange, defaults.evening),
        scrape_days,
        all_days: parse_bool("SCRAPE_ALL_DAYS", false)?,
        non_scrape_day_mode: parse_env!(
            "NON_SCRAPE_DAY_MODE",
            NonScrapeDayMode,
            defaults.non_scrape_day_mode
        ),
        peak_interval: Duration::from_secs(parse_env!("PEAK_INTERVAL_SECS", u64, 120)),
        off_peak_interval: Duration::from_secs(parse_env!("OFF_PEAK_INTERVAL_SECS", u64, 900)),
        non_scrape_recheck: Duration::from_secs(parse_env!("NON_SCRAPE_RECHECK_SECS", u64, 3600)),
    };

    Ok(Config {
        db_url: env_or!("DATABASE_URL", "sqlite://traffic.db"),
        db_pool_max: parse_env!("DB_POOL_MAX", u32, 5),
        static_url: env_or!("SIGALERT_STATIC_URL", DEFAULT_STATIC_URL),
        data_url: env_or!("SIGALERT_DATA_URL", DEFAULT_DATA_URL),
        http_timeout: Duration::from_secs(parse_env!("HTTP_TIMEOUT_SECS", u64, 30)),
        schedule,
        strict_sensor_count: parse_bool("STRICT_SENSOR_COUNT", true)?,
        slowdown_threshold_mph: parse_env!("SLOWDOWN_THRESHOLD_MPH", f64, 25.0),
        archive_dir: PathBuf::from(env_or!("ARCHIVE_DIR", "data-archive")),
        bind_addr: parse_env!("BIND_ADDR", SocketAddr, SocketAddr::from(([0, 0, 0, 0], 8080))),
    })
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    pub fn log_config(&self) {
        // ---
        let s = &self.schedule;
        let days = if s.all_days {
            "all".to_string()
        } else {
            s.scrape_days.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",")
        };

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL        : {}", self.db_url);
        tracing::info!("  DB_POOL_MAX         : {}", self.db_pool_max);
        tracing::info!("  SIGALERT_STATIC_URL : {}", self.static_url);
        tracing::info!("  SIGALERT_DATA_URL   : {}", self.data_url);
        tracing::info!("  HTTP_TIMEOUT_SECS   : {}", self.http_timeout.as_secs());
        tracing::info!("  UTC_OFFSET_HOURS    : {}", s.utc_offset_hours);
        tracing::info!("  MORNING_WINDOW      : {}-{}", s.morning.start, s.morning.end);
        tracing::info!("  EVENING_WINDOW      : {}-{}", s.evening.start, s.evening.end);
        tracing::info!("  SCRAPE_DAYS         : {} ({:?} otherwise)", days, s.non_scrape_day_mode);
        tracing::info!(
            "  INTERVALS           : peak {}s, off-peak {}s, recheck {}s",
            s.peak_interval.as_secs(),
            s.off_peak_interval.as_secs(),
            s.non_scrape_recheck.as_secs()
        );
        tracing::info!("  STRICT_SENSOR_COUNT : {}", self.strict_sensor_count);
        tracing::info!("  ARCHIVE_DIR         : {}", self.archive_dir.display());
        tracing::info!("  BIND_ADDR           : {}", self.bind_addr);
    }
}
