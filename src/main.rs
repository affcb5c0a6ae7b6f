//! Command-line entry point for `sigalert-traffic`.
//!
//! Startup order is the same for every subcommand:
//! - Load `.env` and the environment into [`Config`]
//! - Initialize structured logging/tracing
//! - Open the SQLite store (creating the schema if needed)
//! - Hand off to the subcommand
//!
//! # Environment Variables
//! - `TRAFFIC_LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `TRAFFIC_SPAN_EVENTS` (optional) – span event mode for tracing
//! - see `config.rs` for the application settings
//!
//! Reports (`analyze`, `commute`) print to stdout; logs go to stderr.
use std::{env, net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use sigalert_traffic::archive::{archive_once, recent_dates, replay_dir};
use sigalert_traffic::commute::{best_departure_times, commute_status, CommuteDirection};
use sigalert_traffic::fetch::SigalertClient;
use sigalert_traffic::query;
use sigalert_traffic::recorder::populate_sensors;
use sigalert_traffic::routes;
use sigalert_traffic::scrape_loop::{self, LoopOptions};
use sigalert_traffic::store::SqliteStore;
use sigalert_traffic::{config, Config};

// ---

#[derive(Debug, Parser)]
#[command(
    name = "sigalert-traffic",
    version,
    about = "Record and analyze Sigalert SoCal freeway speeds"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll the live feed on the commute schedule and record every snapshot.
    Scrape {
        /// Treat every weekday as a scrape day.
        #[arg(long)]
        all_days: bool,
        /// Log successful cycles at info level only during peak windows.
        #[arg(long)]
        quiet: bool,
        /// Record a single snapshot and exit.
        #[arg(long)]
        once: bool,
    },
    /// Fetch one live snapshot and store it as a compact blob.
    Archive {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Record archived blobs into the database.
    Replay {
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Only replay one day, `YYYY-MM-DD`.
        #[arg(long)]
        date: Option<String>,
        /// Only replay the last N days (UTC), oldest first.
        #[arg(long, conflicts_with = "date")]
        days: Option<u32>,
    },
    /// Print database stats, route averages, slowdowns and incidents.
    Analyze {
        #[arg(long, default_value_t = 1.0)]
        hours: f64,
    },
    /// Rank the commute routes by current estimated travel time.
    Commute {
        /// `morning` or `evening`; defaults by local time of day.
        #[arg(long)]
        direction: Option<CommuteDirection>,
        #[arg(long)]
        json: bool,
        /// Include hourly history and best departure time.
        #[arg(long)]
        history: bool,
        #[arg(long, default_value_t = 4)]
        weeks: u32,
    },
    /// Write one route's readings to CSV.
    Export {
        #[arg(long)]
        route: String,
        #[arg(long)]
        direction: String,
        #[arg(long, default_value_t = 24.0)]
        hours: f64,
        #[arg(long)]
        out: PathBuf,
    },
    /// Serve the read-only HTTP query API.
    Serve {
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut cfg = config::load_from_env()?;

    match cli.command {
        Command::Scrape {
            all_days,
            quiet,
            once,
        } => {
            cfg.schedule.all_days |= all_days;
            cfg.log_config();
            scrape(&cfg, quiet, once).await
        }
        Command::Archive { dir } => {
            let dir = dir.unwrap_or_else(|| cfg.archive_dir.clone());
            let client = sigalert_client(&cfg)?;
            archive_once(&client, &dir, Utc::now()).await?;
            Ok(())
        }
        Command::Replay { dir, date, days } => {
            let dir = dir.unwrap_or_else(|| cfg.archive_dir.clone());
            let dates = match (date, days) {
                (Some(date), _) => Some(vec![date]),
                (None, Some(days)) => Some(recent_dates(Utc::now().date_naive(), days)),
                (None, None) => None,
            };
            let store = open_store(&cfg).await?;
            let report = replay_dir(&store, &dir, dates.as_deref()).await;
            store.close().await;
            let report = report?;
            println!(
                "Replayed {} of {} blobs ({} failed), {} new readings",
                report.recorded, report.files, report.failed, report.readings_written
            );
            Ok(())
        }
        Command::Analyze { hours } => {
            let store = open_store(&cfg).await?;
            let result = analyze(&store, &cfg, hours).await;
            store.close().await;
            result
        }
        Command::Commute {
            direction,
            json,
            history,
            weeks,
        } => {
            let store = open_store(&cfg).await?;
            let result = commute(&store, &cfg, direction, json, history, weeks).await;
            store.close().await;
            result
        }
        Command::Export {
            route,
            direction,
            hours,
            out,
        } => {
            let store = open_store(&cfg).await?;
            let now = Utc::now();
            let written =
                query::export_route_csv(store.pool(), &route, &direction, hours, now, &out).await;
            store.close().await;
            println!("Wrote {} rows to {}", written?, out.display());
            Ok(())
        }
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.bind_addr = bind;
            }
            cfg.log_config();
            serve(cfg).await
        }
    }
}

// ---

async fn open_store(cfg: &Config) -> Result<SqliteStore> {
    // ---
    tracing::info!("Opening database: {}", cfg.db_url);
    SqliteStore::connect(&cfg.db_url, cfg.db_pool_max)
        .await
        .with_context(|| format!("Failed to open database '{}'", cfg.db_url))
}

fn sigalert_client(cfg: &Config) -> Result<SigalertClient> {
    SigalertClient::new(&cfg.static_url, &cfg.data_url, cfg.http_timeout)
        .context("Failed to build HTTP client")
}

/// Resolve on Ctrl-C. If the handler cannot be installed, never resolve.
async fn shutdown_signal() {
    // ---
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown requested"),
        Err(e) => {
            tracing::error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await
        }
    }
}

async fn scrape(cfg: &Config, quiet: bool, once: bool) -> Result<()> {
    // ---
    let store = open_store(cfg).await?;
    let client = sigalert_client(cfg)?;

    let meta = client
        .load_static_metadata()
        .await
        .context("Failed to load static sensor metadata")?;
    populate_sensors(&store, &meta).await?;

    let options = LoopOptions {
        expected_sensors: cfg.strict_sensor_count.then_some(meta.sensor_names.len()),
        quiet,
    };

    if once {
        let report =
            scrape_loop::scrape_once(&store, &client, options.expected_sensors, Utc::now()).await;
        store.close().await;
        let report = report?;
        let r = &report.record;
        println!(
            "[{}] {}/{} speeds, {} incidents ({}ms)",
            r.timestamp, r.valid_readings, r.total_sensors, r.incidents, report.fetch_ms
        );
        return Ok(());
    }

    scrape_loop::run(&store, &client, &cfg.schedule, &options, shutdown_signal()).await;
    store.close().await;
    Ok(())
}

async fn analyze(store: &SqliteStore, cfg: &Config, hours: f64) -> Result<()> {
    // ---
    let pool = store.pool();
    let now = Utc::now();

    let stats = query::data_stats(pool).await?;
    println!("== Data ==");
    println!("  readings      : {}", stats.total_readings);
    println!("  sensors       : {}", stats.sensor_count);
    println!("  incidents     : {}", stats.incident_count);
    println!(
        "  range         : {} .. {}",
        stats.first_reading.as_deref().unwrap_or("-"),
        stats.last_reading.as_deref().unwrap_or("-")
    );
    println!("  days          : {}", stats.days_of_data);
    if let Some(rate) = stats.readings_per_hour {
        println!("  readings/hour : {}", rate);
    }

    println!("\n== Route averages (last {hours}h) ==");
    for route in query::list_routes(pool).await? {
        let direction = route.direction.as_deref().unwrap_or("");
        let avg = query::average_speed(pool, &route.route, direction, hours, now).await?;
        match avg {
            Some(avg) => println!(
                "  {:>5} {:<6} {:>5.1} mph  ({} sensors)",
                route.route, direction, avg, route.sensor_count
            ),
            None => println!(
                "  {:>5} {:<6}   n/a      ({} sensors)",
                route.route, direction, route.sensor_count
            ),
        }
    }

    let threshold = cfg.slowdown_threshold_mph;
    let slowdowns = query::find_slowdowns(pool, threshold, hours, now).await?;
    println!("\n== Slowdowns below {threshold} mph ({}) ==", slowdowns.len());
    for s in slowdowns.iter().take(20) {
        println!(
            "  {:>5.1} mph  {} {} {}",
            s.avg_speed,
            s.route.as_deref().unwrap_or("?"),
            s.direction.as_deref().unwrap_or(""),
            s.name
        );
    }

    let incidents = query::recent_incidents(pool, 24.0, now).await?;
    println!("\n== Incidents first seen in the last 24h ({}) ==", incidents.len());
    for i in incidents.iter().take(10) {
        println!(
            "  #{} {} - {}",
            i.id,
            i.location.as_deref().unwrap_or("?"),
            i.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn commute(
    store: &SqliteStore,
    cfg: &Config,
    direction: Option<CommuteDirection>,
    json: bool,
    history: bool,
    weeks: u32,
) -> Result<()> {
    // ---
    let pool = store.pool();
    let now = Utc::now();
    let local = cfg.schedule.classify(now);
    let direction = direction.unwrap_or_else(|| CommuteDirection::for_local_hour(local.local_hour));

    let status = commute_status(pool, direction, 0.5, now).await?;
    let departures = if history {
        best_departure_times(
            pool,
            direction,
            Some(local.weekday),
            weeks,
            cfg.schedule.utc_offset_hours,
            now,
        )
        .await?
    } else {
        Vec::new()
    };

    if json {
        let body = serde_json::json!({
            "direction": direction,
            "routes": status,
            "departures": departures,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("== {:?} commute, ranked by current travel time ==", direction);
    for (rank, route) in status.iter().enumerate() {
        match route.total_time_mins {
            Some(mins) => println!(
                "  {}. {:<14} {:>5.1} min  avg {:>5.1} mph, min {:>5.1} mph",
                rank + 1,
                route.route,
                mins,
                route.avg_speed.unwrap_or(0.0),
                route.min_speed.unwrap_or(0.0)
            ),
            None => println!("  {}. {:<14}   no data", rank + 1, route.route),
        }
        for seg in &route.segments {
            match seg.time_mins {
                Some(mins) => println!(
                    "       {:<10} {:>5.1} min ({} sensors)",
                    seg.segment, mins, seg.sensors
                ),
                None => println!("       {:<10}   no data", seg.segment),
            }
        }
    }

    if history {
        println!("\n== {:?} departures over the last {} weeks ==", local.weekday, weeks);
        for summary in &departures {
            let best = summary
                .best()
                .map(|b| format!("best {:02}:00 ({:.1} min)", b.hour, b.est_time_mins))
                .unwrap_or_else(|| "no history".to_string());
            println!("  {:<14} {}", summary.route, best);
            for slot in &summary.slots {
                println!(
                    "       {:02}:00  {:>5.1} mph  {:>5.1} min",
                    slot.hour, slot.avg_speed, slot.est_time_mins
                );
            }
        }
    }
    Ok(())
}

async fn serve(cfg: Config) -> Result<()> {
    // ---
    let store = open_store(&cfg).await?;
    let addr = cfg.bind_addr;
    let app = routes::router(store.pool().clone(), cfg);

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    Ok(())
}

/// Initialize the global tracing subscriber for structured logging.
///
/// - Color output controlled by TTY detection and `FORCE_COLOR`:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY on stderr
/// - Span event emission mode controlled by `TRAFFIC_SPAN_EVENTS`:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level from `RUST_LOG` if set, otherwise `TRAFFIC_LOG_LEVEL`
fn init_tracing() {
    // ---
    let span_events = match env::var("TRAFFIC_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stderr().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("TRAFFIC_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
