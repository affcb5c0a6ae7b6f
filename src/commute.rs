//! Commute travel-time estimates for Culver City <-> Port of Long Beach.
//!
//! A route is an ordered list of segments, each a sensor index range on one
//! freeway direction. Sensors are treated as evenly spaced, so a route's time
//! is the sum of `MILES_PER_SENSOR / speed` over sensors with a usable
//! average.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc, Weekday};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::query::cutoff;

// ---

/// Approximate spacing between consecutive sensors.
pub const MILES_PER_SENSOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub route: &'static str,
    pub direction: &'static str,
    pub start_idx: i64,
    pub end_idx: i64,
}

impl Segment {
    pub const fn new(
        route: &'static str,
        direction: &'static str,
        start_idx: i64,
        end_idx: i64,
    ) -> Self {
        Segment {
            route,
            direction,
            start_idx,
            end_idx,
        }
    }

    pub fn sensor_count(&self) -> i64 {
        self.end_idx - self.start_idx + 1
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.route, self.direction)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommuteRoute {
    pub name: &'static str,
    pub segments: &'static [Segment],
}

/// Culver City to the port.
pub const MORNING_ROUTES: &[CommuteRoute] = &[
    CommuteRoute {
        name: "405→710",
        segments: &[
            Segment::new("405", "South", 5789, 5816),
            Segment::new("710", "West", 5949, 5956),
        ],
    },
    CommuteRoute {
        name: "405→105→710",
        segments: &[
            Segment::new("405", "South", 5789, 5800),
            Segment::new("105", "East", 4754, 4768),
            Segment::new("710", "West", 5949, 5956),
        ],
    },
    CommuteRoute {
        name: "10→110→710",
        segments: &[
            Segment::new("10", "East", 1537, 1551),
            Segment::new("110", "South", 4825, 4873),
            Segment::new("710", "West", 5949, 5956),
        ],
    },
];

/// The port back to Culver City.
pub const EVENING_ROUTES: &[CommuteRoute] = &[
    CommuteRoute {
        name: "710→405",
        segments: &[
            Segment::new("710", "East", 5924, 5930),
            Segment::new("405", "North", 5709, 5736),
        ],
    },
    CommuteRoute {
        name: "710→105→405",
        segments: &[
            Segment::new("710", "East", 5924, 5930),
            Segment::new("105", "West", 4781, 4795),
            Segment::new("405", "North", 5730, 5736),
        ],
    },
    CommuteRoute {
        name: "710→110→10",
        segments: &[
            Segment::new("710", "East", 5924, 5930),
            Segment::new("110", "North", 4776, 4824),
            Segment::new("10", "West", 1981, 1993),
        ],
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommuteDirection {
    Morning,
    Evening,
}

impl CommuteDirection {
    pub fn routes(self) -> &'static [CommuteRoute] {
        match self {
            CommuteDirection::Morning => MORNING_ROUTES,
            CommuteDirection::Evening => EVENING_ROUTES,
        }
    }

    /// Local departure hours worth comparing.
    pub fn departure_hours(self) -> std::ops::RangeInclusive<u32> {
        match self {
            CommuteDirection::Morning => 5..=10,
            CommuteDirection::Evening => 15..=20,
        }
    }

    /// Which commute a local hour belongs to; off-hours show the morning one.
    pub fn for_local_hour(hour: u32) -> Self {
        if (15..=20).contains(&hour) {
            CommuteDirection::Evening
        } else {
            CommuteDirection::Morning
        }
    }
}

impl FromStr for CommuteDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "morning" => Ok(CommuteDirection::Morning),
            "evening" => Ok(CommuteDirection::Evening),
            other => Err(format!("expected 'morning' or 'evening', got '{other}'")),
        }
    }
}

/// Travel time over a set of sensor speeds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TravelEstimate {
    pub minutes: Option<f64>,
    pub avg_speed: Option<f64>,
    pub min_speed: Option<f64>,
    pub sensors: usize,
}

/// Sum per-sensor travel times, ignoring missing or non-positive speeds.
pub fn estimate_travel_time(speeds: &[f64], miles_per_sensor: f64) -> TravelEstimate {
    // ---
    let valid: Vec<f64> = speeds.iter().copied().filter(|s| *s > 0.0).collect();
    if valid.is_empty() {
        return TravelEstimate {
            minutes: None,
            avg_speed: None,
            min_speed: None,
            sensors: speeds.len(),
        };
    }

    let minutes = valid.iter().map(|speed| miles_per_sensor / speed * 60.0).sum();
    let avg = valid.iter().sum::<f64>() / valid.len() as f64;
    let min = valid.iter().copied().fold(f64::INFINITY, f64::min);

    TravelEstimate {
        minutes: Some(minutes),
        avg_speed: Some(avg),
        min_speed: Some(min),
        sensors: valid.len(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentReport {
    pub segment: String,
    pub sensors: usize,
    pub time_mins: Option<f64>,
    pub avg_speed: Option<f64>,
    pub min_speed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteReport {
    pub route: String,
    pub total_time_mins: Option<f64>,
    pub avg_speed: Option<f64>,
    pub min_speed: Option<f64>,
    pub segments: Vec<SegmentReport>,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Trailing per-sensor average speeds along one segment.
pub async fn segment_speeds(
    pool: &SqlitePool,
    segment: &Segment,
    hours: f64,
    now: DateTime<Utc>,
) -> Result<Vec<f64>> {
    // ---
    let rows: Vec<(i64, f64)> = sqlx::query_as(
        r#"
        SELECT r.sensor_idx, AVG(r.speed_mph) AS avg_speed
        FROM speed_readings r
        JOIN sensors s ON r.sensor_idx = s.idx
        WHERE s.route = ? AND s.direction = ?
          AND r.sensor_idx BETWEEN ? AND ?
          AND r.timestamp > ?
          AND r.speed_mph IS NOT NULL
        GROUP BY r.sensor_idx
        ORDER BY r.sensor_idx
        "#,
    )
    .bind(segment.route)
    .bind(segment.direction)
    .bind(segment.start_idx)
    .bind(segment.end_idx)
    .bind(cutoff(now, hours))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(_, speed)| speed).collect())
}

/// Estimate one route from the last `hours` of readings.
pub async fn analyze_route(
    pool: &SqlitePool,
    route: &CommuteRoute,
    hours: f64,
    now: DateTime<Utc>,
) -> Result<RouteReport> {
    // ---
    let mut total_time = 0.0;
    let mut have_time = false;
    let mut all_speeds = Vec::new();
    let mut segments = Vec::with_capacity(route.segments.len());

    for segment in route.segments {
        let speeds = segment_speeds(pool, segment, hours, now).await?;
        let estimate = estimate_travel_time(&speeds, MILES_PER_SENSOR);

        if let Some(minutes) = estimate.minutes {
            total_time += minutes;
            have_time = true;
            all_speeds.extend(speeds.iter().copied().filter(|s| *s > 0.0));
        }

        segments.push(SegmentReport {
            segment: segment.to_string(),
            sensors: estimate.sensors,
            time_mins: estimate.minutes.map(round1),
            avg_speed: estimate.avg_speed.map(round1),
            min_speed: estimate.min_speed.map(round1),
        });
    }

    let overall = estimate_travel_time(&all_speeds, MILES_PER_SENSOR);
    Ok(RouteReport {
        route: route.name.to_string(),
        total_time_mins: have_time.then(|| round1(total_time)),
        avg_speed: overall.avg_speed.map(round1),
        min_speed: overall.min_speed.map(round1),
        segments,
    })
}

/// Current estimates for every route of a commute, fastest first.
///
/// Routes without any data sort last.
pub async fn commute_status(
    pool: &SqlitePool,
    direction: CommuteDirection,
    hours: f64,
    now: DateTime<Utc>,
) -> Result<Vec<RouteReport>> {
    // ---
    let mut reports = Vec::new();
    for route in direction.routes() {
        reports.push(analyze_route(pool, route, hours, now).await?);
    }
    reports.sort_by(|a, b| {
        let a = a.total_time_mins.unwrap_or(f64::INFINITY);
        let b = b.total_time_mins.unwrap_or(f64::INFINITY);
        a.total_cmp(&b)
    });
    Ok(reports)
}

/// Speed statistics for one local (weekday, hour) bucket.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct HourlySpeed {
    /// Local weekday, `0` = Sunday.
    pub dow: String,
    /// Local hour, two digits.
    pub hour: String,
    pub avg_speed: f64,
    pub min_speed: i64,
    pub readings: i64,
}

/// Historical speeds on a segment grouped by local weekday and hour.
pub async fn hourly_pattern(
    pool: &SqlitePool,
    segment: &Segment,
    weekday: Option<Weekday>,
    hour: Option<u32>,
    weeks_back: u32,
    utc_offset_hours: i32,
    now: DateTime<Utc>,
) -> Result<Vec<HourlySpeed>> {
    // ---
    let shift = format!("{utc_offset_hours:+} hours");
    let dow = weekday.map(|d| d.num_days_from_sunday().to_string());
    let hour = hour.map(|h| format!("{h:02}"));

    let rows = sqlx::query_as(
        r#"
        SELECT strftime('%w', r.timestamp, ?1) AS dow,
               strftime('%H', r.timestamp, ?1) AS hour,
               AVG(r.speed_mph) AS avg_speed,
               MIN(r.speed_mph) AS min_speed,
               COUNT(*) AS readings
        FROM speed_readings r
        JOIN sensors s ON r.sensor_idx = s.idx
        WHERE s.route = ?2 AND s.direction = ?3
          AND r.sensor_idx BETWEEN ?4 AND ?5
          AND r.timestamp > ?6
          AND r.speed_mph IS NOT NULL
          AND (?7 IS NULL OR strftime('%w', r.timestamp, ?1) = ?7)
          AND (?8 IS NULL OR strftime('%H', r.timestamp, ?1) = ?8)
        GROUP BY dow, hour
        ORDER BY dow, hour
        "#,
    )
    .bind(shift)
    .bind(segment.route)
    .bind(segment.direction)
    .bind(segment.start_idx)
    .bind(segment.end_idx)
    .bind(cutoff(now, f64::from(weeks_back) * 7.0 * 24.0))
    .bind(dow)
    .bind(hour)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartureSlot {
    pub hour: u32,
    pub avg_speed: f64,
    pub est_time_mins: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartureSummary {
    pub route: String,
    pub slots: Vec<DepartureSlot>,
}

impl DepartureSummary {
    /// The slot with the shortest estimated trip.
    pub fn best(&self) -> Option<&DepartureSlot> {
        self.slots
            .iter()
            .min_by(|a, b| a.est_time_mins.total_cmp(&b.est_time_mins))
    }
}

/// Hour-by-hour estimated trip times from the last `weeks_back` weeks.
pub async fn best_departure_times(
    pool: &SqlitePool,
    direction: CommuteDirection,
    weekday: Option<Weekday>,
    weeks_back: u32,
    utc_offset_hours: i32,
    now: DateTime<Utc>,
) -> Result<Vec<DepartureSummary>> {
    // ---
    let mut summaries = Vec::new();

    for route in direction.routes() {
        let route_sensors: i64 = route.segments.iter().map(Segment::sensor_count).sum();
        let mut slots = Vec::new();

        for hour in direction.departure_hours() {
            let mut segment_avgs = Vec::new();
            for segment in route.segments {
                let pattern = hourly_pattern(
                    pool,
                    segment,
                    weekday,
                    Some(hour),
                    weeks_back,
                    utc_offset_hours,
                    now,
                )
                .await?;
                if !pattern.is_empty() {
                    let total: f64 = pattern.iter().map(|p| p.avg_speed).sum();
                    let avg = total / pattern.len() as f64;
                    segment_avgs.push(avg);
                }
            }

            if segment_avgs.is_empty() {
                continue;
            }
            let avg = segment_avgs.iter().sum::<f64>() / segment_avgs.len() as f64;
            if avg <= 0.0 {
                continue;
            }
            slots.push(DepartureSlot {
                hour,
                avg_speed: round1(avg),
                est_time_mins: round1(route_sensors as f64 * MILES_PER_SENSOR / avg * 60.0),
            });
        }

        summaries.push(DepartureSummary {
            route: route.name.to_string(),
            slots,
        });
    }

    Ok(summaries)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::query::tests::{now, seeded};

    const TEST_ROUTE: CommuteRoute = CommuteRoute {
        name: "test",
        segments: &[Segment::new("405", "South", 0, 1), Segment::new("405", "North", 2, 2)],
    };

    #[test]
    fn test_estimate_travel_time() {
        // ---
        let est = estimate_travel_time(&[60.0, 30.0, 0.0], MILES_PER_SENSOR);
        assert_eq!(est.minutes, Some(1.5));
        assert_eq!(est.avg_speed, Some(45.0));
        assert_eq!(est.min_speed, Some(30.0));
        assert_eq!(est.sensors, 2);

        let none = estimate_travel_time(&[0.0], MILES_PER_SENSOR);
        assert_eq!(none.minutes, None);
        assert_eq!(none.sensors, 1);
    }

    #[test]
    fn test_direction_helpers() {
        // ---
        assert_eq!("Evening".parse::<CommuteDirection>().unwrap(), CommuteDirection::Evening);
        assert!("noon".parse::<CommuteDirection>().is_err());
        assert_eq!(CommuteDirection::for_local_hour(17), CommuteDirection::Evening);
        assert_eq!(CommuteDirection::for_local_hour(23), CommuteDirection::Morning);
        assert_eq!(MORNING_ROUTES.len(), 3);
        assert_eq!(EVENING_ROUTES[0].segments[1].sensor_count(), 28);
    }

    #[tokio::test]
    async fn test_analyze_route_skips_segments_without_data() {
        // ---
        let store = seeded().await;
        let report = analyze_route(store.pool(), &TEST_ROUTE, 0.5, now()).await.unwrap();

        // only the 15:45 snapshot is inside 30 minutes: 50 and 10 mph
        assert_eq!(report.total_time_mins, Some(3.6));
        assert_eq!(report.avg_speed, Some(30.0));
        assert_eq!(report.min_speed, Some(10.0));
        assert_eq!(report.segments.len(), 2);
        assert_eq!(report.segments[0].segment, "405 South");
        assert_eq!(report.segments[1].time_mins, None);
    }

    #[tokio::test]
    async fn test_commute_status_without_data() {
        // ---
        let store = seeded().await;
        let reports = commute_status(store.pool(), CommuteDirection::Morning, 0.5, now())
            .await
            .unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.total_time_mins.is_none()));
    }

    #[tokio::test]
    async fn test_hourly_pattern_uses_local_time() {
        // ---
        let store = seeded().await;
        let segment = TEST_ROUTE.segments[0];

        let rows = hourly_pattern(store.pool(), &segment, Some(Weekday::Tue), Some(7), 4, -8, now())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].dow, "2");
        assert_eq!(rows[0].hour, "07");
        assert_eq!(rows[0].avg_speed, 35.0);
        assert_eq!(rows[0].min_speed, 10);
        assert_eq!(rows[0].readings, 4);

        let all = hourly_pattern(store.pool(), &segment, None, None, 4, -8, now()).await.unwrap();
        assert_eq!(all.iter().map(|r| r.hour.as_str()).collect::<Vec<_>>(), vec!["04", "07"]);
    }

    #[tokio::test]
    async fn test_hourly_pattern_with_max_weeks_back() {
        // ---
        let store = seeded().await;
        let segment = TEST_ROUTE.segments[0];

        let rows = hourly_pattern(store.pool(), &segment, None, None, u32::MAX, -8, now())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }
}
