//! Sigalert freeway speed recorder.
//!
//! Polls the Sigalert Southern California traffic feed on a commute-aware
//! schedule, records per-sensor speeds and incidents into SQLite, and answers
//! queries over the recorded history (route averages, slowdowns, incidents,
//! commute travel-time estimates).
//!
//! The pipeline is `fetch` → `models` → `recorder` → `store`, driven by
//! `scrape_loop` on the clock from `schedule`. `query` and `commute` read
//! the same database; `routes` exposes them over HTTP.

pub mod archive;
pub mod commute;
pub mod config;
pub mod error;
pub mod fetch;
pub mod models;
pub mod query;
pub mod recorder;
pub mod routes;
pub mod schedule;
pub mod schema;
pub mod scrape_loop;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
