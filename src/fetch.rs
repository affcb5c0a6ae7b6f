//! HTTP client for the Sigalert static and live documents.
//!
//! Both endpoints only answer requests that look like the site's own XHR
//! calls, so every request carries a browser User-Agent, `Accept`,
//! `X-Requested-With` and `Referer`.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, REFERER, USER_AGENT};
use reqwest::Client;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{Snapshot, StaticMetadata};

// ---

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:146.0) Gecko/20100101 Firefox/146.0";
const ACCEPT_JSON: &str = "application/json, text/javascript, */*; q=0.01";
const SITE_REFERER: &str = "https://www.sigalert.com/";

/// Anything that can produce one live snapshot per call.
pub trait SnapshotSource {
    fn fetch_snapshot(&self) -> impl Future<Output = Result<Snapshot>> + Send;
}

/// Client for the two Sigalert JSON endpoints.
#[derive(Debug, Clone)]
pub struct SigalertClient {
    client: Client,
    static_url: String,
    data_url: String,
}

/// Cache-busting query value derived from the wall clock.
pub fn cache_buster(now: DateTime<Utc>) -> i64 {
    now.timestamp_millis() % 100_000_000
}

impl SigalertClient {
    pub fn new(static_url: &str, data_url: &str, timeout: Duration) -> Result<Self> {
        // ---
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_JSON));
        headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        headers.insert(REFERER, HeaderValue::from_static(SITE_REFERER));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            static_url: static_url.to_string(),
            data_url: data_url.to_string(),
        })
    }

    /// Fetch sensor names and road sections.
    pub async fn load_static_metadata(&self) -> Result<StaticMetadata> {
        // ---
        tracing::info!("Fetching static metadata from {}", self.static_url);
        let document = self.get_json(&self.static_url, None).await?;
        let meta: StaticMetadata = serde_json::from_value(document)?;
        tracing::info!(
            "Static metadata: {} sensors, {} road sections",
            meta.sensor_names.len(),
            meta.road_sections.len()
        );
        Ok(meta)
    }

    async fn get_json(&self, url: &str, cb: Option<i64>) -> Result<Value> {
        // ---
        let mut request = self.client.get(url);
        if let Some(cb) = cb {
            request = request.query(&[("cb", cb)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::RemoteStatus {
                status,
                url: url.to_string(),
            });
        }

        Ok(response.json::<Value>().await?)
    }
}

impl SnapshotSource for SigalertClient {
    async fn fetch_snapshot(&self) -> Result<Snapshot> {
        // ---
        let cb = cache_buster(Utc::now());
        tracing::debug!("Fetching live snapshot (cb={})", cb);
        let document = self.get_json(&self.data_url, Some(cb)).await?;
        Snapshot::from_live(document)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use axum::extract::Query;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;

    async fn live(
        headers: AxumHeaders,
        Query(q): Query<HashMap<String, String>>,
    ) -> (StatusCode, Json<Value>) {
        // ---
        let xhr = headers.get("x-requested-with").and_then(|v| v.to_str().ok());
        if xhr != Some("XMLHttpRequest") || !q.contains_key("cb") {
            return (StatusCode::FORBIDDEN, Json(json!({})));
        }
        (
            StatusCode::OK,
            Json(json!({"speeds": [[55, null, []], [null, null, []]], "incidents": []})),
        )
    }

    async fn static_doc() -> Json<Value> {
        Json(json!({"sensorNames": ["A", "B"], "roadSections": [[1, "North", "5", 0, 1]]}))
    }

    async fn spawn_upstream() -> String {
        // ---
        let app = Router::new()
            .route("/static", get(static_doc))
            .route("/live", get(live))
            .route("/down", get(|| async { StatusCode::BAD_GATEWAY }))
            .route("/html", get(|| async { "<html>maintenance</html>" }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base: &str, static_path: &str, data_path: &str) -> SigalertClient {
        SigalertClient::new(
            &format!("{base}{static_path}"),
            &format!("{base}{data_path}"),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_cache_buster_wraps() {
        // ---
        let at = Utc.with_ymd_and_hms(2026, 1, 13, 15, 0, 0).unwrap();
        let cb = cache_buster(at);
        assert!((0..100_000_000).contains(&cb));
        assert_eq!(cb, at.timestamp_millis() % 100_000_000);
    }

    #[tokio::test]
    async fn test_fetches_static_and_live() {
        // ---
        let base = spawn_upstream().await;
        let sigalert = client(&base, "/static", "/live");

        let meta = sigalert.load_static_metadata().await.unwrap();
        assert_eq!(meta.sensor_names, vec!["A", "B"]);
        assert_eq!(meta.road_sections[0].route.as_deref(), Some("5"));

        let snap = sigalert.fetch_snapshot().await.unwrap();
        assert_eq!(snap.speeds.len(), 2);
        assert_eq!(snap.valid_speed_count(), 1);
    }

    #[tokio::test]
    async fn test_non_success_and_bad_payloads_are_remote_errors() {
        // ---
        let base = spawn_upstream().await;

        let err = client(&base, "/static", "/down").fetch_snapshot().await.unwrap_err();
        assert!(
            matches!(err, Error::RemoteStatus { status, .. } if status == StatusCode::BAD_GATEWAY)
        );
        assert!(err.is_remote());

        let err = client(&base, "/static", "/html").fetch_snapshot().await.unwrap_err();
        assert!(err.is_remote(), "undecodable body should be a fetch error, got {err}");
    }
}
