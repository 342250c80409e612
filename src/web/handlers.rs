//! HTTP request handlers.

use super::AppState;
use crate::db::{Device, RawSample, StorageStats, TariffRate};
use crate::pipeline::RetentionPolicy;
use crate::query::{chart_series, live_snapshot, Metric, QueryError};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header carrying the authenticated caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";

// ============================================================================
// API: Ingest
// ============================================================================

/// One telemetry reading as posted by a collector.
#[derive(Debug, Deserialize)]
pub struct IngestSample {
    pub device_id: i64,
    pub user_id: i64,
    /// Defaults to the time of receipt.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub voltage: Option<f64>,
    #[serde(default)]
    pub current: Option<f64>,
    #[serde(default)]
    pub power: Option<f64>,
    #[serde(default)]
    pub apparent_power: Option<f64>,
    #[serde(default)]
    pub reactive_power: Option<f64>,
    #[serde(default)]
    pub power_factor: Option<f64>,
    #[serde(default)]
    pub energy_today: Option<f64>,
    #[serde(default)]
    pub energy_yesterday: Option<f64>,
    #[serde(default)]
    pub energy_total: Option<f64>,
}

impl IngestSample {
    fn into_sample(self, received_at: DateTime<Utc>) -> RawSample {
        RawSample {
            device_id: self.device_id,
            user_id: self.user_id,
            time: self.timestamp.unwrap_or(received_at),
            voltage: self.voltage,
            current: self.current,
            power: self.power,
            apparent_power: self.apparent_power,
            reactive_power: self.reactive_power,
            power_factor: self.power_factor,
            energy_today: self.energy_today,
            energy_yesterday: self.energy_yesterday,
            energy_total: self.energy_total,
        }
    }
}

pub async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestSample>,
) -> impl IntoResponse {
    if req.device_id <= 0 || req.user_id <= 0 {
        return (StatusCode::BAD_REQUEST, "device_id and user_id must be positive").into_response();
    }

    match state.scheduler.submit(req.into_sample(Utc::now())).await {
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::error!("Ingest: writer unavailable: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "ingest unavailable").into_response()
        }
    }
}

// ============================================================================
// API: Devices and tariffs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    pub user_id: i64,
    pub name: String,
    #[serde(default)]
    pub wattage: Option<f64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn handle_put_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<DeviceRequest>,
) -> impl IntoResponse {
    if id <= 0 || req.user_id <= 0 {
        return (StatusCode::BAD_REQUEST, "device id and user_id must be positive").into_response();
    }
    if req.wattage.is_some_and(|w| !w.is_finite() || w < 0.0) {
        return (StatusCode::BAD_REQUEST, "wattage must be a non-negative number").into_response();
    }

    let device = Device {
        id,
        user_id: req.user_id,
        name: req.name,
        wattage: req.wattage,
        enabled: req.enabled,
    };

    match state.store.upsert_device(&device) {
        Ok(_) => Json(device).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct TariffRequest {
    pub user_id: i64,
    pub rate_per_kwh: f64,
    /// Defaults to the time of receipt.
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
}

pub async fn handle_create_tariff(
    State(state): State<AppState>,
    Json(req): Json<TariffRequest>,
) -> impl IntoResponse {
    if req.user_id <= 0 {
        return (StatusCode::BAD_REQUEST, "user_id must be positive").into_response();
    }
    if !req.rate_per_kwh.is_finite() || req.rate_per_kwh < 0.0 {
        return (StatusCode::BAD_REQUEST, "rate_per_kwh must be a non-negative number").into_response();
    }

    let rate = TariffRate {
        user_id: req.user_id,
        rate_per_kwh: req.rate_per_kwh,
        valid_from: req.valid_from.unwrap_or_else(Utc::now),
    };

    match state.store.add_tariff_rate(&rate) {
        Ok(_) => (StatusCode::CREATED, Json(rate)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Queries
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ChartQuery {
    #[serde(default)]
    pub device_id: Option<i64>,
    /// Range in minutes back from now.
    #[serde(default = "default_timerange")]
    pub timerange: i64,
    #[serde(default, rename = "type")]
    pub metric: Option<String>,
}

fn default_timerange() -> i64 {
    60
}

fn query_error_response(err: QueryError) -> Response {
    match err {
        QueryError::InvalidDevice(_) | QueryError::InvalidMetric(_) | QueryError::InvalidRange(_) => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        QueryError::Db(e) => {
            tracing::error!("Query: storage error: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn handle_chart(
    State(state): State<AppState>,
    Query(query): Query<ChartQuery>,
) -> impl IntoResponse {
    let metric = match query.metric.as_deref().unwrap_or_default().parse::<Metric>() {
        Ok(m) => m,
        Err(e) => return query_error_response(e),
    };

    let policy = RetentionPolicy::from(&state.config);
    match chart_series(
        &state.store,
        &policy,
        query.device_id.unwrap_or(0),
        metric,
        query.timerange,
        Utc::now(),
    ) {
        Ok(series) => Json(series).into_response(),
        Err(e) => query_error_response(e),
    }
}

fn caller_user_id(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(USER_ID_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
}

pub async fn handle_live(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let Some(user_id) = caller_user_id(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing or invalid user id").into_response();
    };

    match live_snapshot(&state.store, &state.config.status, user_id, Utc::now()) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => query_error_response(e),
    }
}

// ============================================================================
// API: Pipeline and storage
// ============================================================================

pub async fn handle_run_pipeline(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.run_pipeline().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub stats: StorageStats,
    pub db_size: String,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.storage_stats() {
        Ok(stats) => Json(StatusResponse {
            db_size: format_bytes(stats.db_size_bytes),
            stats,
        })
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::super::routes;
    use super::*;
    use crate::config::Config;
    use crate::db::{Device, Store, TelemetryRepository};
    use crate::scheduler::Scheduler;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(store: Store) -> axum::Router {
        let config = Config::default();
        let scheduler = Arc::new(Scheduler::new(store.clone(), &config));
        routes(AppState {
            config,
            store,
            scheduler,
        })
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_ingest_validates_ids() {
        let store = Store::open_in_memory().unwrap();

        let resp = app(store.clone())
            .oneshot(post_json("/api/samples", r#"{"device_id":1,"user_id":1,"power":12.5}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = app(store)
            .oneshot(post_json("/api/samples", r#"{"device_id":0,"user_id":1}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chart_returns_series() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_samples(&[RawSample {
                device_id: 5,
                user_id: 1,
                time: Utc::now() - ChronoDuration::minutes(5),
                voltage: Some(229.5),
                ..Default::default()
            }])
            .unwrap();

        let resp = app(store)
            .oneshot(
                Request::builder()
                    .uri("/api/chart?device_id=5&timerange=60&type=voltage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["unit"], "V");
        assert_eq!(body["resolution"], "raw");
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0], 229.5);
    }

    #[tokio::test]
    async fn test_chart_rejects_bad_input() {
        let store = Store::open_in_memory().unwrap();
        for uri in ["/api/chart?timerange=60", "/api/chart?device_id=1&type=frequency"] {
            let resp = app(store.clone())
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_chart_rejects_out_of_bounds_range() {
        let store = Store::open_in_memory().unwrap();
        let resp = app(store)
            .oneshot(
                Request::builder()
                    .uri("/api/chart?device_id=1&timerange=1000000000000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    fn put_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_registered_device_appears_in_live_snapshot() {
        let store = Store::open_in_memory().unwrap();

        let resp = app(store.clone())
            .oneshot(put_json("/api/devices/12", r#"{"user_id":4,"name":"washer","wattage":2100}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["enabled"], true);

        let resp = app(store.clone())
            .oneshot(put_json("/api/devices/0", r#"{"user_id":4,"name":"bad"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app(store)
            .oneshot(
                Request::builder()
                    .uri("/api/live")
                    .header("X-User-Id", "4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["devices"]["12"]["name"], "washer");
        assert_eq!(body["devices"]["12"]["wattage"], 2100.0);
    }

    #[tokio::test]
    async fn test_created_tariff_prices_consumption() {
        let store = Store::open_in_memory().unwrap();

        let resp = app(store.clone())
            .oneshot(post_json(
                "/api/tariffs",
                r#"{"user_id":1,"rate_per_kwh":0.25,"valid_from":"2024-01-01T00:00:00Z"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app(store.clone())
            .oneshot(post_json("/api/tariffs", r#"{"user_id":1,"rate_per_kwh":-1.0}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let now = Utc::now();
        let outcome = crate::metering::apply_reading(
            &store,
            &crate::metering::CostSettings::default(),
            1,
            2,
            Some(4.0),
            None,
            now,
        )
        .unwrap();
        let crate::metering::ReadingOutcome::Created(record) = outcome else {
            panic!("expected a new record, got {:?}", outcome);
        };
        assert_eq!(record.rate_per_kwh, 0.25);
        assert!(!record.fallback_rate);
    }

    #[tokio::test]
    async fn test_live_requires_user() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_device(&Device {
                id: 9,
                user_id: 3,
                name: "fridge".to_string(),
                wattage: Some(150.0),
                enabled: true,
            })
            .unwrap();

        let resp = app(store.clone())
            .oneshot(Request::builder().uri("/api/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app(store)
            .oneshot(
                Request::builder()
                    .uri("/api/live")
                    .header("X-User-Id", "3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["devices"]["9"]["status"], "unknown");
        assert_eq!(body["devices"]["9"]["name"], "fridge");
    }

    #[tokio::test]
    async fn test_pipeline_and_status_endpoints() {
        let store = Store::open_in_memory().unwrap();

        let resp = app(store.clone())
            .oneshot(post_json("/api/pipeline/run", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "completed");

        let resp = app(store)
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["raw_samples"], 0);
        assert!(body["db_size"].is_string());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }
}
