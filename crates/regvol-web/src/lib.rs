//! Axum read API over stored snapshots: cross-agency summary and per-agency series.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use regvol_core::{
    default_summary_new_date, default_summary_old_date, DateAxis, SeriesPoint, DEFAULT_MIN_YEAR,
    DEFAULT_TERMINAL_YEAR,
};
use regvol_storage::{PersistenceError, SnapshotStore};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "regvol-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SnapshotStore>,
    /// Window used by `/agency_details` when the request leaves a bound out.
    pub series_window: DateAxis,
}

impl AppState {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            series_window: DateAxis::default(),
        }
    }

    pub fn with_series_window(mut self, window: DateAxis) -> Self {
        self.series_window = window;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub series_window: DateAxis,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            series_window: DateAxis::default(),
        }
    }
}

impl WebConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        fn parse<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            var: &str,
            default: T,
        ) -> anyhow::Result<T> {
            match lookup(var).filter(|v| !v.trim().is_empty()) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid value for {var}: {raw}")),
                None => Ok(default),
            }
        }

        let defaults = Self::default();
        let min_year = parse(&lookup, "REGVOL_MIN_YEAR", DEFAULT_MIN_YEAR)?;
        let terminal_year = parse(&lookup, "REGVOL_TERMINAL_YEAR", DEFAULT_TERMINAL_YEAR)?;
        Ok(Self {
            bind_addr: parse(&lookup, "REGVOL_WEB_BIND", defaults.bind_addr)?,
            port: parse(&lookup, "REGVOL_WEB_PORT", defaults.port)?,
            series_window: DateAxis::new(min_year, terminal_year)?,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    old_date: Option<NaiveDate>,
    new_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub result_id: usize,
    pub name: String,
    pub short_name: Option<String>,
    pub new_word_count: i64,
    pub old_word_count: i64,
}

#[derive(Debug, Deserialize)]
struct AgencyDetailsRequest {
    agency_name: String,
    min_date: Option<NaiveDate>,
    max_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgencyDetails {
    pub name: String,
    pub features: Vec<SeriesPoint>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/summary", get(summary_handler))
        .route("/agency_details", post(agency_details_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &WebConfig, state: AppState) -> anyhow::Result<()> {
    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "read api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SummaryQuery>,
) -> Response {
    let old_date = query.old_date.unwrap_or_else(default_summary_old_date);
    let new_date = query.new_date.unwrap_or_else(default_summary_new_date);
    match state.store.summary(old_date, new_date).await {
        Ok(rows) => {
            let rows = rows
                .into_iter()
                .enumerate()
                .map(|(result_id, row)| SummaryRow {
                    result_id,
                    name: row.name,
                    short_name: row.short_name,
                    new_word_count: row.new_word_count,
                    old_word_count: row.old_word_count,
                })
                .collect::<Vec<_>>();
            Json(rows).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn agency_details_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AgencyDetailsRequest>,
) -> Response {
    let window = state.series_window;
    let min_date = request
        .min_date
        .or_else(|| window.first())
        .unwrap_or(NaiveDate::MIN);
    let max_date = request
        .max_date
        .or_else(|| window.last())
        .unwrap_or(NaiveDate::MAX);
    match state
        .store
        .agency_series(&request.agency_name, min_date, max_date)
        .await
    {
        Ok(features) => Json(AgencyDetails {
            name: request.agency_name,
            features,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: PersistenceError) -> Response {
    error!(error = %err, "read api query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use regvol_core::AgencyOnDate;
    use regvol_storage::MemorySnapshotStore;
    use tower::ServiceExt;

    fn date(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn row(d: NaiveDate, name: &str, short: &str, words: i64) -> AgencyOnDate {
        AgencyOnDate {
            date: d,
            name: name.into(),
            short_name: Some(short.into()),
            word_count: words,
        }
    }

    async fn seeded_app() -> Router {
        let store = MemorySnapshotStore::new();
        for r in [
            row(date(2018, 2), "Alpha", "A", 100),
            row(date(2025, 2), "Alpha", "A", 150),
            row(date(2018, 2), "Beta", "B", 80),
            row(date(2025, 2), "Beta", "B", 200),
            row(date(2021, 8), "Beta", "B", 120),
            row(date(2025, 2), "Gamma", "G", 5),
        ] {
            store.insert_agency_row(r).await;
        }
        app(AppState::new(Arc::new(store)))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(resp: Response) -> T {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn summary_defaults_compare_2018_with_2025() {
        let resp = seeded_app()
            .await
            .oneshot(Request::builder().uri("/summary").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );

        let rows: Vec<SummaryRow> = body_json(resp).await;
        let summary = rows
            .iter()
            .map(|r| (r.name.as_str(), r.new_word_count, r.old_word_count))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![("Beta", 200, 80), ("Alpha", 150, 100), ("Gamma", 5, 0)]
        );
        assert_eq!(rows[0].result_id, 0);
        assert_eq!(rows[0].short_name.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn summary_dates_are_overridable_and_missing_data_is_empty() {
        let resp = seeded_app()
            .await
            .oneshot(
                Request::builder()
                    .uri("/summary?old_date=2019-02-01&new_date=2019-05-01")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let rows: Vec<SummaryRow> = body_json(resp).await;
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn malformed_summary_date_is_a_client_error() {
        let resp = seeded_app()
            .await
            .oneshot(
                Request::builder()
                    .uri("/summary?old_date=last-year")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn agency_details_returns_ascending_series() {
        let resp = seeded_app()
            .await
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/agency_details")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"agency_name":"Beta"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let details: AgencyDetails = body_json(resp).await;
        assert_eq!(details.name, "Beta");
        assert_eq!(
            details.features,
            vec![
                SeriesPoint { date: date(2018, 2), word_count: 80 },
                SeriesPoint { date: date(2021, 8), word_count: 120 },
                SeriesPoint { date: date(2025, 2), word_count: 200 },
            ]
        );
    }

    #[tokio::test]
    async fn agency_details_honours_window_and_unknown_agency() {
        let app = seeded_app().await;
        let windowed = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/agency_details")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"agency_name":"Beta","min_date":"2019-01-01","max_date":"2024-12-31"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let details: AgencyDetails = body_json(windowed).await;
        assert_eq!(details.features.len(), 1);

        let unknown = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/agency_details")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"agency_name":"Nobody"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::OK);
        let details: AgencyDetails = body_json(unknown).await;
        assert!(details.features.is_empty());
    }

    #[tokio::test]
    async fn health_is_ok() {
        let resp = seeded_app()
            .await
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn web_config_reads_port_and_window() {
        let config = WebConfig::from_lookup(|key| match key {
            "REGVOL_WEB_PORT" => Some("9100".into()),
            "REGVOL_MIN_YEAR" => Some("2020".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.series_window.first(), Some(date(2020, 2)));
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:9100");

        assert!(WebConfig::from_lookup(|key| (key == "REGVOL_WEB_PORT").then(|| "x".into())).is_err());
    }
}
