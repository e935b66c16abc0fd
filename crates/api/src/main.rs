use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sectorflow_core::analysis::{
    calculate_trend_strength, detect_rotation, rank_by_inflow, rotation_signals, AnalysisError,
};
use sectorflow_core::config::{Settings, MAX_TREND_LOOKBACK_DAYS};
use sectorflow_core::domain::{
    Market, RankingResult, RotationEvent, RotationSignal, SnapshotSet, TrendScore,
};
use sectorflow_core::storage::{sector_history, SnapshotStore, StoreError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let store = match sectorflow_core::storage::open_store(&settings).await {
        Ok(store) => Some(store),
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %format!("{e:#}"), "snapshot store unavailable; starting API in degraded mode");
            None
        }
    };

    let port = settings.port;
    let app = router(AppState {
        store,
        settings: Arc::new(settings),
    });

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/markets/:market/snapshots/:date", get(get_snapshot))
        .route("/markets/:market/ranking/:date", get(get_ranking))
        .route("/markets/:market/rotation/:date", get(get_rotation))
        .route("/markets/:market/trend/:sector_code", get(get_trend))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    /// `None` when the backend could not be opened at startup.
    store: Option<Arc<dyn SnapshotStore>>,
    settings: Arc<Settings>,
}

impl AppState {
    fn store(&self) -> Result<&dyn SnapshotStore, ApiError> {
        self.store.as_deref().ok_or(ApiError::Unavailable)
    }
}

#[derive(Debug)]
enum ApiError {
    Unavailable,
    BadRequest(String),
    NotFound(String),
    Unprocessable(String),
    Internal(anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "snapshot store unavailable".to_string(),
            ),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            ApiError::Internal(e) => {
                sentry_anyhow::capture_anyhow(&e);
                tracing::error!(error = %format!("{e:#}"), "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn parse_market(raw: &str) -> Result<Market, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("unknown market: {raw}")))
}

fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("invalid date (want YYYY-MM-DD): {raw}")))
}

async fn load_day(
    store: &dyn SnapshotStore,
    market: Market,
    date: NaiveDate,
) -> Result<SnapshotSet, ApiError> {
    store
        .load(market, date)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no {market} snapshot for {date}")))
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path((market, date)): Path<(String, String)>,
) -> Result<Json<SnapshotSet>, ApiError> {
    let store = state.store()?;
    let market = parse_market(&market)?;
    let date = parse_date(&date)?;
    Ok(Json(load_day(store, market, date).await?))
}

#[derive(Debug, Deserialize)]
struct TopNQuery {
    top_n: Option<usize>,
}

impl TopNQuery {
    fn resolve(&self, settings: &Settings) -> Result<usize, ApiError> {
        match self.top_n {
            Some(0) => Err(ApiError::BadRequest("top_n must be >= 1".to_string())),
            Some(n) => Ok(n),
            None => Ok(settings.top_n),
        }
    }
}

async fn get_ranking(
    State(state): State<AppState>,
    Path((market, date)): Path<(String, String)>,
    Query(query): Query<TopNQuery>,
) -> Result<Json<RankingResult>, ApiError> {
    let store = state.store()?;
    let market = parse_market(&market)?;
    let date = parse_date(&date)?;
    let n = query.resolve(&state.settings)?;

    let today = load_day(store, market, date).await?;
    Ok(Json(rank_by_inflow(&today, n)))
}

#[derive(Debug, Serialize)]
struct RotationResponse {
    market: Market,
    as_of_date: NaiveDate,
    previous_date: Option<NaiveDate>,
    ranking: RankingResult,
    /// Absent when no earlier snapshot exists within the lookback limit.
    rotation: Option<RotationEvent>,
    signals: Vec<RotationSignal>,
}

async fn get_rotation(
    State(state): State<AppState>,
    Path((market, date)): Path<(String, String)>,
    Query(query): Query<TopNQuery>,
) -> Result<Json<RotationResponse>, ApiError> {
    let store = state.store()?;
    let market = parse_market(&market)?;
    let date = parse_date(&date)?;
    let n = query.resolve(&state.settings)?;

    let today = load_day(store, market, date).await?;
    let ranking = rank_by_inflow(&today, n);

    let calendar = state.settings.calendar(market);
    let previous = store
        .previous_trading_day(&calendar, date, state.settings.snapshot_lookback_limit)
        .await?;

    let (rotation, signals) = match &previous {
        Some(prev) => {
            let event = detect_rotation(&ranking, &rank_by_inflow(prev, n))
                .map_err(|e| ApiError::Internal(e.into()))?;
            let signals = rotation_signals(&event, &rank_by_inflow(prev, prev.len()));
            (Some(event), signals)
        }
        None => (None, Vec::new()),
    };

    Ok(Json(RotationResponse {
        market,
        as_of_date: date,
        previous_date: previous.as_ref().map(SnapshotSet::as_of_date),
        ranking,
        rotation,
        signals,
    }))
}

#[derive(Debug, Deserialize)]
struct TrendQuery {
    window_days: Option<usize>,
    as_of_date: Option<String>,
}

async fn get_trend(
    State(state): State<AppState>,
    Path((market, sector_code)): Path<(String, String)>,
    Query(query): Query<TrendQuery>,
) -> Result<Json<TrendScore>, ApiError> {
    let store = state.store()?;
    let market = parse_market(&market)?;
    let window = query.window_days.unwrap_or(state.settings.trend_window_days);
    if window == 0 || window > MAX_TREND_LOOKBACK_DAYS as usize {
        return Err(ApiError::BadRequest(format!(
            "window_days must be between 1 and {MAX_TREND_LOOKBACK_DAYS}"
        )));
    }

    let end = match query.as_of_date.as_deref() {
        Some(raw) => parse_date(raw)?,
        None => state
            .settings
            .calendar(market)
            .latest_session(Utc::now())
            .ok_or_else(|| ApiError::NotFound(format!("no recent {market} session")))?,
    };

    // Long windows need more calendar days than the configured lookback.
    let lookback = i64::from(state.settings.trend_lookback_days).max(window as i64 * 2);
    let start = Duration::try_days(lookback)
        .and_then(|span| end.checked_sub_signed(span))
        .ok_or_else(|| ApiError::BadRequest(format!("as_of_date {end} is out of range")))?;
    let sets = store.load_range(market, start, end).await?;
    let history = sector_history(&sets, &sector_code);

    match calculate_trend_strength(&history, &sector_code, window) {
        Ok(score) => Ok(Json(score)),
        Err(err @ AnalysisError::InsufficientHistory { .. }) => {
            Err(ApiError::Unprocessable(err.to_string()))
        }
        Err(err @ AnalysisError::InvalidWindow) => Err(ApiError::BadRequest(err.to_string())),
        Err(err) => Err(ApiError::Internal(err.into())),
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
