//! Price query, mode switch, and health handlers.
//!
//! Latest-price reads try the hot cache under its 100 ms deadline and fall
//! back to the most recent persisted raw row. Aggregated reads go straight
//! to storage, optionally windowed by a `period` query parameter.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::cache::HotCache;
use crate::mode::ModeController;
use crate::models::{Config, Mode};
use crate::storage::{AggKind, PriceStore};

const HEALTH_PING_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<PriceStore>,
    pub cache: Arc<HotCache>,
    pub mode: Arc<ModeController>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    let message = message.into();
    warn!(status = status.as_u16(), message = %message, "Returning error");
    (status, Json(ErrorResponse { error: message }))
}

#[derive(Debug, Serialize)]
pub struct LatestPriceResponse {
    pub symbol: String,
    pub exchange: String,
    pub price: f64,
    pub timestamp: String,
    pub source: &'static str,
}

pub async fn get_latest(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<LatestPriceResponse>, ApiError> {
    latest(&state, None, symbol).await
}

pub async fn get_latest_for_exchange(
    State(state): State<AppState>,
    Path((exchange, symbol)): Path<(String, String)>,
) -> Result<Json<LatestPriceResponse>, ApiError> {
    latest(&state, Some(exchange), symbol).await
}

async fn latest(
    state: &AppState,
    exchange: Option<String>,
    symbol: String,
) -> Result<Json<LatestPriceResponse>, ApiError> {
    validate(state, &symbol, exchange.as_deref())?;

    let cache_exchange = exchange.as_deref().unwrap_or("");
    match state.cache.get_latest_price(cache_exchange, &symbol).await {
        Ok(price) => Ok(Json(LatestPriceResponse {
            symbol,
            exchange: exchange.unwrap_or_default(),
            price,
            timestamp: Utc::now().to_rfc3339(),
            source: "cache",
        })),
        Err(e) => {
            debug!(symbol = %symbol, error = %e, "Cache lookup failed, falling back to storage");
            let row = state
                .store
                .latest_raw(&symbol, exchange.as_deref())
                .map_err(|e| {
                    error!(error = %e, "Storage fallback failed");
                    api_error(StatusCode::INTERNAL_SERVER_ERROR, "database error")
                })?;
            match row {
                Some(row) => Ok(Json(LatestPriceResponse {
                    symbol,
                    exchange: row.exchange,
                    price: row.price,
                    timestamp: Utc::now().to_rfc3339(),
                    source: "storage",
                })),
                None => Err(api_error(StatusCode::NOT_FOUND, "price not available")),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub period: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AggregatedResponse {
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
}

pub async fn get_highest(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<AggregatedResponse>, ApiError> {
    aggregated(&state, AggKind::Highest, None, symbol, query.period).await
}

pub async fn get_highest_for_exchange(
    State(state): State<AppState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<AggregatedResponse>, ApiError> {
    aggregated(&state, AggKind::Highest, Some(exchange), symbol, query.period).await
}

pub async fn get_lowest(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<AggregatedResponse>, ApiError> {
    aggregated(&state, AggKind::Lowest, None, symbol, query.period).await
}

pub async fn get_lowest_for_exchange(
    State(state): State<AppState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<AggregatedResponse>, ApiError> {
    aggregated(&state, AggKind::Lowest, Some(exchange), symbol, query.period).await
}

pub async fn get_average(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<AggregatedResponse>, ApiError> {
    aggregated(&state, AggKind::Average, None, symbol, query.period).await
}

pub async fn get_average_for_exchange(
    State(state): State<AppState>,
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<AggregatedResponse>, ApiError> {
    aggregated(&state, AggKind::Average, Some(exchange), symbol, query.period).await
}

async fn aggregated(
    state: &AppState,
    kind: AggKind,
    exchange: Option<String>,
    symbol: String,
    period: Option<String>,
) -> Result<Json<AggregatedResponse>, ApiError> {
    validate(state, &symbol, exchange.as_deref())?;

    let since = match &period {
        Some(period) => {
            let window = parse_period(period)
                .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "invalid period format"))?;
            let window = chrono::Duration::from_std(window)
                .map_err(|_| api_error(StatusCode::BAD_REQUEST, "invalid period format"))?;
            Some(Utc::now() - window)
        }
        None => None,
    };

    let row = state
        .store
        .aggregated_value(kind, &symbol, exchange.as_deref(), since)
        .map_err(|e| {
            error!(error = %e, "Aggregated query failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        })?;

    let Some(row) = row else {
        return Err(api_error(StatusCode::NOT_FOUND, "no data available"));
    };

    let mut response = AggregatedResponse {
        symbol,
        exchange: row.exchange,
        period,
        max: None,
        min: None,
        average: None,
    };
    match kind {
        AggKind::Highest => response.max = Some(row.value),
        AggKind::Lowest => response.min = Some(row.value),
        AggKind::Average => response.average = Some(row.value),
    }
    Ok(Json(response))
}

fn validate(state: &AppState, symbol: &str, exchange: Option<&str>) -> Result<(), ApiError> {
    if !state.config.is_known_symbol(symbol) {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid symbol"));
    }
    if let Some(exchange) = exchange {
        if !state.config.is_known_exchange(exchange) {
            return Err(api_error(StatusCode::BAD_REQUEST, "invalid exchange"));
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

pub async fn switch_to_live(State(state): State<AppState>) -> Json<MessageResponse> {
    state.mode.set(Mode::Live);
    Json(MessageResponse {
        message: "Switched to Live Mode".to_string(),
    })
}

pub async fn switch_to_test(State(state): State<AppState>) -> Json<MessageResponse> {
    state.mode.set(Mode::Test);
    Json(MessageResponse {
        message: "Switched to Test Mode".to_string(),
    })
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let cache = match state.cache.ping(HEALTH_PING_TIMEOUT).await {
        Ok(()) => "ok",
        Err(_) => "down",
    };
    let storage = match state.store.ping() {
        Ok(()) => "ok",
        Err(_) => "down",
    };
    Json(json!({
        "cache": cache,
        "storage": storage,
        "workers": "running",
        "mode": state.mode.get().as_str(),
    }))
}

/// Parses duration strings like `5s`, `1m`, `1h30m`, `250ms`.
fn parse_period(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !c.is_ascii_digit() && c != '.')?;
        if number_end == 0 {
            return None;
        }
        let (number, tail) = rest.split_at(number_end);
        let value: f64 = number.parse().ok()?;

        let (unit_secs, tail) = if let Some(tail) = tail.strip_prefix("ms") {
            (1e-3, tail)
        } else if let Some(tail) = tail.strip_prefix('s') {
            (1.0, tail)
        } else if let Some(tail) = tail.strip_prefix('m') {
            (60.0, tail)
        } else if let Some(tail) = tail.strip_prefix('h') {
            (3600.0, tail)
        } else {
            return None;
        };

        let segment = Duration::try_from_secs_f64(value * unit_secs).ok()?;
        total = total.checked_add(segment)?;
        rest = tail;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_periods() {
        assert_eq!(parse_period("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_period("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_period("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_period("250ms"), Some(Duration::from_millis(250)));
    }

    #[test]
    fn parses_compound_periods() {
        assert_eq!(parse_period("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_period("1m30s"), Some(Duration::from_secs(90)));
    }

    #[test]
    fn parses_fractional_periods() {
        assert_eq!(parse_period("1.5s"), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn rejects_malformed_periods() {
        assert_eq!(parse_period(""), None);
        assert_eq!(parse_period("5"), None);
        assert_eq!(parse_period("s"), None);
        assert_eq!(parse_period("5d"), None);
        assert_eq!(parse_period("abc"), None);
        assert_eq!(parse_period("1..5s"), None);
    }

    #[test]
    fn rejects_absurdly_large_periods() {
        assert_eq!(parse_period("99999999999999999999h"), None);
    }
}
