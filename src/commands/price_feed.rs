use crate::bot::types::{PriceSeries, StartPriceFeedArgs, Timeframe};
use crate::config::{MAX_PRICE_POLL_MS, MIN_PRICE_POLL_MS};
use crate::error::AppError;
use crate::state::AppState;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceFeedSession {
    pub symbol: String,
    pub interval: Timeframe,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PriceFeedStopResult {
    pub stopped: bool,
}

fn resolve_poll_interval(
    args: Option<StartPriceFeedArgs>,
    default: Duration,
) -> Result<Duration, AppError> {
    let Some(interval_ms) = args.and_then(|args| args.interval_ms) else {
        return Ok(default);
    };

    if !(MIN_PRICE_POLL_MS..=MAX_PRICE_POLL_MS).contains(&interval_ms) {
        return Err(AppError::InvalidArgument(format!(
            "intervalMs must be between {MIN_PRICE_POLL_MS} and {MAX_PRICE_POLL_MS}"
        )));
    }
    Ok(Duration::from_millis(interval_ms))
}

pub async fn handle_start_price_feed(
    state: &AppState,
    args: Option<StartPriceFeedArgs>,
) -> Result<PriceFeedSession, AppError> {
    let period = resolve_poll_interval(args, state.settings.price_feed.poll_interval)?;
    state.price_poller.start(period).await?;

    let series = state.price_poller.series();
    Ok(PriceFeedSession {
        symbol: series.symbol,
        interval: series.interval,
        poll_interval_ms: period.as_millis() as u64,
    })
}

pub async fn handle_stop_price_feed(state: &AppState) -> PriceFeedStopResult {
    PriceFeedStopResult {
        stopped: state.price_poller.stop().await,
    }
}

pub fn handle_price_series(state: &AppState) -> PriceSeries {
    state.price_poller.series()
}

#[cfg(feature = "desktop")]
#[tauri::command]
pub async fn start_price_feed(
    state: tauri::State<'_, AppState>,
    args: Option<StartPriceFeedArgs>,
) -> Result<PriceFeedSession, AppError> {
    handle_start_price_feed(&state, args).await
}

#[cfg(feature = "desktop")]
#[tauri::command]
pub async fn stop_price_feed(
    state: tauri::State<'_, AppState>,
) -> Result<PriceFeedStopResult, AppError> {
    Ok(handle_stop_price_feed(&state).await)
}

#[cfg(feature = "desktop")]
#[tauri::command]
pub async fn price_series(state: tauri::State<'_, AppState>) -> Result<PriceSeries, AppError> {
    Ok(handle_price_series(&state))
}
