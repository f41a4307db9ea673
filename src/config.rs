use crate::bot::types::{StartupMode, Timeframe, DEFAULT_STARTUP_MODE};
use crate::error::AppError;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://reivun-gkdi.vercel.app";
pub const DEFAULT_PRICE_FEED_BASE_URL: &str = "https://api.binance.com";
pub const DEFAULT_PRICE_SYMBOL: &str = "BTCUSDT";
pub const DEFAULT_PRICE_INTERVAL: Timeframe = Timeframe::M1;
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PRICE_LIMIT: u16 = 100;
pub const DEFAULT_PRICE_POLL_MS: u64 = 30_000;
pub const MIN_TIMEOUT_MS: u64 = 100;
pub const MAX_TIMEOUT_MS: u64 = 120_000;
pub const MIN_PRICE_LIMIT: u16 = 10;
pub const MAX_PRICE_LIMIT: u16 = 1_000;
pub const MIN_PRICE_POLL_MS: u64 = 1_000;
pub const MAX_PRICE_POLL_MS: u64 = 3_600_000;

const SOCKET_IO_PATH: &str = "/socket.io/?EIO=4&transport=websocket";

#[derive(Debug, Clone, PartialEq)]
pub struct PriceFeedSettings {
    pub base_url: String,
    pub symbol: String,
    pub interval: Timeframe,
    pub limit: u16,
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub api_base_url: String,
    pub stream_url: String,
    pub fetch_timeout: Duration,
    pub connect_timeout: Duration,
    pub startup_mode: StartupMode,
    pub price_feed: PriceFeedSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            stream_url: derive_stream_url(DEFAULT_API_BASE_URL),
            fetch_timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            startup_mode: DEFAULT_STARTUP_MODE,
            price_feed: PriceFeedSettings {
                base_url: DEFAULT_PRICE_FEED_BASE_URL.to_string(),
                symbol: DEFAULT_PRICE_SYMBOL.to_string(),
                interval: DEFAULT_PRICE_INTERVAL,
                limit: DEFAULT_PRICE_LIMIT,
                poll_interval: Duration::from_millis(DEFAULT_PRICE_POLL_MS),
                fetch_timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
            },
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_base_url = normalize_base_url(
            "REIVUN_API_BASE_URL",
            read("REIVUN_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
        )?;
        let stream_url = match read("REIVUN_STREAM_URL") {
            Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => url,
            Some(url) => {
                return Err(AppError::InvalidArgument(format!(
                    "REIVUN_STREAM_URL must use ws:// or wss:// (got '{url}')"
                )))
            }
            None => derive_stream_url(&api_base_url),
        };

        let fetch_timeout_ms = parse_ranged(
            "REIVUN_FETCH_TIMEOUT_MS",
            read("REIVUN_FETCH_TIMEOUT_MS"),
            DEFAULT_FETCH_TIMEOUT_MS,
            MIN_TIMEOUT_MS,
            MAX_TIMEOUT_MS,
        )?;
        let connect_timeout_ms = parse_ranged(
            "REIVUN_CONNECT_TIMEOUT_MS",
            read("REIVUN_CONNECT_TIMEOUT_MS"),
            DEFAULT_CONNECT_TIMEOUT_MS,
            MIN_TIMEOUT_MS,
            MAX_TIMEOUT_MS,
        )?;
        let startup_mode = match read("REIVUN_STARTUP_MODE") {
            Some(value) => StartupMode::parse_str(&value)?,
            None => DEFAULT_STARTUP_MODE,
        };

        let price_base_url = normalize_base_url(
            "REIVUN_PRICE_FEED_BASE_URL",
            read("REIVUN_PRICE_FEED_BASE_URL")
                .unwrap_or_else(|| DEFAULT_PRICE_FEED_BASE_URL.to_string()),
        )?;
        let price_symbol = read("REIVUN_PRICE_SYMBOL")
            .unwrap_or_else(|| DEFAULT_PRICE_SYMBOL.to_string())
            .to_ascii_uppercase();
        if !price_symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(AppError::InvalidArgument(
                "REIVUN_PRICE_SYMBOL must be alphanumeric ASCII".to_string(),
            ));
        }
        let price_interval = match read("REIVUN_PRICE_INTERVAL") {
            Some(value) => Timeframe::parse_str(&value)?,
            None => DEFAULT_PRICE_INTERVAL,
        };
        let price_limit = parse_ranged(
            "REIVUN_PRICE_LIMIT",
            read("REIVUN_PRICE_LIMIT"),
            u64::from(DEFAULT_PRICE_LIMIT),
            u64::from(MIN_PRICE_LIMIT),
            u64::from(MAX_PRICE_LIMIT),
        )? as u16;
        let price_poll_ms = parse_ranged(
            "REIVUN_PRICE_POLL_MS",
            read("REIVUN_PRICE_POLL_MS"),
            DEFAULT_PRICE_POLL_MS,
            MIN_PRICE_POLL_MS,
            MAX_PRICE_POLL_MS,
        )?;
        let price_fetch_timeout_ms = parse_ranged(
            "REIVUN_PRICE_FETCH_TIMEOUT_MS",
            read("REIVUN_PRICE_FETCH_TIMEOUT_MS"),
            DEFAULT_FETCH_TIMEOUT_MS,
            MIN_TIMEOUT_MS,
            MAX_TIMEOUT_MS,
        )?;

        Ok(Self {
            api_base_url,
            stream_url,
            fetch_timeout: Duration::from_millis(fetch_timeout_ms),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            startup_mode,
            price_feed: PriceFeedSettings {
                base_url: price_base_url,
                symbol: price_symbol,
                interval: price_interval,
                limit: price_limit,
                poll_interval: Duration::from_millis(price_poll_ms),
                fetch_timeout: Duration::from_millis(price_fetch_timeout_ms),
            },
        })
    }
}

fn normalize_base_url(key: &str, value: String) -> Result<String, AppError> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(AppError::InvalidArgument(format!(
            "{key} must use http:// or https:// (got '{value}')"
        )));
    }
    Ok(value.trim_end_matches('/').to_string())
}

fn parse_ranged(
    key: &str,
    raw: Option<String>,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, AppError> {
    let value = match raw {
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            AppError::InvalidArgument(format!("{key} must be an unsigned integer (got '{raw}')"))
        })?,
        None => default,
    };

    if !(min..=max).contains(&value) {
        return Err(AppError::InvalidArgument(format!(
            "{key} must be between {min} and {max}"
        )));
    }
    Ok(value)
}

/// Socket.IO websocket endpoint served next to the REST API.
pub fn derive_stream_url(api_base_url: &str) -> String {
    let base = api_base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}{SOCKET_IO_PATH}")
}
