use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_TIMEFRAME: Timeframe = Timeframe::M1;
pub const DEFAULT_LEVERAGE: f64 = 1.0;
pub const DEFAULT_TRADE_AMOUNT: f64 = 100.0;
pub const DEFAULT_DEMO_MODE: bool = true;
pub const DEFAULT_STARTUP_MODE: StartupMode = StartupMode::SnapshotFirst;

/// Symbol-keyed map of the latest candle record per monitored symbol.
pub type Snapshot = BTreeMap<String, SymbolRecord>;

/// Partial snapshot delivered by a single `symbolsData` stream event.
pub type SymbolUpdate = BTreeMap<String, SymbolRecord>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim() {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported timeframe '{other}' (expected 1m, 5m or 15m)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    SnapshotFirst,
    StreamFirst,
}

impl StartupMode {
    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "snapshot_first" => Ok(Self::SnapshotFirst),
            "stream_first" => Ok(Self::StreamFirst),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported startup mode '{other}' (expected snapshot_first or stream_first)"
            ))),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            passphrase: passphrase.into(),
        }
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.api_key.is_empty() {
            missing.push("apiKey");
        }
        if self.secret_key.is_empty() {
            missing.push("secretKey");
        }
        if self.passphrase.is_empty() {
            missing.push("passphrase");
        }
        missing
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            return Ok(());
        }
        Err(AppError::Validation(format!(
            "missing credentials: {}",
            missing.join(", ")
        )))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(value: &str) -> &'static str {
            if value.is_empty() {
                "<empty>"
            } else {
                "<redacted>"
            }
        }

        f.debug_struct("Credentials")
            .field("api_key", &redact(&self.api_key))
            .field("secret_key", &redact(&self.secret_key))
            .field("passphrase", &redact(&self.passphrase))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BotConfigArgs {
    pub timeframe: Option<Timeframe>,
    pub leverage: Option<f64>,
    pub trade_amount: Option<f64>,
    pub demo_mode: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    pub timeframe: Timeframe,
    pub leverage: f64,
    pub trade_amount: f64,
    pub demo_mode: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            timeframe: DEFAULT_TIMEFRAME,
            leverage: DEFAULT_LEVERAGE,
            trade_amount: DEFAULT_TRADE_AMOUNT,
            demo_mode: DEFAULT_DEMO_MODE,
        }
    }
}

impl BotConfigArgs {
    pub fn normalize(self) -> Result<BotConfig, AppError> {
        let leverage = self.leverage.unwrap_or(DEFAULT_LEVERAGE);
        if !leverage.is_finite() || leverage <= 0.0 {
            return Err(AppError::InvalidArgument(
                "leverage must be a finite positive number".to_string(),
            ));
        }

        let trade_amount = self.trade_amount.unwrap_or(DEFAULT_TRADE_AMOUNT);
        if !trade_amount.is_finite() || trade_amount <= 0.0 {
            return Err(AppError::InvalidArgument(
                "tradeAmount must be a finite positive number".to_string(),
            ));
        }

        Ok(BotConfig {
            timeframe: self.timeframe.unwrap_or(DEFAULT_TIMEFRAME),
            leverage,
            trade_amount,
            demo_mode: self.demo_mode.unwrap_or(DEFAULT_DEMO_MODE),
        })
    }
}

/// Latest candle for one symbol as reported by the monitoring service.
///
/// Missing fields decode to their defaults: an update always replaces the whole
/// record, so a field the server omits is lost rather than carried over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SymbolRecord {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub timestamp: String,
    pub is_hammer: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BotStatus {
    pub state: RunState,
    pub generation: u64,
    pub connection_healthy: bool,
    pub symbol_count: usize,
    pub last_error: Option<String>,
    pub reason: Option<String>,
    pub updated_at_ms: i64,
}

impl BotStatus {
    pub fn idle(reason: Option<String>) -> Self {
        Self {
            state: RunState::Idle,
            generation: 0,
            connection_healthy: false,
            symbol_count: 0,
            last_error: None,
            reason,
            updated_at_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyActive,
    Superseded,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BotStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartBotArgs {
    pub credentials: Option<Credentials>,
    pub config: Option<BotConfigArgs>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartPriceFeedArgs {
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub time: i64,
    pub close: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceSeries {
    pub symbol: String,
    pub interval: Timeframe,
    pub points: Vec<PricePoint>,
    pub fetched_at_ms: Option<i64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl PriceSeries {
    pub fn empty(symbol: String, interval: Timeframe) -> Self {
        Self {
            symbol,
            interval,
            points: Vec::new(),
            fetched_at_ms: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct KlineWire(
    pub i64,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub i64,
    pub String,
    pub u64,
    pub String,
    pub String,
    pub String,
);

impl TryFrom<KlineWire> for PricePoint {
    type Error = AppError;

    fn try_from(value: KlineWire) -> Result<Self, Self::Error> {
        let close = value.4.parse::<f64>()?;
        if !close.is_finite() {
            return Err(AppError::InvalidArgument(
                "kline close price must be finite".to_string(),
            ));
        }

        Ok(Self {
            time: value.0,
            close,
        })
    }
}
