pub mod bot;
pub mod commands;
pub mod config;
pub mod db;
#[cfg(feature = "desktop")]
pub mod desktop;
pub mod error;
pub mod logging;
pub mod state;

pub use bot::connection::{ConnectionEvent, ConnectionManager, SocketIoConnector, StreamConnector};
pub use bot::credentials::CredentialStore;
pub use bot::lifecycle::{transition, BotLifecycleController, LifecycleSettings, RunEvent};
pub use bot::poller::{BinanceCandleFeed, CandleFeed, PricePoller};
pub use bot::synchronizer::{HttpSnapshotSource, MarketDataSynchronizer, SnapshotSource};
pub use bot::types::{
    BotConfig, BotConfigArgs, BotStatus, Credentials, PricePoint, PriceSeries, RunState,
    Snapshot, StartOutcome, StartupMode, SymbolRecord, SymbolUpdate, Timeframe,
};
pub use config::Settings;
pub use error::AppError;
pub use logging::init_tracing;
pub use state::AppState;
