use crate::bot::connection::{ConnectionManager, SocketIoConnector};
use crate::bot::credentials::CredentialStore;
use crate::bot::lifecycle::{BotLifecycleController, LifecycleSettings};
use crate::bot::poller::{BinanceCandleFeed, PricePoller};
use crate::bot::synchronizer::{HttpSnapshotSource, MarketDataSynchronizer};
use crate::config::Settings;
use crate::error::AppError;
use reqwest::Client;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub settings: Settings,
    pub credential_store: CredentialStore,
    pub bot: BotLifecycleController,
    pub price_poller: PricePoller,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, settings: Settings) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()?;

        let synchronizer = Arc::new(MarketDataSynchronizer::new(
            Arc::new(HttpSnapshotSource::new(
                http_client.clone(),
                &settings.api_base_url,
            )),
            settings.fetch_timeout,
        ));
        let bot = BotLifecycleController::new(
            LifecycleSettings::from(&settings),
            synchronizer,
            ConnectionManager::new(Arc::new(SocketIoConnector), settings.connect_timeout),
        );
        let price_poller = PricePoller::new(
            Arc::new(BinanceCandleFeed::new(http_client, &settings.price_feed)),
            settings.price_feed.fetch_timeout,
        );

        Ok(Self::with_components(db_pool, settings, bot, price_poller))
    }

    pub fn with_components(
        db_pool: SqlitePool,
        settings: Settings,
        bot: BotLifecycleController,
        price_poller: PricePoller,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            credential_store: CredentialStore::new(db_pool.clone()),
            db_pool,
            settings,
            bot,
            price_poller,
        }
    }
}
