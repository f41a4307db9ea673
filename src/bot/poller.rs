use crate::bot::now_unix_ms;
use crate::bot::types::{KlineWire, PricePoint, PriceSeries, Timeframe};
use crate::config::PriceFeedSettings;
use crate::error::AppError;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of the fixed-size candle series shown on the price chart.
#[async_trait]
pub trait CandleFeed: Send + Sync {
    fn symbol(&self) -> &str;

    fn interval(&self) -> Timeframe;

    async fn fetch_series(&self) -> Result<Vec<PricePoint>, AppError>;
}

fn klines_endpoint(base_url: &str, symbol: &str, interval: Timeframe, limit: u16) -> String {
    format!("{}/api/v3/klines", base_url.trim_end_matches('/'))
        + &format!(
            "?symbol={}&interval={}&limit={limit}",
            symbol.to_ascii_uppercase(),
            interval.as_str()
        )
}

#[derive(Debug, Clone)]
pub struct BinanceCandleFeed {
    client: Client,
    symbol: String,
    interval: Timeframe,
    endpoint: String,
}

impl BinanceCandleFeed {
    pub fn new(client: Client, settings: &PriceFeedSettings) -> Self {
        Self {
            client,
            symbol: settings.symbol.to_ascii_uppercase(),
            interval: settings.interval,
            endpoint: klines_endpoint(
                &settings.base_url,
                &settings.symbol,
                settings.interval,
                settings.limit,
            ),
        }
    }
}

#[async_trait]
impl CandleFeed for BinanceCandleFeed {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn interval(&self) -> Timeframe {
        self.interval
    }

    async fn fetch_series(&self) -> Result<Vec<PricePoint>, AppError> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?;
        let payload = response.json::<Vec<KlineWire>>().await?;

        let mut points = Vec::with_capacity(payload.len());
        for kline in payload {
            points.push(kline.try_into()?);
        }
        points.sort_unstable_by_key(|point: &PricePoint| point.time);
        points.dedup_by_key(|point| point.time);
        Ok(points)
    }
}

struct PollerHandle {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
    period: Duration,
}

/// Periodic refresher of the price chart series. One fetch happens immediately on
/// start, then one per period. Each fetch is bounded by `fetch_timeout`; a failed or
/// expired fetch never ends the loop.
pub struct PricePoller {
    feed: Arc<dyn CandleFeed>,
    fetch_timeout: Duration,
    series_tx: Arc<watch::Sender<PriceSeries>>,
    handle: Mutex<Option<PollerHandle>>,
}

impl PricePoller {
    pub fn new(feed: Arc<dyn CandleFeed>, fetch_timeout: Duration) -> Self {
        let (series_tx, _) = watch::channel(PriceSeries::empty(
            feed.symbol().to_string(),
            feed.interval(),
        ));
        Self {
            feed,
            fetch_timeout,
            series_tx: Arc::new(series_tx),
            handle: Mutex::new(None),
        }
    }

    /// Starts polling every `period`, replacing a loop that is already running.
    pub async fn start(&self, period: Duration) -> Result<(), AppError> {
        if period.is_zero() {
            return Err(AppError::InvalidArgument(
                "price poll interval must be greater than zero".to_string(),
            ));
        }

        let mut slot = self.handle.lock().await;
        if let Some(previous) = slot.take() {
            previous.cancellation_token.cancel();
            let _ = previous.join_handle.await;
            debug!(
                previous_ms = previous.period.as_millis() as u64,
                "price poller restarted"
            );
        }

        let cancellation_token = CancellationToken::new();
        let join_handle = tokio::spawn(run_price_poller(
            Arc::clone(&self.feed),
            Arc::clone(&self.series_tx),
            PollTiming {
                period,
                fetch_timeout: self.fetch_timeout,
            },
            cancellation_token.clone(),
        ));
        *slot = Some(PollerHandle {
            cancellation_token,
            join_handle,
            period,
        });

        info!(
            symbol = self.feed.symbol(),
            interval = self.feed.interval().as_str(),
            period_ms = period.as_millis() as u64,
            "price poller started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> bool {
        let existing = self.handle.lock().await.take();
        let Some(handle) = existing else {
            return false;
        };

        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
        info!(symbol = self.feed.symbol(), "price poller stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    pub fn series(&self) -> PriceSeries {
        self.series_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PriceSeries> {
        self.series_tx.subscribe()
    }
}

#[derive(Debug, Clone, Copy)]
struct PollTiming {
    period: Duration,
    fetch_timeout: Duration,
}

async fn fetch_bounded(
    feed: &dyn CandleFeed,
    limit: Duration,
) -> Result<Vec<PricePoint>, AppError> {
    match tokio::time::timeout(limit, feed.fetch_series()).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Fetch(format!(
            "price feed request timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

async fn run_price_poller(
    feed: Arc<dyn CandleFeed>,
    series_tx: Arc<watch::Sender<PriceSeries>>,
    timing: PollTiming,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(timing.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = fetch_bounded(feed.as_ref(), timing.fetch_timeout) => result,
        };

        match result {
            Ok(points) => {
                let count = points.len();
                series_tx.send_modify(|series| {
                    series.points = points;
                    series.fetched_at_ms = Some(now_unix_ms());
                    series.last_error = None;
                    series.consecutive_failures = 0;
                });
                debug!(points = count, "price series refreshed");
            }
            Err(error) => {
                series_tx.send_modify(|series| {
                    series.last_error = Some(error.to_string());
                    series.consecutive_failures = series.consecutive_failures.saturating_add(1);
                });
                warn!(symbol = feed.symbol(), %error, "price series fetch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyFeed {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl CandleFeed for FlakyFeed {
        fn symbol(&self) -> &str {
            "BTCUSDT"
        }

        fn interval(&self) -> Timeframe {
            Timeframe::M1
        }

        async fn fetch_series(&self) -> Result<Vec<PricePoint>, AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(AppError::Fetch("feed unavailable".to_string()));
            }
            Ok(vec![
                PricePoint {
                    time: 1_735_000_000_000,
                    close: 100.5,
                },
                PricePoint {
                    time: 1_735_000_060_000,
                    close: 101.0,
                },
            ])
        }
    }

    fn poller_with(failures: usize) -> (PricePoller, Arc<FlakyFeed>) {
        let feed = Arc::new(FlakyFeed {
            calls: AtomicUsize::new(0),
            failures,
        });
        (PricePoller::new(feed.clone(), Duration::from_secs(1)), feed)
    }

    /// Never answers its first request; later requests succeed at once.
    struct StallingFeed {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CandleFeed for StallingFeed {
        fn symbol(&self) -> &str {
            "BTCUSDT"
        }

        fn interval(&self) -> Timeframe {
            Timeframe::M1
        }

        async fn fetch_series(&self) -> Result<Vec<PricePoint>, AppError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            Ok(vec![PricePoint {
                time: 1_735_000_000_000,
                close: 99.0,
            }])
        }
    }

    #[test]
    fn klines_endpoint_uses_symbol_interval_and_limit() {
        let endpoint = klines_endpoint("https://api.binance.com/", "btcusdt", Timeframe::M5, 100);
        assert_eq!(
            endpoint,
            "https://api.binance.com/api/v3/klines?symbol=BTCUSDT&interval=5m&limit=100"
        );
    }

    #[tokio::test]
    async fn failed_tick_is_followed_by_successful_tick() {
        let (poller, feed) = poller_with(1);
        let mut updates = poller.subscribe();

        poller
            .start(Duration::from_millis(20))
            .await
            .expect("poller should start");

        let failed = updates
            .wait_for(|series| series.consecutive_failures == 1)
            .await
            .expect("sender alive")
            .clone();
        assert!(failed.last_error.is_some());
        assert!(failed.points.is_empty());

        let recovered = tokio::time::timeout(
            Duration::from_secs(1),
            updates.wait_for(|series| !series.points.is_empty()),
        )
        .await
        .expect("next tick should fire")
        .expect("sender alive")
        .clone();

        assert_eq!(recovered.points.len(), 2);
        assert_eq!(recovered.consecutive_failures, 0);
        assert!(recovered.last_error.is_none());
        assert!(recovered.fetched_at_ms.is_some());
        assert!(feed.calls.load(Ordering::SeqCst) >= 2);

        assert!(poller.stop().await);
    }

    #[tokio::test]
    async fn stalled_fetch_expires_and_next_tick_recovers() {
        let feed = Arc::new(StallingFeed {
            calls: AtomicUsize::new(0),
        });
        let poller = PricePoller::new(feed.clone(), Duration::from_millis(40));
        let mut updates = poller.subscribe();

        poller
            .start(Duration::from_millis(20))
            .await
            .expect("poller should start");

        let expired = tokio::time::timeout(
            Duration::from_secs(1),
            updates.wait_for(|series| series.consecutive_failures == 1),
        )
        .await
        .expect("stalled fetch should expire")
        .expect("sender alive")
        .clone();
        assert!(expired
            .last_error
            .as_deref()
            .is_some_and(|error| error.contains("timed out")));

        let recovered = tokio::time::timeout(
            Duration::from_secs(1),
            updates.wait_for(|series| !series.points.is_empty()),
        )
        .await
        .expect("next tick should fire")
        .expect("sender alive")
        .clone();
        assert_eq!(recovered.consecutive_failures, 0);
        assert!(feed.calls.load(Ordering::SeqCst) >= 2);

        assert!(poller.stop().await);
    }

    #[tokio::test]
    async fn unanswered_klines_request_counts_as_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener address");
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let settings = PriceFeedSettings {
            base_url: format!("http://{addr}"),
            symbol: "BTCUSDT".to_string(),
            interval: Timeframe::M1,
            limit: 100,
            poll_interval: Duration::from_millis(50),
            fetch_timeout: Duration::from_millis(50),
        };
        let poller = PricePoller::new(
            Arc::new(BinanceCandleFeed::new(Client::new(), &settings)),
            settings.fetch_timeout,
        );
        let mut updates = poller.subscribe();

        poller
            .start(settings.poll_interval)
            .await
            .expect("poller should start");

        tokio::time::timeout(
            Duration::from_secs(2),
            updates.wait_for(|series| series.consecutive_failures >= 2),
        )
        .await
        .expect("every unanswered request should expire")
        .expect("sender alive");
        assert!(poller.series().points.is_empty());

        assert!(poller.stop().await);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_halts_fetching() {
        let (poller, feed) = poller_with(0);
        assert!(!poller.stop().await);

        poller
            .start(Duration::from_millis(10))
            .await
            .expect("poller should start");
        tokio::time::sleep(Duration::from_millis(35)).await;

        assert!(poller.stop().await);
        assert!(!poller.stop().await);
        assert!(!poller.is_running().await);

        let calls_at_stop = feed.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(feed.calls.load(Ordering::SeqCst), calls_at_stop);
    }

    #[tokio::test]
    async fn start_restarts_running_loop() {
        let (poller, _) = poller_with(0);
        poller
            .start(Duration::from_secs(60))
            .await
            .expect("poller should start");
        poller
            .start(Duration::from_secs(30))
            .await
            .expect("restart should succeed");

        assert!(poller.is_running().await);
        assert_eq!(
            poller.handle.lock().await.as_ref().map(|handle| handle.period),
            Some(Duration::from_secs(30))
        );
        assert!(poller.stop().await);
    }

    #[tokio::test]
    async fn rejects_zero_interval() {
        let (poller, _) = poller_with(0);
        let result = poller.start(Duration::ZERO).await;

        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
        assert!(!poller.is_running().await);
    }

    #[test]
    fn initial_series_is_empty() {
        let (poller, _) = poller_with(0);
        let series = poller.series();

        assert_eq!(series.symbol, "BTCUSDT");
        assert!(series.points.is_empty());
        assert_eq!(series.consecutive_failures, 0);
    }
}
