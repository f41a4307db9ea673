use crate::bot::types::{Credentials, Snapshot, SymbolUpdate};
use crate::error::AppError;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

pub const SYMBOLS_PATH: &str = "/symbols";
pub const API_KEY_HEADER: &str = "API-Key";
pub const SECRET_KEY_HEADER: &str = "Secret-Key";
pub const PASSPHRASE_HEADER: &str = "Passphrase";

/// One full read of the monitored symbol map.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, credentials: &Credentials) -> Result<Snapshot, AppError>;
}

fn symbols_endpoint(api_base_url: &str) -> String {
    format!("{}{SYMBOLS_PATH}", api_base_url.trim_end_matches('/'))
}

fn fetch_error(error: reqwest::Error) -> AppError {
    if error.is_status() {
        let status = error
            .status()
            .map(|status| status.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        return AppError::Fetch(format!("symbols endpoint returned {status}"));
    }
    AppError::Fetch(error.to_string())
}

/// Reads the symbol map from the monitoring REST endpoint, passing the credentials as
/// request headers.
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    client: Client,
    endpoint: String,
}

impl HttpSnapshotSource {
    pub fn new(client: Client, api_base_url: &str) -> Self {
        Self {
            client,
            endpoint: symbols_endpoint(api_base_url),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self, credentials: &Credentials) -> Result<Snapshot, AppError> {
        let response = self
            .client
            .get(&self.endpoint)
            .header(API_KEY_HEADER, &credentials.api_key)
            .header(SECRET_KEY_HEADER, &credentials.secret_key)
            .header(PASSPHRASE_HEADER, &credentials.passphrase)
            .send()
            .await
            .map_err(fetch_error)?
            .error_for_status()
            .map_err(fetch_error)?;

        response
            .json::<Snapshot>()
            .await
            .map_err(|error| AppError::Fetch(format!("invalid symbols payload: {error}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied { symbols: usize },
    Buffered,
    Discarded,
}

#[derive(Debug)]
struct RunBuffer {
    generation: u64,
    snapshot_landed: bool,
    pending: Vec<SymbolUpdate>,
}

#[derive(Debug, Default)]
struct SyncState {
    snapshot: Snapshot,
    run: Option<RunBuffer>,
}

/// Replaces every symbol present in `update` with its new record; other symbols are
/// left untouched.
pub fn apply_update(snapshot: &mut Snapshot, update: SymbolUpdate) -> usize {
    let applied = update.len();
    for (symbol, record) in update {
        snapshot.insert(symbol, record);
    }
    applied
}

/// Owner of the authoritative symbol snapshot.
///
/// A run is opened with [`begin_run`](Self::begin_run). Until the snapshot for that run
/// lands, stream updates are buffered in arrival order and replayed right after the full
/// replace. Updates tagged with any other generation are dropped.
pub struct MarketDataSynchronizer {
    source: Arc<dyn SnapshotSource>,
    fetch_timeout: Duration,
    state: Mutex<SyncState>,
    revision_tx: watch::Sender<u64>,
}

impl MarketDataSynchronizer {
    pub fn new(source: Arc<dyn SnapshotSource>, fetch_timeout: Duration) -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            source,
            fetch_timeout,
            state: Mutex::new(SyncState::default()),
            revision_tx,
        }
    }

    /// Issues one bounded read of the full symbol map. Does not touch the snapshot.
    pub async fn fetch_snapshot(&self, credentials: &Credentials) -> Result<Snapshot, AppError> {
        match tokio::time::timeout(self.fetch_timeout, self.source.fetch(credentials)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Fetch(format!(
                "symbols request timed out after {}ms",
                self.fetch_timeout.as_millis()
            ))),
        }
    }

    pub fn begin_run(&self, generation: u64) {
        let mut state = self.state.lock();
        state.run = Some(RunBuffer {
            generation,
            snapshot_landed: false,
            pending: Vec::new(),
        });
    }

    /// Drops the bookkeeping of the run opened for `generation` or any earlier one, along
    /// with updates still waiting for a snapshot. A newer run is left alone.
    pub fn end_run(&self, generation: u64) -> usize {
        let mut state = self.state.lock();
        let discarded = match state.run.take() {
            Some(run) if run.generation <= generation => run.pending.len(),
            Some(newer) => {
                state.run = Some(newer);
                return 0;
            }
            None => 0,
        };
        if discarded > 0 {
            debug!(generation, discarded, "discarded buffered updates for ended run");
        }
        discarded
    }

    /// Fully replaces the snapshot for `generation`, then replays buffered updates.
    /// Returns `false` without mutating anything when the generation is stale.
    pub fn complete_snapshot(&self, generation: u64, snapshot: Snapshot) -> bool {
        let mut state = self.state.lock();
        let Some(mut run) = state.run.take() else {
            return false;
        };
        if run.generation != generation {
            state.run = Some(run);
            return false;
        }

        state.snapshot = snapshot;
        let replayed = run.pending.len();
        for update in run.pending.drain(..) {
            apply_update(&mut state.snapshot, update);
        }
        run.snapshot_landed = true;
        state.run = Some(run);
        let symbols = state.snapshot.len();
        drop(state);

        info!(generation, symbols, replayed, "snapshot applied");
        self.bump_revision();
        true
    }

    pub fn merge(&self, generation: u64, update: SymbolUpdate) -> MergeOutcome {
        let mut state = self.state.lock();
        let SyncState { snapshot, run } = &mut *state;

        let outcome = match run {
            Some(run) if run.generation == generation => {
                if run.snapshot_landed {
                    MergeOutcome::Applied {
                        symbols: apply_update(snapshot, update),
                    }
                } else {
                    run.pending.push(update);
                    MergeOutcome::Buffered
                }
            }
            _ => MergeOutcome::Discarded,
        };
        drop(state);

        if matches!(outcome, MergeOutcome::Applied { .. }) {
            self.bump_revision();
        }
        outcome
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().snapshot.clone()
    }

    pub fn symbol_count(&self) -> usize {
        self.state.lock().snapshot.len()
    }

    pub fn pending_updates(&self) -> usize {
        self.state
            .lock()
            .run
            .as_ref()
            .map(|run| run.pending.len())
            .unwrap_or_default()
    }

    /// Receiver ticking once per applied snapshot or merge.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    fn bump_revision(&self) {
        self.revision_tx
            .send_modify(|revision| *revision = revision.wrapping_add(1));
    }
}
