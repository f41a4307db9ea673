use crate::bot::connection::{ConnectionEvent, ConnectionManager, EventHandler};
use crate::bot::now_unix_ms;
use crate::bot::synchronizer::{MarketDataSynchronizer, MergeOutcome};
use crate::bot::types::{
    BotConfig, BotStatus, BotStopResult, Credentials, RunState, Snapshot, StartOutcome,
    StartupMode,
};
use crate::config::Settings;
use crate::error::AppError;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    StartRequested,
    StartSucceeded,
    StartFailed,
    StopRequested,
    StopCompleted,
    ConnectionLost,
    FailureCleared,
}

/// Run-state reducer. Events that do not apply to `state` leave it unchanged.
pub fn transition(state: RunState, event: RunEvent) -> RunState {
    match (state, event) {
        (RunState::Idle, RunEvent::StartRequested) => RunState::Starting,
        (RunState::Starting, RunEvent::StartSucceeded) => RunState::Running,
        (RunState::Starting, RunEvent::StartFailed) => RunState::Failed,
        (RunState::Running, RunEvent::ConnectionLost) => RunState::Failed,
        (RunState::Failed, RunEvent::FailureCleared) => RunState::Idle,
        (RunState::Idle, RunEvent::StopRequested) => RunState::Idle,
        (_, RunEvent::StopRequested) => RunState::Stopping,
        (RunState::Stopping, RunEvent::StopCompleted) => RunState::Idle,
        (current, _) => current,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleSettings {
    pub stream_url: String,
    pub startup_mode: StartupMode,
}

impl From<&Settings> for LifecycleSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            stream_url: settings.stream_url.clone(),
            startup_mode: settings.startup_mode,
        }
    }
}

#[derive(Debug)]
struct RunContext {
    state: RunState,
    generation: u64,
    cancel: CancellationToken,
    connection_id: Option<u64>,
    connection_healthy: bool,
    stream_closed: bool,
    last_error: Option<String>,
    reason: Option<String>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            generation: 0,
            cancel: CancellationToken::new(),
            connection_id: None,
            connection_healthy: false,
            stream_closed: false,
            last_error: None,
            reason: Some("bot idle".to_string()),
        }
    }
}

enum StartError {
    Superseded,
    Failed(AppError),
}

impl From<AppError> for StartError {
    fn from(error: AppError) -> Self {
        Self::Failed(error)
    }
}

struct ControllerShared {
    settings: LifecycleSettings,
    synchronizer: Arc<MarketDataSynchronizer>,
    connection: tokio::sync::Mutex<ConnectionManager>,
    run: Mutex<RunContext>,
    status_tx: watch::Sender<BotStatus>,
}

impl ControllerShared {
    fn status(&self) -> BotStatus {
        let (state, generation, connection_healthy, last_error, reason) = {
            let run = self.run.lock();
            (
                run.state,
                run.generation,
                run.connection_healthy,
                run.last_error.clone(),
                run.reason.clone(),
            )
        };

        BotStatus {
            state,
            generation,
            connection_healthy,
            symbol_count: self.synchronizer.symbol_count(),
            last_error,
            reason,
            updated_at_ms: now_unix_ms(),
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }

    fn on_connection_event(&self, generation: u64, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Update(update) => match self.synchronizer.merge(generation, update) {
                MergeOutcome::Applied { .. } => self.publish_status(),
                MergeOutcome::Buffered => debug!(generation, "update buffered until snapshot lands"),
                MergeOutcome::Discarded => debug!(generation, "discarded update from stale run"),
            },
            ConnectionEvent::Connected => {
                {
                    let mut run = self.run.lock();
                    if run.generation != generation {
                        return;
                    }
                    run.connection_healthy = true;
                }
                self.publish_status();
            }
            ConnectionEvent::Error(reason) => {
                {
                    let mut run = self.run.lock();
                    if run.generation != generation {
                        return;
                    }
                    run.last_error = Some(reason);
                }
                self.publish_status();
            }
            ConnectionEvent::Closed => {
                {
                    let mut run = self.run.lock();
                    if run.generation != generation {
                        return;
                    }
                    run.connection_healthy = false;
                    match run.state {
                        RunState::Running => {
                            run.state = transition(run.state, RunEvent::ConnectionLost);
                            run.last_error = Some("stream connection closed".to_string());
                            run.reason = Some("connection lost; stop the bot to reset".to_string());
                            warn!(generation, "stream closed while running");
                        }
                        RunState::Starting => run.stream_closed = true,
                        _ => {}
                    }
                }
                self.publish_status();
            }
        }
    }
}

/// The run-state machine driving snapshot loading and the streaming connection.
///
/// Every `start`/`stop` transition bumps the generation. Completions and stream events
/// carrying an older generation are dropped without touching state.
#[derive(Clone)]
pub struct BotLifecycleController {
    shared: Arc<ControllerShared>,
}

impl BotLifecycleController {
    pub fn new(
        settings: LifecycleSettings,
        synchronizer: Arc<MarketDataSynchronizer>,
        connection: ConnectionManager,
    ) -> Self {
        let run = RunContext::default();
        let (status_tx, _) = watch::channel(BotStatus::idle(run.reason.clone()));

        Self {
            shared: Arc::new(ControllerShared {
                settings,
                synchronizer,
                connection: tokio::sync::Mutex::new(connection),
                run: Mutex::new(run),
                status_tx,
            }),
        }
    }

    pub async fn start(
        &self,
        credentials: &Credentials,
        config: &BotConfig,
    ) -> Result<StartOutcome, AppError> {
        {
            let run = self.shared.run.lock();
            match run.state {
                RunState::Starting | RunState::Running | RunState::Stopping => {
                    debug!(state = ?run.state, "start ignored; bot already active");
                    return Ok(StartOutcome::AlreadyActive);
                }
                RunState::Failed => {
                    let cause = run
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "unknown failure".to_string());
                    return Err(AppError::Connection(format!(
                        "bot failed ({cause}); stop it before starting again"
                    )));
                }
                RunState::Idle => {}
            }
        }

        if !config.demo_mode {
            return Err(AppError::Config(
                "bot can only run with demo mode enabled".to_string(),
            ));
        }
        credentials.validate()?;

        let (generation, cancel) = {
            let mut run = self.shared.run.lock();
            if run.state != RunState::Idle {
                return Ok(StartOutcome::AlreadyActive);
            }
            run.generation = run.generation.wrapping_add(1);
            run.state = transition(run.state, RunEvent::StartRequested);
            run.cancel = CancellationToken::new();
            run.connection_id = None;
            run.connection_healthy = false;
            run.stream_closed = false;
            run.last_error = None;
            run.reason = Some("starting".to_string());
            (run.generation, run.cancel.clone())
        };
        self.shared.synchronizer.begin_run(generation);
        self.shared.publish_status();

        let startup_mode = self.shared.settings.startup_mode;
        info!(generation, ?startup_mode, timeframe = config.timeframe.as_str(), "bot starting");

        let result = match startup_mode {
            StartupMode::SnapshotFirst => {
                match self.load_snapshot(generation, credentials, &cancel).await {
                    Ok(()) => self.open_stream(generation, &cancel).await,
                    Err(error) => Err(error),
                }
            }
            StartupMode::StreamFirst => match self.open_stream(generation, &cancel).await {
                Ok(()) => self.load_snapshot(generation, credentials, &cancel).await,
                Err(error) => Err(error),
            },
        };

        match result {
            Ok(()) => self.finish_start(generation).await,
            Err(StartError::Superseded) => {
                debug!(generation, "start superseded by a newer transition");
                self.release_stale_connection(generation).await;
                Ok(StartOutcome::Superseded)
            }
            Err(StartError::Failed(error)) => self.fail_start(generation, error).await,
        }
    }

    async fn load_snapshot(
        &self,
        generation: u64,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<(), StartError> {
        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StartError::Superseded),
            result = self.shared.synchronizer.fetch_snapshot(credentials) => result?,
        };

        if !self.shared.synchronizer.complete_snapshot(generation, snapshot) {
            return Err(StartError::Superseded);
        }
        self.shared.publish_status();
        Ok(())
    }

    async fn open_stream(
        &self,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<(), StartError> {
        let handler = self.event_handler(generation);
        let endpoint = self.shared.settings.stream_url.as_str();

        let connection_id = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StartError::Superseded),
            result = async {
                let mut connection = self.shared.connection.lock().await;
                connection.connect(endpoint, handler).await
            } => result?,
        };

        {
            let mut run = self.shared.run.lock();
            if run.generation == generation {
                run.connection_id = Some(connection_id);
                return Ok(());
            }
        }
        self.shared
            .connection
            .lock()
            .await
            .release_if(connection_id)
            .await;
        Err(StartError::Superseded)
    }

    async fn finish_start(&self, generation: u64) -> Result<StartOutcome, AppError> {
        let outcome = {
            let mut run = self.shared.run.lock();
            if run.generation != generation {
                None
            } else if run.stream_closed {
                Some(Err(AppError::Connection(
                    "stream closed before the bot was running".to_string(),
                )))
            } else {
                run.state = transition(run.state, RunEvent::StartSucceeded);
                run.reason = Some("streaming".to_string());
                Some(Ok(()))
            }
        };

        match outcome {
            None => {
                self.release_stale_connection(generation).await;
                Ok(StartOutcome::Superseded)
            }
            Some(Err(error)) => self.fail_start(generation, error).await,
            Some(Ok(())) => {
                self.shared.publish_status();
                info!(
                    generation,
                    symbols = self.shared.synchronizer.symbol_count(),
                    "bot running"
                );
                Ok(StartOutcome::Started)
            }
        }
    }

    async fn fail_start(
        &self,
        generation: u64,
        error: AppError,
    ) -> Result<StartOutcome, AppError> {
        let connection_id = {
            let mut run = self.shared.run.lock();
            if run.generation != generation {
                return Ok(StartOutcome::Superseded);
            }
            run.state = transition(run.state, RunEvent::StartFailed);
            run.connection_healthy = false;
            run.last_error = Some(error.to_string());
            run.reason = Some("start failed".to_string());
            run.connection_id.take()
        };
        self.shared.publish_status();
        warn!(generation, %error, "bot start failed");

        self.release_run(generation, connection_id).await;

        {
            let mut run = self.shared.run.lock();
            if run.generation == generation {
                run.state = transition(run.state, RunEvent::FailureCleared);
            }
        }
        self.shared.publish_status();
        Err(error)
    }

    /// Ends the bookkeeping and connection of run `generation` only; a newer run that began
    /// meanwhile keeps its buffer and handle.
    async fn release_run(&self, generation: u64, connection_id: Option<u64>) {
        self.shared.synchronizer.end_run(generation);
        if let Some(id) = connection_id {
            self.shared.connection.lock().await.release_if(id).await;
        }
    }

    async fn release_stale_connection(&self, generation: u64) {
        let stale_id = {
            let mut run = self.shared.run.lock();
            if run.generation == generation {
                run.connection_id.take()
            } else {
                None
            }
        };
        if let Some(id) = stale_id {
            self.shared.connection.lock().await.release_if(id).await;
        }
    }

    /// Safe from any state. Cancels an in-flight start and releases the connection.
    pub async fn stop(&self) -> BotStopResult {
        let (generation, was_active, leftover_id) = {
            let mut run = self.shared.run.lock();
            let previous = run.state;
            let was_active = previous != RunState::Idle;
            if was_active {
                run.generation = run.generation.wrapping_add(1);
                run.state = transition(previous, RunEvent::StopRequested);
                run.reason = Some("stopping".to_string());
            }
            run.cancel.cancel();
            (run.generation, was_active, run.connection_id.take())
        };
        if was_active {
            self.shared.publish_status();
        }

        self.shared.synchronizer.end_run(generation);
        let released = {
            let mut connection = self.shared.connection.lock().await;
            // From Idle a concurrent start may already own the manager; only a handle
            // recorded before this stop is ours to release.
            if was_active {
                connection.disconnect().await
            } else if let Some(id) = leftover_id {
                connection.release_if(id).await
            } else {
                false
            }
        };

        {
            let mut run = self.shared.run.lock();
            if run.generation == generation && run.state == RunState::Stopping {
                run.state = transition(run.state, RunEvent::StopCompleted);
                run.connection_id = None;
                run.connection_healthy = false;
                run.reason = Some("stopped".to_string());
            }
        }

        let stopped = was_active || released;
        if stopped {
            self.shared.publish_status();
            info!(generation, released, "bot stopped");
        }
        BotStopResult { stopped }
    }

    fn event_handler(&self, generation: u64) -> EventHandler {
        let shared: Weak<ControllerShared> = Arc::downgrade(&self.shared);
        Arc::new(move |event| {
            if let Some(shared) = shared.upgrade() {
                shared.on_connection_event(generation, event);
            }
        })
    }

    pub fn state(&self) -> RunState {
        self.shared.run.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.shared.run.lock().generation
    }

    pub fn connection_healthy(&self) -> bool {
        self.shared.run.lock().connection_healthy
    }

    pub fn status(&self) -> BotStatus {
        self.shared.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BotStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared.synchronizer.snapshot()
    }

    pub fn synchronizer(&self) -> &Arc<MarketDataSynchronizer> {
        &self.shared.synchronizer
    }
}
