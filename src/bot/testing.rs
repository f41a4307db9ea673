use crate::bot::connection::{MessageStream, StreamConnector, StreamMessage};
use crate::bot::synchronizer::SnapshotSource;
use crate::bot::types::{Credentials, Snapshot, SymbolRecord};
use crate::error::AppError;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

pub fn record(close: f64, timestamp: &str) -> SymbolRecord {
    SymbolRecord {
        open: close - 1.0,
        high: close + 1.0,
        low: close - 2.0,
        close,
        volume: 10.0,
        timestamp: timestamp.to_string(),
        is_hammer: false,
    }
}

struct CloseGuard(Arc<AtomicUsize>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector whose streams are fed by the test through unbounded channels.
pub struct ScriptedConnector {
    hanging: bool,
    refuse: Mutex<Option<String>>,
    open_calls: AtomicUsize,
    closed_streams: Arc<AtomicUsize>,
    senders: Mutex<Vec<mpsc::UnboundedSender<StreamMessage>>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    fn build(hanging: bool) -> Self {
        Self {
            hanging,
            refuse: Mutex::new(None),
            open_calls: AtomicUsize::new(0),
            closed_streams: Arc::new(AtomicUsize::new(0)),
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn refuse_next(&self, reason: &str) {
        *self.refuse.lock() = Some(reason.to_string());
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn closed_streams(&self) -> usize {
        self.closed_streams.load(Ordering::SeqCst)
    }

    pub fn last_sender(&self) -> Option<mpsc::UnboundedSender<StreamMessage>> {
        self.senders.lock().last().cloned()
    }

    /// Ends every open stream as if the remote side went away.
    pub fn close_streams(&self) {
        self.senders.lock().clear();
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn open(
        &self,
        _endpoint: &str,
        shutdown: CancellationToken,
    ) -> Result<MessageStream, AppError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.hanging {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = self.refuse.lock().take() {
            return Err(AppError::Connection(reason));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.senders.lock().push(sender);
        let guard = CloseGuard(Arc::clone(&self.closed_streams));

        let messages = stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
            receiver
                .recv()
                .await
                .map(|message| (message, (receiver, guard)))
        });
        Ok(messages.take_until(shutdown.cancelled_owned()).boxed())
    }
}

/// Snapshot source answering from a queue of scripted results, optionally held at a gate.
pub struct ScriptedSource {
    calls: AtomicUsize,
    responses: Mutex<VecDeque<Result<Snapshot, AppError>>>,
    gate: Mutex<Option<Arc<Notify>>>,
    entered: Notify,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            responses: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
            entered: Notify::new(),
        })
    }

    pub fn respond(&self, response: Result<Snapshot, AppError>) {
        self.responses.lock().push_back(response);
    }

    /// Holds subsequent fetches until the returned gate is notified.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch(&self, _credentials: &Credentials) -> Result<Snapshot, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Snapshot::new()))
    }
}
