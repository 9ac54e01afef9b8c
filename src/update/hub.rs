//! In-process pub/sub for run progress.
//!
//! Every [`StatusEvent`] emitted by a run is delivered to all currently
//! connected observers and queued for persistence in the same critical
//! section, so observers and the store see one order per run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::models::StatusEvent;
use crate::errors::ObserverDeliveryError;

/// Append-only sink for emitted events.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn append(&self, run_id: &str, event: &StatusEvent) -> Result<()>;
}

/// What an observer receives: the event plus the run it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub run_id: String,
    #[serde(flatten)]
    pub event: StatusEvent,
}

/// One live observer connection. Dropping it closes the channel; the hub
/// prunes it on the next broadcast.
pub struct Observer {
    id: u64,
    client_id: Option<String>,
    receiver: mpsc::UnboundedReceiver<ProgressMessage>,
}

impl Observer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Wait for the next message. `None` once the hub dropped this observer.
    pub async fn recv(&mut self) -> Option<ProgressMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressMessage> {
        self.receiver.try_recv().ok()
    }
}

struct ObserverSlot {
    client_id: Option<String>,
    sender: mpsc::UnboundedSender<ProgressMessage>,
}

enum WriterCommand {
    Append { run_id: String, event: StatusEvent },
    Flush(oneshot::Sender<()>),
}

struct HubState {
    observers: HashMap<u64, ObserverSlot>,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
}

/// Cloneable handle to the observer registry.
#[derive(Clone)]
pub struct StatusHub {
    state: Arc<Mutex<HubState>>,
    next_id: Arc<AtomicU64>,
}

impl StatusHub {
    /// Create a hub that persists every emitted event to `store`.
    /// Must be called inside a tokio runtime: the writer task is spawned here.
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(store, rx));
        Self::with_writer(Some(tx))
    }

    /// Create a hub that only broadcasts.
    pub fn detached() -> Self {
        Self::with_writer(None)
    }

    fn with_writer(writer: Option<mpsc::UnboundedSender<WriterCommand>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                observers: HashMap::new(),
                writer,
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // A panic while holding the lock leaves the registry consistent
        // (every mutation is a single map operation), so recover the guard.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new observer.
    pub fn connect(&self, client_id: Option<String>) -> Observer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().observers.insert(
            id,
            ObserverSlot {
                client_id: client_id.clone(),
                sender,
            },
        );
        debug!(observer_id = id, client_id = ?client_id, "observer connected");
        Observer {
            id,
            client_id,
            receiver,
        }
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn disconnect(&self, observer_id: u64) {
        if let Some(slot) = self.lock().observers.remove(&observer_id) {
            debug!(observer_id, client_id = ?slot.client_id, "observer disconnected");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    /// Deliver an event to every connected observer without persisting it.
    pub fn broadcast(&self, run_id: &str, event: &StatusEvent) {
        let mut state = self.lock();
        deliver(&mut state, run_id, event);
    }

    /// Persist and broadcast one event.
    pub fn emit(&self, run_id: &str, event: StatusEvent) {
        let mut state = self.lock();
        if let Some(writer) = &state.writer {
            let cmd = WriterCommand::Append {
                run_id: run_id.to_string(),
                event: event.clone(),
            };
            if writer.send(cmd).is_err() {
                warn!(run_id, "status writer is gone; event not persisted");
            }
        }
        deliver(&mut state, run_id, &event);
    }

    /// Wait until every event emitted before this call has been handed to
    /// the store.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        {
            let state = self.lock();
            let Some(writer) = &state.writer else {
                return;
            };
            if writer.send(WriterCommand::Flush(tx)).is_err() {
                return;
            }
        }
        let _ = rx.await;
    }
}

fn deliver(state: &mut HubState, run_id: &str, event: &StatusEvent) {
    let message = ProgressMessage {
        run_id: run_id.to_string(),
        event: event.clone(),
    };
    let mut closed = Vec::new();
    for (&id, slot) in &state.observers {
        if let Err(err) = send_to(id, slot, message.clone()) {
            debug!(run_id, error = %err, "dropping observer");
            closed.push(id);
        }
    }
    for id in closed {
        state.observers.remove(&id);
    }
}

fn send_to(
    observer_id: u64,
    slot: &ObserverSlot,
    message: ProgressMessage,
) -> Result<(), ObserverDeliveryError> {
    slot.sender
        .send(message)
        .map_err(|_| ObserverDeliveryError { observer_id })
}

async fn run_writer(store: Arc<dyn StatusStore>, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Append { run_id, event } => {
                if let Err(e) = store.append(&run_id, &event).await {
                    warn!(run_id = %run_id, status = %event.status, "failed to persist status event: {:#}", e);
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
