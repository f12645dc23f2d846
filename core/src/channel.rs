//! Progress events and cooperative shutdown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::checkpoint::UnitStatus;
use crate::task::UnitKey;

/// Channel buffer configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Progress event buffer size (scheduler -> reporter)
    pub event_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { event_buffer: 1_024 }
    }
}

impl ChannelConfig {
    /// Set the progress event buffer size
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    /// Create a progress channel sized by this config
    pub fn event_channel(&self) -> (mpsc::Sender<UnitEvent>, mpsc::Receiver<UnitEvent>) {
        mpsc::channel(self.event_buffer.max(1))
    }
}

/// Emitted after a unit's status change has been checkpointed
#[derive(Debug, Clone, PartialEq)]
pub struct UnitEvent {
    /// Unit the event is about
    pub key: UnitKey,
    /// Status now on disk
    pub status: UnitStatus,
    /// Failure reason, if any
    pub error: Option<String>,
}

/// Cooperative shutdown signal
///
/// The broadcast wakes waiters; the flag makes the signal sticky so a
/// late subscriber still sees it.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    /// New, untriggered signal
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Trigger shutdown
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    /// Whether shutdown was triggered
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Subscribe to the raw broadcast
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Resolve once shutdown is triggered
    pub async fn cancelled(&self) {
        // Subscribe before checking the flag so a trigger in between is seen
        let mut rx = self.tx.subscribe();
        if self.is_triggered() {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.is_triggered() {
                        return;
                    }
                }
            }
        }
    }

    /// Trigger this signal on Ctrl+C
    ///
    /// Returns the listener task so the caller can abort it when done.
    pub fn listen_for_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received Ctrl+C, finishing in-flight units...");
                    shutdown.trigger();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
            }
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
