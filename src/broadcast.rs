//! Cross-process ledger synchronization.
//!
//! Optional per §6: an implementation without network fan-out may use
//! [`NullBroadcastChannel`] and every ledger invariant still holds within a
//! single process. [`TokioBroadcastChannel`] simulates sibling-process sync
//! between pipeline instances in the same process using a broadcast
//! channel, the nearest safe analogue to real IPC without a network
//! dependency.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::ShieldResult;
use crate::stages::ledger::LedgerEntry;

/// A message sent between ledger instances so they can merge each other's
/// entries.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    NewEntry(LedgerEntry),
}

/// A fan-out channel for ledger entries across sibling pipeline instances.
#[async_trait]
pub trait BroadcastChannel: Send + Sync + std::fmt::Debug {
    async fn publish(&self, message: BroadcastMessage) -> ShieldResult<()>;
    /// Drain any messages published by other instances since the last call.
    /// Implementations that cannot buffer (e.g. lossy channels) may return
    /// fewer messages than were published; the ledger's merge is idempotent
    /// so dropped messages only mean a missed cross-process sync, not
    /// corrupted state.
    async fn poll(&self) -> ShieldResult<Vec<BroadcastMessage>>;
}

/// The default: publishes and polls are both no-ops.
#[derive(Debug, Default, Clone)]
pub struct NullBroadcastChannel;

#[async_trait]
impl BroadcastChannel for NullBroadcastChannel {
    async fn publish(&self, _message: BroadcastMessage) -> ShieldResult<()> {
        Ok(())
    }

    async fn poll(&self) -> ShieldResult<Vec<BroadcastMessage>> {
        Ok(Vec::new())
    }
}

/// A same-process broadcast channel backed by `tokio::sync::broadcast`,
/// useful for tests and for simulating multiple pipeline instances sharing
/// a ledger within one process.
#[derive(Debug)]
pub struct TokioBroadcastChannel {
    sender: broadcast::Sender<BroadcastMessage>,
    receiver: tokio::sync::Mutex<broadcast::Receiver<BroadcastMessage>>,
}

impl TokioBroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = broadcast::channel(capacity);
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }
}

#[async_trait]
impl BroadcastChannel for TokioBroadcastChannel {
    async fn publish(&self, message: BroadcastMessage) -> ShieldResult<()> {
        // An absent receiver (lagging or none subscribed) is not an error -
        // broadcast failures are swallowed the same as storage failures.
        let _ = self.sender.send(message);
        Ok(())
    }

    async fn poll(&self) -> ShieldResult<Vec<BroadcastMessage>> {
        let mut receiver = self.receiver.lock().await;
        let mut drained = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(msg) => drained.push(msg),
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            }
        }
        Ok(drained)
    }
}
