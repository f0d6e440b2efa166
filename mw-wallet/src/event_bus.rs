//! Change-notification fan-out for the wallet store.
//!
//! The store broadcasts every state change through an `EventBus`. All
//! subscribers receive all events, in emission order; late subscribers do
//! not receive past events. Dropping the receiver unsubscribes, so an
//! observer is always removed on destruction.

use tokio::sync::broadcast;

use crate::types::{ChangeAction, TxDescription};

const DEFAULT_EVENT_LIMIT: usize = 1024;

/// A change notification emitted by the wallet store.
#[derive(Debug, Clone)]
pub enum WalletEvent {
    CoinsChanged,
    TransactionChanged {
        action: ChangeAction,
        items: Vec<TxDescription>,
    },
    SystemStateChanged,
    AddressChanged,
}

/// Event bus for broadcasting store changes to observers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WalletEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    ///
    /// Capacity determines how many events can be buffered before slow
    /// receivers start missing events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Emit an event to all subscribers.
    ///
    /// No receivers is not an error; the event is simply dropped.
    pub fn emit(&self, event: WalletEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LIMIT)
    }
}

/// Receiving half of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventReceiver {
    receiver: broadcast::Receiver<WalletEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<WalletEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("store observer lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when no event is pending.
    pub fn try_recv(&mut self) -> Option<WalletEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("store observer lagged, {} events dropped", n);
                }
                Err(_) => return None,
            }
        }
    }
}
