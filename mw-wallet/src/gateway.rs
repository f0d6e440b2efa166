//! The boundary between the negotiation engine and the outside world.
//!
//! The state machine emits peer parameters, registers finished
//! transactions with the chain and requests kernel proofs through this
//! trait; the surrounding runtime delivers the answers back by writing
//! parameters into the bag and calling `update()` again.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::address::WalletId;
use crate::kernel::{Transaction, TxKernel};
use crate::negotiation::SetTxParameter;
use crate::types::{SystemState, TxId};

/// Outbound operations of the negotiation engine.
///
/// All sends are best-effort: duplicates and reordering are acceptable,
/// the state machine is idempotent against both. The gateway guarantees
/// at-least-once delivery of inbound parameter updates and one `update()`
/// call per such update.
pub trait NegotiatorGateway: Send + Sync {
    /// Forward negotiation parameters to the peer.
    fn send_tx_params(&self, peer: WalletId, msg: SetTxParameter);

    /// Submit a finished transaction to the node. Eventually sets
    /// `TransactionRegistered` in the parameter bag.
    fn register_tx(&self, tx_id: TxId, tx: Transaction);

    /// Request a kernel inclusion proof. Eventually sets
    /// `KernelProofHeight`.
    fn confirm_kernel(&self, tx_id: TxId, kernel: TxKernel);

    /// The current chain tip, if one is known.
    fn get_tip(&self) -> Option<SystemState>;

    /// Terminal signal: the transaction leaves the active set.
    fn on_tx_completed(&self, tx_id: TxId);
}

/// One gateway call, captured by value for cross-reactor marshalling.
#[derive(Debug)]
pub enum GatewayEvent {
    SendTxParams { peer: WalletId, msg: SetTxParameter },
    RegisterTx { tx_id: TxId, tx: Transaction },
    ConfirmKernel { tx_id: TxId, kernel: TxKernel },
    TxCompleted { tx_id: TxId },
}

/// Gateway implementation marshalling every call onto a destination
/// reactor through a typed channel.
///
/// The tip is the one query on the trait; it is answered from a shared
/// cell the node-facing side refreshes, so the wallet reactor never
/// blocks waiting for an answer.
pub struct ChannelGateway {
    sender: mpsc::UnboundedSender<GatewayEvent>,
    tip: Arc<RwLock<Option<SystemState>>>,
}

impl ChannelGateway {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            ChannelGateway {
                sender,
                tip: Arc::new(RwLock::new(None)),
            },
            receiver,
        )
    }

    /// Handle used by the node-facing side to publish the tip.
    pub fn tip_cell(&self) -> Arc<RwLock<Option<SystemState>>> {
        Arc::clone(&self.tip)
    }

    fn enqueue(&self, event: GatewayEvent) {
        if self.sender.send(event).is_err() {
            tracing::warn!("gateway channel closed, dropping event");
        }
    }
}

impl NegotiatorGateway for ChannelGateway {
    fn send_tx_params(&self, peer: WalletId, msg: SetTxParameter) {
        self.enqueue(GatewayEvent::SendTxParams { peer, msg });
    }

    fn register_tx(&self, tx_id: TxId, tx: Transaction) {
        self.enqueue(GatewayEvent::RegisterTx { tx_id, tx });
    }

    fn confirm_kernel(&self, tx_id: TxId, kernel: TxKernel) {
        self.enqueue(GatewayEvent::ConfirmKernel { tx_id, kernel });
    }

    fn get_tip(&self) -> Option<SystemState> {
        self.tip.read().ok().and_then(|guard| *guard)
    }

    fn on_tx_completed(&self, tx_id: TxId) {
        self.enqueue(GatewayEvent::TxCompleted { tx_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_gateway_marshals_calls() {
        let (gateway, mut rx) = ChannelGateway::new();
        let tx_id = TxId([3; 16]);

        gateway.on_tx_completed(tx_id);
        match rx.try_recv().unwrap() {
            GatewayEvent::TxCompleted { tx_id: got } => assert_eq!(got, tx_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn tip_query_reads_shared_cell() {
        let (gateway, _rx) = ChannelGateway::new();
        assert!(gateway.get_tip().is_none());

        let tip = SystemState {
            height: 42,
            hash: Default::default(),
        };
        *gateway.tip_cell().write().unwrap() = Some(tip);
        assert_eq!(gateway.get_tip(), Some(tip));
    }
}
