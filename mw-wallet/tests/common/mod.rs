//! Shared fixtures for the negotiation integration tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use mw_wallet::address::WalletId;
use mw_wallet::coin::{Coin, CoinStatus};
use mw_wallet::crypto::{KeyId, KeyType};
use mw_wallet::gateway::NegotiatorGateway;
use mw_wallet::kernel::{Transaction, TxKernel};
use mw_wallet::negotiation::SetTxParameter;
use mw_wallet::storage::{shared, write_store, MemoryWalletStorage, SharedStorage};
use mw_wallet::types::{Amount, Hash32, SystemState, TxId};
use mw_wallet::wallet::Wallet;

/// Gateway double recording every outbound call.
#[derive(Default)]
pub struct TestGateway {
    pub sent: Mutex<VecDeque<(WalletId, SetTxParameter)>>,
    pub registered: Mutex<VecDeque<(TxId, Transaction)>>,
    pub kernel_requests: Mutex<VecDeque<(TxId, TxKernel)>>,
    pub completed: Mutex<Vec<TxId>>,
    pub tip: Mutex<Option<SystemState>>,
}

impl TestGateway {
    pub fn set_tip(&self, height: u64) {
        *self.tip.lock().unwrap() = Some(SystemState {
            height,
            hash: Hash32([height as u8; 32]),
        });
    }

    pub fn drain_sent(&self) -> Vec<(WalletId, SetTxParameter)> {
        self.sent.lock().unwrap().drain(..).collect()
    }

    pub fn drain_registered(&self) -> Vec<(TxId, Transaction)> {
        self.registered.lock().unwrap().drain(..).collect()
    }

    pub fn drain_kernel_requests(&self) -> Vec<(TxId, TxKernel)> {
        self.kernel_requests.lock().unwrap().drain(..).collect()
    }
}

impl NegotiatorGateway for TestGateway {
    fn send_tx_params(&self, peer: WalletId, msg: SetTxParameter) {
        self.sent.lock().unwrap().push_back((peer, msg));
    }

    fn register_tx(&self, tx_id: TxId, tx: Transaction) {
        self.registered.lock().unwrap().push_back((tx_id, tx));
    }

    fn confirm_kernel(&self, tx_id: TxId, kernel: TxKernel) {
        self.kernel_requests.lock().unwrap().push_back((tx_id, kernel));
    }

    fn get_tip(&self) -> Option<SystemState> {
        *self.tip.lock().unwrap()
    }

    fn on_tx_completed(&self, tx_id: TxId) {
        self.completed.lock().unwrap().push(tx_id);
    }
}

/// One wallet party: store, gateway double, orchestrator and own address.
pub struct Party {
    pub store: SharedStorage,
    pub gateway: Arc<TestGateway>,
    pub wallet: Wallet,
    pub address: WalletId,
}

impl Party {
    pub fn new(seed: u8, coin_values: &[Amount]) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_test_writer()
            .try_init();

        let store = shared(MemoryWalletStorage::with_seed([seed; 64], "password").unwrap());
        let gateway = Arc::new(TestGateway::default());
        gateway.set_tip(1);
        let mut wallet = Wallet::new(
            Arc::clone(&store),
            Arc::clone(&gateway) as Arc<dyn NegotiatorGateway>,
        );

        {
            let mut guard = write_store(&store).unwrap();
            guard
                .set_system_state(&SystemState {
                    height: 1,
                    hash: Hash32([1; 32]),
                })
                .unwrap();
            for value in coin_values {
                let idx = guard.allocate_kid_range(1);
                let coin = Coin::new(
                    KeyId::new(idx, KeyType::Regular, *value),
                    CoinStatus::Available,
                );
                guard.store_coin(&coin).unwrap();
            }
        }

        let address = wallet.create_address("party").unwrap().wallet_id;
        Party {
            store,
            gateway,
            wallet,
            address,
        }
    }

    /// All coins, sorted by id.
    pub fn coins(&self) -> Vec<Coin> {
        let guard = self.store.read().unwrap();
        let mut coins = Vec::new();
        guard.visit_coins(&mut |c| {
            coins.push(c.clone());
            true
        });
        coins
    }

    pub fn coin_values_with_status(&self, status: CoinStatus) -> Vec<Amount> {
        let mut values: Vec<Amount> = self
            .coins()
            .into_iter()
            .filter(|c| c.status == status)
            .map(|c| c.value())
            .collect();
        values.sort_unstable();
        values
    }

    pub fn tx_status(&self, tx_id: &TxId) -> mw_wallet::types::TxStatus {
        self.store
            .read()
            .unwrap()
            .get_tx(tx_id)
            .expect("transaction must be in history")
            .status
    }
}

/// Shuttle peer messages between two parties until both queues run dry.
///
/// Node answers (registration, kernel proofs) are not simulated here; the
/// tests drive those explicitly.
pub fn pump_messages(a: &mut Party, b: &mut Party) {
    loop {
        let from_a = a.gateway.drain_sent();
        let from_b = b.gateway.drain_sent();
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for (peer, msg) in from_a {
            assert_eq!(peer, b.address);
            b.wallet.on_tx_parameters(b.address, msg).unwrap();
        }
        for (peer, msg) in from_b {
            assert_eq!(peer, a.address);
            a.wallet.on_tx_parameters(a.address, msg).unwrap();
        }
    }
}
