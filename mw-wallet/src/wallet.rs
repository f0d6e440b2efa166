//! The wallet orchestrator: owns the active transactions and feeds the
//! state machines.
//!
//! Inbound events (peer parameter batches, node answers, tip changes)
//! arrive one at a time on the wallet reactor. Each one is applied to the
//! parameter bag and followed by exactly one `update()` of the affected
//! transaction.

use std::collections::HashMap;
use std::sync::Arc;

use crate::address::{identity_key, WalletAddress, WalletId};
use crate::error::{Result, WalletError};
use crate::gateway::NegotiatorGateway;
use crate::negotiation::{SetTxParameter, SimpleTransaction, TxType};
use crate::params::TxParameterId;
use crate::storage::{read_store, set_parameter, write_store, SharedStorage};
use crate::types::{
    timestamp_now, Amount, Height, SystemState, TxDescription, TxId, TxStatus,
    DEFAULT_TX_LIFETIME,
};

pub struct Wallet {
    store: SharedStorage,
    gateway: Arc<dyn NegotiatorGateway>,
    active: HashMap<TxId, SimpleTransaction>,
}

impl Wallet {
    pub fn new(store: SharedStorage, gateway: Arc<dyn NegotiatorGateway>) -> Self {
        Wallet {
            store,
            gateway,
            active: HashMap::new(),
        }
    }

    /// Start an outgoing transfer: seed the parameter bag, save the
    /// history record and run the first update.
    pub fn send_money(
        &mut self,
        peer_id: WalletId,
        my_id: WalletId,
        amounts: Vec<Amount>,
        fee: Amount,
    ) -> Result<TxId> {
        if amounts.is_empty() || amounts.iter().any(|a| *a == 0) {
            return Err(WalletError::General("amounts must be non-zero".into()));
        }
        let tx_id = TxId::generate();
        let amount: Amount = amounts.iter().sum();
        let now = timestamp_now();
        let tip_height = read_store(&self.store)?.current_height();
        let min_height = tip_height;
        let max_height = tip_height + DEFAULT_TX_LIFETIME;

        {
            let mut guard = write_store(&self.store)?;
            let store = &mut *guard;
            set_parameter(store, &tx_id, TxParameterId::TransactionType, &TxType::Simple, false)?;
            set_parameter(store, &tx_id, TxParameterId::CreateTime, &now, false)?;
            set_parameter(store, &tx_id, TxParameterId::ModifyTime, &now, false)?;
            set_parameter(store, &tx_id, TxParameterId::Amount, &amount, false)?;
            if amounts.len() > 1 {
                set_parameter(store, &tx_id, TxParameterId::AmountList, &amounts, false)?;
            }
            set_parameter(store, &tx_id, TxParameterId::Fee, &fee, false)?;
            set_parameter(store, &tx_id, TxParameterId::MinHeight, &min_height, false)?;
            set_parameter(store, &tx_id, TxParameterId::MaxHeight, &max_height, false)?;
            set_parameter(store, &tx_id, TxParameterId::PeerId, &peer_id, false)?;
            set_parameter(store, &tx_id, TxParameterId::MyId, &my_id, false)?;
            set_parameter(store, &tx_id, TxParameterId::IsSender, &true, false)?;
            set_parameter(store, &tx_id, TxParameterId::IsInitiator, &true, false)?;
            set_parameter(
                store,
                &tx_id,
                TxParameterId::Status,
                &TxStatus::Pending,
                false,
            )?;

            guard.save_tx(&TxDescription {
                tx_id,
                amount,
                fee,
                change: 0,
                min_height,
                peer_id,
                my_id,
                create_time: now,
                modify_time: now,
                sender: true,
                status: TxStatus::Pending,
                kernel_id: None,
            })?;
        }

        tracing::info!("{} send of {} initiated", tx_id, amount);
        self.resume_tx(tx_id).update()?;
        Ok(tx_id)
    }

    /// Apply a peer's parameter batch and advance the transaction.
    ///
    /// `my_id` is the own address the message was delivered to; a first
    /// contact creates the receiving half of the negotiation.
    pub fn on_tx_parameters(&mut self, my_id: WalletId, msg: SetTxParameter) -> Result<()> {
        if msg.tx_type != TxType::Simple {
            tracing::debug!("{} ignoring message of unknown tx type", msg.tx_id);
            return Ok(());
        }
        let tx_id = msg.tx_id;

        let known = read_store(&self.store)?.get_tx(&tx_id);
        match &known {
            Some(tx) if !self.active.contains_key(&tx_id) && !tx.can_cancel() => {
                // Late or duplicate message for a settled transaction.
                tracing::debug!("{} dropping message for settled transaction", tx_id);
                return Ok(());
            }
            Some(_) => {}
            None => self.init_receiving_tx(&tx_id, my_id, &msg)?,
        }

        {
            let mut guard = write_store(&self.store)?;
            for (param_id, blob) in &msg.params {
                guard.set_tx_parameter(&tx_id, *param_id, blob, true)?;
            }
        }

        if known.is_none() {
            self.save_description_from_params(&tx_id)?;
        }

        self.resume_tx(tx_id).update()
    }

    /// The node's answer to `register_tx`.
    pub fn on_transaction_registered(&mut self, tx_id: TxId, registered: bool) -> Result<()> {
        if !self.is_live(&tx_id)? {
            return Ok(());
        }
        {
            let mut guard = write_store(&self.store)?;
            set_parameter(
                &mut *guard,
                &tx_id,
                TxParameterId::TransactionRegistered,
                &registered,
                true,
            )?;
        }
        self.resume_tx(tx_id).update()
    }

    /// The node's answer to `confirm_kernel`.
    pub fn on_kernel_proof(&mut self, tx_id: TxId, height: Height) -> Result<()> {
        if !self.is_live(&tx_id)? {
            return Ok(());
        }
        {
            let mut guard = write_store(&self.store)?;
            set_parameter(
                &mut *guard,
                &tx_id,
                TxParameterId::KernelProofHeight,
                &height,
                true,
            )?;
        }
        self.resume_tx(tx_id).update()
    }

    /// The chain tip advanced: persist it and give every active
    /// transaction one update.
    pub fn on_tip_changed(&mut self, state: SystemState) -> Result<()> {
        write_store(&self.store)?.set_system_state(&state)?;
        let tx_ids: Vec<TxId> = self.active.keys().copied().collect();
        for tx_id in tx_ids {
            self.resume_tx(tx_id).update()?;
        }
        Ok(())
    }

    pub fn cancel_tx(&mut self, tx_id: TxId) -> Result<()> {
        let result = self.resume_tx(tx_id).cancel();
        self.active.remove(&tx_id);
        result
    }

    /// Terminal gateway signal: drop the transaction from the active set.
    pub fn on_tx_completed(&mut self, tx_id: TxId) {
        self.active.remove(&tx_id);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Create a fresh own address backed by a newly allocated identity
    /// key.
    pub fn create_address(&mut self, label: &str) -> Result<WalletAddress> {
        let mut guard = write_store(&self.store)?;
        let own_id = guard.allocate_kid_range(1);
        let key = identity_key(guard.master_kdf(), own_id);
        let address = WalletAddress {
            wallet_id: WalletId::from_secret(&key),
            label: label.to_string(),
            category: String::new(),
            create_time: timestamp_now(),
            duration: 0,
            own_id,
        };
        guard.save_address(&address)?;
        Ok(address)
    }

    /// A cancelled or settled transaction no longer consumes node
    /// answers.
    fn is_live(&self, tx_id: &TxId) -> Result<bool> {
        if self.active.contains_key(tx_id) {
            return Ok(true);
        }
        Ok(read_store(&self.store)?
            .get_tx(tx_id)
            .map(|tx| tx.can_cancel())
            .unwrap_or(false))
    }

    fn resume_tx(&mut self, tx_id: TxId) -> &mut SimpleTransaction {
        let store = Arc::clone(&self.store);
        let gateway = Arc::clone(&self.gateway);
        self.active
            .entry(tx_id)
            .or_insert_with(|| SimpleTransaction::new(store, gateway, tx_id))
    }

    /// Seed the receiving half of a transaction on first contact.
    fn init_receiving_tx(
        &mut self,
        tx_id: &TxId,
        my_id: WalletId,
        msg: &SetTxParameter,
    ) -> Result<()> {
        tracing::info!("{} incoming transaction from {}", tx_id, msg.from);
        let now = timestamp_now();
        let mut guard = write_store(&self.store)?;
        let store = &mut *guard;
        set_parameter(store, tx_id, TxParameterId::TransactionType, &TxType::Simple, false)?;
        set_parameter(store, tx_id, TxParameterId::CreateTime, &now, false)?;
        set_parameter(store, tx_id, TxParameterId::ModifyTime, &now, false)?;
        set_parameter(store, tx_id, TxParameterId::PeerId, &msg.from, false)?;
        set_parameter(store, tx_id, TxParameterId::MyId, &my_id, false)?;
        set_parameter(store, tx_id, TxParameterId::IsInitiator, &false, false)?;
        set_parameter(store, tx_id, TxParameterId::Status, &TxStatus::Pending, false)?;
        Ok(())
    }

    /// Build the history record for a transaction created by a peer
    /// message, once its parameters are in the bag.
    fn save_description_from_params(&mut self, tx_id: &TxId) -> Result<()> {
        let mut guard = write_store(&self.store)?;
        let store = &mut *guard;

        let amount = crate::storage::get_parameter(store, tx_id, TxParameterId::Amount)?
            .unwrap_or(0u64);
        let fee =
            crate::storage::get_parameter(store, tx_id, TxParameterId::Fee)?.unwrap_or(0u64);
        let min_height = crate::storage::get_parameter(store, tx_id, TxParameterId::MinHeight)?
            .unwrap_or(0u64);
        let sender = crate::storage::get_parameter(store, tx_id, TxParameterId::IsSender)?
            .unwrap_or(false);
        let peer_id =
            crate::storage::get_parameter(store, tx_id, TxParameterId::PeerId)?;
        let my_id = crate::storage::get_parameter(store, tx_id, TxParameterId::MyId)?;
        let create_time = crate::storage::get_parameter(store, tx_id, TxParameterId::CreateTime)?
            .unwrap_or_else(timestamp_now);

        let (peer_id, my_id) = match (peer_id, my_id) {
            (Some(p), Some(m)) => (p, m),
            _ => return Ok(()),
        };

        guard.save_tx(&TxDescription {
            tx_id: *tx_id,
            amount,
            fee,
            change: 0,
            min_height,
            peer_id,
            my_id,
            create_time,
            modify_time: create_time,
            sender,
            status: TxStatus::Pending,
            kernel_id: None,
        })?;
        Ok(())
    }
}
