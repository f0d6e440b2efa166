//! Storage abstraction for the wallet core.
//!
//! The store exclusively owns coins, addresses, transaction descriptions
//! and the per-transaction parameter bag. It runs on the wallet reactor
//! thread, so the trait is synchronous; cross-thread access goes through
//! the typed bridge, never through the store directly.

pub mod memory;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use secp256k1::{PublicKey, SecretKey};

use crate::address::{WalletAddress, WalletId};
use crate::coin::Coin;
use crate::crypto::{self, KeyId, MasterKdf};
use crate::error::{StorageError, StorageResult};
use crate::event_bus::EventReceiver;
use crate::params::{ParameterValue, TxParameterId};
use crate::types::{Amount, BlockHeader, Height, SystemState, TxDescription, TxId};

pub use memory::MemoryWalletStorage;

/// Keyed persistence for the wallet core.
pub trait WalletStorage: Send {
    /// The master key-derivation handle.
    fn master_kdf(&self) -> &MasterKdf;

    /// Mint `count` fresh key identifiers; returns the first.
    ///
    /// Ranges are issued monotonically and never reused for the lifetime
    /// of the store.
    fn allocate_kid_range(&mut self, count: u64) -> u64;

    /// Pick `Available` coins whose values sum to at least `amount`, or an
    /// empty vector when funds are insufficient.
    ///
    /// With `lock` set the returned coins are reserved under a fresh
    /// session so concurrent selections cannot double-spend them.
    fn select_coins(&mut self, amount: Amount, lock: bool) -> Vec<Coin>;

    /// Sum of the values of all selectable coins.
    fn get_available(&self) -> Amount;

    /// Insert a new coin.
    fn store_coin(&mut self, coin: &Coin) -> StorageResult<()>;

    /// Persist updates to known coins.
    fn save_coins(&mut self, coins: &[Coin]) -> StorageResult<()>;

    /// Remove a coin outright.
    fn remove_coin(&mut self, id: &KeyId) -> StorageResult<()>;

    fn get_coin(&self, id: &KeyId) -> Option<Coin>;

    /// Visit every coin until the callback returns `false`.
    fn visit_coins(&self, visitor: &mut dyn FnMut(&Coin) -> bool);

    fn get_coins_created_by_tx(&self, tx_id: &TxId) -> Vec<Coin>;

    /// Blinding factor and Pedersen commitment of a coin.
    ///
    /// Derivation goes through the child KDF selected by the coin's
    /// sub-index.
    fn calc_commitment(&self, id: &KeyId) -> StorageResult<(SecretKey, PublicKey)> {
        let blinding = self.master_kdf().child_kdf(id.sub_idx).derive_key(id);
        let commitment = crypto::commit(id.value, &blinding)?;
        Ok((blinding, commitment))
    }

    /// Write one parameter blob; returns whether the stored value changed.
    ///
    /// The write is flushed before the call returns. With `should_notify`
    /// set, a change emits a transaction-changed notification.
    fn set_tx_parameter(
        &mut self,
        tx_id: &TxId,
        param_id: TxParameterId,
        blob: &[u8],
        should_notify: bool,
    ) -> StorageResult<bool>;

    fn get_tx_parameter(&self, tx_id: &TxId, param_id: TxParameterId) -> Option<Vec<u8>>;

    fn get_tx_history(&self) -> Vec<TxDescription>;

    fn get_tx(&self, tx_id: &TxId) -> Option<TxDescription>;

    fn save_tx(&mut self, tx: &TxDescription) -> StorageResult<()>;

    /// Delete a transaction record and its parameter bag.
    fn delete_tx(&mut self, tx_id: &TxId) -> StorageResult<()>;

    /// Undo coin-state changes caused by one transaction: outputs it
    /// created are removed, inputs it reserved return to `Available`.
    fn rollback_tx(&mut self, tx_id: &TxId) -> StorageResult<()>;

    /// Rewind coin confirmations past a reorg at `min_height`.
    fn rollback_confirmed_utxo(&mut self, min_height: Height) -> StorageResult<()>;

    fn get_addresses(&self, own: bool) -> Vec<WalletAddress>;

    fn get_address(&self, id: &WalletId) -> Option<WalletAddress>;

    fn save_address(&mut self, address: &WalletAddress) -> StorageResult<()>;

    fn delete_address(&mut self, id: &WalletId) -> StorageResult<()>;

    fn get_system_state(&self) -> Option<SystemState>;

    fn set_system_state(&mut self, state: &SystemState) -> StorageResult<()>;

    /// Height of the last known system state, zero when none.
    fn current_height(&self) -> Height {
        self.get_system_state().map(|s| s.height).unwrap_or(0)
    }

    /// Append block headers to the chain-of-trust history.
    fn add_headers(&mut self, headers: &[BlockHeader]) -> StorageResult<()>;

    fn header_at(&self, height: Height) -> Option<BlockHeader>;

    /// Drop history from `height` upwards (reorg).
    fn delete_headers_from(&mut self, height: Height) -> StorageResult<()>;

    /// Atomically re-encrypt persisted key material under a new password.
    ///
    /// Either the whole store opens with the new password afterwards, or
    /// the operation fails and the old password still opens it.
    fn change_password(&mut self, old: &str, new: &str) -> StorageResult<()>;

    /// Subscribe to change notifications. Dropping the receiver
    /// unsubscribes.
    fn subscribe(&self) -> EventReceiver;
}

/// Shared handle to the wallet store.
pub type SharedStorage = Arc<RwLock<dyn WalletStorage>>;

/// Wrap a concrete store into a shared handle.
pub fn shared<S: WalletStorage + 'static>(store: S) -> SharedStorage {
    Arc::new(RwLock::new(store))
}

pub fn read_store(store: &SharedStorage) -> StorageResult<RwLockReadGuard<'_, dyn WalletStorage>> {
    store
        .read()
        .map_err(|e| StorageError::LockPoisoned(e.to_string()))
}

pub fn write_store(
    store: &SharedStorage,
) -> StorageResult<RwLockWriteGuard<'_, dyn WalletStorage + 'static>> {
    store
        .write()
        .map_err(|e| StorageError::LockPoisoned(e.to_string()))
}

/// Read one typed parameter from the bag.
pub fn get_parameter<T: ParameterValue>(
    store: &dyn WalletStorage,
    tx_id: &TxId,
    param_id: TxParameterId,
) -> StorageResult<Option<T>> {
    match store.get_tx_parameter(tx_id, param_id) {
        None => Ok(None),
        Some(blob) => T::from_blob(&blob)
            .map(Some)
            .map_err(|e| StorageError::Serialization(format!("{param_id:?}: {e}"))),
    }
}

/// Write one typed parameter into the bag.
pub fn set_parameter<T: ParameterValue>(
    store: &mut dyn WalletStorage,
    tx_id: &TxId,
    param_id: TxParameterId,
    value: &T,
    should_notify: bool,
) -> StorageResult<bool> {
    store.set_tx_parameter(tx_id, param_id, &value.to_blob(), should_notify)
}
