//! In-memory storage implementation.
//!
//! Sqlite persistence mechanics live behind the same trait in production
//! deployments; the memory backend carries the full semantics: keyed
//! parameter bag, coin lifecycle, rollback, change notifications and
//! password-sealed key material.

use std::collections::BTreeMap;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha512;

use crate::address::{WalletAddress, WalletId};
use crate::coin::{Coin, CoinStatus, EMPTY_COIN_SESSION};
use crate::crypto::{KeyId, MasterKdf};
use crate::error::{StorageError, StorageResult};
use crate::event_bus::{EventBus, EventReceiver, WalletEvent};
use crate::params::TxParameterId;
use crate::storage::WalletStorage;
use crate::types::{
    Amount, BlockHeader, ChangeAction, Height, SystemState, TxDescription, TxId, MAX_HEIGHT,
};

const SEAL_SALT_LEN: usize = 16;
const SEAL_NONCE_LEN: usize = 12;
const SEAL_KDF_ROUNDS: u32 = 2048;

/// The master seed sealed under a password-derived key.
#[derive(Debug, Clone)]
struct SealedSeed {
    salt: [u8; SEAL_SALT_LEN],
    nonce: [u8; SEAL_NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl SealedSeed {
    fn seal(seed: &[u8; 64], password: &str) -> StorageResult<Self> {
        let mut salt = [0u8; SEAL_SALT_LEN];
        let mut nonce = [0u8; SEAL_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&seal_key(password, &salt)));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), seed.as_slice())
            .map_err(|_| StorageError::WriteFailed("seed encryption failed".into()))?;

        Ok(SealedSeed {
            salt,
            nonce,
            ciphertext,
        })
    }

    fn unseal(&self, password: &str) -> StorageResult<[u8; 64]> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&seal_key(password, &self.salt)));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map_err(|_| StorageError::InvalidPassword)?;
        plaintext
            .as_slice()
            .try_into()
            .map_err(|_| StorageError::Serialization("sealed seed has wrong length".into()))
    }
}

fn seal_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, SEAL_KDF_ROUNDS, &mut key);
    key
}

/// Bounded branch-and-bound search for a subset summing to exactly
/// `target`. Candidates must be sorted by descending value.
fn find_exact_subset(candidates: &[&Coin], target: Amount) -> Option<Vec<usize>> {
    const MAX_NODES: usize = 10_000;

    // Suffix sums for pruning: how much value remains from index i on.
    let mut remaining = vec![0u64; candidates.len() + 1];
    for i in (0..candidates.len()).rev() {
        remaining[i] = remaining[i + 1] + candidates[i].value();
    }

    fn search(
        candidates: &[&Coin],
        remaining: &[u64],
        index: usize,
        target: Amount,
        picked: &mut Vec<usize>,
        budget: &mut usize,
    ) -> bool {
        if target == 0 {
            return true;
        }
        if index >= candidates.len() || remaining[index] < target || *budget == 0 {
            return false;
        }
        *budget -= 1;

        let value = candidates[index].value();
        if value <= target {
            picked.push(index);
            if search(candidates, remaining, index + 1, target - value, picked, budget) {
                return true;
            }
            picked.pop();
        }
        search(candidates, remaining, index + 1, target, picked, budget)
    }

    let mut picked = Vec::new();
    let mut budget = MAX_NODES;
    search(candidates, &remaining, 0, target, &mut picked, &mut budget).then_some(picked)
}

/// In-memory wallet store.
pub struct MemoryWalletStorage {
    kdf: MasterKdf,
    sealed_seed: SealedSeed,
    coins: BTreeMap<KeyId, Coin>,
    params: BTreeMap<(TxId, TxParameterId), Vec<u8>>,
    txs: BTreeMap<TxId, TxDescription>,
    addresses: BTreeMap<WalletId, WalletAddress>,
    headers: BTreeMap<Height, BlockHeader>,
    system_state: Option<SystemState>,
    next_kid: u64,
    next_session: u64,
    events: EventBus,
}

impl MemoryWalletStorage {
    /// Create a fresh store with a random master seed sealed under
    /// `password`.
    pub fn create(password: &str) -> StorageResult<Self> {
        let mut seed = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::with_seed(seed, password)
    }

    /// Create a store over a caller-provided master seed.
    pub fn with_seed(seed: [u8; 64], password: &str) -> StorageResult<Self> {
        Ok(MemoryWalletStorage {
            kdf: MasterKdf::from_seed(seed),
            sealed_seed: SealedSeed::seal(&seed, password)?,
            coins: BTreeMap::new(),
            params: BTreeMap::new(),
            txs: BTreeMap::new(),
            addresses: BTreeMap::new(),
            headers: BTreeMap::new(),
            system_state: None,
            next_kid: 1,
            next_session: 1,
            events: EventBus::default(),
        })
    }

    /// Whether `password` opens the sealed key material.
    pub fn verify_password(&self, password: &str) -> bool {
        self.sealed_seed.unseal(password).is_ok()
    }

    fn update_coin_maturity(&mut self, tip: Height) {
        let mut changed = false;
        for coin in self.coins.values_mut() {
            changed |= coin.refresh_maturity(tip);
        }
        if changed {
            self.events.emit(WalletEvent::CoinsChanged);
        }
    }
}

impl WalletStorage for MemoryWalletStorage {
    fn master_kdf(&self) -> &MasterKdf {
        &self.kdf
    }

    fn allocate_kid_range(&mut self, count: u64) -> u64 {
        let first = self.next_kid;
        self.next_kid += count;
        first
    }

    fn select_coins(&mut self, amount: Amount, lock: bool) -> Vec<Coin> {
        let mut candidates: Vec<&Coin> =
            self.coins.values().filter(|c| c.is_selectable()).collect();
        candidates.sort_by(|a, b| b.value().cmp(&a.value()).then(a.id.cmp(&b.id)));

        if candidates.iter().map(|c| c.value()).sum::<Amount>() < amount {
            return Vec::new();
        }

        // Prefer an exact-match subset (no change output), fall back to
        // largest-first greedy for the fewest inputs.
        let mut selected: Vec<Coin> = match find_exact_subset(&candidates, amount) {
            Some(indices) => indices.iter().map(|i| candidates[*i].clone()).collect(),
            None => {
                let mut picked = Vec::new();
                let mut total: Amount = 0;
                for coin in candidates {
                    picked.push(coin.clone());
                    total += coin.value();
                    if total >= amount {
                        break;
                    }
                }
                picked
            }
        };

        if lock {
            let session = self.next_session;
            self.next_session += 1;
            for coin in &mut selected {
                coin.session = session;
                self.coins.insert(coin.id, coin.clone());
            }
            self.events.emit(WalletEvent::CoinsChanged);
        }
        selected
    }

    fn get_available(&self) -> Amount {
        self.coins
            .values()
            .filter(|c| c.is_selectable())
            .map(|c| c.value())
            .sum()
    }

    fn store_coin(&mut self, coin: &Coin) -> StorageResult<()> {
        self.coins.insert(coin.id, coin.clone());
        self.events.emit(WalletEvent::CoinsChanged);
        Ok(())
    }

    fn save_coins(&mut self, coins: &[Coin]) -> StorageResult<()> {
        if coins.is_empty() {
            return Ok(());
        }
        for coin in coins {
            self.coins.insert(coin.id, coin.clone());
        }
        self.events.emit(WalletEvent::CoinsChanged);
        Ok(())
    }

    fn remove_coin(&mut self, id: &KeyId) -> StorageResult<()> {
        self.coins.remove(id);
        self.events.emit(WalletEvent::CoinsChanged);
        Ok(())
    }

    fn get_coin(&self, id: &KeyId) -> Option<Coin> {
        self.coins.get(id).cloned()
    }

    fn visit_coins(&self, visitor: &mut dyn FnMut(&Coin) -> bool) {
        for coin in self.coins.values() {
            if !visitor(coin) {
                break;
            }
        }
    }

    fn get_coins_created_by_tx(&self, tx_id: &TxId) -> Vec<Coin> {
        self.coins
            .values()
            .filter(|c| c.create_tx.as_ref() == Some(tx_id))
            .cloned()
            .collect()
    }

    fn set_tx_parameter(
        &mut self,
        tx_id: &TxId,
        param_id: TxParameterId,
        blob: &[u8],
        should_notify: bool,
    ) -> StorageResult<bool> {
        let changed = self
            .params
            .insert((*tx_id, param_id), blob.to_vec())
            .as_deref()
            != Some(blob);
        if changed && should_notify {
            let items = self.get_tx(tx_id).into_iter().collect();
            self.events.emit(WalletEvent::TransactionChanged {
                action: ChangeAction::Updated,
                items,
            });
        }
        Ok(changed)
    }

    fn get_tx_parameter(&self, tx_id: &TxId, param_id: TxParameterId) -> Option<Vec<u8>> {
        self.params.get(&(*tx_id, param_id)).cloned()
    }

    fn get_tx_history(&self) -> Vec<TxDescription> {
        self.txs.values().cloned().collect()
    }

    fn get_tx(&self, tx_id: &TxId) -> Option<TxDescription> {
        self.txs.get(tx_id).cloned()
    }

    fn save_tx(&mut self, tx: &TxDescription) -> StorageResult<()> {
        let action = if self.txs.insert(tx.tx_id, tx.clone()).is_some() {
            ChangeAction::Updated
        } else {
            ChangeAction::Added
        };
        self.events.emit(WalletEvent::TransactionChanged {
            action,
            items: vec![tx.clone()],
        });
        Ok(())
    }

    fn delete_tx(&mut self, tx_id: &TxId) -> StorageResult<()> {
        let removed = self.txs.remove(tx_id);
        self.params.retain(|(id, _), _| id != tx_id);
        if let Some(tx) = removed {
            self.events.emit(WalletEvent::TransactionChanged {
                action: ChangeAction::Removed,
                items: vec![tx],
            });
        }
        Ok(())
    }

    fn rollback_tx(&mut self, tx_id: &TxId) -> StorageResult<()> {
        let mut to_remove = Vec::new();
        let mut changed = false;
        for coin in self.coins.values_mut() {
            if coin.create_tx.as_ref() == Some(tx_id) && coin.status == CoinStatus::Incoming {
                to_remove.push(coin.id);
            } else if coin.spend_tx.as_ref() == Some(tx_id) && coin.status == CoinStatus::Outgoing
            {
                coin.status = CoinStatus::Available;
                coin.spend_tx = None;
                coin.session = EMPTY_COIN_SESSION;
                changed = true;
            }
        }
        for id in &to_remove {
            self.coins.remove(id);
        }
        if changed || !to_remove.is_empty() {
            self.events.emit(WalletEvent::CoinsChanged);
        }
        Ok(())
    }

    fn rollback_confirmed_utxo(&mut self, min_height: Height) -> StorageResult<()> {
        let mut changed = false;
        for coin in self.coins.values_mut() {
            if coin.confirm_height != MAX_HEIGHT && coin.confirm_height > min_height {
                coin.status = if coin.create_tx.is_some() {
                    CoinStatus::Incoming
                } else {
                    CoinStatus::Unavailable
                };
                coin.confirm_height = MAX_HEIGHT;
                coin.maturity = MAX_HEIGHT;
                changed = true;
            }
        }
        if changed {
            self.events.emit(WalletEvent::CoinsChanged);
        }
        Ok(())
    }

    fn get_addresses(&self, own: bool) -> Vec<WalletAddress> {
        self.addresses
            .values()
            .filter(|a| a.is_own() == own)
            .cloned()
            .collect()
    }

    fn get_address(&self, id: &WalletId) -> Option<WalletAddress> {
        self.addresses.get(id).cloned()
    }

    fn save_address(&mut self, address: &WalletAddress) -> StorageResult<()> {
        self.addresses.insert(address.wallet_id, address.clone());
        self.events.emit(WalletEvent::AddressChanged);
        Ok(())
    }

    fn delete_address(&mut self, id: &WalletId) -> StorageResult<()> {
        if self.addresses.remove(id).is_some() {
            self.events.emit(WalletEvent::AddressChanged);
        }
        Ok(())
    }

    fn get_system_state(&self) -> Option<SystemState> {
        self.system_state
    }

    fn set_system_state(&mut self, state: &SystemState) -> StorageResult<()> {
        self.system_state = Some(*state);
        self.update_coin_maturity(state.height);
        self.events.emit(WalletEvent::SystemStateChanged);
        Ok(())
    }

    fn add_headers(&mut self, headers: &[BlockHeader]) -> StorageResult<()> {
        for header in headers {
            self.headers.insert(header.height, *header);
        }
        Ok(())
    }

    fn header_at(&self, height: Height) -> Option<BlockHeader> {
        self.headers.get(&height).copied()
    }

    fn delete_headers_from(&mut self, height: Height) -> StorageResult<()> {
        self.headers.retain(|h, _| *h < height);
        Ok(())
    }

    fn change_password(&mut self, old: &str, new: &str) -> StorageResult<()> {
        let seed = self.sealed_seed.unseal(old)?;
        // Build the replacement fully before swapping so a failure leaves
        // the old sealing in place.
        let resealed = SealedSeed::seal(&seed, new)?;
        self.sealed_seed = resealed;
        Ok(())
    }

    fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyType;

    fn store() -> MemoryWalletStorage {
        MemoryWalletStorage::with_seed([7u8; 64], "secret").unwrap()
    }

    fn add_coin(db: &mut MemoryWalletStorage, value: Amount) -> Coin {
        let idx = db.allocate_kid_range(1);
        let coin = Coin::new(KeyId::new(idx, KeyType::Regular, value), CoinStatus::Available);
        db.store_coin(&coin).unwrap();
        coin
    }

    #[test]
    fn select_coins_prefers_exact_match() {
        let mut db = store();
        for v in [4u64, 5, 7] {
            add_coin(&mut db, v);
        }
        // 7 + 4 hits 11 exactly; no change needed.
        let picked = db.select_coins(11, false);
        let mut values: Vec<Amount> = picked.iter().map(|c| c.value()).collect();
        values.sort_unstable();
        assert_eq!(values, vec![4, 7]);
    }

    #[test]
    fn select_coins_falls_back_to_largest_first() {
        let mut db = store();
        for v in [4u64, 5, 7] {
            add_coin(&mut db, v);
        }
        // No subset sums to 10; greedy takes 7 then 5.
        let picked = db.select_coins(10, false);
        let values: Vec<Amount> = picked.iter().map(|c| c.value()).collect();
        assert_eq!(values, vec![7, 5]);
    }

    #[test]
    fn select_coins_insufficient_returns_empty() {
        let mut db = store();
        add_coin(&mut db, 5);
        assert!(db.select_coins(11, true).is_empty());
        // Nothing was reserved.
        assert_eq!(db.get_available(), 5);
    }

    #[test]
    fn locked_coins_are_excluded_from_later_selections() {
        let mut db = store();
        add_coin(&mut db, 10);
        let first = db.select_coins(10, true);
        assert_eq!(first.len(), 1);
        assert!(db.select_coins(10, true).is_empty());
    }

    #[test]
    fn rollback_tx_restores_coin_state() {
        let mut db = store();
        let coin = add_coin(&mut db, 10);
        let tx_id = TxId([1; 16]);

        let mut spent = db.select_coins(10, true).pop().unwrap();
        spent.status = CoinStatus::Outgoing;
        spent.spend_tx = Some(tx_id);
        db.save_coins(&[spent]).unwrap();

        let idx = db.allocate_kid_range(1);
        let mut created = Coin::new(KeyId::new(idx, KeyType::Regular, 3), CoinStatus::Incoming);
        created.create_tx = Some(tx_id);
        db.store_coin(&created).unwrap();

        db.rollback_tx(&tx_id).unwrap();

        let restored = db.get_coin(&coin.id).unwrap();
        assert_eq!(restored, coin);
        assert!(db.get_coin(&created.id).is_none());
    }

    #[test]
    fn coins_created_by_tx_are_found() {
        let mut db = store();
        let tx_id = TxId([4; 16]);
        let idx = db.allocate_kid_range(2);

        let mut created = Coin::new(KeyId::new(idx, KeyType::Regular, 6), CoinStatus::Incoming);
        created.create_tx = Some(tx_id);
        db.store_coin(&created).unwrap();
        db.store_coin(&Coin::new(
            KeyId::new(idx + 1, KeyType::Regular, 7),
            CoinStatus::Available,
        ))
        .unwrap();

        let found = db.get_coins_created_by_tx(&tx_id);
        assert_eq!(found, vec![created]);
    }

    #[test]
    fn addresses_filter_by_ownership() {
        let mut db = store();
        let own_key = secp256k1::SecretKey::from_slice(&[5; 32]).unwrap();
        let foreign_key = secp256k1::SecretKey::from_slice(&[6; 32]).unwrap();

        db.save_address(&WalletAddress {
            wallet_id: WalletId::from_secret(&own_key),
            label: "mine".into(),
            category: String::new(),
            create_time: 0,
            duration: 0,
            own_id: 3,
        })
        .unwrap();
        db.save_address(&WalletAddress {
            wallet_id: WalletId::from_secret(&foreign_key),
            label: "theirs".into(),
            category: String::new(),
            create_time: 0,
            duration: 0,
            own_id: 0,
        })
        .unwrap();

        assert_eq!(db.get_addresses(true).len(), 1);
        assert_eq!(db.get_addresses(false).len(), 1);
        assert_eq!(db.get_addresses(true)[0].label, "mine");
    }

    #[test]
    fn kid_ranges_are_monotonic() {
        let mut db = store();
        let a = db.allocate_kid_range(3);
        let b = db.allocate_kid_range(1);
        assert_eq!(b, a + 3);
    }

    #[test]
    fn parameter_bag_round_trip_and_change_detection() {
        let mut db = store();
        let tx_id = TxId([2; 16]);
        assert!(db
            .set_tx_parameter(&tx_id, TxParameterId::Amount, &[1, 2, 3], false)
            .unwrap());
        assert!(!db
            .set_tx_parameter(&tx_id, TxParameterId::Amount, &[1, 2, 3], false)
            .unwrap());
        assert_eq!(
            db.get_tx_parameter(&tx_id, TxParameterId::Amount),
            Some(vec![1, 2, 3])
        );
    }

    #[test]
    fn password_change_is_atomic() {
        let mut db = store();
        assert!(db.verify_password("secret"));

        assert!(db.change_password("wrong", "other").is_err());
        assert!(db.verify_password("secret"));

        db.change_password("secret", "next").unwrap();
        assert!(db.verify_password("next"));
        assert!(!db.verify_password("secret"));
    }

    #[test]
    fn header_history_supports_reorg() {
        let mut db = store();
        let headers: Vec<BlockHeader> = (1u64..=5)
            .map(|h| BlockHeader {
                height: h,
                hash: crate::types::Hash32([h as u8; 32]),
                prev: crate::types::Hash32([h as u8 - 1; 32]),
            })
            .collect();
        db.add_headers(&headers).unwrap();

        assert_eq!(db.header_at(3).unwrap().hash, crate::types::Hash32([3; 32]));
        db.delete_headers_from(4).unwrap();
        assert!(db.header_at(4).is_none());
        assert!(db.header_at(3).is_some());
    }

    #[test]
    fn rollback_confirmed_utxo_rewinds_past_reorg() {
        let mut db = store();
        let tx_id = TxId([3; 16]);

        let idx = db.allocate_kid_range(2);
        let mut confirmed = Coin::new(KeyId::new(idx, KeyType::Regular, 8), CoinStatus::Available);
        confirmed.confirm_height = 120;
        confirmed.maturity = 180;
        confirmed.create_tx = Some(tx_id);
        let mut untouched =
            Coin::new(KeyId::new(idx + 1, KeyType::Regular, 9), CoinStatus::Available);
        untouched.confirm_height = 80;
        db.save_coins(&[confirmed.clone(), untouched.clone()]).unwrap();

        db.rollback_confirmed_utxo(100).unwrap();

        let rewound = db.get_coin(&confirmed.id).unwrap();
        assert_eq!(rewound.status, CoinStatus::Incoming);
        assert_eq!(rewound.confirm_height, MAX_HEIGHT);
        assert_eq!(rewound.maturity, MAX_HEIGHT);
        assert_eq!(db.get_coin(&untouched.id).unwrap(), untouched);
    }

    #[test]
    fn change_notifications_flush_before_return() {
        let mut db = store();
        let mut rx = db.subscribe();

        add_coin(&mut db, 3);
        assert!(matches!(rx.try_recv(), Some(WalletEvent::CoinsChanged)));

        db.set_system_state(&SystemState {
            height: 7,
            hash: Default::default(),
        })
        .unwrap();
        assert!(matches!(
            rx.try_recv(),
            Some(WalletEvent::SystemStateChanged)
        ));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn maturity_refresh_on_tip_advance() {
        let mut db = store();
        let idx = db.allocate_kid_range(1);
        let mut coin = Coin::new(KeyId::new(idx, KeyType::Regular, 5), CoinStatus::Maturing);
        coin.maturity = 50;
        db.store_coin(&coin).unwrap();

        db.set_system_state(&SystemState {
            height: 49,
            hash: Default::default(),
        })
        .unwrap();
        assert_eq!(db.get_coin(&coin.id).unwrap().status, CoinStatus::Maturing);

        db.set_system_state(&SystemState {
            height: 50,
            hash: Default::default(),
        })
        .unwrap();
        assert_eq!(db.get_coin(&coin.id).unwrap().status, CoinStatus::Available);
    }
}
