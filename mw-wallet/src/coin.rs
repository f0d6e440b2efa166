//! Owned unspent outputs and their lifecycle.

use crate::crypto::{KeyId, KeyType};
use crate::types::{Amount, Height, TxId, MAX_HEIGHT};

/// Session token meaning "not reserved by any selection".
pub const EMPTY_COIN_SESSION: u64 = 0;

/// Lifecycle state of a coin.
///
/// A coin with `spend_tx` set stays `Outgoing` while its transaction is
/// open and becomes `Spent` only once the kernel proof lands; a coin with
/// `create_tx` set stays `Incoming` until the same event flips it to
/// `Available`. A coin is never simultaneously `Outgoing` and `Incoming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CoinStatus {
    Unavailable = 0,
    Available = 1,
    Maturing = 2,
    Outgoing = 3,
    Incoming = 4,
    Spent = 5,
}

impl CoinStatus {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(CoinStatus::Unavailable),
            1 => Some(CoinStatus::Available),
            2 => Some(CoinStatus::Maturing),
            3 => Some(CoinStatus::Outgoing),
            4 => Some(CoinStatus::Incoming),
            5 => Some(CoinStatus::Spent),
            _ => None,
        }
    }
}

/// An owned output.
///
/// The identifier carries everything needed to re-derive the blinding
/// factor and commitment from the master KDF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub id: KeyId,
    pub status: CoinStatus,
    pub create_height: Height,
    /// Spendable only once the chain reaches this height.
    pub maturity: Height,
    pub confirm_height: Height,
    pub locked_height: Height,
    pub create_tx: Option<TxId>,
    pub spend_tx: Option<TxId>,
    pub session: u64,
}

impl Coin {
    pub fn new(id: KeyId, status: CoinStatus) -> Self {
        Coin {
            id,
            status,
            create_height: 0,
            maturity: MAX_HEIGHT,
            confirm_height: MAX_HEIGHT,
            locked_height: MAX_HEIGHT,
            create_tx: None,
            spend_tx: None,
            session: EMPTY_COIN_SESSION,
        }
    }

    pub fn value(&self) -> Amount {
        self.id.value
    }

    pub fn is_change(&self) -> bool {
        self.id.key_type == KeyType::Change
    }

    /// Whether the coin may be picked by `select_coins`.
    pub fn is_selectable(&self) -> bool {
        self.status == CoinStatus::Available && self.session == EMPTY_COIN_SESSION
    }

    /// Refresh `Maturing` coins against the current tip.
    pub fn refresh_maturity(&mut self, tip: Height) -> bool {
        if self.status == CoinStatus::Maturing && tip >= self.maturity {
            self.status = CoinStatus::Available;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(value: Amount, status: CoinStatus) -> Coin {
        Coin::new(KeyId::new(1, KeyType::Regular, value), status)
    }

    #[test]
    fn selectable_only_when_available_and_unreserved() {
        let mut c = coin(10, CoinStatus::Available);
        assert!(c.is_selectable());

        c.session = 7;
        assert!(!c.is_selectable());

        c.session = EMPTY_COIN_SESSION;
        c.status = CoinStatus::Incoming;
        assert!(!c.is_selectable());
    }

    #[test]
    fn maturing_coin_becomes_available_at_maturity() {
        let mut c = coin(10, CoinStatus::Maturing);
        c.maturity = 100;
        assert!(!c.refresh_maturity(99));
        assert_eq!(c.status, CoinStatus::Maturing);
        assert!(c.refresh_maturity(100));
        assert_eq!(c.status, CoinStatus::Available);
    }
}
