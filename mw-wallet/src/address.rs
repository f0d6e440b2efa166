//! Wallet identities and the address book entry.

use std::fmt;

use secp256k1::{Keypair, SecretKey, XOnlyPublicKey, SECP256K1};

use crate::crypto::{KeyId, KeyType, MasterKdf};
use crate::error::WalletError;
use crate::types::{timestamp_now, Timestamp};

/// A public wallet identity: a 256-bit curve point, hex-serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalletId(XOnlyPublicKey);

impl WalletId {
    /// Parse from exactly 64 hex characters; rejects off-curve points.
    pub fn from_hex(s: &str) -> Result<Self, WalletError> {
        if s.len() != 64 {
            return Err(WalletError::InvalidAddress(format!(
                "expected 64 hex characters, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
        let point = XOnlyPublicKey::from_slice(&bytes)
            .map_err(|_| WalletError::InvalidAddress("point is not on the curve".into()))?;
        Ok(WalletId(point))
    }

    /// The identity controlled by a secret key.
    pub fn from_secret(sk: &SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(SECP256K1, sk);
        WalletId(keypair.x_only_public_key().0)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, WalletError> {
        XOnlyPublicKey::from_slice(bytes)
            .map(WalletId)
            .map_err(|_| WalletError::InvalidAddress("point is not on the curve".into()))
    }

    pub fn serialize(&self) -> [u8; 32] {
        self.0.serialize()
    }

    pub fn as_xonly(&self) -> &XOnlyPublicKey {
        &self.0
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.serialize()))
    }
}

/// One address-book entry.
///
/// `own_id` is non-zero when this wallet controls the secret behind the
/// identity; it doubles as the key-derivation index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletAddress {
    pub wallet_id: WalletId,
    pub label: String,
    pub category: String,
    pub create_time: Timestamp,
    /// Seconds until expiry; zero means the address never expires.
    pub duration: u64,
    pub own_id: u64,
}

impl WalletAddress {
    pub fn expiration_time(&self) -> Timestamp {
        if self.duration == 0 {
            return Timestamp::MAX;
        }
        self.create_time.saturating_add(self.duration)
    }

    pub fn is_expired(&self) -> bool {
        timestamp_now() > self.expiration_time()
    }

    pub fn is_own(&self) -> bool {
        self.own_id != 0
    }
}

/// Derive the identity secret key behind an own address.
pub fn identity_key(kdf: &MasterKdf, own_id: u64) -> SecretKey {
    kdf.derive_key(&KeyId::new(own_id, KeyType::Identity, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_hex_accepts_valid_id() {
        let sk = SecretKey::from_slice(&[3u8; 32]).unwrap();
        let id = WalletId::from_secret(&sk);
        let parsed = WalletId::from_hex(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn from_hex_rejects_bad_length_and_garbage() {
        assert!(WalletId::from_hex("abcd").is_err());
        assert!(WalletId::from_hex(&"g".repeat(64)).is_err());
        // 64 hex chars but x-coordinate beyond the field modulus.
        assert!(WalletId::from_hex(&"ff".repeat(32)).is_err());
    }

    #[test]
    fn address_expiry() {
        let sk = SecretKey::from_slice(&[4u8; 32]).unwrap();
        let mut addr = WalletAddress {
            wallet_id: WalletId::from_secret(&sk),
            label: "test".into(),
            category: String::new(),
            create_time: timestamp_now(),
            duration: 0,
            own_id: 1,
        };
        assert!(!addr.is_expired());

        addr.create_time = 1000;
        addr.duration = 1;
        assert!(addr.is_expired());
    }
}
