//! Elliptic-curve arithmetic for confidential transactions.
//!
//! Everything is built on `secp256k1`: Pedersen commitments use a second
//! generator `H` (a NUMS point nobody knows the discrete log of), scalar
//! arithmetic goes through the tweak API, and payment confirmations use
//! BIP340 Schnorr signatures. The two-party kernel signature is a plain
//! Schnorr multisig over a shared public nonce; see [`schnorr`].

pub mod kdf;
pub mod schnorr;

use std::sync::OnceLock;

use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, CryptoResult};
use crate::types::{Amount, Hash32};

pub use kdf::{KeyId, KeyType, MasterKdf};

static GENERATOR_H: OnceLock<PublicKey> = OnceLock::new();

/// The value generator `H`.
///
/// Derived from the serialized base generator `G` by try-and-increment, so
/// its discrete log with respect to `G` is unknown.
pub fn generator_h() -> &'static PublicKey {
    GENERATOR_H.get_or_init(|| {
        let g = SecretKey::from_slice(&[
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 1,
        ])
        .expect("one is a valid scalar")
        .public_key(SECP256K1);

        let mut counter = 0u32;
        loop {
            let mut hasher = Sha256::new();
            hasher.update(b"mw-wallet/generator-h");
            hasher.update(g.serialize());
            hasher.update(counter.to_le_bytes());
            let digest: [u8; 32] = hasher.finalize().into();

            let mut candidate = [0u8; 33];
            candidate[0] = 0x02;
            candidate[1..].copy_from_slice(&digest);
            if let Ok(point) = PublicKey::from_slice(&candidate) {
                return point;
            }
            counter += 1;
        }
    })
}

/// Pedersen commitment `value * H + blinding * G`.
pub fn commit(value: Amount, blinding: &SecretKey) -> CryptoResult<PublicKey> {
    let blind_point = blinding.public_key(SECP256K1);
    if value == 0 {
        return Ok(blind_point);
    }
    let value_point = generator_h().mul_tweak(SECP256K1, &scalar_from_u64(value))?;
    point_add(&value_point, &blind_point)
}

/// `value * H`, the commitment to a bare value with no blinding.
pub fn commit_value(value: Amount) -> CryptoResult<PublicKey> {
    if value == 0 {
        return Err(CryptoError::InvalidScalar);
    }
    Ok(generator_h().mul_tweak(SECP256K1, &scalar_from_u64(value))?)
}

/// `a + b` over the curve order.
pub fn scalar_add(a: &SecretKey, b: &SecretKey) -> CryptoResult<SecretKey> {
    Ok(a.add_tweak(&Scalar::from(*b))?)
}

/// `a - b` over the curve order.
pub fn scalar_sub(a: &SecretKey, b: &SecretKey) -> CryptoResult<SecretKey> {
    scalar_add(a, &b.negate())
}

/// Accumulate `delta` into an optional running sum.
///
/// The sum starts at zero, which `SecretKey` cannot represent; the
/// accumulator is `None` until the first contribution.
pub fn scalar_accumulate(acc: &mut Option<SecretKey>, delta: SecretKey) -> CryptoResult<()> {
    *acc = Some(match acc.take() {
        Some(current) => scalar_add(&current, &delta)?,
        None => delta,
    });
    Ok(())
}

/// Point addition.
pub fn point_add(a: &PublicKey, b: &PublicKey) -> CryptoResult<PublicKey> {
    a.combine(b).map_err(|_| CryptoError::DegenerateSum)
}

/// Sum of a non-empty slice of points.
pub fn point_sum(points: &[PublicKey]) -> CryptoResult<PublicKey> {
    let (first, rest) = points.split_first().ok_or(CryptoError::DegenerateSum)?;
    let mut acc = *first;
    for p in rest {
        acc = point_add(&acc, p)?;
    }
    Ok(acc)
}

/// Public form of a secret scalar, `sk * G`.
pub fn public_of(sk: &SecretKey) -> PublicKey {
    sk.public_key(SECP256K1)
}

fn scalar_from_u64(value: u64) -> Scalar {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&value.to_be_bytes());
    Scalar::from_be_bytes(bytes).expect("64-bit value is below the curve order")
}

/// SHA-256 of a list of byte strings.
pub fn hash_parts(parts: &[&[u8]]) -> Hash32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Hash32(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fill: u8) -> SecretKey {
        SecretKey::from_slice(&[fill; 32]).unwrap()
    }

    #[test]
    fn generator_h_differs_from_g() {
        let g = key(1).public_key(SECP256K1);
        assert_ne!(*generator_h(), g);
        // Deterministic across calls.
        assert_eq!(*generator_h(), *generator_h());
    }

    #[test]
    fn commitment_is_homomorphic() {
        // commit(a, x) + commit(b, y) == commit(a + b, x + y)
        let (a, b) = (3u64, 7u64);
        let (x, y) = (key(11), key(23));

        let lhs = point_add(&commit(a, &x).unwrap(), &commit(b, &y).unwrap()).unwrap();
        let rhs = commit(a + b, &scalar_add(&x, &y).unwrap()).unwrap();
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn zero_value_commits_to_blinding_only() {
        let x = key(5);
        assert_eq!(commit(0, &x).unwrap(), public_of(&x));
    }

    #[test]
    fn scalar_sub_inverts_add() {
        let a = key(9);
        let b = key(4);
        let sum = scalar_add(&a, &b).unwrap();
        assert_eq!(scalar_sub(&sum, &b).unwrap(), a);
    }

    #[test]
    fn accumulate_from_empty() {
        let mut acc = None;
        scalar_accumulate(&mut acc, key(2)).unwrap();
        scalar_accumulate(&mut acc, key(3)).unwrap();
        assert_eq!(acc.unwrap(), scalar_add(&key(2), &key(3)).unwrap());
    }
}
