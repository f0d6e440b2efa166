//! Two-party Schnorr multisig and payment confirmations.
//!
//! The kernel signature is assembled from two partial signatures over a
//! shared public nonce `R = R_a + R_b` and a shared commitment
//! `E = P_a + P_b`:
//!
//! ```text
//! e   = H(R || E || m)            (challenge, shared)
//! s_i = k_i + e * x_i             (partial, per party)
//! s   = s_a + s_b                 (final)
//! ```
//!
//! A partial verifies as `s_i * G == R_i + e * P_i`, the final signature as
//! `s * G == R + e * E`. Payment confirmations are ordinary BIP340 Schnorr
//! signatures over `(kernel id, amount, sender)` under the receiver's
//! wallet identity.

use secp256k1::schnorr::Signature as BipSignature;
use secp256k1::{Keypair, Message, PublicKey, Scalar, SecretKey, SECP256K1};

use super::{public_of, scalar_add};
use crate::address::WalletId;
use crate::error::CryptoResult;
use crate::types::{Amount, Hash32};

/// A completed kernel signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// The shared public nonce `R`.
    pub nonce_pub: PublicKey,
    /// The aggregated scalar `s`.
    pub k: SecretKey,
}

impl Signature {
    /// Verify against the commitment the signature was produced for.
    pub fn is_valid(&self, msg: &Hash32, commitment: &PublicKey) -> bool {
        verify_equation(
            &self.k,
            &self.nonce_pub,
            commitment,
            &self.nonce_pub,
            commitment,
            msg,
        )
    }
}

/// The Fiat-Shamir challenge `e = H(R || E || m)`, reduced to a scalar.
///
/// Both parties must arrive at the same scalar, so the overflow fallback
/// (re-hashing) is deterministic rather than randomized.
pub fn challenge(nonce_pub: &PublicKey, commitment: &PublicKey, msg: &Hash32) -> Scalar {
    let mut digest =
        super::hash_parts(&[&nonce_pub.serialize(), &commitment.serialize(), &msg.0]).0;
    loop {
        match Scalar::from_be_bytes(digest) {
            Ok(scalar) => return scalar,
            Err(_) => digest = super::hash_parts(&[&digest]).0,
        }
    }
}

/// Produce this party's partial signature `s_i = k_i + e * x_i`.
pub fn sign_partial(
    excess: &SecretKey,
    nonce: &SecretKey,
    total_nonce_pub: &PublicKey,
    commitment: &PublicKey,
    msg: &Hash32,
) -> CryptoResult<SecretKey> {
    let e = challenge(total_nonce_pub, commitment, msg);
    let ex = excess.mul_tweak(&e)?;
    scalar_add(nonce, &ex)
}

/// Check a peer's partial signature against its public nonce and excess.
///
/// The challenge binds the aggregate nonce and commitment; the equation
/// checks only the peer's share of both.
pub fn verify_partial(
    partial: &SecretKey,
    peer_nonce_pub: &PublicKey,
    peer_excess_pub: &PublicKey,
    total_nonce_pub: &PublicKey,
    commitment: &PublicKey,
    msg: &Hash32,
) -> bool {
    verify_equation(
        partial,
        peer_nonce_pub,
        peer_excess_pub,
        total_nonce_pub,
        commitment,
        msg,
    )
}

/// `s * G == R_share + e * P_share` with `e = H(R_total || E || m)`.
fn verify_equation(
    s: &SecretKey,
    nonce_pub_share: &PublicKey,
    pubkey_share: &PublicKey,
    total_nonce_pub: &PublicKey,
    commitment: &PublicKey,
    msg: &Hash32,
) -> bool {
    let e = challenge(total_nonce_pub, commitment, msg);
    let rhs = match pubkey_share
        .mul_tweak(SECP256K1, &e)
        .and_then(|ep| nonce_pub_share.combine(&ep))
    {
        Ok(point) => point,
        Err(_) => return false,
    };
    public_of(s) == rhs
}

/// A receiver-signed acknowledgement binding a payment to a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub kernel_id: Hash32,
    pub amount: Amount,
    pub sender: WalletId,
    pub signature: BipSignature,
}

impl PaymentConfirmation {
    fn message(kernel_id: &Hash32, amount: Amount, sender: &WalletId) -> Message {
        let digest = super::hash_parts(&[
            b"mw/payment-confirmation",
            &kernel_id.0,
            &amount.to_le_bytes(),
            &sender.serialize(),
        ]);
        Message::from_digest(digest.0)
    }

    /// Sign `(kernel id, amount, sender)` with the receiver's identity key.
    pub fn sign(
        kernel_id: Hash32,
        amount: Amount,
        sender: WalletId,
        receiver_key: &SecretKey,
    ) -> Self {
        let keypair = Keypair::from_secret_key(SECP256K1, receiver_key);
        let msg = Self::message(&kernel_id, amount, &sender);
        let signature = SECP256K1.sign_schnorr(&msg, &keypair);
        PaymentConfirmation {
            kernel_id,
            amount,
            sender,
            signature,
        }
    }

    /// Verify against the receiver's wallet identity.
    pub fn is_valid(&self, receiver: &WalletId) -> bool {
        let msg = Self::message(&self.kernel_id, self.amount, &self.sender);
        SECP256K1
            .verify_schnorr(&self.signature, &msg, receiver.as_xonly())
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::point_add;
    use secp256k1::SecretKey;

    fn key(fill: u8) -> SecretKey {
        SecretKey::from_slice(&[fill; 32]).unwrap()
    }

    struct Party {
        excess: SecretKey,
        nonce: SecretKey,
    }

    impl Party {
        fn new(e: u8, n: u8) -> Self {
            Party {
                excess: key(e),
                nonce: key(n),
            }
        }
    }

    #[test]
    fn two_party_signature_aggregates() {
        let alice = Party::new(10, 11);
        let bob = Party::new(20, 21);
        let msg = Hash32([42; 32]);

        let commitment =
            point_add(&public_of(&alice.excess), &public_of(&bob.excess)).unwrap();
        let nonce_pub =
            point_add(&public_of(&alice.nonce), &public_of(&bob.nonce)).unwrap();

        let sa =
            sign_partial(&alice.excess, &alice.nonce, &nonce_pub, &commitment, &msg).unwrap();
        let sb = sign_partial(&bob.excess, &bob.nonce, &nonce_pub, &commitment, &msg).unwrap();

        // Each side can check the other's partial.
        assert!(verify_partial(
            &sb,
            &public_of(&bob.nonce),
            &public_of(&bob.excess),
            &nonce_pub,
            &commitment,
            &msg,
        ));
        assert!(verify_partial(
            &sa,
            &public_of(&alice.nonce),
            &public_of(&alice.excess),
            &nonce_pub,
            &commitment,
            &msg,
        ));

        let sig = Signature {
            nonce_pub,
            k: scalar_add(&sa, &sb).unwrap(),
        };
        assert!(sig.is_valid(&msg, &commitment));
        assert!(!sig.is_valid(&Hash32([43; 32]), &commitment));
    }

    #[test]
    fn tampered_partial_is_rejected() {
        let alice = Party::new(10, 11);
        let bob = Party::new(20, 21);
        let msg = Hash32([1; 32]);

        let commitment =
            point_add(&public_of(&alice.excess), &public_of(&bob.excess)).unwrap();
        let nonce_pub =
            point_add(&public_of(&alice.nonce), &public_of(&bob.nonce)).unwrap();

        let sb = sign_partial(&bob.excess, &bob.nonce, &nonce_pub, &commitment, &msg).unwrap();
        let forged = scalar_add(&sb, &key(1)).unwrap();
        assert!(!verify_partial(
            &forged,
            &public_of(&bob.nonce),
            &public_of(&bob.excess),
            &nonce_pub,
            &commitment,
            &msg,
        ));
    }

    #[test]
    fn payment_confirmation_round_trip() {
        let receiver_key = key(77);
        let receiver = WalletId::from_secret(&receiver_key);
        let sender = WalletId::from_secret(&key(88));

        let pc = PaymentConfirmation::sign(Hash32([9; 32]), 500, sender, &receiver_key);
        assert!(pc.is_valid(&receiver));

        // Wrong receiver, wrong amount, wrong sender all fail.
        assert!(!pc.is_valid(&sender));
        let mut tampered = pc;
        tampered.amount = 501;
        assert!(!tampered.is_valid(&receiver));
        let mut tampered = pc;
        tampered.sender = receiver;
        assert!(!tampered.is_valid(&receiver));
    }
}
