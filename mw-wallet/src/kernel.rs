//! Transaction body: inputs, outputs, the kernel, and final validation.

use secp256k1::{PublicKey, SecretKey, SECP256K1};

use crate::crypto::schnorr::Signature;
use crate::crypto::{self, point_sum};
use crate::error::{CryptoError, CryptoResult};
use crate::types::{Amount, Hash32, Height};

/// A spent output, referenced by its Pedersen commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxInput {
    pub commitment: PublicKey,
}

/// A created output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutput {
    pub commitment: PublicKey,
}

/// The signed commitment summarizing a transaction: fee, validity window,
/// excess commitment and Schnorr signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxKernel {
    pub fee: Amount,
    pub min_height: Height,
    pub max_height: Height,
    /// The aggregate public excess; set once both parties' halves are known.
    pub commitment: Option<PublicKey>,
    pub signature: Option<Signature>,
}

impl TxKernel {
    pub fn new(fee: Amount, min_height: Height, max_height: Height) -> Self {
        TxKernel {
            fee,
            min_height,
            max_height,
            commitment: None,
            signature: None,
        }
    }

    fn commitment(&self) -> CryptoResult<&PublicKey> {
        self.commitment
            .as_ref()
            .ok_or(CryptoError::NotReady("kernel commitment"))
    }

    /// The message both parties sign: fee, validity window and commitment.
    pub fn message_hash(&self) -> CryptoResult<Hash32> {
        let commitment = self.commitment()?;
        Ok(crypto::hash_parts(&[
            b"mw/kernel",
            &self.fee.to_le_bytes(),
            &self.min_height.to_le_bytes(),
            &self.max_height.to_le_bytes(),
            &commitment.serialize(),
        ]))
    }

    /// Kernel identifier, stable from partial signing onwards.
    pub fn id(&self) -> CryptoResult<Hash32> {
        self.message_hash()
    }

    /// Verify the aggregate signature.
    pub fn is_valid(&self) -> bool {
        let (commitment, signature) = match (&self.commitment, &self.signature) {
            (Some(c), Some(s)) => (c, s),
            _ => return false,
        };
        let msg = match self.message_hash() {
            Ok(m) => m,
            Err(_) => return false,
        };
        self.min_height <= self.max_height && signature.is_valid(&msg, commitment)
    }
}

/// A fully assembled transaction ready for registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub kernel: TxKernel,
    /// The aggregate offset scalar, both parties' contributions summed.
    pub offset: SecretKey,
}

impl Transaction {
    /// Canonical ordering: inputs and outputs sorted by commitment encoding.
    pub fn normalize(&mut self) {
        self.inputs.sort_by_key(|i| i.commitment.serialize());
        self.outputs.sort_by_key(|o| o.commitment.serialize());
    }

    /// Structural validation of the final transaction.
    ///
    /// Checks the kernel signature and the balance equation
    /// `sum(inputs) == sum(outputs) + fee * H + kernel commitment +
    /// offset * G`, plus canonical ordering without duplicates.
    pub fn validate(&self) -> CryptoResult<()> {
        if !self.kernel.is_valid() {
            return Err(CryptoError::InvalidPoint);
        }
        if !is_sorted_unique(self.inputs.iter().map(|i| i.commitment.serialize()))
            || !is_sorted_unique(self.outputs.iter().map(|o| o.commitment.serialize()))
        {
            return Err(CryptoError::InvalidPoint);
        }

        let lhs = point_sum(
            &self
                .inputs
                .iter()
                .map(|i| i.commitment)
                .collect::<Vec<_>>(),
        )?;

        let mut rhs: Vec<PublicKey> =
            self.outputs.iter().map(|o| o.commitment).collect();
        if self.kernel.fee > 0 {
            rhs.push(crypto::commit_value(self.kernel.fee)?);
        }
        rhs.push(*self.kernel.commitment()?);
        rhs.push(self.offset.public_key(SECP256K1));
        let rhs = point_sum(&rhs)?;

        if lhs != rhs {
            return Err(CryptoError::DegenerateSum);
        }
        Ok(())
    }
}

fn is_sorted_unique<I: Iterator<Item = [u8; 33]>>(iter: I) -> bool {
    let mut prev: Option<[u8; 33]> = None;
    for item in iter {
        if let Some(p) = prev {
            if p >= item {
                return false;
            }
        }
        prev = Some(item);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::schnorr::sign_partial;
    use crate::crypto::{commit, public_of, scalar_accumulate, scalar_sub};

    fn key(fill: u8) -> SecretKey {
        SecretKey::from_slice(&[fill; 32]).unwrap()
    }

    /// Build a one-party transaction: one input of 10, one output of 9,
    /// fee 1, kernel excess chosen freely, offset balancing the rest.
    fn balanced_transaction() -> Transaction {
        let b_in = key(31);
        let b_out = key(32);
        let excess = key(33);
        let nonce = key(34);

        let input = TxInput {
            commitment: commit(10, &b_in).unwrap(),
        };
        let output = TxOutput {
            commitment: commit(9, &b_out).unwrap(),
        };

        // offset = b_in - b_out - excess, so that
        // in == out + fee*H + excess*G + offset*G.
        let mut offset = None;
        scalar_accumulate(&mut offset, scalar_sub(&b_in, &b_out).unwrap()).unwrap();
        let offset = scalar_sub(&offset.unwrap(), &excess).unwrap();

        let mut kernel = TxKernel::new(1, 0, 100);
        kernel.commitment = Some(public_of(&excess));
        let msg = kernel.message_hash().unwrap();
        let nonce_pub = public_of(&nonce);
        let k = sign_partial(&excess, &nonce, &nonce_pub, &public_of(&excess), &msg).unwrap();
        kernel.signature = Some(Signature { nonce_pub, k });

        let mut tx = Transaction {
            inputs: vec![input],
            outputs: vec![output],
            kernel,
            offset,
        };
        tx.normalize();
        tx
    }

    #[test]
    fn balanced_transaction_validates() {
        balanced_transaction().validate().unwrap();
    }

    #[test]
    fn unbalanced_transaction_is_rejected() {
        let mut tx = balanced_transaction();
        tx.offset = key(99);
        assert!(tx.validate().is_err());
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut tx = balanced_transaction();
        let sig = tx.kernel.signature.as_mut().unwrap();
        sig.k = key(55);
        assert!(tx.validate().is_err());
    }

    #[test]
    fn kernel_id_is_independent_of_signature() {
        let mut tx = balanced_transaction();
        let before = tx.kernel.id().unwrap();
        tx.kernel.signature = None;
        assert_eq!(tx.kernel.id().unwrap(), before);
    }
}
