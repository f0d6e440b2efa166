//! The per-transaction parameter bag: identifiers and blob codecs.
//!
//! Every negotiation parameter is persisted as one `(tx id, parameter id)`
//! row holding an opaque blob. The blob layout is canonical and stable:
//! little-endian integers, 33-byte compressed points, 32-byte big-endian
//! scalars, and length-prefixed concatenation for vectors. A restarted
//! wallet must read back exactly what its predecessor wrote.

use secp256k1::schnorr::Signature as BipSignature;
use secp256k1::{PublicKey, SecretKey};

use crate::address::WalletId;
use crate::error::{CodecError, CodecResult};
use crate::kernel::{TxInput, TxOutput};
use crate::types::{Hash32, TxId, TxStatus};

/// Identifier of one persisted negotiation parameter.
///
/// The discriminants are storage keys; never renumber them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum TxParameterId {
    // Negotiated terms, set at creation or by the peer's invitation.
    TransactionType = 0,
    IsSender = 1,
    Amount = 2,
    Fee = 3,
    MinHeight = 4,
    MaxHeight = 5,
    MyId = 6,
    PeerId = 7,
    IsInitiator = 8,
    AmountList = 9,
    PeerProtoVersion = 10,
    MyAddressId = 11,

    // Progress, visible through the transaction description.
    Status = 20,
    KernelProofHeight = 21,
    FailureReason = 22,
    TransactionRegistered = 23,
    KernelId = 24,
    CreateTime = 25,
    ModifyTime = 26,

    // Private negotiation state, never sent to the peer.
    State = 40,
    BlindingExcess = 41,
    MyNonce = 42,
    Change = 43,
    Inputs = 44,
    Outputs = 45,
    Offset = 46,

    // The peer's half of the negotiation.
    PeerPublicExcess = 60,
    PeerPublicNonce = 61,
    PeerSignature = 62,
    PeerInputs = 63,
    PeerOutputs = 64,
    PeerOffset = 65,
    PaymentConfirmation = 66,
}

/// Storage key of a parameter row.
pub type ParamKey = (TxId, TxParameterId);

/// A value that can live in the parameter bag.
pub trait ParameterValue: Sized {
    fn to_blob(&self) -> Vec<u8>;
    fn from_blob(blob: &[u8]) -> CodecResult<Self>;
}

fn expect_len(blob: &[u8], expected: usize) -> CodecResult<()> {
    if blob.len() != expected {
        return Err(CodecError::UnexpectedLength {
            expected,
            actual: blob.len(),
        });
    }
    Ok(())
}

impl ParameterValue for u64 {
    fn to_blob(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        expect_len(blob, 8)?;
        Ok(u64::from_le_bytes(blob.try_into().expect("length checked")))
    }
}

impl ParameterValue for u32 {
    fn to_blob(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        expect_len(blob, 4)?;
        Ok(u32::from_le_bytes(blob.try_into().expect("length checked")))
    }
}

impl ParameterValue for bool {
    fn to_blob(&self) -> Vec<u8> {
        vec![u8::from(*self)]
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        expect_len(blob, 1)?;
        match blob[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidDiscriminant(other as u32)),
        }
    }
}

impl ParameterValue for TxId {
    fn to_blob(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        expect_len(blob, 16)?;
        Ok(TxId::from_slice(blob).expect("length checked"))
    }
}

impl ParameterValue for Hash32 {
    fn to_blob(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        expect_len(blob, 32)?;
        Ok(Hash32::from_slice(blob).expect("length checked"))
    }
}

impl ParameterValue for WalletId {
    fn to_blob(&self) -> Vec<u8> {
        self.serialize().to_vec()
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        expect_len(blob, 32)?;
        WalletId::from_slice(blob).map_err(|e| CodecError::InvalidValue(e.to_string()))
    }
}

impl ParameterValue for SecretKey {
    fn to_blob(&self) -> Vec<u8> {
        self.secret_bytes().to_vec()
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        expect_len(blob, 32)?;
        Ok(SecretKey::from_slice(blob)?)
    }
}

impl ParameterValue for PublicKey {
    fn to_blob(&self) -> Vec<u8> {
        self.serialize().to_vec()
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        expect_len(blob, 33)?;
        Ok(PublicKey::from_slice(blob)?)
    }
}

impl ParameterValue for BipSignature {
    fn to_blob(&self) -> Vec<u8> {
        self.as_ref().to_vec()
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        expect_len(blob, 64)?;
        Ok(BipSignature::from_slice(blob)?)
    }
}

impl ParameterValue for TxStatus {
    fn to_blob(&self) -> Vec<u8> {
        (*self as u32).to_blob()
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        let v = u32::from_blob(blob)?;
        TxStatus::from_u32(v).ok_or(CodecError::InvalidDiscriminant(v))
    }
}

impl ParameterValue for Vec<u64> {
    fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.len() * 8);
        out.extend_from_slice(&(self.len() as u32).to_le_bytes());
        for v in self {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        let (count, body) = split_count(blob)?;
        expect_len(body, count * 8)?;
        Ok(body
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("chunk size")))
            .collect())
    }
}

impl ParameterValue for Vec<TxInput> {
    fn to_blob(&self) -> Vec<u8> {
        commitments_to_blob(self.iter().map(|i| i.commitment))
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        Ok(commitments_from_blob(blob)?
            .into_iter()
            .map(|commitment| TxInput { commitment })
            .collect())
    }
}

impl ParameterValue for Vec<TxOutput> {
    fn to_blob(&self) -> Vec<u8> {
        commitments_to_blob(self.iter().map(|o| o.commitment))
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        Ok(commitments_from_blob(blob)?
            .into_iter()
            .map(|commitment| TxOutput { commitment })
            .collect())
    }
}

fn split_count(blob: &[u8]) -> CodecResult<(usize, &[u8])> {
    if blob.len() < 4 {
        return Err(CodecError::UnexpectedLength {
            expected: 4,
            actual: blob.len(),
        });
    }
    let count = u32::from_le_bytes(blob[..4].try_into().expect("length checked")) as usize;
    Ok((count, &blob[4..]))
}

fn commitments_to_blob(points: impl ExactSizeIterator<Item = PublicKey>) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + points.len() * 33);
    out.extend_from_slice(&(points.len() as u32).to_le_bytes());
    for p in points {
        out.extend_from_slice(&p.serialize());
    }
    out
}

fn commitments_from_blob(blob: &[u8]) -> CodecResult<Vec<PublicKey>> {
    let (count, body) = split_count(blob)?;
    expect_len(body, count * 33)?;
    body.chunks_exact(33)
        .map(|c| PublicKey::from_slice(c).map_err(CodecError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SECP256K1;

    fn point(fill: u8) -> PublicKey {
        SecretKey::from_slice(&[fill; 32]).unwrap().public_key(SECP256K1)
    }

    fn round_trip<T: ParameterValue + PartialEq + std::fmt::Debug>(value: T) {
        let blob = value.to_blob();
        assert_eq!(T::from_blob(&blob).unwrap(), value);
    }

    #[test]
    fn scalar_codecs_round_trip() {
        round_trip(0u64);
        round_trip(u64::MAX);
        round_trip(7u32);
        round_trip(true);
        round_trip(false);
        round_trip(TxId([5; 16]));
        round_trip(Hash32([9; 32]));
        round_trip(TxStatus::Registered);
        round_trip(SecretKey::from_slice(&[3; 32]).unwrap());
        round_trip(point(4));
        round_trip(vec![1u64, 2, 3]);
        round_trip(Vec::<u64>::new());
    }

    #[test]
    fn vector_codecs_round_trip() {
        round_trip(vec![
            TxInput {
                commitment: point(2),
            },
            TxInput {
                commitment: point(3),
            },
        ]);
        round_trip(Vec::<TxOutput>::new());
        round_trip(vec![TxOutput {
            commitment: point(6),
        }]);
    }

    #[test]
    fn truncated_blobs_are_rejected() {
        assert!(u64::from_blob(&[1, 2, 3]).is_err());
        assert!(TxId::from_blob(&[0; 15]).is_err());
        assert!(Vec::<TxInput>::from_blob(&[2, 0, 0, 0, 1, 2]).is_err());
        assert!(bool::from_blob(&[2]).is_err());
    }
}
