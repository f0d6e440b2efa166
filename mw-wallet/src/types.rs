//! Common type definitions for the wallet core.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::address::WalletId;

/// Block height.
pub type Height = u64;

/// Coin value in the smallest unit.
pub type Amount = u64;

/// Seconds since the Unix epoch.
pub type Timestamp = u64;

/// Sentinel for "no height" / "unbounded".
pub const MAX_HEIGHT: Height = Height::MAX;

/// Blocks an output must wait after confirmation before it may be spent.
pub const MATURITY_STD: Height = 60;

/// Kernel validity window applied when the sender does not specify one.
pub const DEFAULT_TX_LIFETIME: Height = 1440;

/// Negotiation protocol version advertised to peers.
pub const PROTO_VERSION: u32 = 1;

/// Current wall-clock timestamp.
pub fn timestamp_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A 32-byte hash value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash32(arr))
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash32 {
    fn from(arr: [u8; 32]) -> Self {
        Hash32(arr)
    }
}

/// Hash of a block.
pub type BlockHash = Hash32;

/// Unique identifier of one negotiation, shared by both parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(pub [u8; 16]);

impl TxId {
    /// Generate a fresh random transaction id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        TxId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(TxId(arr))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The chain tip as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemState {
    pub height: Height,
    pub hash: BlockHash,
}

/// A block header kept in the wallet's chain-of-trust history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: Height,
    pub hash: BlockHash,
    pub prev: BlockHash,
}

/// User-visible status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TxStatus {
    Pending = 0,
    InProgress = 1,
    Cancelled = 2,
    Completed = 3,
    Failed = 4,
    Registered = 5,
}

impl TxStatus {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(TxStatus::Pending),
            1 => Some(TxStatus::InProgress),
            2 => Some(TxStatus::Cancelled),
            3 => Some(TxStatus::Completed),
            4 => Some(TxStatus::Failed),
            5 => Some(TxStatus::Registered),
            _ => None,
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Pending => "pending",
            TxStatus::InProgress => "in progress",
            TxStatus::Cancelled => "cancelled",
            TxStatus::Completed => "completed",
            TxStatus::Failed => "failed",
            TxStatus::Registered => "registered",
        };
        f.write_str(s)
    }
}

/// Action attached to a transaction-history change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Added,
    Removed,
    Updated,
    Reset,
}

/// The externally visible record of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxDescription {
    pub tx_id: TxId,
    pub amount: Amount,
    pub fee: Amount,
    pub change: Amount,
    pub min_height: Height,
    pub peer_id: WalletId,
    pub my_id: WalletId,
    pub create_time: Timestamp,
    pub modify_time: Timestamp,
    pub sender: bool,
    pub status: TxStatus,
    pub kernel_id: Option<Hash32>,
}

impl TxDescription {
    pub fn can_cancel(&self) -> bool {
        matches!(
            self.status,
            TxStatus::Pending | TxStatus::InProgress | TxStatus::Registered
        )
    }
}
