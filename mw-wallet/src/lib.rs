//! Mimblewimble wallet core.
//!
//! Two parties jointly construct a single confidential transaction whose
//! kernel signature is the sum of partial Schnorr signatures; neither party
//! ever learns the other's blinding factors. Every negotiation parameter is
//! persisted to a keyed store so a restarted wallet resumes from the exact
//! protocol state it left.
//!
//! The main pieces:
//!
//! - [`storage`]: keyed persistence of coins, addresses, transaction
//!   descriptions and the per-transaction parameter bag, with
//!   change-notification fan-out.
//! - [`builder`]: per-update transaction builder with input selection, change
//!   construction, kernel assembly, partial signing, final aggregation.
//! - [`negotiation`]: the transaction state machine driving one
//!   negotiation from invitation to kernel proof.
//! - [`gateway`]: the abstract boundary towards the peer channel and the
//!   node.
//! - [`wallet`]: the orchestrator owning the set of active transactions.

pub mod address;
pub mod builder;
pub mod coin;
pub mod crypto;
pub mod error;
pub mod event_bus;
pub mod gateway;
pub mod kernel;
pub mod negotiation;
pub mod params;
pub mod storage;
pub mod types;
pub mod wallet;

pub use address::{WalletAddress, WalletId};
pub use coin::{Coin, CoinStatus};
pub use error::{Result, StorageError, WalletError};
pub use gateway::NegotiatorGateway;
pub use kernel::{Transaction, TxKernel};
pub use negotiation::{SimpleTransaction, TxFailureReason};
pub use storage::{MemoryWalletStorage, WalletStorage};
pub use types::{Amount, Height, TxDescription, TxId, TxStatus};
pub use wallet::Wallet;
