//! The two-party transaction state machine.
//!
//! One `SimpleTransaction` instance drives one negotiation. The object
//! carries only the transaction id and handles to the store and gateway;
//! every other bit of state lives in the parameter bag, so a restarted
//! wallet resumes from the exact protocol state it left and there is no
//! "in-memory says X, disk says Y" to go wrong.
//!
//! `update()` is the single entry point. It is idempotent, never blocks on
//! network I/O, advances at most one state edge per call and flushes every
//! parameter it writes before returning.

use std::fmt;
use std::sync::Arc;

use crate::address::{identity_key, WalletId};
use crate::builder::TxBuilder;
use crate::coin::{Coin, CoinStatus};
use crate::crypto::schnorr::PaymentConfirmation;
use crate::error::{CodecError, CodecResult, CryptoError, Result, StorageError, StorageResult};
use crate::gateway::NegotiatorGateway;
use crate::params::{ParameterValue, TxParameterId};
use crate::storage::{get_parameter, read_store, set_parameter, write_store, SharedStorage};
use crate::types::{
    timestamp_now, Amount, Height, TxId, TxStatus, MATURITY_STD, MAX_HEIGHT, PROTO_VERSION,
};

/// Kind of a negotiation, sent with every peer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TxType {
    Simple = 0,
}

impl ParameterValue for TxType {
    fn to_blob(&self) -> Vec<u8> {
        (*self as u32).to_blob()
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        match u32::from_blob(blob)? {
            0 => Ok(TxType::Simple),
            other => Err(CodecError::InvalidDiscriminant(other)),
        }
    }
}

/// Protocol state, persisted under `TxParameterId::State`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TxState {
    Initial = 0,
    Invitation = 1,
    InvitationConfirmation = 2,
    PeerConfirmation = 3,
    KernelConfirmation = 4,
    Registration = 5,
}

impl ParameterValue for TxState {
    fn to_blob(&self) -> Vec<u8> {
        (*self as u32).to_blob()
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        match u32::from_blob(blob)? {
            0 => Ok(TxState::Initial),
            1 => Ok(TxState::Invitation),
            2 => Ok(TxState::InvitationConfirmation),
            3 => Ok(TxState::PeerConfirmation),
            4 => Ok(TxState::KernelConfirmation),
            5 => Ok(TxState::Registration),
            other => Err(CodecError::InvalidDiscriminant(other)),
        }
    }
}

/// Why a negotiation failed. Persisted and, when locally originated,
/// forwarded to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TxFailureReason {
    Unknown = 0,
    Cancelled = 1,
    InvalidPeerSignature = 2,
    FailedToRegister = 3,
    InvalidTransaction = 4,
    NoInputs = 5,
    TransactionExpired = 6,
    FailedToSendParameters = 7,
}

impl TxFailureReason {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(TxFailureReason::Unknown),
            1 => Some(TxFailureReason::Cancelled),
            2 => Some(TxFailureReason::InvalidPeerSignature),
            3 => Some(TxFailureReason::FailedToRegister),
            4 => Some(TxFailureReason::InvalidTransaction),
            5 => Some(TxFailureReason::NoInputs),
            6 => Some(TxFailureReason::TransactionExpired),
            7 => Some(TxFailureReason::FailedToSendParameters),
            _ => None,
        }
    }
}

impl fmt::Display for TxFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TxFailureReason::Unknown => "unexpected reason",
            TxFailureReason::Cancelled => "transaction cancelled",
            TxFailureReason::InvalidPeerSignature => "peer signature is not valid",
            TxFailureReason::FailedToRegister => "failed to register transaction",
            TxFailureReason::InvalidTransaction => "transaction is not valid",
            TxFailureReason::NoInputs => "no inputs",
            TxFailureReason::TransactionExpired => "transaction expired",
            TxFailureReason::FailedToSendParameters => "failed to send tx parameters",
        };
        f.write_str(msg)
    }
}

impl ParameterValue for TxFailureReason {
    fn to_blob(&self) -> Vec<u8> {
        (*self as u32).to_blob()
    }

    fn from_blob(blob: &[u8]) -> CodecResult<Self> {
        let v = u32::from_blob(blob)?;
        TxFailureReason::from_u32(v).ok_or(CodecError::InvalidDiscriminant(v))
    }
}

/// A failure that routes through the `on_failed` path.
#[derive(Debug, Clone, Copy)]
pub struct TxFailure {
    pub reason: TxFailureReason,
    /// Whether the peer must be told. Peer-originated failures are never
    /// echoed back.
    pub notify: bool,
}

impl TxFailure {
    pub fn new(reason: TxFailureReason, notify: bool) -> Self {
        TxFailure { reason, notify }
    }
}

/// Internal error plumbing of one `update()` pass.
#[derive(Debug)]
pub enum UpdateError {
    /// Negotiation failure: routed to `on_failed`.
    Failed(TxFailure),
    /// Storage failure: fatal to the current operation, surfaced to the
    /// caller.
    Storage(StorageError),
}

impl From<TxFailure> for UpdateError {
    fn from(f: TxFailure) -> Self {
        UpdateError::Failed(f)
    }
}

impl From<StorageError> for UpdateError {
    fn from(e: StorageError) -> Self {
        UpdateError::Storage(e)
    }
}

impl From<CryptoError> for UpdateError {
    fn from(e: CryptoError) -> Self {
        tracing::error!("crypto failure during negotiation: {}", e);
        UpdateError::Failed(TxFailure::new(TxFailureReason::Unknown, false))
    }
}

/// One peer message: a batch of parameters for one transaction.
///
/// Parameter ids are chosen from the recipient's point of view: the
/// sender's public excess travels as `PeerPublicExcess`.
#[derive(Debug, Clone)]
pub struct SetTxParameter {
    pub tx_id: TxId,
    pub tx_type: TxType,
    pub from: WalletId,
    pub params: Vec<(TxParameterId, Vec<u8>)>,
}

impl SetTxParameter {
    pub fn new(tx_id: TxId, from: WalletId) -> Self {
        SetTxParameter {
            tx_id,
            tx_type: TxType::Simple,
            from,
            params: Vec::new(),
        }
    }

    pub fn add<T: ParameterValue>(mut self, id: TxParameterId, value: &T) -> Self {
        self.params.push((id, value.to_blob()));
        self
    }
}

/// State machine of one simple value transfer.
pub struct SimpleTransaction {
    tx_id: TxId,
    store: SharedStorage,
    gateway: Arc<dyn NegotiatorGateway>,
}

impl SimpleTransaction {
    pub fn new(store: SharedStorage, gateway: Arc<dyn NegotiatorGateway>, tx_id: TxId) -> Self {
        SimpleTransaction {
            tx_id,
            store,
            gateway,
        }
    }

    pub fn tx_id(&self) -> &TxId {
        &self.tx_id
    }

    pub fn tx_type(&self) -> TxType {
        TxType::Simple
    }

    /// Advance the negotiation by at most one state edge.
    ///
    /// Invoked whenever a parameter this transaction cares about was
    /// written or the chain tip advanced. Negotiation failures route to
    /// the failure path internally; only storage errors surface.
    pub fn update(&mut self) -> Result<()> {
        let outcome = self.check_external_failures().and_then(|failed| {
            if failed {
                return Ok(());
            }
            self.update_impl()?;
            self.check_expired()
        });
        match outcome {
            Ok(()) => Ok(()),
            Err(UpdateError::Failed(failure)) => {
                self.on_failed(failure.reason, failure.notify)?;
                Ok(())
            }
            Err(UpdateError::Storage(e)) => {
                tracing::error!("{} storage failure: {}", self.tx_id, e);
                Err(e.into())
            }
        }
    }

    /// Cancel the negotiation.
    ///
    /// A transaction still `Pending` is deleted outright; an open one
    /// notifies the peer, rolls its coins back and stays in history as
    /// `Cancelled`. Idempotent.
    pub fn cancel(&mut self) -> Result<()> {
        let status = self
            .get::<TxStatus>(TxParameterId::Status)?
            .unwrap_or(TxStatus::Failed);
        if status == TxStatus::Pending {
            write_store(&self.store)?.delete_tx(&self.tx_id)?;
        } else {
            self.notify_failure(TxFailureReason::Cancelled)?;
            self.update_tx_description(TxStatus::Cancelled)?;
            self.rollback_tx()?;
            self.gateway.on_tx_completed(self.tx_id);
        }
        Ok(())
    }

    fn update_impl(&mut self) -> std::result::Result<(), UpdateError> {
        let is_sender = self.get_mandatory::<bool>(TxParameterId::IsSender)?;
        let is_self_tx = self.is_self_tx()?;
        let tx_state = self.state()?;

        let amount_list = match self.get::<Vec<Amount>>(TxParameterId::AmountList)? {
            Some(list) => list,
            None => vec![self.get_mandatory::<Amount>(TxParameterId::Amount)?],
        };
        let fee = self.get_mandatory::<Amount>(TxParameterId::Fee)?;

        let mut builder = TxBuilder::new(
            self.tx_id,
            Arc::clone(&self.store),
            self.is_initiator()?,
            amount_list,
            fee,
        );

        if !builder.get_initial_tx_params()? && tx_state == TxState::Initial {
            tracing::info!(
                "{} {} {} (fee: {})",
                self.tx_id,
                if is_sender { "sending" } else { "receiving" },
                builder.amount(),
                builder.fee()
            );

            if is_sender {
                builder.select_inputs()?;
                builder.add_change_output()?;
            }
            if is_self_tx || !is_sender {
                for amount in builder.amount_list().to_vec() {
                    builder.add_output(amount, false)?;
                }
            }
            builder.finalize_outputs()?;

            self.update_tx_description(TxStatus::InProgress)?;
        }

        if self.get::<u64>(TxParameterId::MyAddressId)?.is_none() {
            if let Some(my_id) = self.my_id()? {
                let own_id = read_store(&self.store)?
                    .get_address(&my_id)
                    .filter(|a| a.is_own())
                    .map(|a| a.own_id);
                if let Some(own_id) = own_id {
                    self.set(TxParameterId::MyAddressId, &own_id)?;
                }
            }
        }

        builder.create_kernel()?;

        if !is_self_tx && !builder.get_peer_public_excess_and_nonce()? {
            if tx_state == TxState::Initial {
                self.send_invitation(&builder, is_sender)?;
                self.set_state(TxState::Invitation)?;
            }
            return Ok(());
        }

        builder.sign_partial()?;

        let has_peers_ios = builder.get_peer_inputs_and_outputs()?;
        if !is_self_tx && !builder.get_peer_signature()? {
            if tx_state == TxState::Initial {
                // We are the invited participant responding to the
                // invitation.
                self.update_tx_description(TxStatus::Registered)?;
                self.confirm_invitation(&builder, !has_peers_ios, is_sender)?;

                if self.get::<u32>(TxParameterId::PeerProtoVersion)?.is_some() {
                    // Peers with the new flow skip the registration
                    // notification; go straight to awaiting the proof.
                    self.set(TxParameterId::TransactionRegistered, &true)?;
                    self.set_state(TxState::KernelConfirmation)?;
                    self.confirm_kernel(&builder)?;
                } else {
                    self.set_state(TxState::InvitationConfirmation)?;
                }
                return Ok(());
            }
            if self.is_initiator()? {
                return Ok(());
            }
        }

        if self.is_initiator()? && !builder.is_peer_signature_valid()? {
            return Err(TxFailure::new(TxFailureReason::InvalidPeerSignature, true).into());
        }

        if !is_self_tx && is_sender && self.is_initiator()? {
            // The receiver must have acknowledged the payment with a
            // signature over (kernel id, amount, sender).
            if !self.verify_payment_confirmation()? {
                if self.peer_version()? >= PROTO_VERSION {
                    return Err(
                        TxFailure::new(TxFailureReason::InvalidPeerSignature, false).into()
                    );
                }
                tracing::warn!(
                    "{} payment confirmation missing or invalid; tolerated for legacy peer",
                    self.tx_id
                );
            }
        }

        builder.finalize_signature()?;

        match self.get::<bool>(TxParameterId::TransactionRegistered)? {
            None => {
                if !is_self_tx && (!has_peers_ios || self.is_initiator()?) {
                    if tx_state == TxState::Invitation {
                        self.update_tx_description(TxStatus::Registered)?;
                        self.confirm_transaction(&builder, !has_peers_ios)?;
                        self.set_state(TxState::PeerConfirmation)?;
                    }
                    if !has_peers_ios {
                        return Ok(());
                    }
                }

                let transaction = builder.create_transaction()?;
                if let Err(e) = transaction.validate() {
                    tracing::error!("{} final transaction invalid: {}", self.tx_id, e);
                    return Err(
                        TxFailure::new(TxFailureReason::InvalidTransaction, true).into()
                    );
                }
                self.gateway.register_tx(self.tx_id, transaction);
                self.set_state(TxState::Registration)?;
                return Ok(());
            }
            Some(false) => {
                return Err(TxFailure::new(TxFailureReason::FailedToRegister, true).into());
            }
            Some(true) => {}
        }

        let proof_height = self
            .get::<Height>(TxParameterId::KernelProofHeight)?
            .unwrap_or(0);
        if proof_height == 0 {
            if tx_state == TxState::Registration
                && self.get::<u32>(TxParameterId::PeerProtoVersion)?.is_none()
            {
                // Tell an old-protocol peer the transaction is on its way.
                self.notify_transaction_registered()?;
            }
            self.set_state(TxState::KernelConfirmation)?;
            self.confirm_kernel(&builder)?;
            return Ok(());
        }

        // The kernel proof landed: promote this transaction's coins.
        let mut unconfirmed = self.unconfirmed_outputs()?;
        for coin in &mut unconfirmed {
            if coin.status == CoinStatus::Outgoing {
                coin.status = CoinStatus::Spent;
            } else {
                coin.status = CoinStatus::Available;
                coin.confirm_height = proof_height;
                coin.maturity = proof_height + MATURITY_STD;
            }
        }
        write_store(&self.store)?.save_coins(&unconfirmed)?;

        self.complete_tx()?;
        Ok(())
    }

    fn check_external_failures(&mut self) -> std::result::Result<bool, UpdateError> {
        if let Some(reason) = self.get::<TxFailureReason>(TxParameterId::FailureReason)? {
            let status = self.get_mandatory::<TxStatus>(TxParameterId::Status)?;
            if status == TxStatus::InProgress {
                // Peer-originated: fail locally, never echo back.
                self.on_failed(reason, false)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn check_expired(&mut self) -> std::result::Result<(), UpdateError> {
        let status = self.get_mandatory::<TxStatus>(TxParameterId::Status)?;
        if status == TxStatus::Completed {
            return Ok(());
        }
        let max_height = self
            .get::<Height>(TxParameterId::MaxHeight)?
            .unwrap_or(MAX_HEIGHT);
        if let Some(tip) = self.gateway.get_tip() {
            if tip.height > max_height {
                tracing::info!(
                    "{} expired: tip {}, max kernel height {}",
                    self.tx_id,
                    tip.height,
                    max_height
                );
                return Err(TxFailure::new(TxFailureReason::TransactionExpired, true).into());
            }
        }
        Ok(())
    }

    fn on_failed(&mut self, reason: TxFailureReason, notify: bool) -> StorageResult<()> {
        tracing::error!("{} failed: {}", self.tx_id, reason);

        if notify {
            self.notify_failure(reason)?;
        }

        let status = if reason == TxFailureReason::Cancelled {
            TxStatus::Cancelled
        } else {
            TxStatus::Failed
        };
        self.set_quiet(TxParameterId::FailureReason, &reason)?;
        self.update_tx_description(status)?;
        self.rollback_tx()?;

        self.gateway.on_tx_completed(self.tx_id);
        Ok(())
    }

    fn rollback_tx(&self) -> StorageResult<()> {
        tracing::info!("{} rolling back coin state", self.tx_id);
        write_store(&self.store)?.rollback_tx(&self.tx_id)
    }

    fn notify_failure(&self, reason: TxFailureReason) -> StorageResult<()> {
        let status = self
            .get::<TxStatus>(TxParameterId::Status)?
            .unwrap_or(TxStatus::Failed);
        // Only statuses where the peer may still believe the tx is alive.
        if !matches!(status, TxStatus::Pending | TxStatus::InProgress) {
            return Ok(());
        }
        if let Some(msg) = self.new_message()? {
            self.send_tx_parameters(msg.add(TxParameterId::FailureReason, &reason))?;
        }
        Ok(())
    }

    fn complete_tx(&mut self) -> StorageResult<()> {
        tracing::info!("{} transaction completed", self.tx_id);
        self.update_tx_description(TxStatus::Completed)?;
        self.gateway.on_tx_completed(self.tx_id);
        Ok(())
    }

    fn confirm_kernel(&mut self, builder: &TxBuilder) -> std::result::Result<(), UpdateError> {
        self.update_tx_description(TxStatus::Registered)?;
        self.gateway.confirm_kernel(self.tx_id, builder.kernel()?);
        Ok(())
    }

    fn update_tx_description(&mut self, status: TxStatus) -> StorageResult<()> {
        self.set(TxParameterId::Status, &status)?;
        let now = timestamp_now();
        self.set_quiet(TxParameterId::ModifyTime, &now)?;

        let kernel_id = self.get(TxParameterId::KernelId)?;
        let mut guard = write_store(&self.store)?;
        if let Some(mut tx) = guard.get_tx(&self.tx_id) {
            tx.status = status;
            tx.modify_time = now;
            tx.kernel_id = kernel_id.or(tx.kernel_id);
            guard.save_tx(&tx)?;
        }
        Ok(())
    }

    fn send_invitation(
        &self,
        builder: &TxBuilder,
        is_sender: bool,
    ) -> std::result::Result<(), UpdateError> {
        let msg = match self.new_message()? {
            Some(msg) => msg
                .add(TxParameterId::Amount, &builder.amount())
                .add(TxParameterId::Fee, &builder.fee())
                .add(TxParameterId::MinHeight, &builder.min_height())
                .add(TxParameterId::MaxHeight, &builder.max_height())
                .add(TxParameterId::IsSender, &!is_sender)
                .add(TxParameterId::PeerProtoVersion, &PROTO_VERSION)
                .add(TxParameterId::PeerPublicExcess, &builder.public_excess()?)
                .add(TxParameterId::PeerPublicNonce, &builder.public_nonce()?),
            None => {
                return Err(
                    TxFailure::new(TxFailureReason::FailedToSendParameters, false).into()
                )
            }
        };
        if !self.send_tx_parameters(msg)? {
            return Err(TxFailure::new(TxFailureReason::FailedToSendParameters, false).into());
        }
        Ok(())
    }

    fn confirm_invitation(
        &self,
        builder: &TxBuilder,
        send_utxos: bool,
        is_sender: bool,
    ) -> std::result::Result<(), UpdateError> {
        tracing::info!(
            "{} transaction accepted, kernel {}",
            self.tx_id,
            builder.kernel_id()?
        );
        let mut msg = match self.new_message()? {
            Some(msg) => msg
                .add(TxParameterId::PeerProtoVersion, &PROTO_VERSION)
                .add(TxParameterId::PeerPublicExcess, &builder.public_excess()?)
                .add(TxParameterId::PeerSignature, &builder.partial_signature()?)
                .add(TxParameterId::PeerPublicNonce, &builder.public_nonce()?),
            None => return Ok(()),
        };
        if send_utxos {
            let offset = builder.offset().map_err(UpdateError::from)?;
            msg = msg
                .add(TxParameterId::PeerInputs, &builder.inputs().to_vec())
                .add(TxParameterId::PeerOutputs, &builder.outputs().to_vec())
                .add(TxParameterId::PeerOffset, &offset);
        }

        if !is_sender {
            if let Some(signature) = self.sign_payment_confirmation(builder)? {
                msg = msg.add(TxParameterId::PaymentConfirmation, &signature);
            }
        }

        self.send_tx_parameters(msg)?;
        Ok(())
    }

    /// The receiver's acknowledgement: sign (kernel id, amount, sender
    /// public key) with the key behind the own address.
    fn sign_payment_confirmation(
        &self,
        builder: &TxBuilder,
    ) -> std::result::Result<Option<secp256k1::schnorr::Signature>, UpdateError> {
        let peer_id = self.get::<WalletId>(TxParameterId::PeerId)?;
        let my_id = self.my_id()?;
        let (peer_id, my_id) = match (peer_id, my_id) {
            (Some(p), Some(m)) => (p, m),
            _ => return Ok(None),
        };

        let key = {
            let guard = read_store(&self.store)?;
            match guard.get_address(&my_id).filter(|a| a.is_own()) {
                Some(addr) => identity_key(guard.master_kdf(), addr.own_id),
                None => return Ok(None),
            }
        };

        let pc =
            PaymentConfirmation::sign(builder.kernel_id()?, builder.amount(), peer_id, &key);
        Ok(Some(pc.signature))
    }

    fn verify_payment_confirmation(&self) -> std::result::Result<bool, UpdateError> {
        let peer_id = self.get::<WalletId>(TxParameterId::PeerId)?;
        let my_id = self.my_id()?;
        let kernel_id = self.get(TxParameterId::KernelId)?;
        let amount = self.get::<Amount>(TxParameterId::Amount)?;
        let signature = self.get(TxParameterId::PaymentConfirmation)?;

        match (peer_id, my_id, kernel_id, amount, signature) {
            (Some(peer_id), Some(my_id), Some(kernel_id), Some(amount), Some(signature)) => {
                let pc = PaymentConfirmation {
                    kernel_id,
                    amount,
                    sender: my_id,
                    signature,
                };
                Ok(pc.is_valid(&peer_id))
            }
            _ => Ok(false),
        }
    }

    fn confirm_transaction(
        &self,
        builder: &TxBuilder,
        send_utxos: bool,
    ) -> std::result::Result<(), UpdateError> {
        if self.get::<u32>(TxParameterId::PeerProtoVersion)?.is_some() {
            // New-flow peers finish from the invitation confirmation alone.
            return Ok(());
        }
        let mut msg = match self.new_message()? {
            Some(msg) => {
                msg.add(TxParameterId::PeerSignature, &builder.partial_signature()?)
            }
            None => return Ok(()),
        };
        if send_utxos {
            let offset = builder.offset().map_err(UpdateError::from)?;
            msg = msg
                .add(TxParameterId::PeerInputs, &builder.inputs().to_vec())
                .add(TxParameterId::PeerOutputs, &builder.outputs().to_vec())
                .add(TxParameterId::PeerOffset, &offset);
        }
        self.send_tx_parameters(msg)?;
        Ok(())
    }

    fn notify_transaction_registered(&self) -> StorageResult<()> {
        if let Some(msg) = self.new_message()? {
            self.send_tx_parameters(msg.add(TxParameterId::TransactionRegistered, &true))?;
        }
        Ok(())
    }

    fn new_message(&self) -> StorageResult<Option<SetTxParameter>> {
        Ok(self
            .my_id()?
            .map(|from| SetTxParameter::new(self.tx_id, from)))
    }

    fn send_tx_parameters(&self, msg: SetTxParameter) -> StorageResult<bool> {
        match self.get::<WalletId>(TxParameterId::PeerId)? {
            Some(peer_id) => {
                self.gateway.send_tx_params(peer_id, msg);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// A self-transaction pays one of our own addresses: the peer exchange
    /// edges are skipped entirely.
    fn is_self_tx(&self) -> StorageResult<bool> {
        let peer_id = match self.get::<WalletId>(TxParameterId::PeerId)? {
            Some(id) => id,
            None => return Ok(false),
        };
        Ok(read_store(&self.store)?
            .get_address(&peer_id)
            .map(|a| a.is_own())
            .unwrap_or(false))
    }

    fn is_initiator(&self) -> std::result::Result<bool, UpdateError> {
        self.get_mandatory::<bool>(TxParameterId::IsInitiator)
    }

    fn peer_version(&self) -> StorageResult<u32> {
        Ok(self
            .get::<u32>(TxParameterId::PeerProtoVersion)?
            .unwrap_or(0))
    }

    fn state(&self) -> StorageResult<TxState> {
        Ok(self
            .get::<TxState>(TxParameterId::State)?
            .unwrap_or(TxState::Initial))
    }

    fn set_state(&mut self, state: TxState) -> StorageResult<()> {
        self.set_quiet(TxParameterId::State, &state)
    }

    fn my_id(&self) -> StorageResult<Option<WalletId>> {
        self.get::<WalletId>(TxParameterId::MyId)
    }

    /// Coins this transaction is waiting on: own outputs still `Incoming`,
    /// own inputs still `Outgoing`.
    fn unconfirmed_outputs(&self) -> StorageResult<Vec<Coin>> {
        let guard = read_store(&self.store)?;
        let mut coins = Vec::new();
        guard.visit_coins(&mut |coin| {
            if (coin.create_tx.as_ref() == Some(&self.tx_id)
                && coin.status == CoinStatus::Incoming)
                || (coin.spend_tx.as_ref() == Some(&self.tx_id)
                    && coin.status == CoinStatus::Outgoing)
            {
                coins.push(coin.clone());
            }
            true
        });
        Ok(coins)
    }

    fn get<T: ParameterValue>(&self, id: TxParameterId) -> StorageResult<Option<T>> {
        let guard = read_store(&self.store)?;
        get_parameter(&*guard, &self.tx_id, id)
    }

    fn get_mandatory<T: ParameterValue>(
        &self,
        id: TxParameterId,
    ) -> std::result::Result<T, UpdateError> {
        match self.get::<T>(id)? {
            Some(value) => Ok(value),
            None => {
                tracing::error!("{} missing mandatory parameter {:?}", self.tx_id, id);
                Err(TxFailure::new(TxFailureReason::Unknown, true).into())
            }
        }
    }

    /// Write a parameter, notifying observers for the externally visible
    /// ones.
    fn set<T: ParameterValue>(&mut self, id: TxParameterId, value: &T) -> StorageResult<()> {
        let notify = should_notify_about_changes(id);
        let mut guard = write_store(&self.store)?;
        set_parameter(&mut *guard, &self.tx_id, id, value, notify)?;
        Ok(())
    }

    fn set_quiet<T: ParameterValue>(&mut self, id: TxParameterId, value: &T) -> StorageResult<()> {
        let mut guard = write_store(&self.store)?;
        set_parameter(&mut *guard, &self.tx_id, id, value, false)?;
        Ok(())
    }
}

/// Which parameters are externally visible enough that writing them should
/// raise a transaction-changed notification.
fn should_notify_about_changes(id: TxParameterId) -> bool {
    matches!(
        id,
        TxParameterId::Amount
            | TxParameterId::Fee
            | TxParameterId::MinHeight
            | TxParameterId::PeerId
            | TxParameterId::MyId
            | TxParameterId::CreateTime
            | TxParameterId::IsSender
            | TxParameterId::Status
            | TxParameterId::TransactionType
            | TxParameterId::KernelId
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reason_round_trip() {
        for v in 0..8u32 {
            let reason = TxFailureReason::from_u32(v).unwrap();
            assert_eq!(TxFailureReason::from_blob(&reason.to_blob()).unwrap(), reason);
        }
        assert!(TxFailureReason::from_u32(8).is_none());
    }

    #[test]
    fn tx_state_round_trip() {
        for state in [
            TxState::Initial,
            TxState::Invitation,
            TxState::InvitationConfirmation,
            TxState::PeerConfirmation,
            TxState::KernelConfirmation,
            TxState::Registration,
        ] {
            assert_eq!(TxState::from_blob(&state.to_blob()).unwrap(), state);
        }
    }

    #[test]
    fn notifying_parameters_match_the_visible_set() {
        assert!(should_notify_about_changes(TxParameterId::Status));
        assert!(should_notify_about_changes(TxParameterId::KernelId));
        assert!(!should_notify_about_changes(TxParameterId::BlindingExcess));
        assert!(!should_notify_about_changes(TxParameterId::MyNonce));
        assert!(!should_notify_about_changes(TxParameterId::State));
    }
}
