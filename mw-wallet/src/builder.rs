//! Per-update transaction builder.
//!
//! One builder is constructed for every `update()` of the state machine.
//! It owns the working copy of inputs, outputs, the offset, the blinding
//! excess, the kernel and the peer's half of the negotiation, all loaded
//! from and flushed back to the parameter bag; the builder itself holds
//! nothing that must survive the call.

use secp256k1::{PublicKey, SecretKey};

use crate::coin::{Coin, CoinStatus};
use crate::crypto::{self, schnorr, KeyId, KeyType};
use crate::error::{CryptoError, CryptoResult, StorageResult};
use crate::kernel::{Transaction, TxInput, TxKernel, TxOutput};
use crate::negotiation::{TxFailure, TxFailureReason, UpdateError};
use crate::params::TxParameterId;
use crate::storage::{
    get_parameter, read_store, set_parameter, write_store, SharedStorage, WalletStorage,
};
use crate::types::{Amount, Hash32, Height, TxId, MAX_HEIGHT};

pub struct TxBuilder {
    tx_id: TxId,
    store: SharedStorage,
    is_initiator: bool,
    amount_list: Vec<Amount>,
    fee: Amount,
    change: Amount,
    min_height: Height,
    max_height: Height,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    /// Running offset: input blindings minus output blindings plus the raw
    /// kernel excess. `None` until the first contribution.
    offset: Option<SecretKey>,
    /// Raw kernel excess before `create_kernel`, the negated signing
    /// secret afterwards.
    blinding_excess: Option<SecretKey>,
    nonce: Option<SecretKey>,
    kernel: Option<TxKernel>,
    message: Option<Hash32>,
    total_nonce_pub: Option<PublicKey>,
    partial_signature: Option<SecretKey>,
    peer_public_excess: Option<PublicKey>,
    peer_public_nonce: Option<PublicKey>,
    peer_signature: Option<SecretKey>,
    peer_inputs: Vec<TxInput>,
    peer_outputs: Vec<TxOutput>,
    peer_offset: Option<SecretKey>,
}

impl TxBuilder {
    pub fn new(
        tx_id: TxId,
        store: SharedStorage,
        is_initiator: bool,
        amount_list: Vec<Amount>,
        fee: Amount,
    ) -> Self {
        TxBuilder {
            tx_id,
            store,
            is_initiator,
            amount_list,
            fee,
            change: 0,
            min_height: 0,
            max_height: MAX_HEIGHT,
            inputs: Vec::new(),
            outputs: Vec::new(),
            offset: None,
            blinding_excess: None,
            nonce: None,
            kernel: None,
            message: None,
            total_nonce_pub: None,
            partial_signature: None,
            peer_public_excess: None,
            peer_public_nonce: None,
            peer_signature: None,
            peer_inputs: Vec::new(),
            peer_outputs: Vec::new(),
            peer_offset: None,
        }
    }

    /// Load the parameters written by previous updates.
    ///
    /// Returns whether the blinding excess and offset are already present,
    /// i.e. whether input selection and output creation already ran. This
    /// is the guard that makes restarts resume without re-selecting inputs.
    pub fn get_initial_tx_params(&mut self) -> StorageResult<bool> {
        let guard = read_store(&self.store)?;
        let store = &*guard;
        if let Some(inputs) = get_parameter(store, &self.tx_id, TxParameterId::Inputs)? {
            self.inputs = inputs;
        }
        if let Some(outputs) = get_parameter(store, &self.tx_id, TxParameterId::Outputs)? {
            self.outputs = outputs;
        }
        if let Some(min) = get_parameter(store, &self.tx_id, TxParameterId::MinHeight)? {
            self.min_height = min;
        }
        if let Some(max) = get_parameter(store, &self.tx_id, TxParameterId::MaxHeight)? {
            self.max_height = max;
        }
        self.blinding_excess =
            get_parameter(store, &self.tx_id, TxParameterId::BlindingExcess)?;
        self.offset = get_parameter(store, &self.tx_id, TxParameterId::Offset)?;
        Ok(self.blinding_excess.is_some() && self.offset.is_some())
    }

    /// Select inputs covering amount plus fee and reserve them.
    pub fn select_inputs(&mut self) -> Result<(), UpdateError> {
        let amount_with_fee = self.amount() + self.fee;
        let mut guard = write_store(&self.store)?;
        let mut coins = guard.select_coins(amount_with_fee, true);
        if coins.is_empty() {
            tracing::error!(
                "{} not enough funds: requested {}, available {}",
                self.tx_id,
                amount_with_fee,
                guard.get_available()
            );
            return Err(TxFailure::new(TxFailureReason::NoInputs, !self.is_initiator).into());
        }

        let mut total: Amount = 0;
        for coin in &mut coins {
            coin.spend_tx = Some(self.tx_id);
            coin.status = CoinStatus::Outgoing;

            let (blinding, commitment) = guard.calc_commitment(&coin.id)?;
            crypto::scalar_accumulate(&mut self.offset, blinding)
                .map_err(UpdateError::from)?;
            self.inputs.push(TxInput { commitment });
            total += coin.value();
        }

        self.change += total - amount_with_fee;

        set_parameter(&mut *guard, &self.tx_id, TxParameterId::Change, &self.change, false)?;
        set_parameter(&mut *guard, &self.tx_id, TxParameterId::Inputs, &self.inputs, false)?;
        self.save_offset(&mut *guard)?;
        guard.save_coins(&coins)?;
        Ok(())
    }

    pub fn add_change_output(&mut self) -> Result<(), UpdateError> {
        if self.change == 0 {
            return Ok(());
        }
        self.add_output(self.change, true)
    }

    /// Mint a fresh key id, persist the `Incoming` coin and derive its
    /// commitment.
    pub fn add_output(&mut self, amount: Amount, change: bool) -> Result<(), UpdateError> {
        let mut guard = write_store(&self.store)?;
        let idx = guard.allocate_kid_range(1);
        let key_type = if change { KeyType::Change } else { KeyType::Regular };
        let id = KeyId::new(idx, key_type, amount);

        let mut coin = Coin::new(id, CoinStatus::Incoming);
        coin.create_tx = Some(self.tx_id);
        coin.create_height = self.min_height;
        guard.store_coin(&coin)?;

        let (blinding, commitment) = guard.calc_commitment(&id)?;
        crypto::scalar_accumulate(&mut self.offset, blinding.negate())
            .map_err(UpdateError::from)?;
        self.outputs.push(TxOutput { commitment });
        Ok(())
    }

    pub fn finalize_outputs(&mut self) -> Result<(), UpdateError> {
        let mut guard = write_store(&self.store)?;
        set_parameter(&mut *guard, &self.tx_id, TxParameterId::Outputs, &self.outputs, false)?;
        self.save_offset(&mut *guard)?;
        Ok(())
    }

    /// Allocate the kernel and this party's excess and nonce.
    ///
    /// The excess is persisted in raw form and negated in memory (the
    /// offset convention); the nonce is derived from a stored random seed
    /// on every call so retries are deterministic.
    pub fn create_kernel(&mut self) -> Result<(), UpdateError> {
        debug_assert!(self.kernel.is_none());

        let mut guard = write_store(&self.store)?;
        let raw_excess = match self.blinding_excess.take() {
            Some(raw) => raw,
            None => {
                let idx = guard.allocate_kid_range(1);
                let raw = guard
                    .master_kdf()
                    .derive_key(&KeyId::new(idx, KeyType::Kernel, 0));
                set_parameter(
                    &mut *guard,
                    &self.tx_id,
                    TxParameterId::BlindingExcess,
                    &raw,
                    false,
                )?;
                raw
            }
        };
        crypto::scalar_accumulate(&mut self.offset, raw_excess).map_err(UpdateError::from)?;
        self.blinding_excess = Some(raw_excess.negate());

        let seed: Hash32 = match get_parameter(&*guard, &self.tx_id, TxParameterId::MyNonce)? {
            Some(seed) => seed,
            None => {
                let mut raw = [0u8; 32];
                rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut raw);
                let seed = Hash32(raw);
                set_parameter(&mut *guard, &self.tx_id, TxParameterId::MyNonce, &seed, false)?;
                seed
            }
        };
        self.nonce = Some(guard.master_kdf().derive_nonce(&seed.0));

        self.kernel = Some(TxKernel::new(self.fee, self.min_height, self.max_height));
        Ok(())
    }

    pub fn get_peer_public_excess_and_nonce(&mut self) -> StorageResult<bool> {
        let guard = read_store(&self.store)?;
        self.peer_public_excess =
            get_parameter(&*guard, &self.tx_id, TxParameterId::PeerPublicExcess)?;
        self.peer_public_nonce =
            get_parameter(&*guard, &self.tx_id, TxParameterId::PeerPublicNonce)?;
        Ok(self.peer_public_excess.is_some() && self.peer_public_nonce.is_some())
    }

    pub fn get_peer_signature(&mut self) -> StorageResult<bool> {
        let guard = read_store(&self.store)?;
        self.peer_signature = get_parameter(&*guard, &self.tx_id, TxParameterId::PeerSignature)?;
        Ok(self.peer_signature.is_some())
    }

    pub fn get_peer_inputs_and_outputs(&mut self) -> StorageResult<bool> {
        let guard = read_store(&self.store)?;
        let store = &*guard;
        let has_inputs = match get_parameter(store, &self.tx_id, TxParameterId::PeerInputs)? {
            Some(inputs) => {
                self.peer_inputs = inputs;
                true
            }
            None => false,
        };
        let outputs: Option<Vec<TxOutput>> =
            get_parameter(store, &self.tx_id, TxParameterId::PeerOutputs)?;
        let offset: Option<SecretKey> =
            get_parameter(store, &self.tx_id, TxParameterId::PeerOffset)?;
        let has_outputs = match (outputs, offset) {
            (Some(outputs), Some(offset)) => {
                self.peer_outputs = outputs;
                self.peer_offset = Some(offset);
                true
            }
            _ => false,
        };
        Ok(has_inputs || has_outputs)
    }

    /// Aggregate the commitment and nonce, sign this party's half.
    pub fn sign_partial(&mut self) -> Result<(), UpdateError> {
        let excess = self.signing_excess()?;
        let nonce = self.nonce.ok_or(CryptoError::NotReady("nonce"))?;

        let mut commitment = crypto::public_of(&excess);
        if let Some(peer) = &self.peer_public_excess {
            commitment = crypto::point_add(&commitment, peer).map_err(UpdateError::from)?;
        }
        let kernel = self.kernel.as_mut().ok_or(CryptoError::NotReady("kernel"))?;
        kernel.commitment = Some(commitment);

        let message = kernel.message_hash().map_err(UpdateError::from)?;
        self.message = Some(message);

        let mut nonce_pub = crypto::public_of(&nonce);
        if let Some(peer) = &self.peer_public_nonce {
            nonce_pub = crypto::point_add(&nonce_pub, peer).map_err(UpdateError::from)?;
        }
        self.total_nonce_pub = Some(nonce_pub);

        self.partial_signature = Some(
            schnorr::sign_partial(&excess, &nonce, &nonce_pub, &commitment, &message)
                .map_err(UpdateError::from)?,
        );

        self.store_kernel_id()
    }

    /// Check the peer's partial signature under the shared challenge.
    pub fn is_peer_signature_valid(&self) -> Result<bool, UpdateError> {
        match (&self.peer_signature, &self.peer_public_nonce, &self.peer_public_excess) {
            // Self-transaction: there is no peer half to check.
            (None, None, None) => Ok(true),
            (Some(partial), Some(nonce_pub), Some(excess_pub)) => {
                let total_nonce = self
                    .total_nonce_pub
                    .ok_or(CryptoError::NotReady("aggregate nonce"))?;
                let kernel = self.kernel.as_ref().ok_or(CryptoError::NotReady("kernel"))?;
                let commitment = kernel
                    .commitment
                    .ok_or(CryptoError::NotReady("kernel commitment"))?;
                let message = self.message.ok_or(CryptoError::NotReady("kernel message"))?;
                Ok(schnorr::verify_partial(
                    partial,
                    nonce_pub,
                    excess_pub,
                    &total_nonce,
                    &commitment,
                    &message,
                ))
            }
            _ => Ok(false),
        }
    }

    /// Sum own and peer partials into the final kernel signature.
    ///
    /// Without a peer contribution (self-transaction) the own partial is
    /// already the complete signature.
    pub fn finalize_signature(&mut self) -> Result<(), UpdateError> {
        let mut k = self
            .partial_signature
            .ok_or(CryptoError::NotReady("partial signature"))?;
        if let Some(peer) = &self.peer_signature {
            k = crypto::scalar_add(&k, peer).map_err(UpdateError::from)?;
        }
        let nonce_pub = self
            .total_nonce_pub
            .ok_or(CryptoError::NotReady("aggregate nonce"))?;
        let kernel = self.kernel.as_mut().ok_or(CryptoError::NotReady("kernel"))?;
        kernel.signature = Some(schnorr::Signature { nonce_pub, k });
        self.store_kernel_id()
    }

    /// Concatenate both parties' inputs and outputs, sum the offsets and
    /// normalize.
    pub fn create_transaction(&mut self) -> Result<Transaction, UpdateError> {
        let kernel = self.kernel.clone().ok_or(CryptoError::NotReady("kernel"))?;
        let mut offset = self.offset.ok_or(CryptoError::NotReady("offset"))?;
        if let Some(peer) = &self.peer_offset {
            offset = crypto::scalar_add(&offset, peer).map_err(UpdateError::from)?;
        }

        let mut inputs = self.inputs.clone();
        inputs.extend(self.peer_inputs.iter().copied());
        let mut outputs = self.outputs.clone();
        outputs.extend(self.peer_outputs.iter().copied());

        let mut tx = Transaction {
            inputs,
            outputs,
            kernel,
            offset,
        };
        tx.normalize();
        tracing::info!("{} transaction created, kernel {}", self.tx_id, self.kernel_id()?);
        Ok(tx)
    }

    pub fn amount(&self) -> Amount {
        self.amount_list.iter().sum()
    }

    pub fn amount_list(&self) -> &[Amount] {
        &self.amount_list
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    pub fn min_height(&self) -> Height {
        self.min_height
    }

    pub fn max_height(&self) -> Height {
        self.max_height
    }

    pub fn inputs(&self) -> &[TxInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOutput] {
        &self.outputs
    }

    /// The in-memory offset including the kernel excess contribution.
    pub fn offset(&self) -> CryptoResult<SecretKey> {
        self.offset.ok_or(CryptoError::NotReady("offset"))
    }

    pub fn public_excess(&self) -> Result<PublicKey, UpdateError> {
        Ok(crypto::public_of(&self.signing_excess()?))
    }

    pub fn public_nonce(&self) -> Result<PublicKey, UpdateError> {
        let nonce = self.nonce.ok_or(CryptoError::NotReady("nonce"))?;
        Ok(crypto::public_of(&nonce))
    }

    pub fn partial_signature(&self) -> Result<SecretKey, UpdateError> {
        Ok(self
            .partial_signature
            .ok_or(CryptoError::NotReady("partial signature"))?)
    }

    pub fn kernel(&self) -> Result<TxKernel, UpdateError> {
        Ok(self.kernel.clone().ok_or(CryptoError::NotReady("kernel"))?)
    }

    pub fn kernel_id(&self) -> Result<Hash32, UpdateError> {
        let kernel = self.kernel.as_ref().ok_or(CryptoError::NotReady("kernel"))?;
        Ok(kernel.id().map_err(UpdateError::from)?)
    }

    fn signing_excess(&self) -> Result<SecretKey, UpdateError> {
        Ok(self
            .blinding_excess
            .ok_or(CryptoError::NotReady("blinding excess"))?)
    }

    fn store_kernel_id(&self) -> Result<(), UpdateError> {
        let id = self.kernel_id()?;
        let mut guard = write_store(&self.store)?;
        set_parameter(&mut *guard, &self.tx_id, TxParameterId::KernelId, &id, true)?;
        Ok(())
    }

    fn save_offset(&self, store: &mut dyn WalletStorage) -> StorageResult<()> {
        if let Some(offset) = &self.offset {
            set_parameter(store, &self.tx_id, TxParameterId::Offset, offset, false)?;
        }
        Ok(())
    }
}
