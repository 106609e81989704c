//! # Blocks
//!
//! A block commits a reward transaction, a **sorted set** of user
//! transaction hashes, and the signatures of the round's producer and
//! validators. The transaction set is kept sorted so that every node
//! serializes the same block to the same bytes — the message digest
//! depends on it.
//!
//! Three digest modes serialize progressively larger parts of the block:
//!
//! - `Producer` — everything up to the transaction set. What the elected
//!   producer signs.
//! - `Validator` — additionally includes the producer's key and signature.
//!   What each validator signs; it cannot be formed until the producer has
//!   signed.
//! - `Full` — everything. The block hash.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::crypto::hash::sha3;
use crate::crypto::keys;
use crate::crypto::types::{Hash, PublicKey, SecretKey, Signature};
use crate::transaction::{GenesisTransaction, StakerRewardTransaction, TransactionType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("cannot create a validator digest without a producer signature")]
    MissingProducerSignature,
}

/// Which slice of the block feeds the digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestMode {
    Full,
    Producer,
    Validator,
}

// ---------------------------------------------------------------------------
// Reward transaction
// ---------------------------------------------------------------------------

/// The reward transaction opening a block: the genesis mint for block
/// zero, a staker reward for every block after it.
#[derive(Debug, Clone, PartialEq)]
pub enum RewardTransaction {
    Genesis(GenesisTransaction),
    StakerReward(StakerRewardTransaction),
}

impl RewardTransaction {
    pub fn hash(&self) -> Hash {
        match self {
            Self::Genesis(tx) => tx.hash(),
            Self::StakerReward(tx) => tx.hash(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        matches!(self, Self::Genesis(_))
    }
}

impl Default for RewardTransaction {
    /// Defaults to a staker reward: there is only ever one genesis.
    fn default() -> Self {
        Self::StakerReward(StakerRewardTransaction::default())
    }
}

impl Serializable for RewardTransaction {
    fn write(&self, writer: &mut Writer) {
        match self {
            Self::Genesis(tx) => tx.write(writer),
            Self::StakerReward(tx) => tx.write(writer),
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let tag = reader.peek_varint()?;

        match TransactionType::from_tag(tag) {
            Some(TransactionType::Genesis) => Ok(Self::Genesis(GenesisTransaction::read(reader)?)),
            Some(TransactionType::StakerReward) => {
                Ok(Self::StakerReward(StakerRewardTransaction::read(reader)?))
            }
            _ => Err(CodecError::UnknownTag(tag)),
        }
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub version: u64,
    pub previous_blockhash: Hash,
    pub timestamp: u64,
    pub block_index: u64,
    pub reward_tx: RewardTransaction,

    /// Transaction hashes, kept sorted so serialization is byte-identical
    /// across nodes regardless of insertion order.
    pub transactions: BTreeSet<Hash>,

    pub producer_public_key: PublicKey,
    pub producer_signature: Signature,

    /// Validator signatures, ordered by public key for the same reason the
    /// transaction set is sorted.
    pub validator_signatures: BTreeMap<PublicKey, Signature>,
}

impl Block {
    /// Inserts a transaction hash into the block's set.
    pub fn append_transaction_hash(&mut self, hash: Hash) {
        self.transactions.insert(hash);
    }

    /// Records a validator's signature. The first signature per key wins.
    pub fn append_validator_signature(&mut self, public_key: PublicKey, signature: Signature) {
        self.validator_signatures.entry(public_key).or_insert(signature);
    }

    pub fn hash(&self) -> Hash {
        self.message_digest(DigestMode::Full)
            .unwrap_or_else(|_| Hash::empty())
    }

    pub fn index(&self) -> u64 {
        self.block_index
    }

    pub fn is_genesis(&self) -> bool {
        self.reward_tx.is_genesis()
    }

    fn has_producer(&self) -> bool {
        !self.producer_public_key.is_empty() && !self.producer_signature.is_empty()
    }

    /// The signing payload for the given mode.
    pub fn message_digest(&self, mode: DigestMode) -> Result<Hash, BlockError> {
        Ok(sha3(&self.serialize_with_mode(mode)?))
    }

    pub fn serialize_with_mode(&self, mode: DigestMode) -> Result<Vec<u8>, BlockError> {
        if mode == DigestMode::Validator && !self.has_producer() {
            return Err(BlockError::MissingProducerSignature);
        }

        let mut writer = Writer::new();

        self.write_with_mode(&mut writer, mode);

        Ok(writer.into_vec())
    }

    fn write_with_mode(&self, writer: &mut Writer, mode: DigestMode) {
        writer.varint(self.version);

        writer.key(&self.previous_blockhash);

        writer.varint(self.timestamp);

        writer.varint(self.block_index);

        self.reward_tx.write(writer);

        writer.varint(self.transactions.len() as u64);

        for hash in &self.transactions {
            writer.key(hash);
        }

        if mode == DigestMode::Producer {
            return;
        }

        let has_producer = self.has_producer();

        writer.boolean(has_producer);

        if has_producer {
            writer.key(&self.producer_public_key);

            writer.key(&self.producer_signature);
        }

        if mode == DigestMode::Validator {
            return;
        }

        writer.varint(self.validator_signatures.len() as u64);

        for (public_key, signature) in &self.validator_signatures {
            writer.key(public_key);

            writer.key(signature);
        }
    }

    /// Signs the block as its producer, recording and returning the key
    /// and signature.
    pub fn producer_sign(&mut self, secret_key: &SecretKey) -> Result<(PublicKey, Signature), BlockError> {
        self.producer_public_key = keys::secret_key_to_public_key(secret_key);

        let digest = self.message_digest(DigestMode::Producer)?;

        self.producer_signature = keys::generate_signature(&digest, secret_key);

        Ok((self.producer_public_key, self.producer_signature))
    }

    /// Signs the block as a validator, recording and returning the key and
    /// signature. Requires the producer's signature to be present.
    pub fn validator_sign(
        &mut self,
        secret_key: &SecretKey,
    ) -> Result<(PublicKey, Signature), BlockError> {
        let public_key = keys::secret_key_to_public_key(secret_key);

        let digest = self.message_digest(DigestMode::Validator)?;

        let signature = keys::generate_signature(&digest, secret_key);

        self.append_validator_signature(public_key, signature);

        Ok((public_key, signature))
    }

    /// Structural validity: the reward transaction pays someone, the
    /// producer has not signed as a validator, and every signature checks
    /// out. Whether those parties were *elected* is consensus logic that
    /// lives elsewhere.
    pub fn validate_construction(&self) -> bool {
        let reward_pays = match &self.reward_tx {
            RewardTransaction::Genesis(tx) => !tx.outputs.is_empty(),
            RewardTransaction::StakerReward(tx) => !tx.staker_outputs.is_empty(),
        };

        if !reward_pays {
            return false;
        }

        // The producer may not validate their own block.
        if self.validator_signatures.contains_key(&self.producer_public_key) {
            return false;
        }

        if !self.validate_producer_signature() {
            return false;
        }

        self.validate_validator_signatures()
    }

    /// Checks only the producer signature.
    pub fn validate_producer_signature(&self) -> bool {
        let digest = match self.message_digest(DigestMode::Producer) {
            Ok(digest) => digest,
            Err(_) => return false,
        };

        keys::check_signature(&digest, &self.producer_public_key, &self.producer_signature)
    }

    /// Checks every validator signature; at least one is required.
    pub fn validate_validator_signatures(&self) -> bool {
        if self.validator_signatures.is_empty() {
            return false;
        }

        let digest = match self.message_digest(DigestMode::Validator) {
            Ok(digest) => digest,
            Err(_) => return false,
        };

        self.validator_signatures
            .iter()
            .all(|(public_key, signature)| keys::check_signature(&digest, public_key, signature))
    }

    pub fn size(&self) -> usize {
        self.wire_size()
    }
}

impl Serializable for Block {
    fn write(&self, writer: &mut Writer) {
        self.write_with_mode(writer, DigestMode::Full);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = reader.varint()?;

        let previous_blockhash = Hash::read(reader)?;

        let timestamp = reader.varint()?;

        let block_index = reader.varint()?;

        let reward_tx = RewardTransaction::read(reader)?;

        let count = reader.varint()? as usize;

        let mut transactions = BTreeSet::new();

        for _ in 0..count {
            transactions.insert(Hash::read(reader)?);
        }

        let has_producer = reader.boolean()?;

        let (producer_public_key, producer_signature) = if has_producer {
            (PublicKey::read(reader)?, Signature::read(reader)?)
        } else {
            (PublicKey::empty(), Signature::empty())
        };

        let count = reader.varint()? as usize;

        let mut validator_signatures = BTreeMap::new();

        for _ in 0..count {
            let public_key = PublicKey::read(reader)?;

            let signature = Signature::read(reader)?;

            validator_signatures.insert(public_key, signature);
        }

        Ok(Self {
            version,
            previous_blockhash,
            timestamp,
            block_index,
            reward_tx,
            transactions,
            producer_public_key,
            producer_signature,
            validator_signatures,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
