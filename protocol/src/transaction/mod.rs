//! # Transactions
//!
//! The six transaction variants of the network and the machinery they
//! share. Three are system transactions (GENESIS, STAKER_REWARD,
//! STAKE_REFUND); three are user transactions (NORMAL, STAKE,
//! RECALL_STAKE) that exist in an uncommitted form carrying full proofs
//! and a committed form carrying only the proof hashes.
//!
//! Polymorphic decoding peeks the leading type varint and dispatches to
//! the matching variant; unknown tags are decode errors, never panics.

pub mod components;
pub mod genesis;
pub mod stake_refund;
pub mod staker_reward;
pub mod user;
pub mod validation;

use thiserror::Error;

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::crypto::types::{Hash, KeyImage, PublicKey};

pub use components::{
    NormalData, RecallStakeData, StakeData, StakerOutput, TransactionBody, TransactionOutput,
    TransactionPrefix,
};
pub use genesis::GenesisTransaction;
pub use stake_refund::StakeRefundTransaction;
pub use staker_reward::StakerRewardTransaction;
pub use user::{CommittedUserTransaction, UncommittedUserTransaction};

pub type CommittedNormalTransaction = CommittedUserTransaction<NormalData>;
pub type CommittedStakeTransaction = CommittedUserTransaction<StakeData>;
pub type CommittedRecallStakeTransaction = CommittedUserTransaction<RecallStakeData>;

pub type UncommittedNormalTransaction = UncommittedUserTransaction<NormalData>;
pub type UncommittedStakeTransaction = UncommittedUserTransaction<StakeData>;
pub type UncommittedRecallStakeTransaction = UncommittedUserTransaction<RecallStakeData>;

// ---------------------------------------------------------------------------
// Type tags
// ---------------------------------------------------------------------------

/// Discriminant of a transaction on the wire. The numeric tags are
/// consensus-relevant; changing them is a hard fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TransactionType {
    Genesis,
    StakerReward,
    Normal,
    Stake,
    RecallStake,
    StakeRefund,
}

impl TransactionType {
    pub const fn tag(self) -> u64 {
        match self {
            Self::Genesis => 0,
            Self::StakerReward => 1,
            Self::Normal => 2,
            Self::Stake => 3,
            Self::RecallStake => 4,
            Self::StakeRefund => 5,
        }
    }

    pub const fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Genesis),
            1 => Some(Self::StakerReward),
            2 => Some(Self::Normal),
            3 => Some(Self::Stake),
            4 => Some(Self::RecallStake),
            5 => Some(Self::StakeRefund),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Genesis => "Genesis",
            Self::StakerReward => "StakerReward",
            Self::Normal => "Normal",
            Self::Stake => "Stake",
            Self::RecallStake => "RecallStake",
            Self::StakeRefund => "StakeRefund",
        };

        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Everything that can be wrong with a transaction, from construction
/// through full validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("unknown transaction type: {0}")]
    UnknownType(u64),

    #[error("transaction version {0} is not permitted for this type")]
    InvalidVersion(u64),

    #[error("transaction is missing a fee")]
    MissingFee,

    #[error("transaction fee {actual} is below the required fee {required}")]
    LowFee { required: u64, actual: u64 },

    #[error("proof-of-work has {actual} leading zeros, {required} required")]
    MinimumPow { required: u32, actual: u32 },

    #[error("key image is not in the prime subgroup")]
    InvalidKeyImage,

    #[error("duplicate key image within the transaction")]
    DuplicateKeyImage,

    #[error("key image already exists on chain")]
    KeyImageAlreadyExists,

    #[error("invalid input count: {0}")]
    InvalidInputCount(usize),

    #[error("invalid output count: {0}")]
    InvalidOutputCount(usize),

    #[error("output public ephemeral is empty")]
    OutputPublicEphemeral,

    #[error("output amount is invalid")]
    OutputAmount,

    #[error("output commitment is invalid")]
    OutputCommitment,

    #[error("output was not found")]
    OutputNotFound,

    #[error("transaction public key is empty")]
    PublicKeyMissing,

    #[error("transaction secret key is missing or wrong")]
    SecretKeyMissing,

    #[error("secret key does not match the public key")]
    KeypairMismatch,

    #[error("range proof failed verification")]
    InvalidRangeProof,

    #[error("{signatures} signatures for {key_images} key images")]
    SignatureSizeMismatch { signatures: usize, key_images: usize },

    #[error("{pseudo_commitments} pseudo commitments for {key_images} key images")]
    InvalidPseudoCommitmentCount {
        pseudo_commitments: usize,
        key_images: usize,
    },

    #[error("ring signature for input {0} failed verification")]
    InvalidRingSignature(usize),

    #[error("ring has {actual} participants, {expected} expected")]
    RingParticipantCount { expected: usize, actual: usize },

    #[error("pseudo commitments do not balance against outputs plus fee")]
    CommitmentsDoNotBalance,

    #[error("stake amount is zero")]
    StakeNoAmount,

    #[error("candidate public key is empty")]
    CandidateKeyMissing,

    #[error("staker id is empty")]
    StakerIdMissing,

    #[error("recall view signature is missing or invalid")]
    RecallViewSignature,

    #[error("recall spend signature is missing or invalid")]
    RecallSpendSignature,

    #[error("recall stake transaction hash is empty")]
    RecallStakeTxHash,

    #[error("staker reward entry has an empty staker id")]
    StakerRewardId,

    #[error("staker reward entry has no amount")]
    StakerRewardAmount,

    #[error("extra field of {0} bytes exceeds the maximum")]
    ExtraTooLarge(usize),

    #[error("a genesis transaction already exists")]
    GenesisAlreadyExists,

    #[error("address error: {0}")]
    Address(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Committed transaction sum type
// ---------------------------------------------------------------------------

/// Any transaction in the form it is stored on chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Transaction {
    Genesis(GenesisTransaction),
    StakerReward(StakerRewardTransaction),
    Normal(CommittedNormalTransaction),
    Stake(CommittedStakeTransaction),
    RecallStake(CommittedRecallStakeTransaction),
    StakeRefund(StakeRefundTransaction),
}

impl Transaction {
    pub fn tx_type(&self) -> TransactionType {
        match self {
            Self::Genesis(_) => TransactionType::Genesis,
            Self::StakerReward(_) => TransactionType::StakerReward,
            Self::Normal(_) => TransactionType::Normal,
            Self::Stake(_) => TransactionType::Stake,
            Self::RecallStake(_) => TransactionType::RecallStake,
            Self::StakeRefund(_) => TransactionType::StakeRefund,
        }
    }

    pub fn hash(&self) -> Hash {
        match self {
            Self::Genesis(tx) => tx.hash(),
            Self::StakerReward(tx) => tx.hash(),
            Self::Normal(tx) => tx.hash(),
            Self::Stake(tx) => tx.hash(),
            Self::RecallStake(tx) => tx.hash(),
            Self::StakeRefund(tx) => tx.hash(),
        }
    }

    pub fn check_construction(&self) -> Result<(), TransactionError> {
        match self {
            Self::Genesis(tx) => tx.check_construction(),
            Self::StakerReward(tx) => tx.check_construction(),
            Self::Normal(tx) => tx.check_construction(),
            Self::Stake(tx) => tx.check_construction(),
            Self::RecallStake(tx) => tx.check_construction(),
            Self::StakeRefund(tx) => tx.check_construction(),
        }
    }

    pub fn size(&self) -> usize {
        self.wire_size()
    }

    pub fn is_genesis(&self) -> bool {
        matches!(self, Self::Genesis(_))
    }

    /// The block index before which this transaction's outputs cannot be
    /// spent.
    pub fn unlock_block(&self) -> u64 {
        match self {
            Self::Genesis(tx) => tx.prefix.unlock_block,
            Self::StakerReward(_) => 0,
            Self::Normal(tx) => tx.prefix.unlock_block,
            Self::Stake(tx) => tx.prefix.unlock_block,
            Self::RecallStake(tx) => tx.prefix.unlock_block,
            Self::StakeRefund(tx) => tx.prefix.unlock_block,
        }
    }

    /// The spendable outputs this transaction creates. Staker rewards
    /// credit the staking registry instead and have none.
    pub fn outputs(&self) -> &[TransactionOutput] {
        match self {
            Self::Genesis(tx) => &tx.outputs,
            Self::StakerReward(_) => &[],
            Self::Normal(tx) => &tx.body.outputs,
            Self::Stake(tx) => &tx.body.outputs,
            Self::RecallStake(tx) => &tx.body.outputs,
            Self::StakeRefund(tx) => &tx.outputs,
        }
    }

    /// The key images this transaction consumes. Only user transactions
    /// spend inputs.
    pub fn key_images(&self) -> &[KeyImage] {
        match self {
            Self::Normal(tx) => &tx.body.key_images,
            Self::Stake(tx) => &tx.body.key_images,
            Self::RecallStake(tx) => &tx.body.key_images,
            _ => &[],
        }
    }

    /// The proof-of-work hash, for the variants subject to the fee rule.
    pub fn pow_hash(&self) -> Option<Hash> {
        match self {
            Self::Normal(tx) => Some(tx.pow_hash()),
            Self::Stake(tx) => Some(tx.pow_hash()),
            Self::RecallStake(tx) => Some(tx.pow_hash()),
            _ => None,
        }
    }

    pub fn fee(&self) -> Option<u64> {
        match self {
            Self::Normal(tx) => Some(tx.body.fee),
            Self::Stake(tx) => Some(tx.body.fee),
            Self::RecallStake(tx) => Some(tx.body.fee),
            _ => None,
        }
    }
}

impl Serializable for Transaction {
    fn write(&self, writer: &mut Writer) {
        match self {
            Self::Genesis(tx) => tx.write(writer),
            Self::StakerReward(tx) => tx.write(writer),
            Self::Normal(tx) => tx.write(writer),
            Self::Stake(tx) => tx.write(writer),
            Self::RecallStake(tx) => tx.write(writer),
            Self::StakeRefund(tx) => tx.write(writer),
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let tag = reader.peek_varint()?;

        match TransactionType::from_tag(tag) {
            Some(TransactionType::Genesis) => Ok(Self::Genesis(GenesisTransaction::read(reader)?)),
            Some(TransactionType::StakerReward) => {
                Ok(Self::StakerReward(StakerRewardTransaction::read(reader)?))
            }
            Some(TransactionType::Normal) => {
                Ok(Self::Normal(CommittedNormalTransaction::read(reader)?))
            }
            Some(TransactionType::Stake) => {
                Ok(Self::Stake(CommittedStakeTransaction::read(reader)?))
            }
            Some(TransactionType::RecallStake) => Ok(Self::RecallStake(
                CommittedRecallStakeTransaction::read(reader)?,
            )),
            Some(TransactionType::StakeRefund) => {
                Ok(Self::StakeRefund(StakeRefundTransaction::read(reader)?))
            }
            None => Err(CodecError::UnknownTag(tag)),
        }
    }
}

impl From<GenesisTransaction> for Transaction {
    fn from(tx: GenesisTransaction) -> Self {
        Self::Genesis(tx)
    }
}

impl From<StakerRewardTransaction> for Transaction {
    fn from(tx: StakerRewardTransaction) -> Self {
        Self::StakerReward(tx)
    }
}

impl From<CommittedNormalTransaction> for Transaction {
    fn from(tx: CommittedNormalTransaction) -> Self {
        Self::Normal(tx)
    }
}

impl From<CommittedStakeTransaction> for Transaction {
    fn from(tx: CommittedStakeTransaction) -> Self {
        Self::Stake(tx)
    }
}

impl From<CommittedRecallStakeTransaction> for Transaction {
    fn from(tx: CommittedRecallStakeTransaction) -> Self {
        Self::RecallStake(tx)
    }
}

impl From<StakeRefundTransaction> for Transaction {
    fn from(tx: StakeRefundTransaction) -> Self {
        Self::StakeRefund(tx)
    }
}

// ---------------------------------------------------------------------------
// Uncommitted transaction sum type
// ---------------------------------------------------------------------------

/// A user transaction in flight, before a block commits it.
#[derive(Debug, Clone, PartialEq)]
pub enum UncommittedTransaction {
    Normal(UncommittedNormalTransaction),
    Stake(UncommittedStakeTransaction),
    RecallStake(UncommittedRecallStakeTransaction),
}

impl UncommittedTransaction {
    pub fn tx_type(&self) -> TransactionType {
        match self {
            Self::Normal(_) => TransactionType::Normal,
            Self::Stake(_) => TransactionType::Stake,
            Self::RecallStake(_) => TransactionType::RecallStake,
        }
    }

    pub fn hash(&self) -> Hash {
        match self {
            Self::Normal(tx) => tx.hash(),
            Self::Stake(tx) => tx.hash(),
            Self::RecallStake(tx) => tx.hash(),
        }
    }

    pub fn digest(&self) -> Hash {
        match self {
            Self::Normal(tx) => tx.digest(),
            Self::Stake(tx) => tx.digest(),
            Self::RecallStake(tx) => tx.digest(),
        }
    }

    pub fn pow_hash(&self) -> Hash {
        match self {
            Self::Normal(tx) => tx.pow_hash(),
            Self::Stake(tx) => tx.pow_hash(),
            Self::RecallStake(tx) => tx.pow_hash(),
        }
    }

    pub fn fee(&self) -> u64 {
        self.body().fee
    }

    pub fn key_images(&self) -> &[KeyImage] {
        &self.body().key_images
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::Normal(tx) => tx.prefix.public_key,
            Self::Stake(tx) => tx.prefix.public_key,
            Self::RecallStake(tx) => tx.prefix.public_key,
        }
    }

    pub fn body(&self) -> &TransactionBody {
        match self {
            Self::Normal(tx) => &tx.body,
            Self::Stake(tx) => &tx.body,
            Self::RecallStake(tx) => &tx.body,
        }
    }

    pub fn suffix(&self) -> &components::UncommittedSuffix {
        match self {
            Self::Normal(tx) => &tx.suffix,
            Self::Stake(tx) => &tx.suffix,
            Self::RecallStake(tx) => &tx.suffix,
        }
    }

    pub fn check_construction(&self) -> Result<(), TransactionError> {
        match self {
            Self::Normal(tx) => tx.check_construction(),
            Self::Stake(tx) => tx.check_construction(),
            Self::RecallStake(tx) => tx.check_construction(),
        }
    }

    pub fn size(&self) -> usize {
        self.wire_size()
    }

    /// Projects into the committed form, wrapped in the on-chain sum type.
    pub fn to_committed(&self) -> Transaction {
        match self {
            Self::Normal(tx) => Transaction::Normal(tx.to_committed()),
            Self::Stake(tx) => Transaction::Stake(tx.to_committed()),
            Self::RecallStake(tx) => Transaction::RecallStake(tx.to_committed()),
        }
    }
}

impl Serializable for UncommittedTransaction {
    fn write(&self, writer: &mut Writer) {
        match self {
            Self::Normal(tx) => tx.write(writer),
            Self::Stake(tx) => tx.write(writer),
            Self::RecallStake(tx) => tx.write(writer),
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let tag = reader.peek_varint()?;

        match TransactionType::from_tag(tag) {
            Some(TransactionType::Normal) => {
                Ok(Self::Normal(UncommittedNormalTransaction::read(reader)?))
            }
            Some(TransactionType::Stake) => {
                Ok(Self::Stake(UncommittedStakeTransaction::read(reader)?))
            }
            Some(TransactionType::RecallStake) => Ok(Self::RecallStake(
                UncommittedRecallStakeTransaction::read(reader)?,
            )),
            _ => Err(CodecError::UnknownTag(tag)),
        }
    }
}

impl From<UncommittedNormalTransaction> for UncommittedTransaction {
    fn from(tx: UncommittedNormalTransaction) -> Self {
        Self::Normal(tx)
    }
}

impl From<UncommittedStakeTransaction> for UncommittedTransaction {
    fn from(tx: UncommittedStakeTransaction) -> Self {
        Self::Stake(tx)
    }
}

impl From<UncommittedRecallStakeTransaction> for UncommittedTransaction {
    fn from(tx: UncommittedRecallStakeTransaction) -> Self {
        Self::RecallStake(tx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_round_trip() {
        for tx_type in [
            TransactionType::Genesis,
            TransactionType::StakerReward,
            TransactionType::Normal,
            TransactionType::Stake,
            TransactionType::RecallStake,
            TransactionType::StakeRefund,
        ] {
            assert_eq!(TransactionType::from_tag(tx_type.tag()), Some(tx_type));
        }

        assert_eq!(TransactionType::from_tag(99), None);
    }

    #[test]
    fn polymorphic_decode_dispatches_on_tag() {
        let reward = StakerRewardTransaction::new(
            vec![StakerOutput {
                staker_id: crate::crypto::hash::sha3(b"staker"),
                amount: 10,
            }],
            vec![],
        );

        let decoded = Transaction::from_bytes(&reward.to_bytes()).unwrap();

        assert_eq!(decoded.tx_type(), TransactionType::StakerReward);
        assert_eq!(decoded.hash(), reward.hash());
    }

    #[test]
    fn polymorphic_decode_rejects_unknown_tag() {
        let mut writer = Writer::new();
        writer.varint(42);

        assert!(matches!(
            Transaction::from_bytes(writer.data()),
            Err(CodecError::UnknownTag(42))
        ));
    }

    #[test]
    fn uncommitted_decode_rejects_committed_only_tags() {
        let genesis_tag = TransactionType::Genesis.tag();

        let mut writer = Writer::new();
        writer.varint(genesis_tag);

        assert!(matches!(
            UncommittedTransaction::from_bytes(writer.data()),
            Err(CodecError::UnknownTag(_))
        ));
    }
}
