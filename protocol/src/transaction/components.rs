//! Shared building blocks of the transaction variants: the prefix, the
//! user body, the committed/uncommitted suffixes, and the per-type data
//! sections. Every variant is assembled from these pieces so that the
//! digest each variant hashes is, byte for byte, the concatenation of the
//! component encodings.

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::config;
use crate::crypto::clsag::ClsagSignature;
use crate::crypto::hash::{sha3, sha3_multi};
use crate::crypto::range_proof::RangeProof;
use crate::crypto::types::{Commitment, Hash, KeyImage, PublicKey, Signature};
use crate::transaction::{TransactionError, TransactionType};

// ---------------------------------------------------------------------------
// Prefix
// ---------------------------------------------------------------------------

/// The fields every prefixed transaction starts with. The type tag itself
/// is supplied by the variant; the prefix serializes right behind it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransactionPrefix {
    pub version: u64,
    pub unlock_block: u64,
    pub public_key: PublicKey,
}

impl Default for TransactionPrefix {
    fn default() -> Self {
        Self {
            version: 1,
            unlock_block: 0,
            public_key: PublicKey::empty(),
        }
    }
}

impl TransactionPrefix {
    pub fn write(&self, tx_type: TransactionType, writer: &mut Writer) {
        writer.varint(tx_type.tag());

        writer.varint(self.version);

        writer.varint(self.unlock_block);

        writer.key(&self.public_key);
    }

    /// Reads the prefix fields. The caller has already consumed (or peeked
    /// past) the type tag to pick the variant.
    pub fn read_fields(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            version: reader.varint()?,
            unlock_block: reader.varint()?,
            public_key: PublicKey::read(reader)?,
        })
    }
}

/// Consumes and validates the leading type tag.
pub(crate) fn read_type_tag(
    reader: &mut Reader<'_>,
    expected: TransactionType,
) -> Result<(), CodecError> {
    let tag = reader.varint()?;

    if tag != expected.tag() {
        return Err(CodecError::UnknownTag(tag));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// A confidential output: the one-time key it pays to, the masked amount,
/// and the Pedersen commitment the range proof and parity check attest to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct TransactionOutput {
    pub public_ephemeral: PublicKey,
    pub amount: u64,
    pub commitment: Commitment,
}

impl TransactionOutput {
    /// The content hash, which doubles as the output's global index key.
    pub fn hash(&self) -> Hash {
        sha3(&self.to_bytes())
    }

    pub fn check_construction(&self) -> Result<(), TransactionError> {
        if self.public_ephemeral.is_empty() {
            return Err(TransactionError::OutputPublicEphemeral);
        }

        if self.amount == 0 {
            return Err(TransactionError::OutputAmount);
        }

        if self.commitment.is_empty() {
            return Err(TransactionError::OutputCommitment);
        }

        Ok(())
    }
}

impl Serializable for TransactionOutput {
    fn write(&self, writer: &mut Writer) {
        writer.key(&self.public_ephemeral);

        writer.varint(self.amount);

        writer.key(&self.commitment);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            public_ephemeral: PublicKey::read(reader)?,
            amount: reader.varint()?,
            commitment: Commitment::read(reader)?,
        })
    }
}

/// A staker reward line item: who gets credited, and by how much. The same
/// shape records a penalty with the opposite sign at the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct StakerOutput {
    pub staker_id: Hash,
    pub amount: u64,
}

impl StakerOutput {
    pub fn hash(&self) -> Hash {
        sha3(&self.to_bytes())
    }

    pub fn check_construction(&self) -> Result<(), TransactionError> {
        if self.staker_id.is_empty() {
            return Err(TransactionError::StakerRewardId);
        }

        if self.amount == 0 {
            return Err(TransactionError::StakerRewardAmount);
        }

        Ok(())
    }
}

impl Serializable for StakerOutput {
    fn write(&self, writer: &mut Writer) {
        writer.key(&self.staker_id);

        writer.varint(self.amount);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            staker_id: Hash::read(reader)?,
            amount: reader.varint()?,
        })
    }
}

// ---------------------------------------------------------------------------
// User body
// ---------------------------------------------------------------------------

/// The spend body shared by every user transaction: proof-of-work nonce,
/// fee, the key images of the consumed inputs, and the new outputs.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct TransactionBody {
    pub nonce: u64,
    pub fee: u64,
    pub key_images: Vec<KeyImage>,
    pub outputs: Vec<TransactionOutput>,
}

impl TransactionBody {
    pub fn check_construction(&self) -> Result<(), TransactionError> {
        if self.fee == 0 {
            return Err(TransactionError::MissingFee);
        }

        if self.key_images.is_empty()
            || self.key_images.len() > config::transaction::MAXIMUM_INPUTS
        {
            return Err(TransactionError::InvalidInputCount(self.key_images.len()));
        }

        for key_image in &self.key_images {
            if !key_image.in_prime_subgroup() {
                return Err(TransactionError::InvalidKeyImage);
            }
        }

        // Duplicate inputs inside one transaction would double spend
        // against themselves before the chain ever saw them.
        let mut deduped = self.key_images.clone();

        deduped.sort();

        deduped.dedup();

        if deduped.len() != self.key_images.len() {
            return Err(TransactionError::DuplicateKeyImage);
        }

        if self.outputs.len() < config::transaction::MINIMUM_OUTPUTS
            || self.outputs.len() > config::transaction::MAXIMUM_OUTPUTS
        {
            return Err(TransactionError::InvalidOutputCount(self.outputs.len()));
        }

        for output in &self.outputs {
            output.check_construction()?;
        }

        Ok(())
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.varint(self.nonce);

        writer.varint(self.fee);

        writer.key_vec(&self.key_images);

        writer.varint(self.outputs.len() as u64);

        for output in &self.outputs {
            output.write(writer);
        }
    }

    pub fn read_fields(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let nonce = reader.varint()?;

        let fee = reader.varint()?;

        let key_images = reader
            .key_vec::<32>()?
            .into_iter()
            .map(KeyImage::from)
            .collect();

        let count = reader.varint()? as usize;

        let mut outputs = Vec::with_capacity(count.min(config::transaction::MAXIMUM_OUTPUTS));

        for _ in 0..count {
            outputs.push(TransactionOutput::read(reader)?);
        }

        Ok(Self {
            nonce,
            fee,
            key_images,
            outputs,
        })
    }
}

// ---------------------------------------------------------------------------
// Suffixes
// ---------------------------------------------------------------------------

/// The full proof material of an in-flight user transaction. Once the
/// transaction commits, the suffix collapses into its two hashes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UncommittedSuffix {
    pub pseudo_commitments: Vec<Commitment>,
    pub ring_participants: Vec<Hash>,
    pub signatures: Vec<ClsagSignature>,
    pub range_proof: RangeProof,
}

impl UncommittedSuffix {
    /// Hash over everything in the suffix except the range proof. Survives
    /// pruning as one half of the committed suffix.
    pub fn signature_hash(&self) -> Hash {
        let mut writer = Writer::new();

        self.write_signatures(&mut writer);

        sha3(writer.data())
    }

    /// The range proof's content hash: the other half of the committed
    /// suffix, and an input to the proof-of-work hash.
    pub fn range_proof_hash(&self) -> Hash {
        self.range_proof.hash()
    }

    pub fn to_committed(&self) -> CommittedSuffix {
        CommittedSuffix {
            signature_hash: self.signature_hash(),
            range_proof_hash: self.range_proof_hash(),
        }
    }

    fn write_signatures(&self, writer: &mut Writer) {
        writer.key_vec(&self.pseudo_commitments);

        writer.key_vec(&self.ring_participants);

        writer.varint(self.signatures.len() as u64);

        for signature in &self.signatures {
            signature.write(writer);
        }
    }

    pub fn write(&self, writer: &mut Writer) {
        self.write_signatures(writer);

        self.range_proof.write(writer);
    }

    pub fn read_fields(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let pseudo_commitments = reader
            .key_vec::<32>()?
            .into_iter()
            .map(Commitment::from)
            .collect();

        let ring_participants = reader
            .key_vec::<32>()?
            .into_iter()
            .map(Hash::from)
            .collect();

        let count = reader.varint()? as usize;

        let mut signatures = Vec::with_capacity(count.min(config::transaction::MAXIMUM_INPUTS));

        for _ in 0..count {
            signatures.push(ClsagSignature::read(reader)?);
        }

        Ok(Self {
            pseudo_commitments,
            ring_participants,
            signatures,
            range_proof: RangeProof::read(reader)?,
        })
    }
}

/// The pruned proof material of a committed user transaction. Keeping only
/// the two hashes lets a node discard signatures and range proofs while the
/// transaction hash stays exactly what it was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct CommittedSuffix {
    pub signature_hash: Hash,
    pub range_proof_hash: Hash,
}

impl CommittedSuffix {
    pub fn write(&self, writer: &mut Writer) {
        writer.key(&self.signature_hash);

        writer.key(&self.range_proof_hash);
    }

    pub fn read_fields(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            signature_hash: Hash::read(reader)?,
            range_proof_hash: Hash::read(reader)?,
        })
    }
}

/// Computes the consensus identity of a user transaction from its digest
/// and suffix hashes. Both transaction forms funnel through this one
/// function, which is the entire trick behind hash-stable pruning.
pub fn user_transaction_hash(
    digest: &Hash,
    signature_hash: &Hash,
    range_proof_hash: &Hash,
) -> Hash {
    sha3_multi(&[
        digest.as_ref(),
        signature_hash.as_ref(),
        range_proof_hash.as_ref(),
    ])
}

// ---------------------------------------------------------------------------
// Per-type data sections
// ---------------------------------------------------------------------------

/// The type-specific data section carried between a user transaction's
/// body and suffix. Implementors supply the type tag, the permitted
/// versions, and their own construction rules.
pub trait TransactionData: Clone + std::fmt::Debug + PartialEq + Default {
    const TYPE: TransactionType;

    const PERMITTED_VERSIONS: &'static [u64];

    fn check_construction(&self) -> Result<(), TransactionError>;

    fn write(&self, writer: &mut Writer);

    fn read_fields(reader: &mut Reader<'_>) -> Result<Self, CodecError>;
}

/// Data section of a NORMAL transaction: free-form extra bytes, bounded so
/// nobody stores their photo collection on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct NormalData {
    pub extra: Vec<u8>,
}

impl TransactionData for NormalData {
    const TYPE: TransactionType = TransactionType::Normal;

    const PERMITTED_VERSIONS: &'static [u64] = &[1, 2];

    fn check_construction(&self) -> Result<(), TransactionError> {
        if self.extra.len() > config::transaction::MAXIMUM_EXTRA_SIZE {
            return Err(TransactionError::ExtraTooLarge(self.extra.len()));
        }

        Ok(())
    }

    fn write(&self, writer: &mut Writer) {
        writer.blob(&self.extra);
    }

    fn read_fields(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            extra: reader.blob()?,
        })
    }
}

/// Data section of a STAKE transaction. Version 1 proposes a candidacy;
/// version 2 votes for an existing candidate.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct StakeData {
    pub stake_amount: u64,
    pub candidate_public_key: PublicKey,
    pub staker_public_view_key: PublicKey,
    pub staker_public_spend_key: PublicKey,
}

impl TransactionData for StakeData {
    const TYPE: TransactionType = TransactionType::Stake;

    const PERMITTED_VERSIONS: &'static [u64] = &[1, 2];

    fn check_construction(&self) -> Result<(), TransactionError> {
        if self.stake_amount == 0 {
            return Err(TransactionError::StakeNoAmount);
        }

        if self.candidate_public_key.is_empty() {
            return Err(TransactionError::CandidateKeyMissing);
        }

        Ok(())
    }

    fn write(&self, writer: &mut Writer) {
        writer.varint(self.stake_amount);

        writer.key(&self.candidate_public_key);

        writer.key(&self.staker_public_view_key);

        writer.key(&self.staker_public_spend_key);
    }

    fn read_fields(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            stake_amount: reader.varint()?,
            candidate_public_key: PublicKey::read(reader)?,
            staker_public_view_key: PublicKey::read(reader)?,
            staker_public_spend_key: PublicKey::read(reader)?,
        })
    }
}

/// Data section of a RECALL_STAKE transaction: which stake comes back, and
/// the two signatures proving the staker's view and spend keys authorized
/// the recall.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct RecallStakeData {
    pub stake_amount: u64,
    pub candidate_public_key: PublicKey,
    pub staker_id: Hash,
    pub view_signature: Signature,
    pub spend_signature: Signature,
}

impl TransactionData for RecallStakeData {
    const TYPE: TransactionType = TransactionType::RecallStake;

    const PERMITTED_VERSIONS: &'static [u64] = &[1, 2];

    fn check_construction(&self) -> Result<(), TransactionError> {
        if self.stake_amount == 0 {
            return Err(TransactionError::StakeNoAmount);
        }

        if self.candidate_public_key.is_empty() {
            return Err(TransactionError::CandidateKeyMissing);
        }

        if self.staker_id.is_empty() {
            return Err(TransactionError::StakerIdMissing);
        }

        if self.view_signature.is_empty() {
            return Err(TransactionError::RecallViewSignature);
        }

        if self.spend_signature.is_empty() {
            return Err(TransactionError::RecallSpendSignature);
        }

        Ok(())
    }

    fn write(&self, writer: &mut Writer) {
        writer.varint(self.stake_amount);

        writer.key(&self.candidate_public_key);

        writer.key(&self.staker_id);

        writer.key(&self.view_signature);

        writer.key(&self.spend_signature);
    }

    fn read_fields(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            stake_amount: reader.varint()?,
            candidate_public_key: PublicKey::read(reader)?,
            staker_id: Hash::read(reader)?,
            view_signature: Signature::read(reader)?,
            spend_signature: Signature::read(reader)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
