//! The two forms of a user transaction.
//!
//! A user transaction (NORMAL, STAKE or RECALL_STAKE) exists first in its
//! **uncommitted** form, carrying full ring signatures and a range proof,
//! and then — once a block commits it — in its **committed** form, where
//! the proof material is replaced by two hashes. The projection is
//! hash-stable: both forms share the digest over prefix ‖ body ‖ data, and
//! the transaction hash is the digest rehashed with the signature hash and
//! the range-proof hash, so pruning never changes a transaction's identity.

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::crypto::hash::{argon2id, sha3, sha3_multi};
use crate::crypto::types::Hash;
use crate::transaction::components::{
    read_type_tag, user_transaction_hash, CommittedSuffix, TransactionBody, TransactionData,
    TransactionPrefix, UncommittedSuffix,
};
use crate::transaction::TransactionError;

/// A committed user transaction: prefix, body, its type-specific data, and
/// the pruned suffix hashes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommittedUserTransaction<D: TransactionData> {
    pub prefix: TransactionPrefix,
    pub body: TransactionBody,
    pub data: D,
    pub suffix: CommittedSuffix,
}

/// An uncommitted user transaction: same digest fields, full proof
/// material.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UncommittedUserTransaction<D: TransactionData> {
    pub prefix: TransactionPrefix,
    pub body: TransactionBody,
    pub data: D,
    pub suffix: UncommittedSuffix,
}

fn write_digest_fields<D: TransactionData>(
    prefix: &TransactionPrefix,
    body: &TransactionBody,
    data: &D,
    writer: &mut Writer,
) {
    prefix.write(D::TYPE, writer);

    body.write(writer);

    data.write(writer);
}

fn digest_of<D: TransactionData>(
    prefix: &TransactionPrefix,
    body: &TransactionBody,
    data: &D,
) -> Hash {
    let mut writer = Writer::new();

    write_digest_fields(prefix, body, data, &mut writer);

    sha3(writer.data())
}

fn check_shared_construction<D: TransactionData>(
    prefix: &TransactionPrefix,
    body: &TransactionBody,
    data: &D,
) -> Result<(), TransactionError> {
    if !D::PERMITTED_VERSIONS.contains(&prefix.version) {
        return Err(TransactionError::InvalidVersion(prefix.version));
    }

    if prefix.public_key.is_empty() {
        return Err(TransactionError::PublicKeyMissing);
    }

    body.check_construction()?;

    data.check_construction()
}

/// The proof-of-work input shared by both forms: Argon2id over the digest
/// rehashed with the range-proof hash.
fn pow_hash_of(digest: &Hash, range_proof_hash: &Hash) -> Hash {
    argon2id(&sha3_multi(&[digest.as_ref(), range_proof_hash.as_ref()]))
}

impl<D: TransactionData> CommittedUserTransaction<D> {
    /// The digest over prefix ‖ body ‖ data, shared with the uncommitted
    /// form.
    pub fn digest(&self) -> Hash {
        digest_of(&self.prefix, &self.body, &self.data)
    }

    /// The consensus identity of the transaction.
    pub fn hash(&self) -> Hash {
        user_transaction_hash(
            &self.digest(),
            &self.suffix.signature_hash,
            &self.suffix.range_proof_hash,
        )
    }

    pub fn pow_hash(&self) -> Hash {
        pow_hash_of(&self.digest(), &self.suffix.range_proof_hash)
    }

    pub fn check_construction(&self) -> Result<(), TransactionError> {
        check_shared_construction(&self.prefix, &self.body, &self.data)
    }

    pub fn size(&self) -> usize {
        self.wire_size()
    }
}

impl<D: TransactionData> Serializable for CommittedUserTransaction<D> {
    fn write(&self, writer: &mut Writer) {
        write_digest_fields(&self.prefix, &self.body, &self.data, writer);

        self.suffix.write(writer);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        read_type_tag(reader, D::TYPE)?;

        Ok(Self {
            prefix: TransactionPrefix::read_fields(reader)?,
            body: TransactionBody::read_fields(reader)?,
            data: D::read_fields(reader)?,
            suffix: CommittedSuffix::read_fields(reader)?,
        })
    }
}

impl<D: TransactionData> UncommittedUserTransaction<D> {
    pub fn digest(&self) -> Hash {
        digest_of(&self.prefix, &self.body, &self.data)
    }

    /// The consensus identity. Computed through the same projection the
    /// committed form stores, so committing never changes the hash.
    pub fn hash(&self) -> Hash {
        user_transaction_hash(
            &self.digest(),
            &self.suffix.signature_hash(),
            &self.suffix.range_proof_hash(),
        )
    }

    pub fn pow_hash(&self) -> Hash {
        pow_hash_of(&self.digest(), &self.suffix.range_proof_hash())
    }

    /// Mines the transaction nonce until the proof-of-work hash clears the
    /// requested number of leading zero bits. Returns `false` only if the
    /// entire nonce space is exhausted first.
    pub fn mine(&mut self, zeros: u32) -> bool {
        if self.pow_hash().leading_zeros() >= zeros {
            return true;
        }

        self.body.nonce = 0;

        loop {
            if self.pow_hash().leading_zeros() >= zeros {
                return true;
            }

            if self.body.nonce == u64::MAX {
                return false;
            }

            self.body.nonce += 1;
        }
    }

    pub fn pow_verify(&self, zeros: u32) -> bool {
        self.pow_hash().leading_zeros() >= zeros
    }

    pub fn check_construction(&self) -> Result<(), TransactionError> {
        check_shared_construction(&self.prefix, &self.body, &self.data)?;

        if self.suffix.pseudo_commitments.len() != self.body.key_images.len() {
            return Err(TransactionError::InvalidPseudoCommitmentCount {
                pseudo_commitments: self.suffix.pseudo_commitments.len(),
                key_images: self.body.key_images.len(),
            });
        }

        if self.suffix.signatures.len() != self.body.key_images.len() {
            return Err(TransactionError::SignatureSizeMismatch {
                signatures: self.suffix.signatures.len(),
                key_images: self.body.key_images.len(),
            });
        }

        Ok(())
    }

    /// Projects this transaction into its committed form. The identity is
    /// preserved; the proof material is not.
    pub fn to_committed(&self) -> CommittedUserTransaction<D> {
        CommittedUserTransaction {
            prefix: self.prefix.clone(),
            body: self.body.clone(),
            data: self.data.clone(),
            suffix: self.suffix.to_committed(),
        }
    }

    pub fn size(&self) -> usize {
        self.wire_size()
    }
}

impl<D: TransactionData> Serializable for UncommittedUserTransaction<D> {
    fn write(&self, writer: &mut Writer) {
        write_digest_fields(&self.prefix, &self.body, &self.data, writer);

        self.suffix.write(writer);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        read_type_tag(reader, D::TYPE)?;

        Ok(Self {
            prefix: TransactionPrefix::read_fields(reader)?,
            body: TransactionBody::read_fields(reader)?,
            data: D::read_fields(reader)?,
            suffix: UncommittedSuffix::read_fields(reader)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::generate_keypair;
    use crate::crypto::types::{Commitment, KeyImage, PublicKey};
    use crate::transaction::components::{NormalData, StakeData, TransactionOutput};

    fn sample_output(tag: u8) -> TransactionOutput {
        TransactionOutput {
            public_ephemeral: generate_keypair().0,
            amount: 1_000 + tag as u64,
            commitment: Commitment::from([tag; 32]),
        }
    }

    fn sample_uncommitted() -> UncommittedUserTransaction<NormalData> {
        UncommittedUserTransaction {
            prefix: TransactionPrefix {
                version: 1,
                unlock_block: 10,
                public_key: generate_keypair().0,
            },
            body: TransactionBody {
                nonce: 7,
                fee: 4,
                key_images: vec![KeyImage::from(*generate_keypair().0.as_bytes())],
                outputs: vec![sample_output(1), sample_output(2)],
            },
            data: NormalData {
                extra: b"memo".to_vec(),
            },
            suffix: UncommittedSuffix {
                pseudo_commitments: vec![Commitment::from([5u8; 32])],
                ring_participants: vec![crate::crypto::hash::sha3(b"ring member")],
                signatures: vec![Default::default()],
                range_proof: Default::default(),
            },
        }
    }

    #[test]
    fn committed_and_uncommitted_share_a_hash() {
        let uncommitted = sample_uncommitted();
        let committed = uncommitted.to_committed();

        assert_eq!(uncommitted.digest(), committed.digest());
        assert_eq!(uncommitted.hash(), committed.hash());
        assert_eq!(uncommitted.pow_hash(), committed.pow_hash());
    }

    #[test]
    fn serialize_parse_round_trips() {
        let uncommitted = sample_uncommitted();
        let decoded =
            UncommittedUserTransaction::<NormalData>::from_bytes(&uncommitted.to_bytes()).unwrap();
        assert_eq!(decoded, uncommitted);
        assert_eq!(decoded.hash(), uncommitted.hash());

        let committed = uncommitted.to_committed();
        let decoded =
            CommittedUserTransaction::<NormalData>::from_bytes(&committed.to_bytes()).unwrap();
        assert_eq!(decoded, committed);
        assert_eq!(decoded.hash(), committed.hash());
    }

    #[test]
    fn decode_rejects_wrong_type_tag() {
        let stake = UncommittedUserTransaction::<StakeData> {
            prefix: TransactionPrefix {
                version: 1,
                unlock_block: 0,
                public_key: generate_keypair().0,
            },
            ..Default::default()
        };

        let result = UncommittedUserTransaction::<NormalData>::from_bytes(&stake.to_bytes());

        assert!(matches!(result, Err(CodecError::UnknownTag(_))));
    }

    #[test]
    fn construction_check_accepts_the_sample() {
        assert!(sample_uncommitted().check_construction().is_ok());
    }

    #[test]
    fn construction_check_rejects_bad_version() {
        let mut tx = sample_uncommitted();
        tx.prefix.version = 9;

        assert_eq!(
            tx.check_construction(),
            Err(TransactionError::InvalidVersion(9))
        );
    }

    #[test]
    fn construction_check_rejects_empty_public_key() {
        let mut tx = sample_uncommitted();
        tx.prefix.public_key = PublicKey::empty();

        assert_eq!(
            tx.check_construction(),
            Err(TransactionError::PublicKeyMissing)
        );
    }

    #[test]
    fn construction_check_counts_proof_material() {
        let mut tx = sample_uncommitted();
        tx.suffix.pseudo_commitments.clear();
        assert!(matches!(
            tx.check_construction(),
            Err(TransactionError::InvalidPseudoCommitmentCount { .. })
        ));

        let mut tx = sample_uncommitted();
        tx.suffix.signatures.clear();
        assert!(matches!(
            tx.check_construction(),
            Err(TransactionError::SignatureSizeMismatch { .. })
        ));
    }

    #[test]
    fn mutating_the_body_changes_the_digest() {
        let tx = sample_uncommitted();
        let mut other = tx.clone();
        other.body.fee += 1;

        assert_ne!(tx.digest(), other.digest());
        assert_ne!(tx.hash(), other.hash());
    }

    #[test]
    fn mine_accepts_trivial_target() {
        let mut tx = sample_uncommitted();

        assert!(tx.mine(0));
    }
}
