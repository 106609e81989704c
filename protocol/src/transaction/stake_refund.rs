//! The stake refund transaction: the return leg of a recall. It pays the
//! recalled amount back to the staker in exactly one output and names the
//! recall transaction it settles, which is how the staking engine pairs
//! the two.

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::crypto::hash::sha3;
use crate::crypto::keys;
use crate::crypto::types::{Hash, SecretKey};
use crate::transaction::components::{read_type_tag, TransactionOutput, TransactionPrefix};
use crate::transaction::{TransactionError, TransactionType};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StakeRefundTransaction {
    pub prefix: TransactionPrefix,
    pub secret_key: SecretKey,
    pub recall_stake_tx: Hash,
    pub outputs: Vec<TransactionOutput>,
}

impl StakeRefundTransaction {
    pub fn hash(&self) -> Hash {
        sha3(&self.to_bytes())
    }

    pub fn check_construction(&self) -> Result<(), TransactionError> {
        if self.prefix.version != 1 {
            return Err(TransactionError::InvalidVersion(self.prefix.version));
        }

        if self.prefix.public_key.is_empty() {
            return Err(TransactionError::PublicKeyMissing);
        }

        if self.secret_key.is_empty() {
            return Err(TransactionError::SecretKeyMissing);
        }

        if keys::secret_key_to_public_key(&self.secret_key) != self.prefix.public_key {
            return Err(TransactionError::KeypairMismatch);
        }

        if self.recall_stake_tx.is_empty() {
            return Err(TransactionError::RecallStakeTxHash);
        }

        if self.outputs.len() != 1 {
            return Err(TransactionError::InvalidOutputCount(self.outputs.len()));
        }

        for output in &self.outputs {
            output.check_construction()?;
        }

        Ok(())
    }

    pub fn size(&self) -> usize {
        self.wire_size()
    }
}

impl Serializable for StakeRefundTransaction {
    fn write(&self, writer: &mut Writer) {
        self.prefix.write(TransactionType::StakeRefund, writer);

        writer.key(&self.secret_key);

        writer.key(&self.recall_stake_tx);

        writer.varint(self.outputs.len() as u64);

        for output in &self.outputs {
            output.write(writer);
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        read_type_tag(reader, TransactionType::StakeRefund)?;

        let prefix = TransactionPrefix::read_fields(reader)?;

        let secret_key = SecretKey::read(reader)?;

        let recall_stake_tx = Hash::read(reader)?;

        let count = reader.varint()? as usize;

        let mut outputs = Vec::new();

        for _ in 0..count {
            outputs.push(TransactionOutput::read(reader)?);
        }

        Ok(Self {
            prefix,
            secret_key,
            recall_stake_tx,
            outputs,
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
    use crate::crypto::types::Commitment;

    fn sample() -> StakeRefundTransaction {
        let (public_key, secret_key) = generate_keypair();

        StakeRefundTransaction {
            prefix: TransactionPrefix {
                version: 1,
                unlock_block: 50,
                public_key,
            },
            secret_key,
            recall_stake_tx: sha3(b"the recall"),
            outputs: vec![TransactionOutput {
                public_ephemeral: generate_keypair().0,
                amount: 321,
                commitment: Commitment::from([3u8; 32]),
            }],
        }
    }

    #[test]
    fn round_trip_preserves_hash() {
        let tx = sample();

        let decoded = StakeRefundTransaction::from_bytes(&tx.to_bytes()).unwrap();

        assert_eq!(decoded, tx);
        assert_eq!(decoded.hash(), tx.hash());
    }

    #[test]
    fn construction_accepts_the_sample() {
        assert!(sample().check_construction().is_ok());
    }

    #[test]
    fn construction_requires_exactly_one_output() {
        let mut tx = sample();
        tx.outputs.push(tx.outputs[0]);

        assert_eq!(
            tx.check_construction(),
            Err(TransactionError::InvalidOutputCount(2))
        );
    }

    #[test]
    fn construction_requires_recall_reference() {
        let mut tx = sample();
        tx.recall_stake_tx = Hash::empty();

        assert_eq!(
            tx.check_construction(),
            Err(TransactionError::RecallStakeTxHash)
        );
    }

    #[test]
    fn construction_requires_matching_keypair() {
        let mut tx = sample();
        tx.secret_key = generate_keypair().1;

        assert_eq!(
            tx.check_construction(),
            Err(TransactionError::KeypairMismatch)
        );
    }
}
