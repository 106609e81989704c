//! # Transaction Validation
//!
//! Two layers of checks stand between a transaction and the chain:
//!
//! - the **construction check** (`check`) is stateless: structure,
//!   versions, counts, key-image subgroup membership, and the
//!   proof-of-work / fee admission rule;
//! - **full validation** (`validate`) runs against a storage snapshot:
//!   commitment parity, the range proof, the ring signatures over fetched
//!   ring members, the double-spend gate, and genesis integrity.
//!
//! The fee curve charges for bytes and refunds for work: every chunk past
//! the base size costs a chunk fee, and each proof-of-work zero beyond the
//! minimum halves the bill, never below the minimum fee.

use std::sync::Arc;

use tracing::trace;

use crate::config;
use crate::crypto::types::{Commitment, PublicKey};
use crate::crypto::{clsag, keys, range_proof};
use crate::staking::StakingEngine;
use crate::storage::{ChainStore, StorageError};
use crate::transaction::{Transaction, TransactionError, UncommittedTransaction};

/// The fee a transaction of `tx_size` bytes with `pow_zeros` leading
/// proof-of-work zeros must pay.
pub fn calculate_transaction_fee(tx_size: usize, pow_zeros: u32) -> u64 {
    use config::transaction::fees::*;

    let size = tx_size as u64;

    let chunks = if size > BASE_CHUNK_SIZE {
        (size - BASE_CHUNK_SIZE).div_ceil(CHUNK_SIZE)
    } else {
        0
    };

    let base = MINIMUM_FEE + chunks * CHUNK_FEE;

    let zeros = pow_zeros.min(MAXIMUM_POW_ZEROS);

    let discount = POW_ZERO_DISCOUNT_MULTIPLIER.pow(zeros.saturating_sub(MINIMUM_POW_ZEROS));

    (base / discount).max(MINIMUM_FEE)
}

fn check_pow_and_fee(
    pow_zeros: u32,
    tx_size: usize,
    fee: u64,
) -> Result<(), TransactionError> {
    if pow_zeros < config::transaction::fees::MINIMUM_POW_ZEROS {
        return Err(TransactionError::MinimumPow {
            required: config::transaction::fees::MINIMUM_POW_ZEROS,
            actual: pow_zeros,
        });
    }

    let required = calculate_transaction_fee(tx_size, pow_zeros);

    if fee < required {
        return Err(TransactionError::LowFee {
            required,
            actual: fee,
        });
    }

    Ok(())
}

fn storage_to_tx_error(error: StorageError) -> TransactionError {
    match error {
        StorageError::TransactionOutputNotFound | StorageError::NotFound => {
            TransactionError::OutputNotFound
        }
        other => TransactionError::Storage(other.to_string()),
    }
}

/// Validates transactions against the chain and staking state.
pub struct TransactionValidator {
    chain: Arc<ChainStore>,
    staking: Arc<StakingEngine>,
}

impl TransactionValidator {
    pub fn new(chain: Arc<ChainStore>, staking: Arc<StakingEngine>) -> Self {
        Self { chain, staking }
    }

    pub fn staking(&self) -> &Arc<StakingEngine> {
        &self.staking
    }

    // -- construction checks -------------------------------------------------

    /// Stateless checks for an in-flight transaction.
    pub fn check_uncommitted(&self, tx: &UncommittedTransaction) -> Result<(), TransactionError> {
        tx.check_construction()?;

        check_pow_and_fee(tx.pow_hash().leading_zeros(), tx.size(), tx.fee())
    }

    /// Stateless checks for a committed transaction. Genesis additionally
    /// re-derives every output against the configured launch wallet.
    pub fn check(&self, tx: &Transaction) -> Result<(), TransactionError> {
        tx.check_construction()?;

        match tx {
            Transaction::Normal(_) | Transaction::Stake(_) | Transaction::RecallStake(_) => {
                let pow_zeros = tx
                    .pow_hash()
                    .map(|hash| hash.leading_zeros())
                    .unwrap_or_default();

                let fee = tx.fee().unwrap_or_default();

                check_pow_and_fee(pow_zeros, tx.size(), fee)
            }
            Transaction::Genesis(genesis) => genesis.verify_outputs(),
            Transaction::StakerReward(_) | Transaction::StakeRefund(_) => Ok(()),
        }
    }

    // -- full validation -----------------------------------------------------

    /// Validates an in-flight transaction against the current snapshot:
    /// construction, commitment parity, range proof, ring signatures, and
    /// the double-spend gate.
    pub fn validate_uncommitted(
        &self,
        tx: &UncommittedTransaction,
    ) -> Result<(), TransactionError> {
        self.check_uncommitted(tx)?;

        let digest = tx.digest();

        let body = tx.body();

        let suffix = tx.suffix();

        let output_commitments: Vec<Commitment> =
            body.outputs.iter().map(|output| output.commitment).collect();

        if !keys::commitments_balance(&suffix.pseudo_commitments, &output_commitments, body.fee) {
            return Err(TransactionError::CommitmentsDoNotBalance);
        }

        if !range_proof::verify(&suffix.range_proof, &output_commitments) {
            return Err(TransactionError::InvalidRangeProof);
        }

        if self
            .chain
            .any_key_image_exists(&body.key_images)
            .map_err(storage_to_tx_error)?
        {
            return Err(TransactionError::KeyImageAlreadyExists);
        }

        if suffix.ring_participants.len() != config::transaction::RING_SIZE {
            return Err(TransactionError::RingParticipantCount {
                expected: config::transaction::RING_SIZE,
                actual: suffix.ring_participants.len(),
            });
        }

        // One shared ring backs every input; fetch it once.
        let ring = self
            .chain
            .get_transaction_outputs(&suffix.ring_participants)
            .map_err(storage_to_tx_error)?;

        let ring_keys: Vec<PublicKey> = ring
            .iter()
            .map(|(output, _)| output.public_ephemeral)
            .collect();

        let ring_commitments: Vec<Commitment> =
            ring.iter().map(|(output, _)| output.commitment).collect();

        for (index, signature) in suffix.signatures.iter().enumerate() {
            if !clsag::check_ring_signature(
                &digest,
                &body.key_images[index],
                &ring_keys,
                signature,
                &ring_commitments,
                &suffix.pseudo_commitments[index],
            ) {
                return Err(TransactionError::InvalidRingSignature(index));
            }
        }

        trace!(tx = %tx.hash(), "uncommitted transaction validated");

        Ok(())
    }

    /// Validates a committed transaction: construction plus the state
    /// checks that still apply once the proof material is pruned.
    pub fn validate(&self, tx: &Transaction) -> Result<(), TransactionError> {
        self.check(tx)?;

        match tx {
            Transaction::Normal(_) | Transaction::Stake(_) | Transaction::RecallStake(_) => {
                if self
                    .chain
                    .any_key_image_exists(tx.key_images())
                    .map_err(storage_to_tx_error)?
                {
                    return Err(TransactionError::KeyImageAlreadyExists);
                }

                Ok(())
            }
            Transaction::Genesis(_) => {
                // Exactly one genesis, ever.
                if self
                    .chain
                    .block_exists_at_index(0)
                    .map_err(storage_to_tx_error)?
                {
                    return Err(TransactionError::GenesisAlreadyExists);
                }

                Ok(())
            }
            Transaction::StakerReward(_) | Transaction::StakeRefund(_) => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::sha3;
    use crate::crypto::keys::generate_keypair;
    use crate::crypto::types::{Hash, KeyImage, SecretKey};
    use crate::storage::{Block, RewardTransaction};
    use crate::transaction::{
        CommittedNormalTransaction, GenesisTransaction, NormalData, TransactionBody,
        TransactionOutput, TransactionPrefix, UncommittedNormalTransaction,
    };

    fn temp_validator() -> (tempfile::TempDir, TransactionValidator, Arc<ChainStore>) {
        let dir = tempfile::tempdir().expect("tempdir");

        let chain = ChainStore::instance(dir.path().join("chain")).expect("chain store");

        let staking =
            StakingEngine::instance(dir.path().join("staking")).expect("staking engine");

        (dir, TransactionValidator::new(Arc::clone(&chain), staking), chain)
    }

    // -- the fee curve -------------------------------------------------------

    #[test]
    fn fee_for_small_transactions_is_the_minimum() {
        assert_eq!(calculate_transaction_fee(0, 1), 1);
        assert_eq!(calculate_transaction_fee(320, 1), 1);
    }

    #[test]
    fn fee_charges_per_chunk_past_the_base() {
        // 400 bytes = 80 past the base = 3 chunks of 32 -> 1 + 3.
        assert_eq!(calculate_transaction_fee(400, 0), 4);
        assert_eq!(calculate_transaction_fee(400, 1), 4);

        // One byte over the base still costs a whole chunk.
        assert_eq!(calculate_transaction_fee(321, 1), 2);
    }

    #[test]
    fn pow_zeros_discount_the_fee_down_to_the_minimum() {
        // 4 zeros discount by 2^(4-1) = 8: 4 / 8 = 0, clamped to 1.
        assert_eq!(calculate_transaction_fee(400, 4), 1);

        // 2 zeros discount by 2: 4 / 2 = 2.
        assert_eq!(calculate_transaction_fee(400, 2), 2);

        // The discount exponent is capped at the maximum zeros.
        assert_eq!(
            calculate_transaction_fee(400, 64),
            calculate_transaction_fee(400, config::transaction::fees::MAXIMUM_POW_ZEROS)
        );
    }

    #[test]
    fn fee_discount_worked_example_large_tx() {
        // 1000 bytes: ceil((1000 - 320) / 32) = 22 chunks -> 23 base.
        assert_eq!(calculate_transaction_fee(1_000, 1), 23);
        assert_eq!(calculate_transaction_fee(1_000, 3), 5); // 23 / 4
        assert_eq!(calculate_transaction_fee(1_000, 6), 1); // 23 / 32 clamped
    }

    // -- stateless checks ----------------------------------------------------

    fn sample_output(tag: u8) -> TransactionOutput {
        TransactionOutput {
            public_ephemeral: generate_keypair().0,
            amount: 1 + tag as u64,
            commitment: crate::crypto::types::Commitment::from([tag | 1; 32]),
        }
    }

    fn sample_uncommitted(fee: u64) -> UncommittedNormalTransaction {
        UncommittedNormalTransaction {
            prefix: TransactionPrefix {
                version: 1,
                unlock_block: 0,
                public_key: generate_keypair().0,
            },
            body: TransactionBody {
                nonce: 0,
                fee,
                key_images: vec![KeyImage::from(*generate_keypair().0.as_bytes())],
                outputs: vec![sample_output(1), sample_output(2)],
            },
            data: NormalData::default(),
            suffix: crate::transaction::components::UncommittedSuffix {
                pseudo_commitments: vec![crate::crypto::types::Commitment::from([7u8; 32])],
                ring_participants: vec![sha3(b"participant")],
                signatures: vec![Default::default()],
                range_proof: Default::default(),
            },
        }
    }

    #[test]
    fn unworked_transaction_fails_minimum_pow() {
        let (_dir, validator, _) = temp_validator();

        let mut inner = sample_uncommitted(u64::MAX);

        // Find a nonce whose hash has NO leading zeros, so the minimum
        // proof-of-work rule is what trips. Expected after ~2 attempts.
        for _ in 0..64 {
            if inner.pow_hash().leading_zeros() == 0 {
                break;
            }

            inner.body.nonce += 1;
        }

        assert!(matches!(
            validator.check_uncommitted(&UncommittedTransaction::Normal(inner)),
            Err(TransactionError::MinimumPow { .. })
        ));
    }

    /// Ignored by default: needs a nonce with exactly one leading zero,
    /// and each proof-of-work attempt is a full memory-hard hash.
    #[test]
    #[ignore]
    fn mined_transaction_with_token_fee_fails_low_fee() {
        let (_dir, validator, _) = temp_validator();

        let mut inner = sample_uncommitted(1);

        // Pad well past the base size so the required fee exceeds the
        // minimum even before discounting.
        inner.data.extra = vec![0u8; 200];

        // Exactly one zero: no discount beyond the baseline.
        while inner.pow_hash().leading_zeros() != 1 {
            inner.body.nonce += 1;
        }

        assert!(matches!(
            validator.check_uncommitted(&UncommittedTransaction::Normal(inner)),
            Err(TransactionError::LowFee { .. })
        ));
    }

    // -- committed validation ------------------------------------------------

    fn mined_committed_tx(fee: u64, key_images: Vec<KeyImage>) -> CommittedNormalTransaction {
        let mut tx = CommittedNormalTransaction {
            prefix: TransactionPrefix {
                version: 1,
                unlock_block: 0,
                public_key: generate_keypair().0,
            },
            body: TransactionBody {
                nonce: 0,
                fee,
                key_images,
                outputs: vec![sample_output(3), sample_output(4)],
            },
            data: NormalData::default(),
            suffix: Default::default(),
        };

        while tx.pow_hash().leading_zeros() < 1 {
            tx.body.nonce += 1;
        }

        tx
    }

    /// Ignored by default: both transactions must be mined, and each
    /// proof-of-work attempt is a full memory-hard hash.
    #[test]
    #[ignore]
    fn committed_double_spend_is_rejected() {
        let (_dir, validator, chain) = temp_validator();

        let image = KeyImage::from(*generate_keypair().0.as_bytes());

        let spend = Transaction::Normal(mined_committed_tx(10_000, vec![image]));

        let mut block = Block {
            version: 1,
            previous_blockhash: Hash::empty(),
            timestamp: 1_700_000_000,
            block_index: 1,
            reward_tx: RewardTransaction::StakerReward(
                crate::transaction::StakerRewardTransaction::new(
                    vec![crate::transaction::StakerOutput {
                        staker_id: sha3(b"staker"),
                        amount: 1,
                    }],
                    vec![],
                ),
            ),
            ..Default::default()
        };

        block.append_transaction_hash(spend.hash());

        chain.put_block(&block, &[spend.clone()]).unwrap();

        // A second transaction reusing the key image must bounce.
        let respend = Transaction::Normal(mined_committed_tx(10_000, vec![image]));

        assert_eq!(
            validator.validate(&respend),
            Err(TransactionError::KeyImageAlreadyExists)
        );
    }

    #[test]
    fn genesis_validates_once_and_only_once() {
        let (_dir, validator, chain) = temp_validator();

        let genesis = GenesisTransaction::construct().unwrap();

        let tx = Transaction::Genesis(genesis.clone());

        assert!(validator.validate(&tx).is_ok());

        let block = Block {
            version: 1,
            previous_blockhash: Hash::empty(),
            timestamp: config::transaction::genesis::TIMESTAMP,
            block_index: 0,
            reward_tx: RewardTransaction::Genesis(genesis),
            ..Default::default()
        };

        chain.put_block(&block, &[]).unwrap();

        assert_eq!(
            validator.validate(&tx),
            Err(TransactionError::GenesisAlreadyExists)
        );
    }

    // -- full ring validation ------------------------------------------------

    /// End-to-end: spend a genesis output through a real 512-member ring
    /// with a real range proof.
    ///
    /// Ignored by default: transaction proof-of-work is memory-hard and
    /// mining plus validation takes tens of seconds.
    #[test]
    #[ignore]
    fn uncommitted_spend_of_genesis_output_validates() {
        let (_dir, validator, chain) = temp_validator();

        // Block 0: the genesis mint.
        let genesis = GenesisTransaction::construct().unwrap();

        let block = Block {
            version: 1,
            previous_blockhash: Hash::empty(),
            timestamp: config::transaction::genesis::TIMESTAMP,
            block_index: 0,
            reward_tx: RewardTransaction::Genesis(genesis.clone()),
            ..Default::default()
        };

        chain.put_block(&block, &[]).unwrap();

        // The ring: the first RING_SIZE genesis outputs; we own index 5.
        let real_index = 5usize;

        let ring_outputs = &genesis.outputs[..config::transaction::RING_SIZE];

        let ring_participants: Vec<Hash> =
            ring_outputs.iter().map(TransactionOutput::hash).collect();

        // Re-derive the one-time secret and blinding for the real output.
        let spend_secret: SecretKey = config::transaction::genesis::WALLET_SPEND_SECRET
            .parse()
            .unwrap();

        let derivation = keys::generate_key_derivation(
            &config::GENESIS_WALLET_VIEW_KEY,
            &config::GENESIS_TX_PRIVATE_KEY,
        )
        .unwrap();

        let scalar = keys::derivation_to_scalar(&derivation, real_index as u64);

        let one_time_secret = keys::derive_secret_key(&scalar, &spend_secret);

        let real_blinding = keys::generate_commitment_blinding_factor(&scalar);

        // Outputs: the input amount minus a generous fee, in range.
        let input_amount = config::transaction::genesis::OUTPUT_AMOUNT;

        let fee = 2_000u64;

        let out_amounts = [60_000u64, input_amount - fee - 60_000];

        let out_blindings: Vec<SecretKey> =
            (0..2).map(|_| generate_keypair().1).collect();

        let (proof, out_commitments) =
            range_proof::prove(&out_amounts, &out_blindings).unwrap();

        let (pseudo_commitments, pseudo_blindings) =
            keys::generate_pseudo_commitments(&[input_amount], &out_blindings);

        let commitment_secret = SecretKey::from_scalar(
            &(real_blinding.to_scalar() - pseudo_blindings[0].to_scalar()),
        );

        let (tx_public, _) = generate_keypair();

        let mut tx = UncommittedNormalTransaction {
            prefix: TransactionPrefix {
                version: 1,
                unlock_block: 0,
                public_key: tx_public,
            },
            body: TransactionBody {
                nonce: 0,
                fee,
                key_images: vec![],
                outputs: out_amounts
                    .iter()
                    .zip(&out_commitments)
                    .map(|(amount, commitment)| TransactionOutput {
                        public_ephemeral: generate_keypair().0,
                        amount: *amount,
                        commitment: *commitment,
                    })
                    .collect(),
            },
            data: NormalData::default(),
            suffix: crate::transaction::components::UncommittedSuffix {
                pseudo_commitments,
                ring_participants,
                signatures: vec![],
                range_proof: proof,
            },
        };

        let ring_keys: Vec<_> = ring_outputs.iter().map(|o| o.public_ephemeral).collect();

        let ring_commitments: Vec<_> = ring_outputs.iter().map(|o| o.commitment).collect();

        // The key image is part of the signed digest, so it goes into the
        // body before mining and signing.
        let key_image = clsag::generate_key_image(&ring_keys[real_index], &one_time_secret);

        tx.body.key_images = vec![key_image];

        assert!(tx.mine(config::transaction::fees::MINIMUM_POW_ZEROS));

        let digest = tx.digest();

        let (signature, signed_image) = clsag::generate_ring_signature(
            &digest,
            &ring_keys,
            &ring_commitments,
            &tx.suffix.pseudo_commitments[0],
            real_index,
            &one_time_secret,
            &commitment_secret,
        )
        .unwrap();

        assert_eq!(signed_image, key_image);

        tx.suffix.signatures = vec![signature];

        let tx = UncommittedTransaction::Normal(tx);

        assert!(validator.validate_uncommitted(&tx).is_ok());
    }
}
