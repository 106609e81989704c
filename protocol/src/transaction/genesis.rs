//! The genesis transaction: the one-time mint that seeds the chain.
//!
//! Genesis splits the initial supply across `2 * RING_SIZE` equal outputs
//! so that real rings can be formed from block one onward. Unusually, the
//! transaction publishes its own secret key — the outputs belong to the
//! configured launch wallet and every node re-derives and re-checks each
//! output against the configuration before accepting a chain.

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::config;
use crate::crypto::hash::sha3;
use crate::crypto::types::{Hash, PublicKey, SecretKey};
use crate::crypto::{address, keys, CryptoError};
use crate::transaction::components::{read_type_tag, TransactionOutput, TransactionPrefix};
use crate::transaction::{TransactionError, TransactionType};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenesisTransaction {
    pub prefix: TransactionPrefix,
    pub secret_key: SecretKey,
    pub outputs: Vec<TransactionOutput>,
}

impl GenesisTransaction {
    /// Constructs the canonical genesis transaction from the configured
    /// genesis key and destination wallet.
    pub fn construct() -> Result<Self, CryptoError> {
        let secret_key = *config::GENESIS_TX_PRIVATE_KEY;

        let public_key = keys::secret_key_to_public_key(&secret_key);

        let (spend, view) = (*config::GENESIS_WALLET_SPEND_KEY, *config::GENESIS_WALLET_VIEW_KEY);

        let derivation = keys::generate_key_derivation(&view, &secret_key)?;

        let count = config::transaction::RING_SIZE * 2;

        let mut outputs = Vec::with_capacity(count);

        for index in 0..count {
            let scalar = keys::derivation_to_scalar(&derivation, index as u64);

            let blinding_factor = keys::generate_commitment_blinding_factor(&scalar);

            let amount_mask = keys::generate_amount_mask(&scalar);

            outputs.push(TransactionOutput {
                public_ephemeral: keys::derive_public_key(&scalar, &spend)?,
                amount: keys::toggle_masked_amount(
                    amount_mask,
                    config::transaction::genesis::OUTPUT_AMOUNT,
                ),
                commitment: keys::generate_pedersen_commitment(
                    &blinding_factor,
                    config::transaction::genesis::OUTPUT_AMOUNT,
                ),
            });
        }

        Ok(Self {
            prefix: TransactionPrefix {
                version: 1,
                unlock_block: 0,
                public_key,
            },
            secret_key,
            outputs,
        })
    }

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

        if self.outputs.len() != config::transaction::RING_SIZE * 2 {
            return Err(TransactionError::InvalidOutputCount(self.outputs.len()));
        }

        for output in &self.outputs {
            output.check_construction()?;
        }

        Ok(())
    }

    /// Re-derives every output against the configured destination wallet:
    /// the one-time key, the unmasked amount, and the commitment must all
    /// match what the configuration says they should be.
    pub fn verify_outputs(&self) -> Result<(), TransactionError> {
        if self.secret_key != *config::GENESIS_TX_PRIVATE_KEY {
            return Err(TransactionError::SecretKeyMissing);
        }

        let (spend, view) = address::decode(&config::GENESIS_DESTINATION_WALLET)
            .map_err(|e| TransactionError::Address(e.to_string()))?;

        let derivation = keys::generate_key_derivation(&view, &self.secret_key)
            .map_err(|e| TransactionError::Crypto(e.to_string()))?;

        for (index, output) in self.outputs.iter().enumerate() {
            let scalar = keys::derivation_to_scalar(&derivation, index as u64);

            let blinding_factor = keys::generate_commitment_blinding_factor(&scalar);

            let amount_mask = keys::generate_amount_mask(&scalar);

            let expected_ephemeral = keys::derive_public_key(&scalar, &spend)
                .map_err(|e| TransactionError::Crypto(e.to_string()))?;

            if expected_ephemeral != output.public_ephemeral {
                return Err(TransactionError::OutputPublicEphemeral);
            }

            if keys::toggle_masked_amount(amount_mask, output.amount)
                != config::transaction::genesis::OUTPUT_AMOUNT
            {
                return Err(TransactionError::OutputAmount);
            }

            if keys::generate_pedersen_commitment(
                &blinding_factor,
                config::transaction::genesis::OUTPUT_AMOUNT,
            ) != output.commitment
            {
                return Err(TransactionError::OutputCommitment);
            }
        }

        Ok(())
    }

    pub fn size(&self) -> usize {
        self.wire_size()
    }

    pub fn public_key(&self) -> PublicKey {
        self.prefix.public_key
    }
}

impl Serializable for GenesisTransaction {
    fn write(&self, writer: &mut Writer) {
        self.prefix.write(TransactionType::Genesis, writer);

        writer.key(&self.secret_key);

        writer.varint(self.outputs.len() as u64);

        for output in &self.outputs {
            output.write(writer);
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        read_type_tag(reader, TransactionType::Genesis)?;

        let prefix = TransactionPrefix::read_fields(reader)?;

        let secret_key = SecretKey::read(reader)?;

        let count = reader.varint()? as usize;

        let mut outputs = Vec::with_capacity(count.min(config::transaction::RING_SIZE * 2));

        for _ in 0..count {
            outputs.push(TransactionOutput::read(reader)?);
        }

        Ok(Self {
            prefix,
            secret_key,
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

    #[test]
    fn constructed_genesis_passes_all_checks() {
        let genesis = GenesisTransaction::construct().unwrap();

        assert_eq!(genesis.outputs.len(), config::transaction::RING_SIZE * 2);
        assert!(genesis.check_construction().is_ok());
        assert!(genesis.verify_outputs().is_ok());
    }

    #[test]
    fn genesis_round_trips_with_stable_hash() {
        let genesis = GenesisTransaction::construct().unwrap();

        let decoded = GenesisTransaction::from_bytes(&genesis.to_bytes()).unwrap();

        assert_eq!(decoded, genesis);
        assert_eq!(decoded.hash(), genesis.hash());
    }

    #[test]
    fn tampered_output_fails_verification() {
        let mut genesis = GenesisTransaction::construct().unwrap();

        genesis.outputs[17].amount ^= 1;

        assert_eq!(
            genesis.verify_outputs(),
            Err(TransactionError::OutputAmount)
        );
    }

    #[test]
    fn swapped_outputs_fail_verification() {
        // Output derivations are index-bound, so reordering is detected.
        let mut genesis = GenesisTransaction::construct().unwrap();

        genesis.outputs.swap(0, 1);

        assert_eq!(
            genesis.verify_outputs(),
            Err(TransactionError::OutputPublicEphemeral)
        );
    }

    #[test]
    fn keypair_mismatch_is_rejected() {
        let mut genesis = GenesisTransaction::construct().unwrap();

        genesis.prefix.public_key = crate::crypto::keys::generate_keypair().0;

        assert_eq!(
            genesis.check_construction(),
            Err(TransactionError::KeypairMismatch)
        );
    }
}
