//! The staking registry's persistent records: candidates, stakers, and
//! the individual stakes backing them. Every record carries a schema
//! version so the registry can migrate without a chain rewrite.

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::config;
use crate::crypto::hash::sha3_keys;
use crate::crypto::types::{Hash, PublicKey};

/// A node that has deposited the candidacy amount and may be elected.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Candidate {
    pub record_version: u64,
    pub candidate_public_key: PublicKey,
    pub staker_public_view_key: PublicKey,
    pub staker_public_spend_key: PublicKey,
    pub total_stake: u64,
}

impl Candidate {
    pub fn new(
        candidate_public_key: PublicKey,
        staker_public_view_key: PublicKey,
        staker_public_spend_key: PublicKey,
        total_stake: u64,
    ) -> Self {
        Self {
            record_version: config::staking::CANDIDATE_RECORD_VERSION,
            candidate_public_key,
            staker_public_view_key,
            staker_public_spend_key,
            total_stake,
        }
    }
}

impl Serializable for Candidate {
    fn write(&self, writer: &mut Writer) {
        writer.varint(self.record_version);

        writer.key(&self.candidate_public_key);

        writer.key(&self.staker_public_view_key);

        writer.key(&self.staker_public_spend_key);

        writer.varint(self.total_stake);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            record_version: reader.varint()?,
            candidate_public_key: PublicKey::read(reader)?,
            staker_public_view_key: PublicKey::read(reader)?,
            staker_public_spend_key: PublicKey::read(reader)?,
            total_stake: reader.varint()?,
        })
    }
}

/// Somebody who has placed at least one stake. Identified by the hash of
/// their view and spend keys; `balance` accumulates staker rewards and
/// absorbs penalties.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Staker {
    pub record_version: u64,
    pub public_view_key: PublicKey,
    pub public_spend_key: PublicKey,
    pub balance: u64,
}

impl Staker {
    pub fn new(public_view_key: PublicKey, public_spend_key: PublicKey) -> Self {
        Self {
            record_version: config::staking::STAKER_RECORD_VERSION,
            public_view_key,
            public_spend_key,
            balance: 0,
        }
    }

    /// The staker's identity: `sha3(view_key ‖ spend_key)`.
    pub fn id(&self) -> Hash {
        staker_id(&self.public_view_key, &self.public_spend_key)
    }
}

impl Serializable for Staker {
    fn write(&self, writer: &mut Writer) {
        writer.varint(self.record_version);

        writer.key(&self.public_view_key);

        writer.key(&self.public_spend_key);

        writer.varint(self.balance);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            record_version: reader.varint()?,
            public_view_key: PublicKey::read(reader)?,
            public_spend_key: PublicKey::read(reader)?,
            balance: reader.varint()?,
        })
    }
}

/// One vote: a staker backing a candidate with an amount.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Stake {
    pub record_version: u64,
    pub candidate_public_key: PublicKey,
    pub public_view_key: PublicKey,
    pub public_spend_key: PublicKey,
    pub stake: u64,
}

impl Stake {
    pub fn new(
        candidate_public_key: PublicKey,
        public_view_key: PublicKey,
        public_spend_key: PublicKey,
        stake: u64,
    ) -> Self {
        Self {
            record_version: config::staking::STAKE_RECORD_VERSION,
            candidate_public_key,
            public_view_key,
            public_spend_key,
            stake,
        }
    }

    /// The identity of the staker who placed this stake.
    pub fn id(&self) -> Hash {
        staker_id(&self.public_view_key, &self.public_spend_key)
    }
}

impl Serializable for Stake {
    fn write(&self, writer: &mut Writer) {
        writer.varint(self.record_version);

        writer.key(&self.candidate_public_key);

        writer.key(&self.public_view_key);

        writer.key(&self.public_spend_key);

        writer.varint(self.stake);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            record_version: reader.varint()?,
            candidate_public_key: PublicKey::read(reader)?,
            public_view_key: PublicKey::read(reader)?,
            public_spend_key: PublicKey::read(reader)?,
            stake: reader.varint()?,
        })
    }
}

/// `sha3(view_key ‖ spend_key)`: how stakers are addressed everywhere.
pub fn staker_id(public_view_key: &PublicKey, public_spend_key: &PublicKey) -> Hash {
    sha3_keys(&[*public_view_key, *public_spend_key])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::generate_keypair;

    #[test]
    fn candidate_round_trip() {
        let candidate = Candidate::new(
            generate_keypair().0,
            generate_keypair().0,
            generate_keypair().0,
            100_000,
        );

        assert_eq!(
            Candidate::from_bytes(&candidate.to_bytes()).unwrap(),
            candidate
        );
    }

    #[test]
    fn stake_round_trip_and_id() {
        let stake = Stake::new(
            generate_keypair().0,
            generate_keypair().0,
            generate_keypair().0,
            500,
        );

        let decoded = Stake::from_bytes(&stake.to_bytes()).unwrap();

        assert_eq!(decoded, stake);
        assert_eq!(decoded.id(), stake.id());
    }

    #[test]
    fn staker_id_matches_stake_id_for_same_keys() {
        let view = generate_keypair().0;
        let spend = generate_keypair().0;

        let staker = Staker::new(view, spend);
        let stake = Stake::new(generate_keypair().0, view, spend, 100);

        assert_eq!(staker.id(), stake.id());
        assert_eq!(staker.id(), staker_id(&view, &spend));
    }

    #[test]
    fn staker_id_depends_on_key_order() {
        let a = generate_keypair().0;
        let b = generate_keypair().0;

        assert_ne!(staker_id(&a, &b), staker_id(&b, &a));
    }
}
