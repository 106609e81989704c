//! The staker reward transaction: the per-block ledger entry crediting the
//! stakers behind the round's electors and debiting any that misbehaved.
//! It carries no spendable outputs — the amounts land directly in the
//! staking registry.

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::crypto::hash::sha3;
use crate::crypto::types::Hash;
use crate::transaction::components::StakerOutput;
use crate::transaction::{TransactionError, TransactionType};

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct StakerRewardTransaction {
    pub version: u64,
    pub staker_outputs: Vec<StakerOutput>,
    pub staker_penalties: Vec<StakerOutput>,
}

impl StakerRewardTransaction {
    pub fn new(staker_outputs: Vec<StakerOutput>, staker_penalties: Vec<StakerOutput>) -> Self {
        Self {
            version: 1,
            staker_outputs,
            staker_penalties,
        }
    }

    pub fn hash(&self) -> Hash {
        sha3(&self.to_bytes())
    }

    pub fn check_construction(&self) -> Result<(), TransactionError> {
        if self.version != 1 {
            return Err(TransactionError::InvalidVersion(self.version));
        }

        if self.staker_outputs.is_empty() {
            return Err(TransactionError::StakerRewardAmount);
        }

        for entry in self.staker_outputs.iter().chain(&self.staker_penalties) {
            entry.check_construction()?;
        }

        Ok(())
    }

    pub fn size(&self) -> usize {
        self.wire_size()
    }
}

impl Serializable for StakerRewardTransaction {
    fn write(&self, writer: &mut Writer) {
        writer.varint(TransactionType::StakerReward.tag());

        writer.varint(self.version);

        writer.varint(self.staker_outputs.len() as u64);

        for output in &self.staker_outputs {
            output.write(writer);
        }

        writer.varint(self.staker_penalties.len() as u64);

        for penalty in &self.staker_penalties {
            penalty.write(writer);
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        super::components::read_type_tag(reader, TransactionType::StakerReward)?;

        let version = reader.varint()?;

        let output_count = reader.varint()? as usize;

        let mut staker_outputs = Vec::new();

        for _ in 0..output_count {
            staker_outputs.push(StakerOutput::read(reader)?);
        }

        let penalty_count = reader.varint()? as usize;

        let mut staker_penalties = Vec::new();

        for _ in 0..penalty_count {
            staker_penalties.push(StakerOutput::read(reader)?);
        }

        Ok(Self {
            version,
            staker_outputs,
            staker_penalties,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
