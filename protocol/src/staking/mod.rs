//! Staking: the candidate/staker/stake registry and the deterministic
//! producer/validator election.

pub mod engine;
pub mod records;

pub use engine::{StakingEngine, StakingError};
pub use records::{staker_id, Candidate, Stake, Staker};
