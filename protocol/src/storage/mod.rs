//! Persistent storage: the transactional key-value engine, the block
//! type, and the chain store built on top of them.

pub mod block;
pub mod chain;
pub mod engine;

pub use block::{Block, BlockError, DigestMode, RewardTransaction};
pub use chain::ChainStore;
pub use engine::{Database, Environment, StorageError};
