//! Cryptographic wrappers: typed containers, hashing, one-time keys,
//! ring signatures, range proofs and wallet addresses.
//!
//! Nothing outside this module touches a curve point or a digest state
//! directly. Consensus code works with the typed 32/64-byte containers and
//! the operations exported here.

pub mod address;
pub mod clsag;
pub mod hash;
pub mod keys;
pub mod range_proof;
pub mod types;

use thiserror::Error;

use types::PublicKey;

/// Failures from the cryptographic layer. Verification routines return
/// plain booleans; these errors cover construction-time problems only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("not a canonical group element: {0}")]
    InvalidPoint(PublicKey),

    #[error("ring shape mismatch: {keys} keys against {commitments} commitments")]
    RingSize { keys: usize, commitments: usize },

    #[error("real index {0} outside the ring")]
    RingIndex(usize),

    #[error("range proof failure: {0}")]
    RangeProof(String),
}
