//! # Range Proofs
//!
//! Aggregated 64-bit range proofs over the Pedersen commitments of a
//! transaction's outputs. The proof convinces a verifier that every
//! committed amount is a non-negative 64-bit integer — without it, a
//! negative output would let a sender mint coins while the commitment
//! parity check still balanced.
//!
//! The aggregated prover requires the number of committed values to be a
//! power of two. Transactions carry between one and eight outputs, so both
//! sides pad the commitment vector to the next power of two with identity
//! commitments (commitments to zero under a zero blinding factor). The
//! padding is deterministic and never serialized.

use bulletproofs::{BulletproofGens, PedersenGens};
use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use merlin::Transcript;
use once_cell::sync::Lazy;

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::config;
use crate::crypto::hash::sha3;
use crate::crypto::types::{Commitment, Hash, SecretKey};
use crate::crypto::CryptoError;

const TRANSCRIPT_LABEL: &[u8] = b"obscura.range.proof";

/// Every committed amount must fit this many bits.
const RANGE_BITS: usize = 64;

static BP_GENS: Lazy<BulletproofGens> = Lazy::new(|| {
    // Party capacity is the output ceiling; it is already a power of two.
    BulletproofGens::new(RANGE_BITS, config::transaction::MAXIMUM_OUTPUTS)
});

static PC_GENS: Lazy<PedersenGens> = Lazy::new(PedersenGens::default);

/// An aggregated range proof over a transaction's output commitments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangeProof {
    bytes: Vec<u8>,
}

impl RangeProof {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The content hash of the proof. This is the `range_proof_hash` that
    /// survives pruning and feeds the transaction hash and the
    /// proof-of-work input.
    pub fn hash(&self) -> Hash {
        sha3(&self.bytes)
    }
}

impl Serializable for RangeProof {
    fn write(&self, writer: &mut Writer) {
        writer.blob(&self.bytes);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            bytes: reader.blob()?,
        })
    }
}

fn padded_length(count: usize) -> usize {
    count.next_power_of_two().max(1)
}

/// Proves that every amount is in range, committing to each under the
/// matching blinding factor. Returns the proof together with the output
/// commitments it attests to (without the padding entries).
pub fn prove(
    amounts: &[u64],
    blinding_factors: &[SecretKey],
) -> Result<(RangeProof, Vec<Commitment>), CryptoError> {
    if amounts.len() != blinding_factors.len() || amounts.is_empty() {
        return Err(CryptoError::RangeProof(
            "amount and blinding factor counts differ".into(),
        ));
    }

    let padded = padded_length(amounts.len());

    let mut values = amounts.to_vec();

    values.resize(padded, 0);

    let mut blindings: Vec<Scalar> = blinding_factors
        .iter()
        .map(SecretKey::to_scalar)
        .collect();

    blindings.resize(padded, Scalar::ZERO);

    let mut transcript = Transcript::new(TRANSCRIPT_LABEL);

    let (proof, commitments) = bulletproofs::RangeProof::prove_multiple(
        &BP_GENS,
        &PC_GENS,
        &mut transcript,
        &values,
        &blindings,
        RANGE_BITS,
    )
    .map_err(|e| CryptoError::RangeProof(e.to_string()))?;

    let commitments = commitments
        .into_iter()
        .take(amounts.len())
        .map(|point| Commitment::from(point.to_bytes()))
        .collect();

    Ok((
        RangeProof {
            bytes: proof.to_bytes(),
        },
        commitments,
    ))
}

/// Verifies an aggregated proof against the output commitment vector.
/// Malformed proofs and commitments simply fail verification; nothing on
/// this path panics on wire data.
pub fn verify(proof: &RangeProof, commitments: &[Commitment]) -> bool {
    if commitments.is_empty() {
        return false;
    }

    let parsed = match bulletproofs::RangeProof::from_bytes(&proof.bytes) {
        Ok(parsed) => parsed,
        Err(_) => return false,
    };

    let mut padded: Vec<CompressedRistretto> = commitments
        .iter()
        .map(|commitment| CompressedRistretto(*commitment.as_bytes()))
        .collect();

    padded.resize(
        padded_length(commitments.len()),
        CompressedRistretto::identity(),
    );

    let mut transcript = Transcript::new(TRANSCRIPT_LABEL);

    parsed
        .verify_multiple(&BP_GENS, &PC_GENS, &mut transcript, &padded, RANGE_BITS)
        .is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
