//! # Keys, Derivations and Commitments
//!
//! The one-time-key machinery that gives outputs their privacy:
//!
//! - a sender derives a shared secret from the recipient's public view key
//!   and the transaction secret key, then stretches it per output index
//!   into a derivation scalar;
//! - the derivation scalar turns the recipient's public spend key into a
//!   one-time **public ephemeral** that only the recipient can link back to
//!   themselves, and deterministically seeds the **amount mask** and the
//!   Pedersen **blinding factor** for that output;
//! - plain (non-ring) signatures over digests use Schnorr on the same
//!   group, so a candidate key, a staker key and an output key are all the
//!   same kind of object.
//!
//! Everything here operates on the prime-order Ristretto group; compressed
//! encodings are the 32-byte containers from [`crate::crypto::types`].

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_512};

use crate::codec::Writer;
use crate::crypto::types::{Commitment, Hash, PublicKey, SecretKey, Signature};
use crate::crypto::CryptoError;

/// Domain prefixes keep the scalar derivations for different purposes from
/// ever colliding on the same input bytes.
const DOMAIN_DERIVATION_SCALAR: &[u8] = b"obscura.derivation.scalar";
const DOMAIN_COMMITMENT_MASK: &[u8] = b"obscura.commitment.mask";
const DOMAIN_AMOUNT_MASK: &[u8] = b"obscura.amount.mask";
const DOMAIN_SIGNATURE: &[u8] = b"obscura.signature";

/// Hashes arbitrary parts to a scalar via a 512-bit digest, which keeps the
/// reduction bias negligible.
pub(crate) fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha3_512::new();

    for part in parts {
        hasher.update(part);
    }

    Scalar::from_hash(hasher)
}

/// Hashes a compressed point to a group element (the `Hp` map used by key
/// images and ring signatures).
pub(crate) fn hash_to_point(data: &[u8]) -> RistrettoPoint {
    let mut hasher = Sha3_512::new();

    hasher.update(b"obscura.hash.to.point");

    hasher.update(data);

    RistrettoPoint::from_uniform_bytes(&<[u8; 64]>::from(hasher.finalize()))
}

/// Generates a fresh keypair from OS entropy.
pub fn generate_keypair() -> (PublicKey, SecretKey) {
    let secret = Scalar::random(&mut OsRng);

    let public = RistrettoPoint::mul_base(&secret);

    (PublicKey::from_point(&public), SecretKey::from_scalar(&secret))
}

/// The public half of a secret key.
pub fn secret_key_to_public_key(secret_key: &SecretKey) -> PublicKey {
    PublicKey::from_point(&RistrettoPoint::mul_base(&secret_key.to_scalar()))
}

/// Computes the shared key derivation `D = s · P` between a secret key and
/// a counterparty public key. Both directions of the usual exchange arrive
/// at the same point.
pub fn generate_key_derivation(
    public_key: &PublicKey,
    secret_key: &SecretKey,
) -> Result<PublicKey, CryptoError> {
    let point = public_key
        .decompress()
        .ok_or(CryptoError::InvalidPoint(*public_key))?;

    Ok(PublicKey::from_point(&(point * secret_key.to_scalar())))
}

/// Stretches a key derivation and an output index into the per-output
/// derivation scalar.
pub fn derivation_to_scalar(derivation: &PublicKey, output_index: u64) -> SecretKey {
    let mut writer = Writer::new();

    writer.varint(output_index);

    SecretKey::from_scalar(&hash_to_scalar(&[
        DOMAIN_DERIVATION_SCALAR,
        derivation.as_ref(),
        writer.data(),
    ]))
}

/// Derives the one-time public ephemeral `P = d · G + B` for an output
/// addressed to the spend key `B`.
pub fn derive_public_key(
    derivation_scalar: &SecretKey,
    public_spend_key: &PublicKey,
) -> Result<PublicKey, CryptoError> {
    let spend = public_spend_key
        .decompress()
        .ok_or(CryptoError::InvalidPoint(*public_spend_key))?;

    let point = RistrettoPoint::mul_base(&derivation_scalar.to_scalar()) + spend;

    Ok(PublicKey::from_point(&point))
}

/// Derives the one-time secret key `x = d + b` matching
/// [`derive_public_key`], for the holder of the spend secret `b`.
pub fn derive_secret_key(derivation_scalar: &SecretKey, secret_spend_key: &SecretKey) -> SecretKey {
    SecretKey::from_scalar(&(derivation_scalar.to_scalar() + secret_spend_key.to_scalar()))
}

/// The deterministic Pedersen blinding factor for an output, seeded by its
/// derivation scalar so the recipient can recompute it.
pub fn generate_commitment_blinding_factor(derivation_scalar: &SecretKey) -> SecretKey {
    SecretKey::from_scalar(&hash_to_scalar(&[
        DOMAIN_COMMITMENT_MASK,
        derivation_scalar.as_ref(),
    ]))
}

/// The deterministic 64-bit amount mask for an output.
pub fn generate_amount_mask(derivation_scalar: &SecretKey) -> u64 {
    let digest = crate::crypto::hash::sha3_multi(&[DOMAIN_AMOUNT_MASK, derivation_scalar.as_ref()]);

    let mut bytes = [0u8; 8];

    bytes.copy_from_slice(&digest.as_bytes()[..8]);

    u64::from_le_bytes(bytes)
}

/// Masks or unmasks an amount. XOR, so the operation is its own inverse.
pub fn toggle_masked_amount(mask: u64, amount: u64) -> u64 {
    amount ^ mask
}

/// Commits to an amount under a blinding factor: `C = v · G + b · H`.
pub fn generate_pedersen_commitment(blinding_factor: &SecretKey, amount: u64) -> Commitment {
    let gens = bulletproofs::PedersenGens::default();

    Commitment::from_point(&gens.commit(Scalar::from(amount), blinding_factor.to_scalar()))
}

/// The point committing to a bare amount with no blinding (`v · G`), used
/// on the verifier side of the commitment parity check.
pub fn amount_commitment_term(amount: u64) -> RistrettoPoint {
    bulletproofs::PedersenGens::default().B * Scalar::from(amount)
}

/// Generates the per-input pseudo commitments for a transaction: one
/// commitment per input amount, with blinding factors chosen so that the
/// pseudo commitments sum to exactly the output commitments plus the fee
/// term. The verifier checks that equality without learning any amount.
pub fn generate_pseudo_commitments(
    input_amounts: &[u64],
    output_blinding_factors: &[SecretKey],
) -> (Vec<Commitment>, Vec<SecretKey>) {
    let target: Scalar = output_blinding_factors
        .iter()
        .map(SecretKey::to_scalar)
        .sum();

    let mut blinding_factors = Vec::with_capacity(input_amounts.len());

    let mut running = Scalar::ZERO;

    for _ in 1..input_amounts.len() {
        let blinding = Scalar::random(&mut OsRng);

        running += blinding;

        blinding_factors.push(SecretKey::from_scalar(&blinding));
    }

    // The final blinding factor closes the sum to the output target.
    blinding_factors.push(SecretKey::from_scalar(&(target - running)));

    let commitments = input_amounts
        .iter()
        .zip(&blinding_factors)
        .map(|(amount, blinding)| generate_pedersen_commitment(blinding, *amount))
        .collect();

    (commitments, blinding_factors)
}

/// Checks the commitment parity of a transaction:
/// `Σ pseudo == Σ outputs + fee · G`.
pub fn commitments_balance(
    pseudo_commitments: &[Commitment],
    output_commitments: &[Commitment],
    fee: u64,
) -> bool {
    let sum = |commitments: &[Commitment]| -> Option<RistrettoPoint> {
        commitments
            .iter()
            .map(Commitment::decompress)
            .try_fold(RistrettoPoint::identity(), |acc, point| Some(acc + point?))
    };

    match (sum(pseudo_commitments), sum(output_commitments)) {
        (Some(pseudo), Some(outputs)) => pseudo == outputs + amount_commitment_term(fee),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Schnorr signatures
// ---------------------------------------------------------------------------

/// Signs a digest with a plain Schnorr signature (`R ‖ s`). The nonce is
/// derived from the secret key and the digest, so signing is deterministic
/// and never reuses a nonce across messages.
pub fn generate_signature(digest: &Hash, secret_key: &SecretKey) -> Signature {
    let x = secret_key.to_scalar();

    let public = RistrettoPoint::mul_base(&x).compress();

    let r = hash_to_scalar(&[DOMAIN_SIGNATURE, secret_key.as_ref(), digest.as_ref()]);

    let big_r = RistrettoPoint::mul_base(&r).compress();

    let c = hash_to_scalar(&[
        DOMAIN_SIGNATURE,
        digest.as_ref(),
        big_r.as_bytes(),
        public.as_bytes(),
    ]);

    let s = r + c * x;

    let mut bytes = [0u8; 64];

    bytes[..32].copy_from_slice(big_r.as_bytes());

    bytes[32..].copy_from_slice(&s.to_bytes());

    Signature::from(bytes)
}

/// Verifies a Schnorr signature over a digest.
pub fn check_signature(digest: &Hash, public_key: &PublicKey, signature: &Signature) -> bool {
    let bytes = signature.as_bytes();

    let mut r_bytes = [0u8; 32];

    r_bytes.copy_from_slice(&bytes[..32]);

    let big_r = match PublicKey::from(r_bytes).decompress() {
        Some(point) => point,
        None => return false,
    };

    let mut s_bytes = [0u8; 32];

    s_bytes.copy_from_slice(&bytes[32..]);

    let s = match Option::<Scalar>::from(Scalar::from_canonical_bytes(s_bytes)) {
        Some(scalar) => scalar,
        None => return false,
    };

    let public = match public_key.decompress() {
        Some(point) => point,
        None => return false,
    };

    let c = hash_to_scalar(&[
        DOMAIN_SIGNATURE,
        digest.as_ref(),
        &bytes[..32],
        public_key.as_ref(),
    ]);

    RistrettoPoint::mul_base(&s) == big_r + public * c
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::sha3;

    #[test]
    fn keypair_halves_match() {
        let (public, secret) = generate_keypair();

        assert_eq!(secret_key_to_public_key(&secret), public);
        assert!(public.in_prime_subgroup());
    }

    #[test]
    fn key_derivation_commutes() {
        // D(a_pub, b_sec) == D(b_pub, a_sec): the usual two-party exchange.
        let (a_pub, a_sec) = generate_keypair();
        let (b_pub, b_sec) = generate_keypair();

        let d1 = generate_key_derivation(&a_pub, &b_sec).unwrap();
        let d2 = generate_key_derivation(&b_pub, &a_sec).unwrap();

        assert_eq!(d1, d2);
    }

    #[test]
    fn derivation_scalar_varies_per_index() {
        let (public, secret) = generate_keypair();
        let derivation = generate_key_derivation(&public, &secret).unwrap();

        assert_ne!(
            derivation_to_scalar(&derivation, 0),
            derivation_to_scalar(&derivation, 1)
        );
    }

    #[test]
    fn one_time_keys_line_up() {
        // The recipient's derived secret must control the sender's derived
        // public ephemeral.
        let (tx_pub, tx_sec) = generate_keypair();
        let (view_pub, view_sec) = generate_keypair();
        let (spend_pub, spend_sec) = generate_keypair();

        // Sender side.
        let sender_derivation = generate_key_derivation(&view_pub, &tx_sec).unwrap();
        let scalar = derivation_to_scalar(&sender_derivation, 3);
        let ephemeral = derive_public_key(&scalar, &spend_pub).unwrap();

        // Recipient side.
        let recipient_derivation = generate_key_derivation(&tx_pub, &view_sec).unwrap();
        let recipient_scalar = derivation_to_scalar(&recipient_derivation, 3);
        let ephemeral_secret = derive_secret_key(&recipient_scalar, &spend_sec);

        assert_eq!(secret_key_to_public_key(&ephemeral_secret), ephemeral);
    }

    #[test]
    fn amount_mask_round_trips() {
        let (public, secret) = generate_keypair();
        let derivation = generate_key_derivation(&public, &secret).unwrap();
        let scalar = derivation_to_scalar(&derivation, 0);

        let mask = generate_amount_mask(&scalar);
        let masked = toggle_masked_amount(mask, 122_565);

        assert_ne!(masked, 122_565);
        assert_eq!(toggle_masked_amount(mask, masked), 122_565);
    }

    #[test]
    fn pseudo_commitments_balance_against_outputs() {
        let output_amounts = [40u64, 55];
        let fee = 5u64;
        let input_amounts = [100u64];

        let output_blindings: Vec<SecretKey> = (0..2)
            .map(|_| SecretKey::from_scalar(&Scalar::random(&mut OsRng)))
            .collect();

        let output_commitments: Vec<Commitment> = output_amounts
            .iter()
            .zip(&output_blindings)
            .map(|(amount, blinding)| generate_pedersen_commitment(blinding, *amount))
            .collect();

        let (pseudo, _) = generate_pseudo_commitments(&input_amounts, &output_blindings);

        assert!(commitments_balance(&pseudo, &output_commitments, fee));
        assert!(!commitments_balance(&pseudo, &output_commitments, fee + 1));
    }

    #[test]
    fn schnorr_round_trip() {
        let (public, secret) = generate_keypair();
        let digest = sha3(b"block digest");

        let signature = generate_signature(&digest, &secret);

        assert!(check_signature(&digest, &public, &signature));
        assert!(!check_signature(&sha3(b"other digest"), &public, &signature));

        let (other_public, _) = generate_keypair();
        assert!(!check_signature(&digest, &other_public, &signature));
    }

    #[test]
    fn schnorr_rejects_tampered_signature() {
        let (public, secret) = generate_keypair();
        let digest = sha3(b"payload");

        let signature = generate_signature(&digest, &secret);

        let mut bytes = *signature.as_bytes();
        bytes[40] ^= 0x01;

        assert!(!check_signature(&digest, &public, &Signature::from(bytes)));
    }
}
