//! # CLSAG Ring Signatures
//!
//! The concise linkable spontaneous anonymous group signature that protects
//! every transaction input. The signer proves, over a ring of candidate
//! outputs, that they hold the secret key of exactly one ring member and
//! that the member's commitment matches the input's pseudo commitment —
//! without revealing which member is theirs. The key image links any second
//! spend of the same output to the first.
//!
//! The scheme aggregates the key and the commitment responses into a single
//! response vector, which is what keeps the signature at one scalar per
//! ring member plus two fixed elements regardless of ring size.
//!
//! Ring members enter the challenge hash in ring order, so signer and
//! verifier must agree on the ordering of the ring — on this network the
//! ring is the ordered list of fetched ring participants.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::crypto::keys::{hash_to_point, hash_to_scalar};
use crate::crypto::types::{Commitment, Hash, KeyImage, PublicKey, SecretKey};
use crate::crypto::CryptoError;

const DOMAIN_AGG_KEYS: &[u8] = b"obscura.clsag.agg.0";
const DOMAIN_AGG_COMMITMENTS: &[u8] = b"obscura.clsag.agg.1";
const DOMAIN_ROUND: &[u8] = b"obscura.clsag.round";

/// A CLSAG signature: one response scalar per ring member, the closing
/// challenge, and the auxiliary commitment image that carries the
/// commitment side of the proof.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClsagSignature {
    pub challenge: SecretKey,
    pub responses: Vec<SecretKey>,
    pub commitment_image: Commitment,
}

impl ClsagSignature {
    /// The number of ring members this signature covers.
    pub fn ring_size(&self) -> usize {
        self.responses.len()
    }
}

impl Serializable for ClsagSignature {
    fn write(&self, writer: &mut Writer) {
        writer.key(&self.challenge);

        writer.key_vec(&self.responses);

        writer.key(&self.commitment_image);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            challenge: SecretKey::from(reader.key::<32>()?),
            responses: reader
                .key_vec::<32>()?
                .into_iter()
                .map(SecretKey::from)
                .collect(),
            commitment_image: Commitment::from(reader.key::<32>()?),
        })
    }
}

/// Derives the key image `I = x · Hp(P)` for a one-time key pair.
pub fn generate_key_image(public_key: &PublicKey, secret_key: &SecretKey) -> KeyImage {
    let base = hash_to_point(public_key.as_ref());

    KeyImage::from((base * secret_key.to_scalar()).compress().to_bytes())
}

struct Ring {
    keys: Vec<RistrettoPoint>,
    key_bytes: Vec<PublicKey>,
    commitment_offsets: Vec<RistrettoPoint>,
}

/// Decompresses the ring and subtracts the pseudo commitment out of every
/// ring commitment so the offsets commit to zero for the true member.
fn prepare_ring(
    public_keys: &[PublicKey],
    commitments: &[Commitment],
    pseudo_commitment: &Commitment,
) -> Result<Ring, CryptoError> {
    if public_keys.len() != commitments.len() || public_keys.is_empty() {
        return Err(CryptoError::RingSize {
            keys: public_keys.len(),
            commitments: commitments.len(),
        });
    }

    let pseudo = pseudo_commitment
        .decompress()
        .ok_or(CryptoError::InvalidPoint(PublicKey::from(
            *pseudo_commitment.as_bytes(),
        )))?;

    let mut keys = Vec::with_capacity(public_keys.len());

    let mut commitment_offsets = Vec::with_capacity(commitments.len());

    for (key, commitment) in public_keys.iter().zip(commitments) {
        keys.push(
            key.decompress()
                .ok_or(CryptoError::InvalidPoint(*key))?,
        );

        let point = commitment
            .decompress()
            .ok_or(CryptoError::InvalidPoint(PublicKey::from(
                *commitment.as_bytes(),
            )))?;

        commitment_offsets.push(point - pseudo);
    }

    Ok(Ring {
        keys,
        key_bytes: public_keys.to_vec(),
        commitment_offsets,
    })
}

/// The two aggregation scalars, binding the ring, both images and the
/// pseudo commitment.
fn aggregation_scalars(
    ring: &Ring,
    key_image: &KeyImage,
    commitment_image: &Commitment,
    pseudo_commitment: &Commitment,
) -> (Scalar, Scalar) {
    let mut writer = Writer::new();

    for key in &ring.key_bytes {
        writer.key(key);
    }

    writer.key(key_image);

    writer.key(commitment_image);

    writer.key(pseudo_commitment);

    let mu_p = hash_to_scalar(&[DOMAIN_AGG_KEYS, writer.data()]);

    let mu_c = hash_to_scalar(&[DOMAIN_AGG_COMMITMENTS, writer.data()]);

    (mu_p, mu_c)
}

/// One step of the challenge chain.
fn round_challenge(
    message: &Hash,
    ring: &Ring,
    left: &RistrettoPoint,
    right: &RistrettoPoint,
) -> Scalar {
    let mut writer = Writer::new();

    for key in &ring.key_bytes {
        writer.key(key);
    }

    writer.key(message);

    writer.bytes(left.compress().as_bytes());

    writer.bytes(right.compress().as_bytes());

    hash_to_scalar(&[DOMAIN_ROUND, writer.data()])
}

/// Produces a CLSAG over the given ring.
///
/// `real_index` is the position of the signer's output in the ring,
/// `secret_key` the one-time secret of that output, and
/// `commitment_secret` the blinding-factor difference between the output's
/// commitment and the pseudo commitment.
pub fn generate_ring_signature(
    message: &Hash,
    public_keys: &[PublicKey],
    commitments: &[Commitment],
    pseudo_commitment: &Commitment,
    real_index: usize,
    secret_key: &SecretKey,
    commitment_secret: &SecretKey,
) -> Result<(ClsagSignature, KeyImage), CryptoError> {
    let ring = prepare_ring(public_keys, commitments, pseudo_commitment)?;

    let n = ring.keys.len();

    if real_index >= n {
        return Err(CryptoError::RingIndex(real_index));
    }

    let x = secret_key.to_scalar();

    let z = commitment_secret.to_scalar();

    let base = hash_to_point(ring.key_bytes[real_index].as_ref());

    let key_image = KeyImage::from((base * x).compress().to_bytes());

    let commitment_image = Commitment::from((base * z).compress().to_bytes());

    let (mu_p, mu_c) = aggregation_scalars(&ring, &key_image, &commitment_image, pseudo_commitment);

    let aggregate_secret = mu_p * x + mu_c * z;

    let aggregate_image = {
        let image = key_image
            .decompress()
            .ok_or(CryptoError::InvalidPoint(PublicKey::from(
                *key_image.as_bytes(),
            )))?;

        let aux = commitment_image
            .decompress()
            .ok_or(CryptoError::InvalidPoint(PublicKey::from(
                *commitment_image.as_bytes(),
            )))?;

        image * mu_p + aux * mu_c
    };

    let alpha = Scalar::random(&mut OsRng);

    let mut responses = vec![Scalar::ZERO; n];

    let mut challenges = vec![Scalar::ZERO; n];

    // Open the chain at the signer's slot.
    {
        let left = RistrettoPoint::mul_base(&alpha);

        let right = base * alpha;

        challenges[(real_index + 1) % n] = round_challenge(message, &ring, &left, &right);
    }

    // Walk the ring from the signer's successor back around.
    let mut i = (real_index + 1) % n;

    while i != real_index {
        let response = Scalar::random(&mut OsRng);

        responses[i] = response;

        let aggregate_key = ring.keys[i] * mu_p + ring.commitment_offsets[i] * mu_c;

        let left = RistrettoPoint::mul_base(&response) + aggregate_key * challenges[i];

        let right =
            hash_to_point(ring.key_bytes[i].as_ref()) * response + aggregate_image * challenges[i];

        challenges[(i + 1) % n] = round_challenge(message, &ring, &left, &right);

        i = (i + 1) % n;
    }

    // Close the chain with the real response.
    responses[real_index] = alpha - challenges[real_index] * aggregate_secret;

    Ok((
        ClsagSignature {
            challenge: SecretKey::from_scalar(&challenges[0]),
            responses: responses
                .iter()
                .map(SecretKey::from_scalar)
                .collect(),
            commitment_image,
        },
        key_image,
    ))
}

/// Verifies a CLSAG over the given ring. Returns `false` for any malformed
/// input; a verification never panics on wire data.
pub fn check_ring_signature(
    message: &Hash,
    key_image: &KeyImage,
    public_keys: &[PublicKey],
    signature: &ClsagSignature,
    commitments: &[Commitment],
    pseudo_commitment: &Commitment,
) -> bool {
    let ring = match prepare_ring(public_keys, commitments, pseudo_commitment) {
        Ok(ring) => ring,
        Err(_) => return false,
    };

    let n = ring.keys.len();

    if signature.responses.len() != n {
        return false;
    }

    if !key_image.in_prime_subgroup() {
        return false;
    }

    let image = match key_image.decompress() {
        Some(point) => point,
        None => return false,
    };

    let aux = match signature.commitment_image.decompress() {
        Some(point) => point,
        None => return false,
    };

    let (mu_p, mu_c) =
        aggregation_scalars(&ring, key_image, &signature.commitment_image, pseudo_commitment);

    let aggregate_image = image * mu_p + aux * mu_c;

    let c0 = signature.challenge.to_scalar();

    let mut challenge = c0;

    for i in 0..n {
        let response = signature.responses[i].to_scalar();

        let aggregate_key = ring.keys[i] * mu_p + ring.commitment_offsets[i] * mu_c;

        let left = RistrettoPoint::mul_base(&response) + aggregate_key * challenge;

        let right = hash_to_point(ring.key_bytes[i].as_ref()) * response + aggregate_image * challenge;

        challenge = round_challenge(message, &ring, &left, &right);
    }

    challenge == c0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::sha3;
    use crate::crypto::keys::{
        generate_keypair, generate_pedersen_commitment, secret_key_to_public_key,
    };
    use rand::Rng;

    const TEST_RING_SIZE: usize = 16;

    struct TestRing {
        message: Hash,
        keys: Vec<PublicKey>,
        commitments: Vec<Commitment>,
        pseudo_commitment: Commitment,
        real_index: usize,
        secret_key: SecretKey,
        commitment_secret: SecretKey,
    }

    fn build_ring() -> TestRing {
        let mut rng = rand::thread_rng();

        let real_index = rng.gen_range(0..TEST_RING_SIZE);

        let amount = 5_000u64;

        let mut keys = Vec::new();
        let mut commitments = Vec::new();

        let (_, real_secret) = generate_keypair();
        let (_, real_blinding) = generate_keypair();

        for i in 0..TEST_RING_SIZE {
            if i == real_index {
                keys.push(secret_key_to_public_key(&real_secret));
                commitments.push(generate_pedersen_commitment(&real_blinding, amount));
            } else {
                let (key, _) = generate_keypair();
                let (_, blinding) = generate_keypair();
                keys.push(key);
                commitments.push(generate_pedersen_commitment(&blinding, rng.gen()));
            }
        }

        // Pseudo commitment to the same amount under a fresh blinding; the
        // commitment secret is the blinding difference.
        let (_, pseudo_blinding) = generate_keypair();
        let pseudo_commitment = generate_pedersen_commitment(&pseudo_blinding, amount);

        let commitment_secret = SecretKey::from_scalar(
            &(real_blinding.to_scalar() - pseudo_blinding.to_scalar()),
        );

        TestRing {
            message: sha3(b"transaction digest"),
            keys,
            commitments,
            pseudo_commitment,
            real_index,
            secret_key: real_secret,
            commitment_secret,
        }
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let ring = build_ring();

        let (signature, key_image) = generate_ring_signature(
            &ring.message,
            &ring.keys,
            &ring.commitments,
            &ring.pseudo_commitment,
            ring.real_index,
            &ring.secret_key,
            &ring.commitment_secret,
        )
        .unwrap();

        assert_eq!(signature.ring_size(), TEST_RING_SIZE);
        assert!(check_ring_signature(
            &ring.message,
            &key_image,
            &ring.keys,
            &signature,
            &ring.commitments,
            &ring.pseudo_commitment,
        ));
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let ring = build_ring();

        let (signature, key_image) = generate_ring_signature(
            &ring.message,
            &ring.keys,
            &ring.commitments,
            &ring.pseudo_commitment,
            ring.real_index,
            &ring.secret_key,
            &ring.commitment_secret,
        )
        .unwrap();

        assert!(!check_ring_signature(
            &sha3(b"a different digest"),
            &key_image,
            &ring.keys,
            &signature,
            &ring.commitments,
            &ring.pseudo_commitment,
        ));
    }

    #[test]
    fn verify_rejects_substituted_key_image() {
        let ring = build_ring();

        let (signature, _) = generate_ring_signature(
            &ring.message,
            &ring.keys,
            &ring.commitments,
            &ring.pseudo_commitment,
            ring.real_index,
            &ring.secret_key,
            &ring.commitment_secret,
        )
        .unwrap();

        let (other_public, other_secret) = generate_keypair();
        let foreign_image = generate_key_image(&other_public, &other_secret);

        assert!(!check_ring_signature(
            &ring.message,
            &foreign_image,
            &ring.keys,
            &signature,
            &ring.commitments,
            &ring.pseudo_commitment,
        ));
    }

    #[test]
    fn verify_rejects_unbalanced_pseudo_commitment() {
        let ring = build_ring();

        let (signature, key_image) = generate_ring_signature(
            &ring.message,
            &ring.keys,
            &ring.commitments,
            &ring.pseudo_commitment,
            ring.real_index,
            &ring.secret_key,
            &ring.commitment_secret,
        )
        .unwrap();

        // A pseudo commitment to a different amount breaks the offset at
        // the true member even though the rest of the ring is unchanged.
        let (_, blinding) = generate_keypair();
        let forged = generate_pedersen_commitment(&blinding, 1);

        assert!(!check_ring_signature(
            &ring.message,
            &key_image,
            &ring.keys,
            &signature,
            &ring.commitments,
            &forged,
        ));
    }

    #[test]
    fn verify_rejects_response_count_mismatch() {
        let ring = build_ring();

        let (mut signature, key_image) = generate_ring_signature(
            &ring.message,
            &ring.keys,
            &ring.commitments,
            &ring.pseudo_commitment,
            ring.real_index,
            &ring.secret_key,
            &ring.commitment_secret,
        )
        .unwrap();

        signature.responses.pop();

        assert!(!check_ring_signature(
            &ring.message,
            &key_image,
            &ring.keys,
            &signature,
            &ring.commitments,
            &ring.pseudo_commitment,
        ));
    }

    #[test]
    fn key_image_is_deterministic_per_key() {
        let (public, secret) = generate_keypair();

        assert_eq!(
            generate_key_image(&public, &secret),
            generate_key_image(&public, &secret)
        );

        let (other_public, other_secret) = generate_keypair();
        assert_ne!(
            generate_key_image(&public, &secret),
            generate_key_image(&other_public, &other_secret)
        );
    }

    #[test]
    fn signature_wire_round_trip() {
        let ring = build_ring();

        let (signature, _) = generate_ring_signature(
            &ring.message,
            &ring.keys,
            &ring.commitments,
            &ring.pseudo_commitment,
            ring.real_index,
            &ring.secret_key,
            &ring.commitment_secret,
        )
        .unwrap();

        let decoded = ClsagSignature::from_bytes(&signature.to_bytes()).unwrap();

        assert_eq!(decoded, signature);
    }
}
