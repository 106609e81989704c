//! # Hashing
//!
//! SHA3-256 is the only content hash on the network: transaction digests,
//! block digests, storage keys, election seeds — all of it. The helpers
//! here exist so call sites never touch the digest machinery directly and
//! never disagree about how composite inputs are fed in.
//!
//! Transaction proof-of-work is Argon2id over the SHA3 digest of the
//! transaction. The parameters are deliberately memory-hard and
//! single-threaded: the target hardware is whatever a wallet runs on, not
//! a mining farm.

use once_cell::sync::Lazy;
use rand::RngCore;
use sha3::{Digest, Sha3_256};

use crate::config;
use crate::crypto::types::Hash;

/// SHA3-256 of a single input.
pub fn sha3(data: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();

    hasher.update(data);

    Hash::from(<[u8; 32]>::from(hasher.finalize()))
}

/// SHA3-256 over multiple parts fed sequentially, identical to hashing
/// their concatenation without building the temporary buffer.
pub fn sha3_multi(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha3_256::new();

    for part in parts {
        hasher.update(part);
    }

    Hash::from(<[u8; 32]>::from(hasher.finalize()))
}

/// SHA3-256 over the concatenation of fixed-width keys, in the order given.
/// This is the digest used to compare transaction-hash sequences when a
/// block is written.
pub fn sha3_keys<K: AsRef<[u8]>>(keys: &[K]) -> Hash {
    let mut hasher = Sha3_256::new();

    for key in keys {
        hasher.update(key.as_ref());
    }

    Hash::from(<[u8; 32]>::from(hasher.finalize()))
}

/// 32 random bytes from the OS entropy pool, typed as a hash. Used for peer
/// IDs and the output sampling cursor, never for key material.
pub fn random_hash() -> Hash {
    let mut bytes = [0u8; 32];

    rand::thread_rng().fill_bytes(&mut bytes);

    Hash::from(bytes)
}

static ARGON2: Lazy<argon2::Argon2<'static>> = Lazy::new(|| {
    let params = argon2::Params::new(
        config::transaction::pow::MEMORY,
        config::transaction::pow::ITERATIONS,
        config::transaction::pow::THREADS,
        Some(Hash::LENGTH),
    )
    .expect("proof-of-work parameters are valid");

    argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params)
});

/// Argon2id over the input, with the input doubling as the salt. The input
/// is always a 32-byte SHA3 digest, so the salt is well-formed by
/// construction.
pub fn argon2id(input: &Hash) -> Hash {
    let mut output = [0u8; 32];

    ARGON2
        .hash_password_into(input.as_bytes(), input.as_bytes(), &mut output)
        .expect("argon2id with fixed parameters cannot fail");

    Hash::from(output)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha3_known_vector() {
        // SHA3-256 of the empty string.
        let expected = "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
            .parse::<Hash>()
            .unwrap();

        assert_eq!(sha3(b""), expected);
    }

    #[test]
    fn sha3_deterministic() {
        assert_eq!(sha3(b"obscura"), sha3(b"obscura"));
        assert_ne!(sha3(b"obscura"), sha3(b"Obscura"));
    }

    #[test]
    fn sha3_multi_matches_concatenation() {
        let multi = sha3_multi(&[b"hello", b" ", b"world"]);
        assert_eq!(multi, sha3(b"hello world"));
    }

    #[test]
    fn sha3_keys_matches_concatenation() {
        let a = Hash::from([1u8; 32]);
        let b = Hash::from([2u8; 32]);

        let mut concat = Vec::new();
        concat.extend_from_slice(a.as_bytes());
        concat.extend_from_slice(b.as_bytes());

        assert_eq!(sha3_keys(&[a, b]), sha3(&concat));
        assert_ne!(sha3_keys(&[a, b]), sha3_keys(&[b, a]));
    }

    #[test]
    fn random_hash_is_not_constant() {
        assert_ne!(random_hash(), random_hash());
    }

    #[test]
    fn argon2id_is_deterministic() {
        let input = sha3(b"pow input");

        let a = argon2id(&input);
        let b = argon2id(&input);

        assert_eq!(a, b);
        assert_ne!(a, input);
    }

    #[test]
    fn argon2id_differs_per_input() {
        assert_ne!(argon2id(&sha3(b"one")), argon2id(&sha3(b"two")));
    }
}
