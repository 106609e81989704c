//! Base58 wallet addresses.
//!
//! An address is the network prefix, the public spend key, the public view
//! key, and a four-byte SHA3 checksum, base58-encoded as one string. The
//! prefix is a 29-bit tag chosen so every encoded address starts with a
//! recognizable run of characters.

use thiserror::Error;

use crate::codec::{Reader, Writer};
use crate::config;
use crate::crypto::hash::sha3;
use crate::crypto::types::PublicKey;

/// Checksum width appended to every address.
const CHECKSUM_LENGTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is not valid base58")]
    Base58,

    #[error("address is truncated")]
    Truncated,

    #[error("address prefix mismatch: expected {expected:#x}, got {actual:#x}")]
    PrefixMismatch { expected: u64, actual: u64 },

    #[error("address checksum mismatch")]
    Checksum,
}

/// Encodes a spend/view key pair as a wallet address.
pub fn encode(public_spend_key: &PublicKey, public_view_key: &PublicKey) -> String {
    let mut writer = Writer::new();

    writer.varint(config::PUBLIC_ADDRESS_PREFIX);

    writer.key(public_spend_key);

    writer.key(public_view_key);

    let checksum = sha3(writer.data());

    writer.bytes(&checksum.as_bytes()[..CHECKSUM_LENGTH]);

    bs58::encode(writer.data()).into_string()
}

/// Decodes a wallet address back into its spend and view keys, verifying
/// the prefix and the checksum.
pub fn decode(address: &str) -> Result<(PublicKey, PublicKey), AddressError> {
    let raw = bs58::decode(address)
        .into_vec()
        .map_err(|_| AddressError::Base58)?;

    if raw.len() <= CHECKSUM_LENGTH {
        return Err(AddressError::Truncated);
    }

    let (body, checksum) = raw.split_at(raw.len() - CHECKSUM_LENGTH);

    if &sha3(body).as_bytes()[..CHECKSUM_LENGTH] != checksum {
        return Err(AddressError::Checksum);
    }

    let mut reader = Reader::new(body);

    let prefix = reader.varint().map_err(|_| AddressError::Truncated)?;

    if prefix != config::PUBLIC_ADDRESS_PREFIX {
        return Err(AddressError::PrefixMismatch {
            expected: config::PUBLIC_ADDRESS_PREFIX,
            actual: prefix,
        });
    }

    let spend = reader.key::<32>().map_err(|_| AddressError::Truncated)?;

    let view = reader.key::<32>().map_err(|_| AddressError::Truncated)?;

    if reader.remaining() != 0 {
        return Err(AddressError::Truncated);
    }

    Ok((PublicKey::from(spend), PublicKey::from(view)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::generate_keypair;

    #[test]
    fn encode_decode_round_trip() {
        let (spend, _) = generate_keypair();
        let (view, _) = generate_keypair();

        let address = encode(&spend, &view);
        let (decoded_spend, decoded_view) = decode(&address).unwrap();

        assert_eq!(decoded_spend, spend);
        assert_eq!(decoded_view, view);
    }

    #[test]
    fn corrupted_address_fails_checksum() {
        let (spend, _) = generate_keypair();
        let (view, _) = generate_keypair();

        let mut address = encode(&spend, &view);

        // Swap the last character for a different base58 character.
        let last = address.pop().unwrap();
        address.push(if last == '2' { '3' } else { '2' });

        assert!(matches!(
            decode(&address),
            Err(AddressError::Checksum) | Err(AddressError::Base58)
        ));
    }

    #[test]
    fn non_base58_input_is_rejected() {
        assert_eq!(decode("not!an@address"), Err(AddressError::Base58));
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert_eq!(decode("22"), Err(AddressError::Truncated));
    }
}
