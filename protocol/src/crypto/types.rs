//! Typed fixed-width containers for the cryptographic objects that flow
//! through the protocol: content hashes, public/secret keys, key images,
//! Pedersen commitments and signatures.
//!
//! All of these are plain byte arrays at rest. The newtypes exist so the
//! compiler keeps a key image from ever being handed to something expecting
//! a public key, and so every container serializes, displays and orders the
//! same way everywhere: verbatim bytes on the wire, lowercase hex for
//! humans, lexicographic ordering for storage keys.

use std::fmt;
use std::str::FromStr;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::{CodecError, Reader, Serializable, Writer};

/// Parse failure for the hex forms of the containers below.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid hex key: {0}")]
pub struct KeyParseError(String);

macro_rules! fixed_bytes_type {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LENGTH: usize = $len;

            /// The all-zero value. Used as the "unset" sentinel throughout
            /// the protocol, never as a live key.
            pub const fn empty() -> Self {
                Self([0u8; $len])
            }

            pub fn is_empty(&self) -> bool {
                self.0.iter().all(|byte| *byte == 0)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::empty()
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = KeyParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|e| KeyParseError(e.to_string()))?;

                let array: [u8; $len] = bytes
                    .try_into()
                    .map_err(|_| KeyParseError(format!("expected {} bytes", $len)))?;

                Ok(Self(array))
            }
        }

        impl Serializable for $name {
            fn write(&self, writer: &mut Writer) {
                writer.key(self);
            }

            fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
                Ok(Self(reader.key::<$len>()?))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;

                text.parse().map_err(|e: KeyParseError| D::Error::custom(e))
            }
        }
    };
}

fixed_bytes_type!(
    /// A 32-byte SHA3-256 digest: the universal content identifier and map
    /// key of the protocol. Ordering is lexicographic on the raw bytes.
    Hash,
    32
);

fixed_bytes_type!(
    /// A compressed group element used as a public key, a ring member, or a
    /// one-time output key.
    PublicKey,
    32
);

fixed_bytes_type!(
    /// A 32-byte scalar. Secret keys, blinding factors and derivation
    /// scalars all live here.
    SecretKey,
    32
);

fixed_bytes_type!(
    /// The linking tag of a spent output. One valid key image exists per
    /// output; its on-chain presence is what makes a double spend visible.
    KeyImage,
    32
);

fixed_bytes_type!(
    /// A Pedersen commitment to an amount.
    Commitment,
    32
);

fixed_bytes_type!(
    /// A 64-byte Schnorr signature (`R ‖ s`).
    Signature,
    64
);

impl Hash {
    /// Number of leading zero bits, used by the transaction proof-of-work
    /// admission rule.
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;

        for byte in self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();

                break;
            }
        }

        zeros
    }
}

impl SecretKey {
    /// The scalar this key encodes, reduced into the group order.
    pub fn to_scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.0)
    }

    pub fn from_scalar(scalar: &Scalar) -> Self {
        Self(scalar.to_bytes())
    }
}

macro_rules! point_container {
    ($name:ident) => {
        impl $name {
            /// Decompress into a group element. `None` when the encoding is
            /// not canonical.
            pub fn decompress(&self) -> Option<RistrettoPoint> {
                CompressedRistretto(self.0).decompress()
            }

            pub fn from_point(point: &RistrettoPoint) -> Self {
                Self(point.compress().to_bytes())
            }

            /// Whether the encoding is a canonical element of the
            /// prime-order group. The group has no small-subgroup elements,
            /// so a successful decompression is the whole check.
            pub fn in_prime_subgroup(&self) -> bool {
                !self.is_empty() && self.decompress().is_some()
            }
        }
    };
}

point_container!(PublicKey);
point_container!(KeyImage);
point_container!(Commitment);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
