//! # Protocol Configuration & Constants
//!
//! Every magic number on the Obscura network lives here. If you are
//! hardcoding a constant somewhere else, you are doing it wrong.
//!
//! These values define the DNA of the network. Several of them are
//! consensus-critical: changing `transaction::RING_SIZE`, the fee curve, or
//! the genesis parameters after launch is a hard fork. Choose wisely during
//! devnet.

use once_cell::sync::Lazy;

use crate::crypto::keys;
use crate::crypto::types::{Hash, PublicKey, SecretKey};

/// Build/version identity, surfaced by the node binary and in handshakes.
pub mod version {
    pub const PROJECT_NAME: &str = "Obscura";

    pub const MAJOR: u64 = 2;

    pub const MINOR: u64 = 0;

    pub const PATCH: u64 = 0;
}

/// Default on-disk layout. Every store keeps its own LMDB environment
/// underneath the data directory.
pub mod storage {
    /// Default node data directory, created relative to the working
    /// directory when no `--db-path` is given.
    pub const DEFAULT_DATA_DIR: &str = ".obscura";

    /// How many megabytes the memory map grows by each time a write runs
    /// into a full map. Growth is cheap, so the step stays small rather
    /// than leaving a huge sparse map on disk-constrained nodes.
    pub const DEFAULT_GROWTH_FACTOR_MB: usize = 8;

    /// Initial memory-map size for a fresh environment, in megabytes.
    pub const DEFAULT_MAP_SIZE_MB: usize = 16;

    /// Maximum number of named sub-databases per environment.
    pub const MAX_DATABASES: u32 = 16;
}

/// Peer-to-peer overlay parameters.
pub mod p2p {
    /// Our current P2P version number.
    pub const VERSION: u64 = 1;

    /// The minimum P2P version that we can/will talk to.
    pub const MINIMUM_VERSION: u64 = 1;

    /// How often we send a keepalive packet to our connected peers.
    pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;

    /// How often we gossip our peer list to discover new peers.
    pub const PEER_EXCHANGE_INTERVAL_MS: u64 = 120_000;

    /// How often we check our outgoing connection count and dial new
    /// peers to make up the difference.
    pub const CONNECTION_MANAGER_INTERVAL_MS: u64 = 30_000;

    /// How long an outbound connection attempt may take before it is
    /// abandoned.
    pub const CONNECTION_TIMEOUT_MS: u64 = 2_000;

    /// The maximum number of peers we will send (or accept) in a handshake
    /// or peer exchange packet. Anything larger is a protocol violation and
    /// the packet is discarded.
    pub const MAXIMUM_PEERS_EXCHANGED: usize = 250;

    /// Peers whose last-seen time is older than this many seconds are
    /// pruned from the peer database and refused on insert.
    pub const PEER_PRUNE_TIME: u64 = 86_400;

    /// Default bind port for listening for P2P connections.
    pub const DEFAULT_BIND_PORT: u16 = 12897;

    /// Bootstrap nodes dialed when the peer database is empty.
    pub const SEED_NODES: &[(&str, u16)] = &[
        ("161.35.102.211", 12897),
        ("128.199.32.206", 12897),
        ("139.59.120.178", 12897),
    ];

    /// The outbound connection count we try to maintain.
    pub const DEFAULT_CONNECTION_COUNT: usize = SEED_NODES.len() + 8;

    /// The network ID we find interesting. Nodes on other network IDs are
    /// tracked for gossip but their application data is not ours.
    pub const NETWORK_ID: [u8; 32] = [
        0x20, 0x20, 0x20, 0x54, 0x68, 0x65, 0x20, 0x4f, 0x62, 0x73, 0x63, 0x75, 0x72, 0x61, 0x20,
        0x44, 0x65, 0x76, 0x65, 0x6c, 0x6f, 0x70, 0x65, 0x72, 0x73, 0x20, 0x20, 0x20, 0x20, 0x20,
        0x20, 0x20,
    ];

    /// The static transport server secret key (Z85). Every node binds its
    /// listening socket with this key so that any client can authenticate
    /// and encrypt to any server without prior exchange.
    ///
    /// TODO: rotate this placeholder before launch.
    pub const SERVER_SECRET_KEY: &str = "Obscura0Server0Key0ReplaceBeforeLaunch00";
}

/// Consensus: elections, quorums and candidacy.
pub mod consensus {
    /// The amount required to propose a candidate node, in atomic units.
    pub const REQUIRED_CANDIDACY_AMOUNT: u64 = 100_000;

    /// The minimum amount required to stake (vote) for a candidate node,
    /// in atomic units.
    pub const MINIMUM_STAKE_AMOUNT: u64 = 100;

    /// The target number of electors selected each round as producers and
    /// as validators.
    pub const ELECTOR_TARGET_COUNT: usize = 10;

    /// The minimum percentage of a round's validators that must sign a
    /// block for the block to be committed to the chain.
    pub const VALIDATOR_THRESHOLD: usize = 60;

    /// The minimum number of permanent candidates required for the network
    /// to be able to produce blocks at all.
    pub const MINIMUM_PERMANENT_CANDIDATES: usize = 3;

    /// Permanent candidates injected into every election so that blocks can
    /// still be produced when too few candidates are staked. Each consumes
    /// one producer and one validator slot per round.
    ///
    /// TODO: replace these placeholder keys with real values before launch.
    pub const PERMANENT_CANDIDATE_KEYS: &[&str] = &[
        "0dd2ca6545ea58be4a3984c15f14d6451caad4e0d91d2460310c10bd4d0becf7",
        "775df2eab78f18c9107a6e085a056c055bd515cf1d8746363b4a9c4bfd4951ad",
        "17cf02ef00953115261750711fe13d2d76d217ca5f54ca175bcecf3b5cc966eb",
    ];
}

/// Schema versions for the staking registry records.
pub mod staking {
    pub const CANDIDATE_RECORD_VERSION: u64 = 1;

    pub const STAKER_RECORD_VERSION: u64 = 1;

    pub const STAKE_RECORD_VERSION: u64 = 1;
}

/// Transaction construction limits and economics.
pub mod transaction {
    /// The number of ring participants required when signing a transaction
    /// input. Must be a power of two.
    pub const RING_SIZE: usize = 512;

    /// The maximum number of inputs permitted in a single transaction.
    pub const MAXIMUM_INPUTS: usize = 8;

    /// The minimum number of outputs required in a single transaction.
    pub const MINIMUM_OUTPUTS: usize = 2;

    /// The maximum number of outputs permitted in a single transaction.
    pub const MAXIMUM_OUTPUTS: usize = 8;

    /// The maximum amount of data that can be carried in the extra field of
    /// a normal transaction.
    pub const MAXIMUM_EXTRA_SIZE: usize = 1_024;

    /// Network fee parameters. A transaction pays for the space it consumes
    /// and may buy the fee down by spending proof-of-work instead.
    pub mod fees {
        /// The minimum network fee required for all transactions.
        pub const MINIMUM_FEE: u64 = 1;

        /// How large, in bytes, each chunk of data is.
        pub const CHUNK_SIZE: u64 = 32;

        /// A transaction up to this size passes with `MINIMUM_FEE` alone.
        pub const BASE_CHUNK_SIZE: u64 = CHUNK_SIZE * 10;

        /// The amount added for each chunk over `BASE_CHUNK_SIZE`.
        pub const CHUNK_FEE: u64 = 1;

        /// The minimum number of leading zeros required on a transaction's
        /// proof-of-work hash before the network will relay it.
        pub const MINIMUM_POW_ZEROS: u32 = 1;

        /// The maximum number of leading zeros considered for the
        /// proof-of-work fee discount.
        pub const MAXIMUM_POW_ZEROS: u32 = 16;

        /// The divisor multiplier applied per proof-of-work zero beyond the
        /// minimum when discounting the required fee.
        pub const POW_ZERO_DISCOUNT_MULTIPLIER: u64 = 2;
    }

    /// Argon2id parameters for transaction proof-of-work mining.
    pub mod pow {
        pub const ITERATIONS: u32 = 2_048;

        /// Expressed in kibibytes (1 MiB).
        pub const MEMORY: u32 = 1_024;

        pub const THREADS: u32 = 1;
    }

    /// Genesis transaction parameters.
    pub mod genesis {
        use super::RING_SIZE;

        /// Genesis block creation timestamp (seconds since the UNIX epoch).
        pub const TIMESTAMP: u64 = 1_633_492_800;

        /// The total amount of the genesis transaction in atomic units.
        pub const AMOUNT: u64 = 125_506_560;

        /// The amount of each output in the genesis transaction. The supply
        /// is split over `2 * RING_SIZE` outputs so that full rings can be
        /// formed from the very start of the chain.
        pub const OUTPUT_AMOUNT: u64 = AMOUNT / (RING_SIZE as u64 * 2);

        /// The genesis transaction private key.
        ///
        /// TODO: replace with a fresh key before launch.
        pub const TX_PRIVATE_KEY: &str =
            "069a225e30af016280a14136ae94af095c269243e56d429496ba70c4f3d9440a";

        /// Secret half of the destination wallet's spend key. The devnet
        /// launch wallet is throwaway, so the secret ships in the tree.
        ///
        /// TODO: replace with the real launch wallet before launch.
        pub const WALLET_SPEND_SECRET: &str =
            "0ab7a31b3d1a4bb9f34c5e70e2c6a0c56255de1a21e3cbb7c61bbcf3b0ba1909";

        /// Secret half of the destination wallet's view key.
        pub const WALLET_VIEW_SECRET: &str =
            "91c6a95fbc1f9a8b35e1a84ed25b0bc3711d82cdd3d37f13731ff8710bd0a40c";
    }
}

/// Our public address prefix (a 29-bit tag prepended to every encoded
/// wallet address).
pub const PUBLIC_ADDRESS_PREFIX: u64 = 0x6bb3b1d;

const _: () = assert!(
    transaction::genesis::OUTPUT_AMOUNT * (transaction::RING_SIZE as u64 * 2)
        == transaction::genesis::AMOUNT,
    "genesis supply must divide evenly across the genesis outputs"
);

const _: () = assert!(
    transaction::RING_SIZE.is_power_of_two(),
    "ring size must be a power of two"
);

/// The network ID as a typed hash, for call sites that want the container
/// rather than raw bytes.
pub static NETWORK_ID: Lazy<Hash> = Lazy::new(|| Hash::from(p2p::NETWORK_ID));

/// Parsed permanent candidate keys, in the order they are configured.
pub static PERMANENT_CANDIDATES: Lazy<Vec<PublicKey>> = Lazy::new(|| {
    consensus::PERMANENT_CANDIDATE_KEYS
        .iter()
        .map(|hex| hex.parse().expect("invalid permanent candidate key"))
        .collect()
});

/// The genesis transaction secret key, parsed.
pub static GENESIS_TX_PRIVATE_KEY: Lazy<SecretKey> = Lazy::new(|| {
    transaction::genesis::TX_PRIVATE_KEY
        .parse()
        .expect("invalid genesis transaction private key")
});

/// Public spend key of the genesis destination wallet.
pub static GENESIS_WALLET_SPEND_KEY: Lazy<PublicKey> = Lazy::new(|| {
    let secret: SecretKey = transaction::genesis::WALLET_SPEND_SECRET
        .parse()
        .expect("invalid genesis wallet spend secret");

    keys::secret_key_to_public_key(&secret)
});

/// Public view key of the genesis destination wallet.
pub static GENESIS_WALLET_VIEW_KEY: Lazy<PublicKey> = Lazy::new(|| {
    let secret: SecretKey = transaction::genesis::WALLET_VIEW_SECRET
        .parse()
        .expect("invalid genesis wallet view secret");

    keys::secret_key_to_public_key(&secret)
});

/// The base58 address the genesis transaction pays funds to, derived from
/// the configured wallet keys so the string and the keys can never drift
/// apart.
pub static GENESIS_DESTINATION_WALLET: Lazy<String> = Lazy::new(|| {
    crate::crypto::address::encode(&GENESIS_WALLET_SPEND_KEY, &GENESIS_WALLET_VIEW_KEY)
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_output_amount_divides_supply() {
        assert_eq!(
            transaction::genesis::OUTPUT_AMOUNT * (transaction::RING_SIZE as u64 * 2),
            transaction::genesis::AMOUNT
        );
    }

    #[test]
    fn fee_floor_is_positive() {
        assert!(transaction::fees::MINIMUM_FEE > 0);
        assert!(transaction::fees::BASE_CHUNK_SIZE >= transaction::fees::CHUNK_SIZE);
    }

    #[test]
    fn connection_count_exceeds_seed_count() {
        assert!(p2p::DEFAULT_CONNECTION_COUNT > p2p::SEED_NODES.len());
    }

    #[test]
    fn permanent_candidates_meet_launch_minimum() {
        assert!(PERMANENT_CANDIDATES.len() >= consensus::MINIMUM_PERMANENT_CANDIDATES);

        // Keys must be distinct or the election seats the same node twice.
        for (i, a) in PERMANENT_CANDIDATES.iter().enumerate() {
            for b in PERMANENT_CANDIDATES.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn server_secret_key_is_valid_z85() {
        assert_eq!(p2p::SERVER_SECRET_KEY.len(), 40);
        let decoded = zmq::z85_decode(p2p::SERVER_SECRET_KEY).expect("valid Z85");
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn genesis_wallet_address_round_trips() {
        let (spend, view) =
            crate::crypto::address::decode(&GENESIS_DESTINATION_WALLET).expect("valid address");
        assert_eq!(spend, *GENESIS_WALLET_SPEND_KEY);
        assert_eq!(view, *GENESIS_WALLET_VIEW_KEY);
    }
}
