// Copyright (c) 2026 The Obscura Developers. MIT License.
// See LICENSE for details.

//! # Obscura — Core Library
//!
//! The core of an Obscura network node: a privacy-preserving,
//! proof-of-stake cryptocurrency where amounts hide behind Pedersen
//! commitments, spends hide inside ring signatures, and block production
//! is decided by a deterministic election over recent chain history.
//!
//! ## Architecture
//!
//! The library splits along the actual concerns of a node:
//!
//! - **codec** — The deterministic wire format everything serializes
//!   through. Varints, fixed keys, nothing else.
//! - **crypto** — Typed containers and wrappers over the primitives:
//!   SHA3, Argon2id proof-of-work, one-time keys, CLSAG ring signatures,
//!   range proofs, addresses.
//! - **storage** — The LMDB-backed engine, the block type, and the chain
//!   store with its atomic block commits.
//! - **transaction** — The six transaction variants, their committed /
//!   uncommitted projection, and the validator.
//! - **staking** — The candidate registry and the election.
//! - **network** — The encrypted P2P overlay: handshakes, peer gossip,
//!   keepalives, data routing.
//! - **config** — Every protocol constant, in one place.
//!
//! ## Design ground rules
//!
//! 1. Consensus formats are exact: one encoding per object, one hash per
//!    encoding. Anything less forks the network eventually.
//! 2. Writers are serialized, readers are snapshots, and a block commit
//!    is one transaction — a half-written block is never visible.
//! 3. Workers poll a single stop signal; shutdown is prompt on every
//!    path, including the error ones.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod network;
pub mod staking;
pub mod storage;
pub mod transaction;
