//! # Peer-to-Peer Overlay
//!
//! The transport that carries handshakes, peer gossip, keepalives and
//! application data between nodes: an encrypted ROUTER server for inbound
//! peers, one DEALER client per outbound peer, a persisted peer database,
//! and the overlay node that ties the loops together.

pub mod address;
pub mod envelope;
pub mod node;
pub mod packets;
pub mod peers;
pub mod sockets;

use thiserror::Error;

use crate::codec::CodecError;
use crate::storage::StorageError;

pub use address::{normalize_host_port, IpAddress};
pub use envelope::MessageEnvelope;
pub use node::{NetworkMessage, Node};
pub use packets::{
    DataPacket, HandshakePacket, KeepalivePacket, Packet, PacketType, PeerExchangePacket,
};
pub use peers::{NetworkPeer, PeerDatabase};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("could not bind the server socket: {0}")]
    Bind(String),

    #[error("could not connect: {0}")]
    Connect(String),

    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("already connected to that host and port")]
    DuplicateConnect,

    #[error("could not connect to any seed nodes")]
    SeedConnect,

    #[error("could not add peer: {0}")]
    PeerAddFailure(String),

    #[error("invalid network address: {0}")]
    InvalidAddress(String),

    #[error("transport error: {0}")]
    Zmq(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<zmq::Error> for NetworkError {
    fn from(error: zmq::Error) -> Self {
        Self::Zmq(error.to_string())
    }
}
