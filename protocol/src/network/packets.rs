//! The four packet types of the overlay protocol.
//!
//! Every payload begins `varint(type) ‖ varint(version)`; the type is
//! peeked to pick the packet shape and unknown types are decode errors.
//! Handshake and peer-exchange packets cap their peer lists at decode
//! time — a list past the cap is a protocol violation and the packet
//! never reaches a handler.

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::config;
use crate::crypto::types::Hash;
use crate::network::peers::NetworkPeer;

/// Wire discriminants of the overlay packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Handshake,
    Keepalive,
    PeerExchange,
    Data,
}

impl PacketType {
    pub const fn tag(self) -> u64 {
        match self {
            Self::Handshake => 1000,
            Self::Keepalive => 1100,
            Self::PeerExchange => 1200,
            Self::Data => 2000,
        }
    }

    pub const fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1000 => Some(Self::Handshake),
            1100 => Some(Self::Keepalive),
            1200 => Some(Self::PeerExchange),
            2000 => Some(Self::Data),
            _ => None,
        }
    }
}

fn read_packet_header(
    reader: &mut Reader<'_>,
    expected: PacketType,
) -> Result<u64, CodecError> {
    let tag = reader.varint()?;

    if tag != expected.tag() {
        return Err(CodecError::UnknownTag(tag));
    }

    reader.varint()
}

fn read_peer_list(reader: &mut Reader<'_>) -> Result<Vec<NetworkPeer>, CodecError> {
    let count = reader.varint()? as usize;

    if count > config::p2p::MAXIMUM_PEERS_EXCHANGED {
        return Err(CodecError::Malformed(format!(
            "peer list of {count} exceeds the exchange maximum"
        )));
    }

    let mut peers = Vec::with_capacity(count);

    for _ in 0..count {
        peers.push(NetworkPeer::read(reader)?);
    }

    Ok(peers)
}

// ---------------------------------------------------------------------------
// Handshake (1000)
// ---------------------------------------------------------------------------

/// The first packet between two peers: who we are, where we listen, which
/// network we speak, and a starter set of peers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandshakePacket {
    pub version: u64,
    pub peer_id: Hash,
    pub peer_port: u16,
    pub network_id: Hash,
    pub peers: Vec<NetworkPeer>,
}

impl HandshakePacket {
    pub fn new(peer_id: Hash, peer_port: u16, network_id: Hash) -> Self {
        Self {
            version: config::p2p::VERSION,
            peer_id,
            peer_port,
            network_id,
            peers: Vec::new(),
        }
    }
}

impl Serializable for HandshakePacket {
    fn write(&self, writer: &mut Writer) {
        writer.varint(PacketType::Handshake.tag());

        writer.varint(self.version);

        writer.key(&self.peer_id);

        writer.varint(u64::from(self.peer_port));

        writer.key(&self.network_id);

        writer.varint(self.peers.len() as u64);

        for peer in &self.peers {
            peer.write(writer);
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = read_packet_header(reader, PacketType::Handshake)?;

        Ok(Self {
            version,
            peer_id: Hash::read(reader)?,
            peer_port: reader.varint()? as u16,
            network_id: Hash::read(reader)?,
            peers: read_peer_list(reader)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Keepalive (1100)
// ---------------------------------------------------------------------------

/// A heartbeat. Carries nothing but our identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeepalivePacket {
    pub version: u64,
    pub peer_id: Hash,
}

impl KeepalivePacket {
    pub fn new(peer_id: Hash) -> Self {
        Self {
            version: config::p2p::VERSION,
            peer_id,
        }
    }
}

impl Serializable for KeepalivePacket {
    fn write(&self, writer: &mut Writer) {
        writer.varint(PacketType::Keepalive.tag());

        writer.varint(self.version);

        writer.key(&self.peer_id);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = read_packet_header(reader, PacketType::Keepalive)?;

        Ok(Self {
            version,
            peer_id: Hash::read(reader)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Peer exchange (1200)
// ---------------------------------------------------------------------------

/// Periodic gossip of our peer list, in the same shape as a handshake, so
/// peer databases converge across the network.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerExchangePacket {
    pub version: u64,
    pub peer_id: Hash,
    pub peer_port: u16,
    pub network_id: Hash,
    pub peers: Vec<NetworkPeer>,
}

impl PeerExchangePacket {
    pub fn new(peer_id: Hash, peer_port: u16, network_id: Hash) -> Self {
        Self {
            version: config::p2p::VERSION,
            peer_id,
            peer_port,
            network_id,
            peers: Vec::new(),
        }
    }
}

impl Serializable for PeerExchangePacket {
    fn write(&self, writer: &mut Writer) {
        writer.varint(PacketType::PeerExchange.tag());

        writer.varint(self.version);

        writer.key(&self.peer_id);

        writer.varint(u64::from(self.peer_port));

        writer.key(&self.network_id);

        writer.varint(self.peers.len() as u64);

        for peer in &self.peers {
            peer.write(writer);
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = read_packet_header(reader, PacketType::PeerExchange)?;

        Ok(Self {
            version,
            peer_id: Hash::read(reader)?,
            peer_port: reader.varint()? as u16,
            network_id: Hash::read(reader)?,
            peers: read_peer_list(reader)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Data (2000)
// ---------------------------------------------------------------------------

/// An opaque application payload, tagged with the network it belongs to.
/// The overlay routes these; it never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataPacket {
    pub version: u64,
    pub network_id: Hash,
    pub payload: Vec<u8>,
}

impl DataPacket {
    pub fn new(network_id: Hash, payload: Vec<u8>) -> Self {
        Self {
            version: config::p2p::VERSION,
            network_id,
            payload,
        }
    }
}

impl Serializable for DataPacket {
    fn write(&self, writer: &mut Writer) {
        writer.varint(PacketType::Data.tag());

        writer.varint(self.version);

        writer.key(&self.network_id);

        writer.blob(&self.payload);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = read_packet_header(reader, PacketType::Data)?;

        Ok(Self {
            version,
            network_id: Hash::read(reader)?,
            payload: reader.blob()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Sum type
// ---------------------------------------------------------------------------

/// Any overlay packet, decoded by peeking the leading type varint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake(HandshakePacket),
    Keepalive(KeepalivePacket),
    PeerExchange(PeerExchangePacket),
    Data(DataPacket),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Handshake(_) => PacketType::Handshake,
            Self::Keepalive(_) => PacketType::Keepalive,
            Self::PeerExchange(_) => PacketType::PeerExchange,
            Self::Data(_) => PacketType::Data,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Self::Handshake(packet) => packet.version,
            Self::Keepalive(packet) => packet.version,
            Self::PeerExchange(packet) => packet.version,
            Self::Data(packet) => packet.version,
        }
    }
}

impl Serializable for Packet {
    fn write(&self, writer: &mut Writer) {
        match self {
            Self::Handshake(packet) => packet.write(writer),
            Self::Keepalive(packet) => packet.write(writer),
            Self::PeerExchange(packet) => packet.write(writer),
            Self::Data(packet) => packet.write(writer),
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let tag = reader.peek_varint()?;

        match PacketType::from_tag(tag) {
            Some(PacketType::Handshake) => Ok(Self::Handshake(HandshakePacket::read(reader)?)),
            Some(PacketType::Keepalive) => Ok(Self::Keepalive(KeepalivePacket::read(reader)?)),
            Some(PacketType::PeerExchange) => {
                Ok(Self::PeerExchange(PeerExchangePacket::read(reader)?))
            }
            Some(PacketType::Data) => Ok(Self::Data(DataPacket::read(reader)?)),
            None => Err(CodecError::UnknownTag(tag)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
