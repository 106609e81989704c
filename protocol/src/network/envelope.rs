//! The two-frame message envelope carried over the routing sockets:
//! frame one addresses a peer by its 32-byte socket identity, frame two is
//! the packet payload. Inbound messages gain the sender identity and the
//! transport-reported peer address on the way in.

use crate::crypto::types::Hash;

/// One message on (or off) the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageEnvelope {
    /// The socket identity the message arrived from.
    pub from: Hash,

    /// The socket identity to route to; `None` broadcasts (client side)
    /// or is invalid (server side — a ROUTER must address someone).
    pub to: Option<Hash>,

    /// Optional correlation subject for request/response flows.
    pub subject: Option<Hash>,

    /// The remote address as reported by the transport, normalized.
    pub peer_address: String,

    /// The serialized packet.
    pub payload: Vec<u8>,
}

impl MessageEnvelope {
    /// An envelope with no recipient: broadcast on a client socket.
    pub fn broadcast(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    /// An envelope routed to a specific peer identity.
    pub fn to(to: Hash, payload: Vec<u8>) -> Self {
        Self {
            to: Some(to),
            payload,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::sha3;

    #[test]
    fn constructors_set_routing() {
        let payload = vec![1u8, 2, 3];

        let broadcast = MessageEnvelope::broadcast(payload.clone());
        assert_eq!(broadcast.to, None);
        assert_eq!(broadcast.payload, payload);

        let routed = MessageEnvelope::to(sha3(b"peer"), payload.clone());
        assert_eq!(routed.to, Some(sha3(b"peer")));
        assert_eq!(routed.payload, payload);
    }
}
