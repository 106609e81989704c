//! # Overlay Node
//!
//! The P2P node: a ROUTER server for inbound peers, a DEALER client per
//! outbound peer, and the loops that keep the overlay alive — polling,
//! keepalives, peer exchange, and the connection manager.
//!
//! ## The handshake state machine
//!
//! An inbound peer is nobody until its HANDSHAKE arrives and validates;
//! then it is registered and its KEEPALIVE / PEER_EXCHANGE / DATA traffic
//! is accepted. A second handshake from a registered peer, or anything
//! else from an unregistered one, is a protocol violation: logged at
//! trace, dropped, nothing more — the transport's own disconnect handling
//! is the only ban hammer.
//!
//! ## Seed mode
//!
//! A seed node exists to spread peer lists, nothing else: it tracks peers
//! across every network ID and ignores all application data.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::codec::Serializable;
use crate::config;
use crate::crypto::types::Hash;
use crate::network::address::{normalize_host_port, IpAddress};
use crate::network::envelope::MessageEnvelope;
use crate::network::packets::{
    DataPacket, HandshakePacket, KeepalivePacket, Packet, PeerExchangePacket,
};
use crate::network::peers::{NetworkPeer, PeerDatabase};
use crate::network::sockets::{Client, MessageQueue, Server, ShutdownSignal};
use crate::network::NetworkError;

/// How long the main poller sleeps when every queue is dry.
const POLLING_INTERVAL: Duration = Duration::from_millis(10);

/// An application payload delivered by the overlay, with where it came
/// from.
#[derive(Debug, Clone)]
pub struct NetworkMessage {
    pub from: Hash,
    pub packet: DataPacket,
    pub is_server: bool,
}

struct Inner {
    peer_db: Arc<PeerDatabase>,
    server: Server,
    clients: RwLock<HashMap<Hash, Arc<Client>>>,
    completed_handshakes: RwLock<HashSet<Hash>>,
    messages: Arc<MessageQueue<NetworkMessage>>,
    network_id: Hash,
    seed_mode: bool,
    shutdown: Arc<ShutdownSignal>,
    context: zmq::Context,
}

/// The overlay node.
pub struct Node {
    inner: Arc<Inner>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    running: AtomicBool,
}

impl Node {
    /// Prepares a node: restores the peer database (pruning stale
    /// entries) and configures — but does not bind — the server socket.
    pub fn new<P: AsRef<Path>>(
        path: P,
        bind_port: u16,
        seed_mode: bool,
        network_id: Hash,
    ) -> Result<Self, NetworkError> {
        let peer_db = PeerDatabase::instance(path)?;

        peer_db.prune()?;

        let context = zmq::Context::new();

        let server = Server::new(&context, bind_port)?;

        Ok(Self {
            inner: Arc::new(Inner {
                peer_db,
                server,
                clients: RwLock::new(HashMap::new()),
                completed_handshakes: RwLock::new(HashSet::new()),
                messages: Arc::new(MessageQueue::new()),
                network_id,
                seed_mode,
                shutdown: Arc::new(ShutdownSignal::new()),
                context,
            }),
            threads: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Binds the server, dials the seed nodes, and starts the overlay
    /// loops. Supplied seed nodes replace the built-in list.
    ///
    /// Fails with [`NetworkError::SeedConnect`] when no seed is reachable
    /// and the peer database has nothing else to offer — except in seed
    /// mode, where a node is allowed to sit and wait to be found.
    pub fn start(&self, seed_nodes: &[(String, u16)]) -> Result<(), NetworkError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.server.bind()?;

        info!(
            port = self.inner.server.port(),
            peer_id = %self.inner.peer_db.peer_id(),
            seed_mode = self.inner.seed_mode,
            "p2p node starting"
        );

        {
            let inner = Arc::clone(&self.inner);

            self.threads
                .lock()
                .push(std::thread::spawn(move || poller_loop(&inner)));
        }

        let mut connected_to_seed = false;

        let builtin: Vec<(String, u16)> = config::p2p::SEED_NODES
            .iter()
            .map(|(host, port)| ((*host).to_string(), *port))
            .collect();

        let dial_list = if seed_nodes.is_empty() {
            &builtin
        } else {
            seed_nodes
        };

        for (host, port) in dial_list {
            match self.inner.connect(host, *port) {
                Ok(()) | Err(NetworkError::DuplicateConnect) => {
                    connected_to_seed = true;
                }
                Err(e) => {
                    debug!(host = %host, port = *port, error = %e, "seed connection failed");
                }
            }
        }

        // Nobody to talk to and nobody to discover: the overlay cannot
        // bootstrap, unless we are the one doing the seeding.
        if !self.inner.seed_mode && !connected_to_seed && self.inner.peer_db.count()? == 0 {
            self.stop();

            return Err(NetworkError::SeedConnect);
        }

        for entry in [
            keepalive_loop as fn(&Arc<Inner>),
            peer_exchange_loop,
            connection_manager_loop,
        ] {
            let inner = Arc::clone(&self.inner);

            self.threads
                .lock()
                .push(std::thread::spawn(move || entry(&inner)));
        }

        Ok(())
    }

    /// Stops every loop and closes every connection. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) && self.threads.lock().is_empty() {
            return;
        }

        debug!("p2p node shutting down");

        self.inner.shutdown.trigger();

        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }

        self.inner.clients.write().clear();

        self.inner.server.stop();

        debug!("p2p node shutdown complete");
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Our stable peer ID.
    pub fn peer_id(&self) -> Hash {
        self.inner.peer_db.peer_id()
    }

    pub fn port(&self) -> u16 {
        self.inner.server.port()
    }

    /// The peer database handle.
    pub fn peers(&self) -> Arc<PeerDatabase> {
        Arc::clone(&self.inner.peer_db)
    }

    /// Application data delivered by the overlay.
    pub fn messages(&self) -> Arc<MessageQueue<NetworkMessage>> {
        Arc::clone(&self.inner.messages)
    }

    pub fn incoming_connections(&self) -> usize {
        self.inner.server.connections()
    }

    pub fn incoming_connected(&self) -> Vec<String> {
        self.inner.server.connected()
    }

    pub fn outgoing_connections(&self) -> usize {
        self.inner.clients.read().len()
    }

    pub fn outgoing_connected(&self) -> Vec<String> {
        self.inner
            .clients
            .read()
            .values()
            .map(|client| format!("{}:{}", client.host(), client.port()))
            .collect()
    }

    /// Inbound peers that have completed the handshake.
    pub fn registered_connections(&self) -> usize {
        self.inner.completed_handshakes.read().len()
    }

    /// Opens an outbound connection (and sends our handshake).
    pub fn connect(&self, host: &str, port: u16) -> Result<(), NetworkError> {
        self.inner.connect(host, port)
    }

    /// Broadcasts an application payload to every outbound peer.
    pub fn send(&self, packet: &DataPacket) {
        self.inner.broadcast(packet.to_bytes());
    }

    /// Replies to a registered inbound peer with an application payload.
    pub fn reply(&self, to: Hash, packet: &DataPacket) {
        self.inner
            .server
            .send(MessageEnvelope::to(to, packet.to_bytes()));
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Inner: connection management and packet handling
// ---------------------------------------------------------------------------

impl Inner {
    /// Dials a peer, handshakes, and tracks the client under the hash of
    /// its normalized host and port.
    fn connect(&self, host: &str, port: u16) -> Result<(), NetworkError> {
        let (host, port, connection_id) =
            normalize_host_port(host, Some(port), config::p2p::DEFAULT_BIND_PORT)?;

        if self.clients.read().contains_key(&connection_id) {
            return Err(NetworkError::DuplicateConnect);
        }

        debug!(%host, port, connection = %connection_id, "connecting to peer");

        let client = Client::connect(&self.context, &host, port)?;

        client.send(MessageEnvelope::broadcast(self.build_handshake().to_bytes()));

        self.clients
            .write()
            .insert(connection_id, Arc::new(client));

        Ok(())
    }

    fn build_handshake(&self) -> HandshakePacket {
        let mut packet = HandshakePacket::new(
            self.peer_db.peer_id(),
            self.server.port(),
            self.network_id,
        );

        packet.peers = self.build_peer_list();

        packet
    }

    fn build_peer_list(&self) -> Vec<NetworkPeer> {
        self.peer_db
            .peers(config::p2p::MAXIMUM_PEERS_EXCHANGED, None)
            .unwrap_or_default()
    }

    /// Broadcasts a payload to every outbound client.
    fn broadcast(&self, payload: Vec<u8>) {
        for client in self.clients.read().values() {
            client.send(MessageEnvelope::broadcast(payload.clone()));
        }
    }

    /// Decodes and dispatches one inbound message. Anything malformed or
    /// out of protocol is logged at trace and dropped.
    fn handle_incoming(&self, envelope: &MessageEnvelope, is_server: bool) {
        let packet = match Packet::from_bytes(&envelope.payload) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(from = %envelope.from, error = %e, "could not decode inbound packet");

                return;
            }
        };

        if packet.version() < config::p2p::MINIMUM_VERSION {
            trace!(from = %envelope.from, version = packet.version(), "peer speaks too old a protocol");

            return;
        }

        match packet {
            Packet::Handshake(packet) => self.handle_handshake(envelope, packet, is_server),
            Packet::Keepalive(packet) => self.handle_keepalive(envelope, packet, is_server),
            Packet::PeerExchange(packet) => self.handle_peer_exchange(envelope, packet, is_server),
            Packet::Data(packet) => self.handle_data(envelope, packet, is_server),
        }
    }

    fn handle_handshake(&self, envelope: &MessageEnvelope, packet: HandshakePacket, is_server: bool) {
        if is_server && self.completed_handshakes.read().contains(&envelope.from) {
            trace!(from = %envelope.from, "handshake already completed, protocol violation");

            return;
        }

        // We don't talk to ourselves.
        if packet.peer_id == self.peer_db.peer_id() || envelope.from == self.server.identity() {
            return;
        }

        self.record_peer(envelope, &packet.peer_id, packet.peer_port, &packet.network_id);

        self.record_gossiped_peers(&packet.peer_id, &packet.peers);

        if is_server {
            let reply = self.build_handshake();

            self.server
                .send(MessageEnvelope::to(envelope.from, reply.to_bytes()));

            self.completed_handshakes.write().insert(envelope.from);

            debug!(from = %envelope.from, peer = %packet.peer_id, "inbound handshake completed");
        }
    }

    fn handle_keepalive(&self, envelope: &MessageEnvelope, packet: KeepalivePacket, is_server: bool) {
        if !is_server {
            // Our outbound peer answered: they are alive.
            let _ = self.peer_db.touch(&packet.peer_id);

            return;
        }

        if !self.completed_handshakes.read().contains(&envelope.from) {
            trace!(from = %envelope.from, "keepalive before handshake, protocol violation");

            return;
        }

        if packet.peer_id == self.peer_db.peer_id() || envelope.from == self.server.identity() {
            return;
        }

        let reply = KeepalivePacket::new(self.peer_db.peer_id());

        self.server
            .send(MessageEnvelope::to(envelope.from, reply.to_bytes()));

        let _ = self.peer_db.touch(&packet.peer_id);
    }

    fn handle_peer_exchange(
        &self,
        envelope: &MessageEnvelope,
        packet: PeerExchangePacket,
        is_server: bool,
    ) {
        if is_server && !self.completed_handshakes.read().contains(&envelope.from) {
            trace!(from = %envelope.from, "peer exchange before handshake, protocol violation");

            return;
        }

        if packet.peer_id == self.peer_db.peer_id() || envelope.from == self.server.identity() {
            return;
        }

        self.record_peer(envelope, &packet.peer_id, packet.peer_port, &packet.network_id);

        self.record_gossiped_peers(&packet.peer_id, &packet.peers);

        if is_server {
            let mut reply = PeerExchangePacket::new(
                self.peer_db.peer_id(),
                self.server.port(),
                self.network_id,
            );

            reply.peers = self.build_peer_list();

            self.server
                .send(MessageEnvelope::to(envelope.from, reply.to_bytes()));
        }
    }

    fn handle_data(&self, envelope: &MessageEnvelope, packet: DataPacket, is_server: bool) {
        // Seeds spread peers, not data.
        if self.seed_mode {
            return;
        }

        if packet.network_id != self.network_id {
            trace!(from = %envelope.from, "data packet for a foreign network dropped");

            return;
        }

        if is_server && !self.completed_handshakes.read().contains(&envelope.from) {
            trace!(from = %envelope.from, "data before handshake, protocol violation");

            return;
        }

        if envelope.from == self.server.identity() {
            return;
        }

        self.messages.push(NetworkMessage {
            from: envelope.from,
            packet,
            is_server,
        });
    }

    /// Files the sending peer in the database, with its address taken
    /// from the transport.
    fn record_peer(&self, envelope: &MessageEnvelope, peer_id: &Hash, port: u16, network_id: &Hash) {
        let Ok(address) = envelope.peer_address.parse::<IpAddress>() else {
            trace!(address = %envelope.peer_address, "unparseable peer address");

            return;
        };

        let peer = NetworkPeer::new(address, *peer_id, port, *network_id);

        if let Err(e) = self.peer_db.add(&peer) {
            trace!(peer = %peer_id, error = %e, "could not record peer");
        }
    }

    /// Files a packet's gossiped peer list, skipping entries claiming to
    /// be the sender (the live record just written is fresher).
    fn record_gossiped_peers(&self, sender: &Hash, peers: &[NetworkPeer]) {
        for peer in peers {
            if peer.peer_id == *sender {
                continue;
            }

            if let Err(e) = self.peer_db.add(peer) {
                trace!(peer = %peer.peer_id, error = %e, "could not record gossiped peer");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loops
// ---------------------------------------------------------------------------

/// Drains the server and every client queue into the typed handlers.
fn poller_loop(inner: &Arc<Inner>) {
    loop {
        let mut handled = false;

        while let Some(envelope) = inner.server.messages().pop() {
            inner.handle_incoming(&envelope, true);

            handled = true;
        }

        let clients: Vec<Arc<Client>> = inner.clients.read().values().cloned().collect();

        for client in clients {
            while let Some(envelope) = client.messages().pop() {
                inner.handle_incoming(&envelope, false);

                handled = true;
            }
        }

        if !handled && inner.shutdown.wait_for(POLLING_INTERVAL) {
            break;
        }

        if inner.shutdown.is_stopping() {
            break;
        }
    }
}

/// Broadcasts keepalives outbound and pokes registered inbound peers.
fn keepalive_loop(inner: &Arc<Inner>) {
    let interval = Duration::from_millis(config::p2p::KEEPALIVE_INTERVAL_MS);

    loop {
        if inner.shutdown.wait_for(interval) {
            break;
        }

        let packet = KeepalivePacket::new(inner.peer_db.peer_id());

        let payload = packet.to_bytes();

        inner.broadcast(payload.clone());

        // The server cannot broadcast; poke each registered peer by name.
        let registered: Vec<Hash> = inner.completed_handshakes.read().iter().copied().collect();

        for to in registered {
            inner.server.send(MessageEnvelope::to(to, payload.clone()));
        }

        trace!("keepalives sent");
    }
}

/// Periodically gossips our peer list to every outbound peer.
fn peer_exchange_loop(inner: &Arc<Inner>) {
    let interval = Duration::from_millis(config::p2p::PEER_EXCHANGE_INTERVAL_MS);

    loop {
        if inner.shutdown.wait_for(interval) {
            break;
        }

        let mut packet = PeerExchangePacket::new(
            inner.peer_db.peer_id(),
            inner.server.port(),
            inner.network_id,
        );

        packet.peers = inner.build_peer_list();

        inner.broadcast(packet.to_bytes());

        trace!(peers = packet.peers.len(), "peer exchange sent");
    }
}

/// Evicts dead clients and tops the outbound connection count back up
/// from the peer database.
fn connection_manager_loop(inner: &Arc<Inner>) {
    let interval = Duration::from_millis(config::p2p::CONNECTION_MANAGER_INTERVAL_MS);

    loop {
        // Sweep disconnected clients first so their slots free up.
        {
            let mut clients = inner.clients.write();

            clients.retain(|id, client| {
                let alive = client.is_connected();

                if !alive {
                    trace!(connection = %id, "client no longer connected, destroying");
                }

                alive
            });
        }

        let current = inner.clients.read().len();

        let wanted = config::p2p::DEFAULT_CONNECTION_COUNT.saturating_sub(current);

        if wanted > 0 {
            // Seeds reach across every network to learn as much of the
            // world as possible; everyone else stays on their own.
            let network_filter = (!inner.seed_mode).then_some(inner.network_id);

            let candidates = inner
                .peer_db
                .peers(wanted, network_filter.as_ref())
                .unwrap_or_default();

            for peer in candidates {
                if peer.peer_id == inner.peer_db.peer_id() {
                    continue;
                }

                match inner.connect(&peer.address.to_string(), peer.port) {
                    Ok(()) | Err(NetworkError::DuplicateConnect) => {}
                    Err(e) => {
                        debug!(peer = %peer.peer_id, error = %e, "could not connect to peer");
                    }
                }
            }
        }

        if inner.shutdown.wait_for(interval) {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
        for _ in 0..500 {
            if predicate() {
                return;
            }

            std::thread::sleep(Duration::from_millis(10));
        }

        panic!("timed out waiting for {what}");
    }

    fn test_port() -> u16 {
        23_000 + (rand::random::<u16>() % 20_000)
    }

    fn spawn_node(dir: &tempfile::TempDir, port: u16, seed_mode: bool) -> Node {
        Node::new(
            dir.path().join(format!("p2p-{port}")),
            port,
            seed_mode,
            *config::NETWORK_ID,
        )
        .expect("node")
    }

    #[test]
    fn two_nodes_handshake_and_learn_each_other() {
        let dir = tempfile::tempdir().unwrap();

        let port_a = test_port();

        let node_a = spawn_node(&dir, port_a, true);
        node_a.start(&[]).expect("start a");

        let node_b = spawn_node(&dir, test_port(), true);
        node_b
            .start(&[("127.0.0.1".to_string(), port_a)])
            .expect("start b");

        assert_eq!(node_b.outgoing_connections(), 1);

        // A registers B after B's handshake, and B learns A's identity
        // from the handshake reply.
        wait_until("a to register b", || node_a.registered_connections() == 1);

        wait_until("b to learn a's peer id", || {
            node_b.peers().exists(&node_a.peer_id()).unwrap_or(false)
        });

        node_b.stop();
        node_a.stop();
    }

    #[test]
    fn data_before_handshake_is_dropped_but_handshake_recovers() {
        let dir = tempfile::tempdir().unwrap();

        let port = test_port();

        let node = spawn_node(&dir, port, false);

        // Not started through `start` (no reachable seeds in a test), so
        // drive the server directly.
        node.inner.server.bind().unwrap();

        {
            let inner = Arc::clone(&node.inner);

            node.threads
                .lock()
                .push(std::thread::spawn(move || poller_loop(&inner)));
        }

        node.running.store(true, Ordering::Release);

        let context = zmq::Context::new();

        let rogue = Client::connect(&context, "127.0.0.1", port).expect("connect");

        // Keepalive before any handshake: dropped, nothing registers.
        let keepalive = KeepalivePacket::new(crate::crypto::hash::random_hash());

        rogue.send(MessageEnvelope::broadcast(keepalive.to_bytes()));

        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(node.registered_connections(), 0);

        // A proper handshake completes the state machine and earns a
        // handshake reply.
        let handshake = HandshakePacket::new(
            crate::crypto::hash::random_hash(),
            9_999,
            *config::NETWORK_ID,
        );

        rogue.send(MessageEnvelope::broadcast(handshake.to_bytes()));

        wait_until("handshake to register", || node.registered_connections() == 1);

        wait_until("handshake reply to arrive", || {
            rogue
                .messages()
                .pop()
                .map(|reply| {
                    matches!(
                        Packet::from_bytes(&reply.payload),
                        Ok(Packet::Handshake(_))
                    )
                })
                .unwrap_or(false)
        });

        node.stop();
    }

    #[test]
    fn unstarted_node_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();

        let node = spawn_node(&dir, test_port(), false);

        assert!(!node.running());
        assert_eq!(node.outgoing_connections(), 0);
        assert_eq!(node.registered_connections(), 0);
    }
}
