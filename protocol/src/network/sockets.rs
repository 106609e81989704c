//! # Routing Sockets
//!
//! The encrypted transport under the overlay: one ROUTER server accepting
//! inbound peers, one DEALER client per outbound peer. All traffic is
//! CurveZMQ-encrypted; the server side uses the network's shared static
//! key (so any client can authenticate any server), each client side uses
//! a fresh ephemeral keypair per connection.
//!
//! Sockets are not thread-safe, so each one lives behind its own mutex
//! and is touched only by its inbound poller, its outbound sender, and
//! the occasional caller enqueueing a message. All socket I/O is
//! non-blocking with short condvar sleeps, so shutdown is prompt. Worker
//! threads hold only the pieces they poll — never the owning handle — so
//! dropping a server or client tears its threads down deterministically.
//!
//! Connection state comes from the transport's monitor events, delivered
//! over an in-process pair socket per monitored socket — monitors never
//! contend with the data path.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use curve25519_dalek::montgomery::MontgomeryPoint;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::codec::Serializable;
use crate::config;
use crate::crypto::hash::random_hash;
use crate::crypto::types::Hash;
use crate::network::envelope::MessageEnvelope;
use crate::network::NetworkError;

/// How long the I/O loops sleep when a socket has nothing for them.
const POLLING_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Shared primitives
// ---------------------------------------------------------------------------

/// A multi-producer queue with interior locking, for passing envelopes
/// between socket threads and the overlay.
#[derive(Debug, Default)]
pub struct MessageQueue<T> {
    items: Mutex<std::collections::VecDeque<T>>,
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }
}

/// The stop flag every worker loop polls. `wait_for` doubles as the
/// periodic sleep: it returns `true` the moment shutdown is signalled.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    stopping: Mutex<bool>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *self.stopping.lock() = true;

        self.condvar.notify_all();
    }

    pub fn is_stopping(&self) -> bool {
        *self.stopping.lock()
    }

    /// Sleeps up to `duration`, waking early on shutdown. Returns whether
    /// shutdown was signalled.
    pub fn wait_for(&self, duration: Duration) -> bool {
        let mut stopping = self.stopping.lock();

        if *stopping {
            return true;
        }

        self.condvar.wait_for(&mut stopping, duration);

        *stopping
    }
}

/// The network's static transport keypair: the configured Z85 secret and
/// the public half derived from it.
pub fn server_curve_keypair() -> Result<([u8; 32], [u8; 32]), NetworkError> {
    let secret = zmq::z85_decode(config::p2p::SERVER_SECRET_KEY)
        .map_err(|e| NetworkError::Zmq(format!("invalid server secret key: {e}")))?;

    let secret: [u8; 32] = secret
        .try_into()
        .map_err(|_| NetworkError::Zmq("server secret key is not 32 bytes".into()))?;

    let public = MontgomeryPoint::mul_base_clamped(secret).to_bytes();

    Ok((public, secret))
}

/// Drains every frame of at most one waiting message, without blocking.
/// Returns the frames and the transport-reported remote address.
fn recv_message_nonblocking(
    socket: &zmq::Socket,
) -> Result<Option<(Vec<Vec<u8>>, String)>, NetworkError> {
    let mut frames: Vec<Vec<u8>> = Vec::new();

    let mut peer_address = String::new();

    loop {
        let mut message = zmq::Message::new();

        match socket.recv(&mut message, zmq::DONTWAIT) {
            Ok(()) => {
                if peer_address.is_empty() {
                    if let Some(address) = message.gets("Peer-Address") {
                        peer_address = address.to_string();
                    }
                }

                let more = message.get_more();

                frames.push(message.to_vec());

                if !more {
                    return Ok(Some((frames, peer_address)));
                }
            }
            Err(zmq::Error::EAGAIN) if frames.is_empty() => return Ok(None),
            Err(zmq::Error::EAGAIN) => {
                // Mid-message: the rest is already queued, spin for it.
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Parses one monitor event message into its numeric event id and the
/// affected endpoint.
fn recv_monitor_event(socket: &zmq::Socket) -> Result<Option<(u16, String)>, NetworkError> {
    let mut event_frame = zmq::Message::new();

    match socket.recv(&mut event_frame, zmq::DONTWAIT) {
        Ok(()) => {}
        Err(zmq::Error::EAGAIN) => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut address_frame = zmq::Message::new();

    socket.recv(&mut address_frame, 0)?;

    if event_frame.len() < 2 {
        return Ok(None);
    }

    let event = u16::from_le_bytes([event_frame[0], event_frame[1]]);

    let address = String::from_utf8_lossy(&address_frame).to_string();

    Ok(Some((event, address)))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The ROUTER server socket plus its worker threads.
pub struct Server {
    identity: Hash,
    port: u16,
    socket: Arc<Mutex<zmq::Socket>>,
    incoming: Arc<MessageQueue<MessageEnvelope>>,
    outgoing: Arc<MessageQueue<MessageEnvelope>>,
    connections: Arc<RwLock<HashSet<String>>>,
    shutdown: Arc<ShutdownSignal>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    context: zmq::Context,
}

impl Server {
    /// Creates the server socket, configured but not yet bound.
    pub fn new(context: &zmq::Context, port: u16) -> Result<Self, NetworkError> {
        let socket = context.socket(zmq::ROUTER)?;

        let (_public, secret) = server_curve_keypair()?;

        socket.set_curve_server(true)?;

        socket.set_curve_secretkey(&secret)?;

        // An undeliverable routed message is an error we want to hear
        // about, not a silent drop.
        socket.set_router_mandatory(true)?;

        let identity = random_hash();

        socket.set_identity(identity.as_ref())?;

        socket.set_linger(0)?;

        Ok(Self {
            identity,
            port,
            socket: Arc::new(Mutex::new(socket)),
            incoming: Arc::new(MessageQueue::new()),
            outgoing: Arc::new(MessageQueue::new()),
            connections: Arc::new(RwLock::new(HashSet::new())),
            shutdown: Arc::new(ShutdownSignal::new()),
            threads: Mutex::new(Vec::new()),
            context: context.clone(),
        })
    }

    /// Binds the listening endpoint and starts the worker threads.
    pub fn bind(&self) -> Result<(), NetworkError> {
        let monitor_endpoint = format!("inproc://monitor-server-{}", self.identity);

        {
            let socket = self.socket.lock();

            socket
                .monitor(&monitor_endpoint, zmq::SocketEvent::ALL.to_raw() as i32)
                .map_err(NetworkError::from)?;

            socket
                .bind(&format!("tcp://*:{}", self.port))
                .map_err(|e| NetworkError::Bind(e.to_string()))?;
        }

        debug!(port = self.port, "server socket bound");

        let mut threads = self.threads.lock();

        threads.push(spawn_inbound_poller(
            Arc::clone(&self.socket),
            Arc::clone(&self.incoming),
            Arc::clone(&self.shutdown),
            None,
        ));

        threads.push(spawn_server_sender(
            Arc::clone(&self.socket),
            Arc::clone(&self.outgoing),
            Arc::clone(&self.shutdown),
        ));

        threads.push(spawn_monitor(
            self.context.clone(),
            monitor_endpoint,
            Arc::clone(&self.connections),
            None,
            Arc::clone(&self.shutdown),
        ));

        Ok(())
    }

    /// The server's socket identity.
    pub fn identity(&self) -> Hash {
        self.identity
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Messages received from connected clients.
    pub fn messages(&self) -> &Arc<MessageQueue<MessageEnvelope>> {
        &self.incoming
    }

    /// Routes a message to a connected client. The envelope must carry a
    /// recipient.
    pub fn send(&self, envelope: MessageEnvelope) {
        self.outgoing.push(envelope);
    }

    /// Transport endpoints currently connected inbound.
    pub fn connected(&self) -> Vec<String> {
        self.connections.read().iter().cloned().collect()
    }

    pub fn connections(&self) -> usize {
        self.connections.read().len()
    }

    pub fn stop(&self) {
        self.shutdown.trigger();

        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One outbound DEALER connection, with its worker threads.
pub struct Client {
    identity: Hash,
    host: String,
    port: u16,
    socket: Arc<Mutex<zmq::Socket>>,
    incoming: Arc<MessageQueue<MessageEnvelope>>,
    outgoing: Arc<MessageQueue<MessageEnvelope>>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<ShutdownSignal>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Client {
    /// Connects to a server, blocking until the transport reports the
    /// connection up or the connection timeout expires.
    pub fn connect(context: &zmq::Context, host: &str, port: u16) -> Result<Self, NetworkError> {
        let socket = context.socket(zmq::DEALER)?;

        // Fresh ephemeral keys per connection; only the server key is
        // static network-wide.
        let keypair = zmq::CurveKeyPair::new()?;

        let (server_public, _secret) = server_curve_keypair()?;

        socket.set_curve_serverkey(&server_public)?;

        socket.set_curve_publickey(&keypair.public_key)?;

        socket.set_curve_secretkey(&keypair.secret_key)?;

        let identity = random_hash();

        socket.set_identity(identity.as_ref())?;

        socket.set_linger(0)?;

        let monitor_endpoint = format!("inproc://monitor-client-{identity}");

        socket
            .monitor(&monitor_endpoint, zmq::SocketEvent::ALL.to_raw() as i32)
            .map_err(NetworkError::from)?;

        let client = Self {
            identity,
            host: host.to_string(),
            port,
            socket: Arc::new(Mutex::new(socket)),
            incoming: Arc::new(MessageQueue::new()),
            outgoing: Arc::new(MessageQueue::new()),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(ShutdownSignal::new()),
            threads: Mutex::new(Vec::new()),
        };

        let connect_gate = Arc::new((Mutex::new(false), Condvar::new()));

        // The monitor must be draining before the connect is issued, or
        // the connected event can slip past us.
        client.threads.lock().push(spawn_monitor(
            context.clone(),
            monitor_endpoint,
            Arc::new(RwLock::new(HashSet::new())),
            Some((Arc::clone(&client.connected), Arc::clone(&connect_gate))),
            Arc::clone(&client.shutdown),
        ));

        client
            .socket
            .lock()
            .connect(&format!("tcp://{host}:{port}"))
            .map_err(|e| NetworkError::Connect(e.to_string()))?;

        // Wait for the monitor to flip the gate.
        {
            let (lock, condvar) = &*connect_gate;

            let mut up = lock.lock();

            if !*up {
                condvar.wait_for(
                    &mut up,
                    Duration::from_millis(config::p2p::CONNECTION_TIMEOUT_MS),
                );
            }

            if !*up {
                drop(up);

                client.stop();

                return Err(NetworkError::ConnectTimeout);
            }
        }

        debug!(host, port, "client connected");

        let mut threads = client.threads.lock();

        threads.push(spawn_inbound_poller(
            Arc::clone(&client.socket),
            Arc::clone(&client.incoming),
            Arc::clone(&client.shutdown),
            Some((identity, host.to_string())),
        ));

        threads.push(spawn_client_sender(
            Arc::clone(&client.socket),
            Arc::clone(&client.outgoing),
            Arc::clone(&client.shutdown),
        ));

        drop(threads);

        Ok(client)
    }

    pub fn identity(&self) -> Hash {
        self.identity
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Messages received from the server.
    pub fn messages(&self) -> &Arc<MessageQueue<MessageEnvelope>> {
        &self.incoming
    }

    /// Enqueues a payload for the server.
    pub fn send(&self, envelope: MessageEnvelope) {
        self.outgoing.push(envelope);
    }

    pub fn stop(&self) {
        self.shutdown.trigger();

        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Worker loops
// ---------------------------------------------------------------------------

/// Drains inbound messages into the queue. On a server socket (`labels`
/// is `None`) the first frame is the sender identity; on a client socket
/// it supplies the fixed identity/address labels and messages are a
/// single payload frame.
fn spawn_inbound_poller(
    socket: Arc<Mutex<zmq::Socket>>,
    incoming: Arc<MessageQueue<MessageEnvelope>>,
    shutdown: Arc<ShutdownSignal>,
    labels: Option<(Hash, String)>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        let received = {
            let socket = socket.lock();

            recv_message_nonblocking(&socket)
        };

        match received {
            Ok(Some((frames, peer_address))) => match &labels {
                None if frames.len() == 2 => {
                    let Ok(from) = Hash::from_bytes(&frames[0]) else {
                        trace!("dropping message with a malformed identity frame");

                        continue;
                    };

                    incoming.push(MessageEnvelope {
                        from,
                        to: None,
                        subject: None,
                        peer_address,
                        payload: frames[1].clone(),
                    });
                }
                Some((identity, host)) if frames.len() == 1 => {
                    incoming.push(MessageEnvelope {
                        from: *identity,
                        to: None,
                        subject: None,
                        peer_address: host.clone(),
                        payload: frames[0].clone(),
                    });
                }
                _ => {
                    trace!(
                        frames = frames.len(),
                        "dropping message with unexpected frame count"
                    );
                }
            },
            Ok(None) => {
                if shutdown.wait_for(POLLING_INTERVAL) {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "inbound receive failed");

                if shutdown.wait_for(POLLING_INTERVAL) {
                    break;
                }
            }
        }
    })
}

/// Sends queued envelopes out a ROUTER socket as `[identity, payload]`
/// frame pairs, atomically under the socket mutex.
fn spawn_server_sender(
    socket: Arc<Mutex<zmq::Socket>>,
    outgoing: Arc<MessageQueue<MessageEnvelope>>,
    shutdown: Arc<ShutdownSignal>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        match outgoing.pop() {
            Some(envelope) => {
                let Some(to) = envelope.to else {
                    trace!("dropping unroutable server message with no recipient");

                    continue;
                };

                let socket = socket.lock();

                let result = socket
                    .send(to.as_bytes().as_slice(), zmq::SNDMORE)
                    .and_then(|_| socket.send(envelope.payload.as_slice(), 0));

                if let Err(e) = result {
                    // With mandatory routing this is how a vanished peer
                    // shows up.
                    trace!(to = %to, error = %e, "could not route message to peer");
                }
            }
            None => {
                if shutdown.wait_for(POLLING_INTERVAL) {
                    break;
                }
            }
        }
    })
}

/// Sends queued payloads out a DEALER socket.
fn spawn_client_sender(
    socket: Arc<Mutex<zmq::Socket>>,
    outgoing: Arc<MessageQueue<MessageEnvelope>>,
    shutdown: Arc<ShutdownSignal>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        match outgoing.pop() {
            Some(envelope) => {
                let socket = socket.lock();

                if let Err(e) = socket.send(envelope.payload.as_slice(), 0) {
                    trace!(error = %e, "client send failed");
                }
            }
            None => {
                if shutdown.wait_for(POLLING_INTERVAL) {
                    break;
                }
            }
        }
    })
}

type ConnectGate = (Arc<AtomicBool>, Arc<(Mutex<bool>, Condvar)>);

/// Follows a socket's monitor stream. Maintains the connected-endpoint
/// set; when a connect gate is supplied (client sockets), flips it on the
/// first successful connection.
fn spawn_monitor(
    context: zmq::Context,
    endpoint: String,
    connections: Arc<RwLock<HashSet<String>>>,
    gate: Option<ConnectGate>,
    shutdown: Arc<ShutdownSignal>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let monitor = match context.socket(zmq::PAIR) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "could not create monitor socket");

                return;
            }
        };

        if let Err(e) = monitor.connect(&endpoint) {
            warn!(error = %e, "could not connect monitor socket");

            return;
        }

        loop {
            match recv_monitor_event(&monitor) {
                Ok(Some((event, address))) => {
                    if event == zmq::SocketEvent::CONNECTED.to_raw()
                        || event == zmq::SocketEvent::ACCEPTED.to_raw()
                        || event == zmq::SocketEvent::HANDSHAKE_SUCCEEDED.to_raw()
                    {
                        trace!(%address, "transport connected");

                        connections.write().insert(address);

                        if let Some((connected, gate)) = &gate {
                            connected.store(true, Ordering::Release);

                            let (lock, condvar) = &**gate;

                            *lock.lock() = true;

                            condvar.notify_all();
                        }
                    } else if event == zmq::SocketEvent::DISCONNECTED.to_raw()
                        || event == zmq::SocketEvent::CLOSED.to_raw()
                    {
                        trace!(%address, "transport disconnected");

                        connections.write().remove(&address);

                        if let Some((connected, _)) = &gate {
                            connected.store(false, Ordering::Release);
                        }
                    }
                }
                Ok(None) | Err(_) => {
                    if shutdown.wait_for(POLLING_INTERVAL) {
                        break;
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
