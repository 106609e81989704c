//! # Peer Database
//!
//! The persisted view of the network: everyone we have ever heard from,
//! keyed by their 32-byte random peer ID, and our own identity generated
//! once and kept forever.
//!
//! Inserts refuse ourselves (we are not our own peer) and anything stale
//! enough to fall outside the prune window. `peers()` hands back a
//! wall-clock-shuffled slice of the table so two consecutive callers get
//! different dialing orders — the shuffle is randomized per call but the
//! contents are exactly the table.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, trace};

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::config;
use crate::crypto::hash::random_hash;
use crate::crypto::types::Hash;
use crate::network::address::IpAddress;
use crate::network::NetworkError;
use crate::storage::engine::{Database, Environment};

/// The well-known key our own peer ID is filed under in the `local`
/// sub-database.
static PEER_ID_IDENTIFIER: Lazy<Hash> = Lazy::new(|| {
    "5440dd9b6683e3b2b0805eec3514ff3e23b7edea1bf29b434cd7a8447687650d"
        .parse()
        .expect("valid peer id identifier")
});

static INSTANCES: Lazy<Mutex<HashMap<Hash, Weak<PeerDatabase>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

// ---------------------------------------------------------------------------
// NetworkPeer
// ---------------------------------------------------------------------------

/// One known peer: where to reach them, who they claim to be, which
/// network they speak, and when we last heard from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NetworkPeer {
    pub address: IpAddress,
    pub peer_id: Hash,
    pub port: u16,
    pub network_id: Hash,
    pub last_seen: u64,
}

impl NetworkPeer {
    pub fn new(address: IpAddress, peer_id: Hash, port: u16, network_id: Hash) -> Self {
        Self {
            address,
            peer_id,
            port,
            network_id,
            last_seen: unix_now(),
        }
    }
}

impl Default for NetworkPeer {
    fn default() -> Self {
        Self {
            address: IpAddress::UNSPECIFIED,
            peer_id: Hash::empty(),
            port: 0,
            network_id: Hash::empty(),
            last_seen: 0,
        }
    }
}

impl Serializable for NetworkPeer {
    fn write(&self, writer: &mut Writer) {
        self.address.write(writer);

        writer.key(&self.peer_id);

        writer.varint(u64::from(self.port));

        writer.key(&self.network_id);

        writer.varint(self.last_seen);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            address: IpAddress::read(reader)?,
            peer_id: Hash::read(reader)?,
            port: reader.varint()? as u16,
            network_id: Hash::read(reader)?,
            last_seen: reader.varint()?,
        })
    }
}

// ---------------------------------------------------------------------------
// PeerDatabase
// ---------------------------------------------------------------------------

/// The persisted peer table plus our own identity.
pub struct PeerDatabase {
    id: Hash,
    peer_id: Hash,
    peerlist: Database,
    write_lock: Mutex<()>,
}

impl PeerDatabase {
    /// Opens (or reuses) the peer database at `path`, loading our peer ID
    /// or generating it on first run.
    pub fn instance<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, NetworkError> {
        let env = Environment::instance(&path)?;

        let id = env.id();

        let mut table = INSTANCES.lock();

        if let Some(existing) = table.get(&id).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let peerlist = env.open_database("peerlist")?;

        let local = env.open_database("local")?;

        let peer_id = match local.get(&*PEER_ID_IDENTIFIER) {
            Ok(value) => Hash::from_bytes(&value).map_err(crate::storage::StorageError::from)?,
            Err(_) => {
                let fresh = random_hash();

                debug!(peer_id = %fresh, "generated new peer id");

                fresh
            }
        };

        local.put(&*PEER_ID_IDENTIFIER, peer_id.as_ref())?;

        let database = Arc::new(Self {
            id,
            peer_id,
            peerlist,
            write_lock: Mutex::new(()),
        });

        table.insert(id, Arc::downgrade(&database));

        Ok(database)
    }

    /// Our own stable peer ID.
    pub fn peer_id(&self) -> Hash {
        self.peer_id
    }

    /// Inserts or refreshes a peer. Ourselves and peers last seen outside
    /// the prune window are refused.
    pub fn add(&self, peer: &NetworkPeer) -> Result<(), NetworkError> {
        if peer.peer_id == self.peer_id {
            return Err(NetworkError::PeerAddFailure(
                "refusing to add ourselves to the peer database".into(),
            ));
        }

        let cutoff = unix_now().saturating_sub(config::p2p::PEER_PRUNE_TIME);

        if peer.last_seen < cutoff {
            return Err(NetworkError::PeerAddFailure(
                "peer was last seen too far in the past".into(),
            ));
        }

        let _guard = self.write_lock.lock();

        trace!(peer = %peer.peer_id, address = %peer.address, "adding peer");

        self.peerlist.put(&peer.peer_id, &peer.to_bytes())?;

        Ok(())
    }

    pub fn exists(&self, peer_id: &Hash) -> Result<bool, NetworkError> {
        Ok(self.peerlist.exists(peer_id)?)
    }

    pub fn get(&self, peer_id: &Hash) -> Result<NetworkPeer, NetworkError> {
        let value = self.peerlist.get(peer_id)?;

        Ok(NetworkPeer::from_bytes(&value).map_err(crate::storage::StorageError::from)?)
    }

    pub fn del(&self, peer_id: &Hash) -> Result<(), NetworkError> {
        let _guard = self.write_lock.lock();

        trace!(peer = %peer_id, "deleting peer");

        self.peerlist.del(peer_id)?;

        Ok(())
    }

    pub fn count(&self) -> Result<u64, NetworkError> {
        Ok(self.peerlist.count()?)
    }

    pub fn peer_ids(&self) -> Result<Vec<Hash>, NetworkError> {
        let mut ids = Vec::new();

        for raw in self.peerlist.list_keys()? {
            ids.push(Hash::from_bytes(&raw).map_err(crate::storage::StorageError::from)?);
        }

        Ok(ids)
    }

    /// Marks a known peer as just heard from.
    pub fn touch(&self, peer_id: &Hash) -> Result<(), NetworkError> {
        let mut peer = self.get(peer_id)?;

        peer.last_seen = unix_now();

        self.add(&peer)
    }

    /// A shuffled slice of the table: up to `count` peers (zero means no
    /// limit), optionally restricted to one network ID. The shuffle is
    /// seeded from the wall clock, so consecutive callers dial in
    /// different orders.
    pub fn peers(
        &self,
        count: usize,
        network_id: Option<&Hash>,
    ) -> Result<Vec<NetworkPeer>, NetworkError> {
        let mut peers = Vec::new();

        for (_, value) in self.peerlist.get_all()? {
            let peer =
                NetworkPeer::from_bytes(&value).map_err(crate::storage::StorageError::from)?;

            if network_id.map_or(true, |id| peer.network_id == *id) {
                peers.push(peer);
            }
        }

        let clock_seed = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;

        peers.shuffle(&mut StdRng::seed_from_u64(clock_seed));

        if count != 0 && peers.len() > count {
            peers.truncate(count);
        }

        Ok(peers)
    }

    /// Drops every peer whose last-seen time has fallen outside the prune
    /// window.
    pub fn prune(&self) -> Result<(), NetworkError> {
        let cutoff = unix_now().saturating_sub(config::p2p::PEER_PRUNE_TIME);

        let stale: Vec<Hash> = self
            .peers(0, None)?
            .into_iter()
            .filter(|peer| peer.last_seen < cutoff)
            .map(|peer| peer.peer_id)
            .collect();

        if !stale.is_empty() {
            debug!(count = stale.len(), "pruning stale peers");
        }

        for peer_id in stale {
            self.del(&peer_id)?;
        }

        Ok(())
    }
}

impl Drop for PeerDatabase {
    fn drop(&mut self) {
        let mut table = INSTANCES.lock();

        if let Some(entry) = table.get(&self.id) {
            if entry.upgrade().is_none() {
                table.remove(&self.id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, Arc<PeerDatabase>) {
        let dir = tempfile::tempdir().expect("tempdir");

        let db = PeerDatabase::instance(dir.path().join("p2p")).expect("open peer database");

        (dir, db)
    }

    fn fresh_peer(network_id: Hash) -> NetworkPeer {
        NetworkPeer::new(
            "10.1.2.3".parse().unwrap(),
            random_hash(),
            12_897,
            network_id,
        )
    }

    #[test]
    fn peer_id_persists_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p2p");

        let first = PeerDatabase::instance(&path).unwrap().peer_id();

        // A second instance from the intern table.
        assert_eq!(PeerDatabase::instance(&path).unwrap().peer_id(), first);
    }

    #[test]
    fn add_get_touch_round_trip() {
        let (_dir, db) = temp_db();

        let peer = fresh_peer(*config::NETWORK_ID);

        db.add(&peer).unwrap();
        assert!(db.exists(&peer.peer_id).unwrap());
        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(db.get(&peer.peer_id).unwrap(), peer);

        db.touch(&peer.peer_id).unwrap();

        let touched = db.get(&peer.peer_id).unwrap();
        assert!(touched.last_seen + 1 >= unix_now());
    }

    #[test]
    fn adding_ourselves_fails() {
        let (_dir, db) = temp_db();

        let mut peer = fresh_peer(*config::NETWORK_ID);
        peer.peer_id = db.peer_id();

        assert!(matches!(
            db.add(&peer),
            Err(NetworkError::PeerAddFailure(_))
        ));
    }

    #[test]
    fn adding_stale_peers_fails() {
        let (_dir, db) = temp_db();

        let mut peer = fresh_peer(*config::NETWORK_ID);
        peer.last_seen = unix_now() - config::p2p::PEER_PRUNE_TIME - 10;

        assert!(matches!(
            db.add(&peer),
            Err(NetworkError::PeerAddFailure(_))
        ));
    }

    #[test]
    fn peers_filters_by_network_and_truncates() {
        let (_dir, db) = temp_db();

        let other_network = crate::crypto::hash::sha3(b"other network");

        for _ in 0..5 {
            db.add(&fresh_peer(*config::NETWORK_ID)).unwrap();
        }

        for _ in 0..3 {
            db.add(&fresh_peer(other_network)).unwrap();
        }

        assert_eq!(db.peers(0, None).unwrap().len(), 8);

        let ours = db.peers(0, Some(&*config::NETWORK_ID)).unwrap();
        assert_eq!(ours.len(), 5);
        assert!(ours.iter().all(|p| p.network_id == *config::NETWORK_ID));

        assert_eq!(db.peers(2, None).unwrap().len(), 2);
    }

    #[test]
    fn prune_removes_only_stale_entries() {
        let (_dir, db) = temp_db();

        let keep = fresh_peer(*config::NETWORK_ID);
        db.add(&keep).unwrap();

        // Sneak a stale peer straight past `add`'s gate.
        let mut stale = fresh_peer(*config::NETWORK_ID);
        stale.last_seen = 1;
        db.peerlist.put(&stale.peer_id, &stale.to_bytes()).unwrap();

        assert_eq!(db.count().unwrap(), 2);

        db.prune().unwrap();

        assert_eq!(db.count().unwrap(), 1);
        assert!(db.exists(&keep.peer_id).unwrap());
        assert!(!db.exists(&stale.peer_id).unwrap());
    }

    #[test]
    fn network_peer_wire_round_trip() {
        let peer = fresh_peer(*config::NETWORK_ID);

        assert_eq!(NetworkPeer::from_bytes(&peer.to_bytes()).unwrap(), peer);
    }
}
