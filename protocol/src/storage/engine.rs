//! # Storage Engine
//!
//! The transactional key-value environment every persistent store sits on:
//! one memory-mapped LMDB environment per database path, named
//! sub-databases inside it, a single writer at a time with any number of
//! concurrent snapshot readers.
//!
//! ## Environments are interned
//!
//! Opening the same path twice hands back the same environment — LMDB
//! forbids a second handle to the same map in one process. The intern
//! table keys environments by the SHA3 of their path and holds weak
//! references, so an environment lives exactly as long as somebody uses it.
//!
//! ## The map grows itself
//!
//! LMDB maps are fixed-size until resized. The simplified `get`/`put`/
//! `del` helpers on [`Database`] run an abort → expand → retry loop
//! whenever the map or transaction fills, so callers never see `MapFull`
//! out of those paths. Multi-write protocols (block commits) run the same
//! loop around their whole transaction. `expand` refuses to run while any
//! write transaction is open; the caller must abort first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use heed::types::Bytes;
use heed::{DatabaseFlags, EnvOpenOptions};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::codec::CodecError;
use crate::config;
use crate::crypto::hash::sha3;
use crate::crypto::types::Hash;

const MEGABYTE: usize = 1024 * 1024;

/// Failures from the storage layer. The chain-level not-found variants
/// live here too: the stores below are schema over this engine and share
/// its error surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("key not found")]
    NotFound,

    #[error("database is empty")]
    Empty,

    #[error("memory map is full")]
    MapFull,

    #[error("write transaction is full")]
    TxnFull,

    #[error("database is corrupted")]
    Corrupted,

    #[error("bad transaction handle")]
    BadTransaction,

    #[error("cannot expand the map while a write transaction is open")]
    ExpandBusy,

    #[error("block not found")]
    BlockNotFound,

    #[error("transaction not found")]
    TransactionNotFound,

    #[error("transaction output not found")]
    TransactionOutputNotFound,

    #[error("supplied transactions do not match the block's transaction set")]
    BlockTxnMismatch,

    #[error("supplied transactions are not in the block's transaction order")]
    BlockTxnOrder,

    #[error("a genesis block already exists")]
    GenesisAlreadyExists,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<heed::Error> for StorageError {
    fn from(error: heed::Error) -> Self {
        match error {
            heed::Error::Mdb(heed::MdbError::MapFull) => Self::MapFull,
            heed::Error::Mdb(heed::MdbError::TxnFull) => Self::TxnFull,
            heed::Error::Mdb(heed::MdbError::NotFound) => Self::NotFound,
            heed::Error::Mdb(heed::MdbError::Corrupted) => Self::Corrupted,
            heed::Error::Mdb(heed::MdbError::BadTxn) => Self::BadTransaction,
            heed::Error::Io(io) => Self::Io(io.to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

/// Encodes an integer key big-endian so that the lexicographic key order
/// of the store equals numeric order; range scans over block indexes and
/// timestamps depend on this.
pub fn integer_key(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Decodes a big-endian integer key.
pub fn decode_integer_key(bytes: &[u8]) -> Result<u64, StorageError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Database("integer key is not 8 bytes".into()))?;

    Ok(u64::from_be_bytes(array))
}

static ENVIRONMENTS: Lazy<Mutex<HashMap<Hash, Weak<Environment>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// One LMDB environment: a memory-mapped file holding any number of named
/// sub-databases.
pub struct Environment {
    env: heed::Env,
    id: Hash,
    path: PathBuf,
    growth_mb: usize,
    open_writers: AtomicUsize,
    expand_lock: Mutex<()>,
    databases: Mutex<HashMap<Hash, heed::Database<Bytes, Bytes>>>,
}

impl Environment {
    /// Opens (or reuses) the environment at `path`. The handle is interned
    /// by the SHA3 of the path: a second call with the same path returns
    /// the same environment.
    pub fn instance<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, StorageError> {
        let path = path.as_ref().to_path_buf();

        let id = sha3(path.to_string_lossy().as_bytes());

        let mut table = ENVIRONMENTS.lock();

        if let Some(existing) = table.get(&id).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        std::fs::create_dir_all(&path).map_err(|e| StorageError::Io(e.to_string()))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config::storage::DEFAULT_MAP_SIZE_MB * MEGABYTE)
                .max_dbs(config::storage::MAX_DATABASES)
                .open(&path)?
        };

        debug!(path = %path.display(), "opened storage environment");

        let environment = Arc::new(Self {
            env,
            id,
            path,
            growth_mb: config::storage::DEFAULT_GROWTH_FACTOR_MB,
            open_writers: AtomicUsize::new(0),
            expand_lock: Mutex::new(()),
            databases: Mutex::new(HashMap::new()),
        });

        table.insert(id, Arc::downgrade(&environment));

        Ok(environment)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> Hash {
        self.id
    }

    /// Opens (or reuses) a named sub-database. Databases are interned per
    /// environment by the SHA3 of their name.
    pub fn open_database(self: &Arc<Self>, name: &str) -> Result<Database, StorageError> {
        self.open_database_inner(name, false)
    }

    /// Opens a sub-database that keeps sorted duplicate values per key.
    pub fn open_database_dup(self: &Arc<Self>, name: &str) -> Result<Database, StorageError> {
        self.open_database_inner(name, true)
    }

    fn open_database_inner(
        self: &Arc<Self>,
        name: &str,
        duplicates: bool,
    ) -> Result<Database, StorageError> {
        let id = sha3(name.as_bytes());

        let mut databases = self.databases.lock();

        if let Some(inner) = databases.get(&id) {
            return Ok(Database {
                env: Arc::clone(self),
                inner: *inner,
                name: name.to_string(),
                duplicates,
            });
        }

        let mut options = self.env.database_options().types::<Bytes, Bytes>();

        options.name(name);

        if duplicates {
            options.flags(DatabaseFlags::DUP_SORT);
        }

        let inner = loop {
            let mut txn = self.env.write_txn()?;

            match options.create(&mut txn).map_err(StorageError::from) {
                Ok(db) => match txn.commit().map_err(StorageError::from) {
                    Ok(()) => break db,
                    Err(StorageError::MapFull | StorageError::TxnFull) => {
                        self.expand()?;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
                Err(StorageError::MapFull | StorageError::TxnFull) => {
                    drop(txn);
                    self.expand()?;
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        databases.insert(id, inner);

        Ok(Database {
            env: Arc::clone(self),
            inner,
            name: name.to_string(),
            duplicates,
        })
    }

    /// Begins the environment's exclusive write transaction.
    pub fn write(&self) -> Result<WriteTransaction<'_>, StorageError> {
        let txn = self.env.write_txn()?;

        self.open_writers.fetch_add(1, Ordering::AcqRel);

        Ok(WriteTransaction {
            txn: Some(txn),
            env: self,
        })
    }

    /// Begins a read snapshot. Readers never block the writer and see a
    /// consistent view for their whole lifetime.
    pub fn read(&self) -> Result<ReadTransaction<'_>, StorageError> {
        Ok(ReadTransaction {
            txn: self.env.read_txn()?,
        })
    }

    /// Grows the memory map by the configured growth factor. Fails with
    /// [`StorageError::ExpandBusy`] while any write transaction is open —
    /// the caller must abort its transaction, expand, and retry.
    pub fn expand(&self) -> Result<(), StorageError> {
        let _guard = self.expand_lock.lock();

        if self.open_writers.load(Ordering::Acquire) != 0 {
            return Err(StorageError::ExpandBusy);
        }

        let current = self.env.info().map_size;

        let target = current + self.growth_mb * MEGABYTE;

        unsafe {
            self.env.resize(target)?;
        }

        debug!(
            path = %self.path.display(),
            from = current,
            to = target,
            "expanded storage environment map"
        );

        Ok(())
    }

    /// The current size of the memory map, in bytes.
    pub fn map_size(&self) -> usize {
        self.env.info().map_size
    }

    /// Runs `operation` inside one write transaction, with the abort →
    /// expand → retry loop applied around the whole transaction. This is
    /// the loop multi-write protocols use so their writes stay atomic
    /// across an expansion.
    pub fn with_write_transaction<T>(
        &self,
        mut operation: impl FnMut(&mut WriteTransaction<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        loop {
            let mut txn = self.write()?;

            match operation(&mut txn) {
                Ok(value) => match txn.commit() {
                    Ok(()) => return Ok(value),
                    Err(StorageError::MapFull | StorageError::TxnFull) => {
                        trace!("write transaction commit hit a full map, expanding");

                        self.expand()?;
                    }
                    Err(e) => return Err(e),
                },
                Err(StorageError::MapFull | StorageError::TxnFull) => {
                    trace!("write transaction hit a full map, expanding");

                    drop(txn);

                    self.expand()?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let mut table = ENVIRONMENTS.lock();

        // Only remove the entry if it is ours (dangling); a new strong
        // entry under the same path must survive.
        if let Some(entry) = table.get(&self.id) {
            if entry.upgrade().is_none() {
                table.remove(&self.id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// The environment's single write transaction. Aborts automatically on
/// drop unless committed, releasing the write lock on every exit path.
pub struct WriteTransaction<'env> {
    txn: Option<heed::RwTxn<'env>>,
    env: &'env Environment,
}

impl<'env> WriteTransaction<'env> {
    pub fn commit(mut self) -> Result<(), StorageError> {
        let txn = self
            .txn
            .take()
            .ok_or(StorageError::BadTransaction)?;

        let result = txn.commit().map_err(StorageError::from);

        // `self.txn` is already None, so Drop will not decrement again.
        self.env.open_writers.fetch_sub(1, Ordering::AcqRel);

        result
    }

    pub fn abort(self) {
        // Drop does the work.
    }

    fn txn_mut(&mut self) -> Result<&mut heed::RwTxn<'env>, StorageError> {
        self.txn.as_mut().ok_or(StorageError::BadTransaction)
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if self.txn.take().is_some() {
            self.env.open_writers.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// A read snapshot.
pub struct ReadTransaction<'env> {
    txn: heed::RoTxn<'env>,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// A named sub-database handle. Cheap to clone; all handles to one name in
/// one environment refer to the same tree.
#[derive(Clone)]
pub struct Database {
    env: Arc<Environment>,
    inner: heed::Database<Bytes, Bytes>,
    name: String,
    duplicates: bool,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Whether the key exists.
    pub fn exists<K: AsRef<[u8]>>(&self, key: &K) -> Result<bool, StorageError> {
        let rtxn = self.env.read()?;

        Ok(self.inner.get(&rtxn.txn, key.as_ref())?.is_some())
    }

    /// Fetches a value. `NotFound` when the key is absent.
    pub fn get<K: AsRef<[u8]>>(&self, key: &K) -> Result<Vec<u8>, StorageError> {
        let rtxn = self.env.read()?;

        self.inner
            .get(&rtxn.txn, key.as_ref())?
            .map(<[u8]>::to_vec)
            .ok_or(StorageError::NotFound)
    }

    /// Stores a value, growing the map as needed. `MapFull` never escapes
    /// this helper.
    pub fn put<K: AsRef<[u8]>>(&self, key: &K, value: &[u8]) -> Result<(), StorageError> {
        let db = self.inner;

        self.env.with_write_transaction(|txn| {
            db.put(txn.txn_mut()?, key.as_ref(), value)
                .map_err(StorageError::from)
        })
    }

    /// Deletes a key (and, in a duplicate database, all of its values),
    /// growing the map as needed. Deleting an absent key is not an error.
    pub fn del<K: AsRef<[u8]>>(&self, key: &K) -> Result<(), StorageError> {
        let db = self.inner;

        self.env.with_write_transaction(|txn| {
            db.delete(txn.txn_mut()?, key.as_ref())
                .map(|_| ())
                .map_err(StorageError::from)
        })
    }

    /// Number of entries (duplicates counted individually).
    pub fn count(&self) -> Result<u64, StorageError> {
        let rtxn = self.env.read()?;

        Ok(self.inner.len(&rtxn.txn)?)
    }

    /// All keys, in sorted order.
    pub fn list_keys(&self) -> Result<Vec<Vec<u8>>, StorageError> {
        let rtxn = self.env.read()?;

        let mut keys = Vec::new();

        for entry in self.inner.iter(&rtxn.txn)? {
            let (key, _) = entry?;

            keys.push(key.to_vec());
        }

        Ok(keys)
    }

    /// Every entry, in key order.
    pub fn get_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let rtxn = self.env.read()?;

        let mut entries = Vec::new();

        for entry in self.inner.iter(&rtxn.txn)? {
            let (key, value) = entry?;

            entries.push((key.to_vec(), value.to_vec()));
        }

        Ok(entries)
    }

    /// The first entry whose key is greater than or equal to `key` —
    /// the nearest-match cursor positioning used for timestamp lookups and
    /// random output sampling.
    pub fn first_at_or_after<K: AsRef<[u8]>>(
        &self,
        key: &K,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError> {
        let rtxn = self.env.read()?;

        let mut range = self.inner.range(
            &rtxn.txn,
            &(
                std::ops::Bound::Included(key.as_ref()),
                std::ops::Bound::Unbounded,
            ),
        )?;

        match range.next() {
            Some(entry) => {
                let (found_key, value) = entry?;

                Ok(Some((found_key.to_vec(), value.to_vec())))
            }
            None => Ok(None),
        }
    }

    /// All values stored under one key of a duplicate database, in sorted
    /// order.
    pub fn get_duplicates<K: AsRef<[u8]>>(&self, key: &K) -> Result<Vec<Vec<u8>>, StorageError> {
        let rtxn = self.env.read()?;

        let mut values = Vec::new();

        if let Some(iter) = self.inner.get_duplicates(&rtxn.txn, key.as_ref())? {
            for entry in iter {
                let (_, value) = entry?;

                values.push(value.to_vec());
            }
        }

        Ok(values)
    }

    /// Deletes one exact (key, value) pair from a duplicate database.
    /// Returns whether the pair existed.
    pub fn del_duplicate<K: AsRef<[u8]>>(
        &self,
        key: &K,
        value: &[u8],
    ) -> Result<bool, StorageError> {
        let db = self.inner;

        self.env.with_write_transaction(|txn| {
            db.delete_one_duplicate(txn.txn_mut()?, key.as_ref(), value)
                .map_err(StorageError::from)
        })
    }

    // -- raw operations against a caller-owned transaction ------------------

    /// `put` against a caller-owned write transaction. Full-map errors
    /// surface here; the caller's retry loop owns the abort-and-expand.
    pub fn put_in(
        &self,
        txn: &mut WriteTransaction<'_>,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StorageError> {
        self.inner
            .put(txn.txn_mut()?, key, value)
            .map_err(StorageError::from)
    }

    /// `del` against a caller-owned write transaction.
    pub fn del_in(&self, txn: &mut WriteTransaction<'_>, key: &[u8]) -> Result<(), StorageError> {
        self.inner
            .delete(txn.txn_mut()?, key)
            .map(|_| ())
            .map_err(StorageError::from)
    }

    /// `get` against a caller-owned write transaction, observing its
    /// uncommitted writes.
    pub fn get_in(
        &self,
        txn: &mut WriteTransaction<'_>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .inner
            .get(txn.txn_mut()?, key)?
            .map(<[u8]>::to_vec))
    }

    pub fn supports_duplicates(&self) -> bool {
        self.duplicates
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_env() -> (tempfile::TempDir, Arc<Environment>) {
        let dir = tempfile::tempdir().expect("tempdir");

        let env = Environment::instance(dir.path().join("db")).expect("open environment");

        (dir, env)
    }

    #[test]
    fn put_get_del_round_trip() {
        let (_dir, env) = temp_env();
        let db = env.open_database("things").unwrap();

        assert_eq!(db.get(&b"missing"), Err(StorageError::NotFound));

        db.put(&b"alpha", b"one").unwrap();
        assert_eq!(db.get(&b"alpha").unwrap(), b"one");
        assert!(db.exists(&b"alpha").unwrap());
        assert_eq!(db.count().unwrap(), 1);

        db.del(&b"alpha").unwrap();
        assert!(!db.exists(&b"alpha").unwrap());
        assert_eq!(db.count().unwrap(), 0);
    }

    #[test]
    fn environments_are_interned_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        let a = Environment::instance(&path).unwrap();
        let b = Environment::instance(&path).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn databases_are_interned_by_name() {
        let (_dir, env) = temp_env();

        let a = env.open_database("blocks").unwrap();
        let b = env.open_database("blocks").unwrap();

        a.put(&b"key", b"value").unwrap();
        assert_eq!(b.get(&b"key").unwrap(), b"value");
    }

    #[test]
    fn expand_grows_the_map() {
        let (_dir, env) = temp_env();

        let before = env.map_size();
        env.expand().unwrap();

        assert_eq!(
            env.map_size(),
            before + config::storage::DEFAULT_GROWTH_FACTOR_MB * MEGABYTE
        );
    }

    #[test]
    fn expand_refuses_while_writer_open() {
        let (_dir, env) = temp_env();

        let txn = env.write().unwrap();
        assert_eq!(env.expand(), Err(StorageError::ExpandBusy));

        drop(txn);
        assert!(env.expand().is_ok());
    }

    #[test]
    fn dropped_transaction_aborts_its_writes() {
        let (_dir, env) = temp_env();
        let db = env.open_database("things").unwrap();

        {
            let mut txn = env.write().unwrap();
            db.put_in(&mut txn, b"ghost", b"value").unwrap();
            // Dropped without commit.
        }

        assert!(!db.exists(&b"ghost").unwrap());
    }

    #[test]
    fn committed_transaction_persists_its_writes() {
        let (_dir, env) = temp_env();
        let db = env.open_database("things").unwrap();

        let mut txn = env.write().unwrap();
        db.put_in(&mut txn, b"kept", b"value").unwrap();
        txn.commit().unwrap();

        assert_eq!(db.get(&b"kept").unwrap(), b"value");
    }

    #[test]
    fn first_at_or_after_finds_nearest_key() {
        let (_dir, env) = temp_env();
        let db = env.open_database("indexed").unwrap();

        db.put(&integer_key(10), b"ten").unwrap();
        db.put(&integer_key(20), b"twenty").unwrap();

        let (key, value) = db.first_at_or_after(&integer_key(11)).unwrap().unwrap();
        assert_eq!(decode_integer_key(&key).unwrap(), 20);
        assert_eq!(value, b"twenty");

        let (key, _) = db.first_at_or_after(&integer_key(10)).unwrap().unwrap();
        assert_eq!(decode_integer_key(&key).unwrap(), 10);

        assert!(db.first_at_or_after(&integer_key(21)).unwrap().is_none());
    }

    #[test]
    fn integer_keys_sort_numerically() {
        let (_dir, env) = temp_env();
        let db = env.open_database("ordered").unwrap();

        for value in [300u64, 2, 1_000_000, 40] {
            db.put(&integer_key(value), b"x").unwrap();
        }

        let keys: Vec<u64> = db
            .list_keys()
            .unwrap()
            .iter()
            .map(|k| decode_integer_key(k).unwrap())
            .collect();

        assert_eq!(keys, vec![2, 40, 300, 1_000_000]);
    }

    #[test]
    fn duplicate_database_stores_many_values_per_key() {
        let (_dir, env) = temp_env();
        let db = env.open_database_dup("stakes").unwrap();

        let mut txn = env.write().unwrap();
        db.put_in(&mut txn, b"candidate", b"stake-a").unwrap();
        db.put_in(&mut txn, b"candidate", b"stake-b").unwrap();
        db.put_in(&mut txn, b"candidate", b"stake-c").unwrap();
        txn.commit().unwrap();

        let values = db.get_duplicates(&b"candidate").unwrap();
        assert_eq!(values.len(), 3);
        assert!(values.contains(&b"stake-b".to_vec()));

        assert!(db.del_duplicate(&b"candidate", b"stake-b").unwrap());
        assert!(!db.del_duplicate(&b"candidate", b"stake-b").unwrap());
        assert_eq!(db.get_duplicates(&b"candidate").unwrap().len(), 2);
    }
}
