//! # Chain Store
//!
//! The persistent blockchain: blocks and their secondary indexes,
//! committed transactions, the spent key-image set, and the global output
//! index, all inside one storage environment.
//!
//! ## Sub-databases
//!
//! | name                  | key                    | value                              |
//! |-----------------------|------------------------|------------------------------------|
//! | `blocks`              | block hash             | serialized block                   |
//! | `block_indexes`       | block index (8B BE)    | block hash                         |
//! | `block_timestamps`    | timestamp (8B BE)      | block hash                         |
//! | `transactions`        | tx hash                | serialized tx ‖ containing block   |
//! | `key_images`          | key image              | (empty)                            |
//! | `transaction_outputs` | output hash            | varint(unlock_block) ‖ output      |
//!
//! ## Write protocol
//!
//! A block lands atomically or not at all: one global write lock, one
//! storage transaction covering the reward transaction, every user
//! transaction, their key images and outputs, and the three block records.
//! A full map aborts the whole transaction, expands, and retries from the
//! top, so a half-written block is never visible.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::codec::{Reader, Serializable, Writer};
use crate::crypto::hash::{random_hash, sha3_keys};
use crate::crypto::types::{Hash, KeyImage};
use crate::storage::block::{Block, RewardTransaction};
use crate::storage::engine::{integer_key, Database, Environment, StorageError, WriteTransaction};
use crate::transaction::{Transaction, TransactionOutput};

/// Sampling in `get_random_outputs` gives up after this many probes per
/// requested output rather than spinning on a store where nothing
/// qualifies.
const RANDOM_OUTPUT_PROBE_LIMIT: usize = 64;

static INSTANCES: Lazy<Mutex<HashMap<Hash, Weak<ChainStore>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Handle to the node's blockchain database.
pub struct ChainStore {
    id: Hash,
    env: Arc<Environment>,
    blocks: Database,
    block_indexes: Database,
    block_timestamps: Database,
    transactions: Database,
    key_images: Database,
    transaction_outputs: Database,
    write_lock: Mutex<()>,
}

impl ChainStore {
    /// Opens (or reuses) the chain store at `path`. Interned by path like
    /// the environment underneath it.
    pub fn instance<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, StorageError> {
        let env = Environment::instance(&path)?;

        let id = env.id();

        let mut table = INSTANCES.lock();

        if let Some(existing) = table.get(&id).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let store = Arc::new(Self {
            id,
            blocks: env.open_database("blocks")?,
            block_indexes: env.open_database("block_indexes")?,
            block_timestamps: env.open_database("block_timestamps")?,
            transactions: env.open_database("transactions")?,
            key_images: env.open_database("key_images")?,
            transaction_outputs: env.open_database("transaction_outputs")?,
            env,
            write_lock: Mutex::new(()),
        });

        table.insert(id, Arc::downgrade(&store));

        Ok(store)
    }

    // -- block reads ---------------------------------------------------------

    pub fn block_exists(&self, block_hash: &Hash) -> Result<bool, StorageError> {
        self.blocks.exists(block_hash)
    }

    pub fn block_exists_at_index(&self, block_index: u64) -> Result<bool, StorageError> {
        self.block_indexes.exists(&integer_key(block_index))
    }

    /// Fetches a block and all of its user transactions.
    pub fn get_block(&self, block_hash: &Hash) -> Result<(Block, Vec<Transaction>), StorageError> {
        let block = self.get_block_record(block_hash)?;

        let mut transactions = Vec::with_capacity(block.transactions.len());

        for tx_hash in &block.transactions {
            let (transaction, _) = self
                .get_transaction(tx_hash)
                .map_err(|_| StorageError::TransactionNotFound)?;

            transactions.push(transaction);
        }

        Ok((block, transactions))
    }

    pub fn get_block_by_index(
        &self,
        block_index: u64,
    ) -> Result<(Block, Vec<Transaction>), StorageError> {
        let block_hash = self.get_block_hash(block_index)?;

        self.get_block(&block_hash)
    }

    /// The block whose timestamp is the nearest at or after `timestamp`,
    /// together with that actual timestamp.
    pub fn get_block_by_timestamp(&self, timestamp: u64) -> Result<(Block, u64), StorageError> {
        let (key, value) = self
            .block_timestamps
            .first_at_or_after(&integer_key(timestamp))?
            .ok_or(StorageError::BlockNotFound)?;

        let actual = crate::storage::engine::decode_integer_key(&key)?;

        let block_hash = Hash::from_bytes(&value)?;

        Ok((self.get_block_record(&block_hash)?, actual))
    }

    pub fn get_block_count(&self) -> Result<u64, StorageError> {
        self.blocks.count()
    }

    pub fn get_block_hash(&self, block_index: u64) -> Result<Hash, StorageError> {
        let value = self
            .block_indexes
            .get(&integer_key(block_index))
            .map_err(|_| StorageError::BlockNotFound)?;

        Ok(Hash::from_bytes(&value)?)
    }

    pub fn get_block_index(&self, block_hash: &Hash) -> Result<u64, StorageError> {
        Ok(self.get_block_record(block_hash)?.block_index)
    }

    fn get_block_record(&self, block_hash: &Hash) -> Result<Block, StorageError> {
        let value = self
            .blocks
            .get(block_hash)
            .map_err(|_| StorageError::BlockNotFound)?;

        Ok(Block::from_bytes(&value)?)
    }

    // -- transaction reads ---------------------------------------------------

    pub fn transaction_exists(&self, tx_hash: &Hash) -> Result<bool, StorageError> {
        self.transactions.exists(tx_hash)
    }

    /// Fetches a committed transaction and the hash of the block that
    /// contains it.
    pub fn get_transaction(&self, tx_hash: &Hash) -> Result<(Transaction, Hash), StorageError> {
        let value = self
            .transactions
            .get(tx_hash)
            .map_err(|_| StorageError::TransactionNotFound)?;

        let mut reader = Reader::new(&value);

        let transaction = Transaction::read(&mut reader)?;

        let block_hash = Hash::read(&mut reader)?;

        Ok((transaction, block_hash))
    }

    // -- output reads --------------------------------------------------------

    pub fn output_count(&self) -> Result<u64, StorageError> {
        self.transaction_outputs.count()
    }

    pub fn output_exists(&self, output_hash: &Hash) -> Result<bool, StorageError> {
        self.transaction_outputs.exists(output_hash)
    }

    /// Fetches an output and the unlock block of the transaction that
    /// created it.
    pub fn get_transaction_output(
        &self,
        output_hash: &Hash,
    ) -> Result<(TransactionOutput, u64), StorageError> {
        let value = self
            .transaction_outputs
            .get(output_hash)
            .map_err(|_| StorageError::TransactionOutputNotFound)?;

        decode_output_record(&value)
    }

    /// Vector form of [`Self::get_transaction_output`]: fails whole if any
    /// single output is missing.
    pub fn get_transaction_outputs(
        &self,
        output_hashes: &[Hash],
    ) -> Result<Vec<(TransactionOutput, u64)>, StorageError> {
        output_hashes
            .iter()
            .map(|hash| self.get_transaction_output(hash))
            .collect()
    }

    /// Draws `count` distinct outputs whose unlock block is at least
    /// `min_block_index`, by probing the output index at random cursor
    /// positions. The result is sorted by output hash.
    pub fn get_random_outputs(
        &self,
        min_block_index: u64,
        count: usize,
    ) -> Result<Vec<TransactionOutput>, StorageError> {
        if (self.output_count()? as usize) < count {
            return Err(StorageError::TransactionOutputNotFound);
        }

        let mut results: BTreeMap<Hash, TransactionOutput> = BTreeMap::new();

        let mut probes_left = count.saturating_mul(RANDOM_OUTPUT_PROBE_LIMIT);

        while results.len() < count {
            if probes_left == 0 {
                return Err(StorageError::TransactionOutputNotFound);
            }

            probes_left -= 1;

            let probe = random_hash();

            let Some((key, value)) = self.transaction_outputs.first_at_or_after(&probe)? else {
                continue;
            };

            let Ok((output, unlock_block)) = decode_output_record(&value) else {
                continue;
            };

            // Reject index corruption and outputs too young for the
            // caller's ring.
            if output.hash() != Hash::from_bytes(&key)? || unlock_block < min_block_index {
                continue;
            }

            results.entry(output.hash()).or_insert(output);
        }

        Ok(results.into_values().collect())
    }

    // -- key images ----------------------------------------------------------

    pub fn key_image_exists(&self, key_image: &KeyImage) -> Result<bool, StorageError> {
        self.key_images.exists(key_image)
    }

    /// Whether **any** of the given key images is already spent. This is
    /// the double-spend gate; per-image detail is in
    /// [`Self::key_images_exist`].
    pub fn any_key_image_exists(&self, key_images: &[KeyImage]) -> Result<bool, StorageError> {
        for key_image in key_images {
            if self.key_images.exists(key_image)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Per-image existence map, for diagnostics.
    pub fn key_images_exist(
        &self,
        key_images: &[KeyImage],
    ) -> Result<Vec<(KeyImage, bool)>, StorageError> {
        key_images
            .iter()
            .map(|image| Ok((*image, self.key_images.exists(image)?)))
            .collect()
    }

    // -- writes --------------------------------------------------------------

    /// Commits a block and its user transactions atomically.
    ///
    /// The supplied transactions must be exactly the block's transaction
    /// set, in the set's order — the concatenated-hash comparison
    /// guarantees every node processes the same transactions in the same
    /// order, which keeps the global output indexes identical across the
    /// network.
    pub fn put_block(
        &self,
        block: &Block,
        transactions: &[Transaction],
    ) -> Result<(), StorageError> {
        if transactions.len() != block.transactions.len() {
            return Err(StorageError::BlockTxnMismatch);
        }

        let block_tx_hashes: Vec<Hash> = block.transactions.iter().copied().collect();

        let supplied_hashes: Vec<Hash> = transactions.iter().map(Transaction::hash).collect();

        if sha3_keys(&block_tx_hashes) != sha3_keys(&supplied_hashes) {
            return Err(StorageError::BlockTxnOrder);
        }

        if block.is_genesis() && self.block_exists_at_index(0)? {
            return Err(StorageError::GenesisAlreadyExists);
        }

        let _guard = self.write_lock.lock();

        let block_hash = block.hash();

        self.env.with_write_transaction(|txn| {
            self.put_reward_transaction_in(txn, &block.reward_tx, &block_hash)?;

            for transaction in transactions {
                self.put_transaction_in(txn, transaction, &block_hash)?;
            }

            self.blocks
                .put_in(txn, block_hash.as_ref(), &block.to_bytes())?;

            self.block_indexes
                .put_in(txn, &integer_key(block.block_index), block_hash.as_ref())?;

            self.block_timestamps
                .put_in(txn, &integer_key(block.timestamp), block_hash.as_ref())?;

            Ok(())
        })?;

        info!(
            block = %block_hash,
            index = block.block_index,
            transactions = transactions.len(),
            "committed block"
        );

        Ok(())
    }

    fn put_reward_transaction_in(
        &self,
        txn: &mut WriteTransaction<'_>,
        reward_tx: &RewardTransaction,
        block_hash: &Hash,
    ) -> Result<(), StorageError> {
        let transaction = match reward_tx {
            RewardTransaction::Genesis(tx) => Transaction::Genesis(tx.clone()),
            RewardTransaction::StakerReward(tx) => Transaction::StakerReward(tx.clone()),
        };

        self.put_transaction_in(txn, &transaction, block_hash)
    }

    /// Writes one transaction: the record itself (with its containing
    /// block appended), its key images into the spent set, and its outputs
    /// into the global output index.
    fn put_transaction_in(
        &self,
        txn: &mut WriteTransaction<'_>,
        transaction: &Transaction,
        block_hash: &Hash,
    ) -> Result<(), StorageError> {
        let tx_hash = transaction.hash();

        let mut writer = Writer::new();

        transaction.write(&mut writer);

        writer.key(block_hash);

        self.transactions
            .put_in(txn, tx_hash.as_ref(), writer.data())?;

        for key_image in transaction.key_images() {
            self.key_images.put_in(txn, key_image.as_ref(), &[])?;
        }

        let unlock_block = transaction.unlock_block();

        for output in transaction.outputs() {
            let mut record = Writer::new();

            record.varint(unlock_block);

            output.write(&mut record);

            self.transaction_outputs
                .put_in(txn, output.hash().as_ref(), record.data())?;
        }

        trace!(tx = %tx_hash, block = %block_hash, "stored transaction");

        Ok(())
    }

    /// Rolls the chain back so that `to_index` blocks remain: every block
    /// with index ≥ `to_index` is deleted, newest first, together with its
    /// transactions, outputs and key images. Each block is removed in its
    /// own expandable transaction.
    pub fn rewind(&self, to_index: u64) -> Result<(), StorageError> {
        if !self.block_exists_at_index(to_index)? {
            return Err(StorageError::BlockNotFound);
        }

        let _guard = self.write_lock.lock();

        let block_count = self.get_block_count()?;

        for index in (to_index..block_count).rev() {
            self.del_block(index)?;
        }

        info!(to_index, "rewound chain");

        Ok(())
    }

    fn del_block(&self, block_index: u64) -> Result<(), StorageError> {
        let (block, transactions) = self.get_block_by_index(block_index)?;

        let block_hash = block.hash();

        self.env.with_write_transaction(|txn| {
            for transaction in &transactions {
                self.del_transaction_in(txn, transaction)?;
            }

            let reward = match &block.reward_tx {
                RewardTransaction::Genesis(tx) => Transaction::Genesis(tx.clone()),
                RewardTransaction::StakerReward(tx) => Transaction::StakerReward(tx.clone()),
            };

            self.del_transaction_in(txn, &reward)?;

            self.block_timestamps
                .del_in(txn, &integer_key(block.timestamp))?;

            self.block_indexes
                .del_in(txn, &integer_key(block.block_index))?;

            self.blocks.del_in(txn, block_hash.as_ref())?;

            Ok(())
        })?;

        debug!(block = %block_hash, index = block_index, "deleted block");

        Ok(())
    }

    fn del_transaction_in(
        &self,
        txn: &mut WriteTransaction<'_>,
        transaction: &Transaction,
    ) -> Result<(), StorageError> {
        for key_image in transaction.key_images() {
            self.key_images.del_in(txn, key_image.as_ref())?;
        }

        for output in transaction.outputs() {
            self.transaction_outputs
                .del_in(txn, output.hash().as_ref())?;
        }

        self.transactions
            .del_in(txn, transaction.hash().as_ref())
    }

    pub fn id(&self) -> Hash {
        self.id
    }
}

impl Drop for ChainStore {
    fn drop(&mut self) {
        let mut table = INSTANCES.lock();

        if let Some(entry) = table.get(&self.id) {
            if entry.upgrade().is_none() {
                table.remove(&self.id);
            }
        }
    }
}

fn decode_output_record(value: &[u8]) -> Result<(TransactionOutput, u64), StorageError> {
    let mut reader = Reader::new(value);

    let unlock_block = reader.varint()?;

    let output = TransactionOutput::read(&mut reader)?;

    Ok((output, unlock_block))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
