//! # Staking Engine
//!
//! The registry of candidates, stakers and stakes, and the deterministic
//! election that turns it into each round's producers and validators.
//!
//! ## The election is a pure function of the chain
//!
//! Every node runs the election locally and must arrive at the same
//! result. All randomness is drawn from the SHA3 of the previous round's
//! block hashes, extended per draw; candidates are enumerated in
//! lexicographic key order; ties cannot happen because the cumulative
//! weight walk is ordered. Wall clocks, thread timing and iteration order
//! of in-memory maps play no part.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Weak};

use num_bigint::BigUint;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::codec::{Serializable, Writer};
use crate::config;
use crate::crypto::hash::{sha3, sha3_keys};
use crate::crypto::keys;
use crate::crypto::types::{Hash, PublicKey};
use crate::staking::records::{Candidate, Stake, Staker};
use crate::storage::engine::{Database, Environment, StorageError};
use crate::transaction::{
    CommittedRecallStakeTransaction, CommittedStakeTransaction, StakeRefundTransaction,
    StakerRewardTransaction,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StakingError {
    #[error("stake transaction version {0} is not recognized")]
    InvalidVersion(u64),

    #[error("candidate already exists")]
    CandidateAlreadyExists,

    #[error("candidate not found")]
    CandidateNotFound,

    #[error("candidacy amount is not the required amount")]
    CandidateAmountInvalid,

    #[error("staker not found")]
    StakerNotFound,

    #[error("stake amount is below the minimum")]
    StakeAmount,

    #[error("no matching stake record")]
    StakeNotFound,

    #[error("refund does not reference the recall transaction")]
    RefundMismatch,

    #[error("recall view signature is invalid")]
    RecallViewSignature,

    #[error("recall spend signature is invalid")]
    RecallSpendSignature,

    #[error("{actual} permanent candidates configured, {required} required")]
    InsufficientPermanentCandidates { required: usize, actual: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

static INSTANCES: Lazy<Mutex<HashMap<Hash, Weak<StakingEngine>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Handle to the node's staking registry.
pub struct StakingEngine {
    id: Hash,
    env: Arc<Environment>,
    candidates: Database,
    stakers: Database,
    stakes: Database,
    write_lock: Mutex<()>,
}

impl StakingEngine {
    /// Opens (or reuses) the staking registry at `path`.
    pub fn instance<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, StakingError> {
        let env = Environment::instance(&path)?;

        let id = env.id();

        let mut table = INSTANCES.lock();

        if let Some(existing) = table.get(&id).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let engine = Arc::new(Self {
            id,
            candidates: env.open_database("candidates")?,
            stakers: env.open_database("stakers")?,
            stakes: env.open_database_dup("stakes")?,
            env,
            write_lock: Mutex::new(()),
        });

        table.insert(id, Arc::downgrade(&engine));

        Ok(engine)
    }

    // -- candidates ----------------------------------------------------------

    pub fn candidate_exists(&self, candidate_key: &PublicKey) -> Result<bool, StakingError> {
        Ok(self.candidates.exists(candidate_key)?)
    }

    pub fn get_candidate(&self, candidate_key: &PublicKey) -> Result<Candidate, StakingError> {
        let value = self
            .candidates
            .get(candidate_key)
            .map_err(|_| StakingError::CandidateNotFound)?;

        Ok(Candidate::from_bytes(&value).map_err(StorageError::from)?)
    }

    pub fn add_candidate(&self, candidate: &Candidate) -> Result<(), StakingError> {
        self.candidates
            .put(&candidate.candidate_public_key, &candidate.to_bytes())?;

        Ok(())
    }

    pub fn delete_candidate(&self, candidate_key: &PublicKey) -> Result<(), StakingError> {
        self.candidates.del(candidate_key)?;

        // Any votes for the candidate go with them.
        self.stakes.del(candidate_key)?;

        Ok(())
    }

    /// All candidate keys, in lexicographic order.
    pub fn get_candidates(&self) -> Result<Vec<PublicKey>, StakingError> {
        let mut keys = Vec::new();

        for raw in self.candidates.list_keys()? {
            keys.push(PublicKey::from_bytes(&raw).map_err(StorageError::from)?);
        }

        Ok(keys)
    }

    /// All stakes voting for one candidate.
    pub fn get_candidate_stakes(&self, candidate_key: &PublicKey) -> Result<Vec<Stake>, StakingError> {
        let mut stakes = Vec::new();

        for raw in self.stakes.get_duplicates(candidate_key)? {
            stakes.push(Stake::from_bytes(&raw).map_err(StorageError::from)?);
        }

        Ok(stakes)
    }

    /// A candidate's election weight: the candidacy deposit plus every
    /// active vote. Unknown candidates weigh nothing.
    pub fn get_candidate_votes(&self, candidate_key: &PublicKey) -> Result<u64, StakingError> {
        let candidate = match self.get_candidate(candidate_key) {
            Ok(candidate) => candidate,
            Err(StakingError::CandidateNotFound) => return Ok(0),
            Err(e) => return Err(e),
        };

        let votes: u64 = self
            .get_candidate_stakes(candidate_key)?
            .iter()
            .map(|stake| stake.stake)
            .sum();

        Ok(candidate.total_stake.saturating_add(votes))
    }

    // -- stakers -------------------------------------------------------------

    pub fn get_staker(&self, staker_id: &Hash) -> Result<Staker, StakingError> {
        let value = self
            .stakers
            .get(staker_id)
            .map_err(|_| StakingError::StakerNotFound)?;

        Ok(Staker::from_bytes(&value).map_err(StorageError::from)?)
    }

    pub fn add_staker(&self, staker: &Staker) -> Result<(), StakingError> {
        self.stakers.put(&staker.id(), &staker.to_bytes())?;

        Ok(())
    }

    pub fn delete_staker(&self, staker_id: &Hash) -> Result<(), StakingError> {
        self.stakers.del(staker_id)?;

        Ok(())
    }

    /// All staker ids, in lexicographic order.
    pub fn get_stakers(&self) -> Result<Vec<Hash>, StakingError> {
        let mut ids = Vec::new();

        for raw in self.stakers.list_keys()? {
            ids.push(Hash::from_bytes(&raw).map_err(StorageError::from)?);
        }

        Ok(ids)
    }

    /// Every stake one staker has placed, grouped by candidate.
    pub fn get_staker_stakes(
        &self,
        staker_id: &Hash,
    ) -> Result<BTreeMap<PublicKey, Vec<Stake>>, StakingError> {
        let mut grouped: BTreeMap<PublicKey, Vec<Stake>> = BTreeMap::new();

        for candidate_key in self.get_candidates()? {
            for stake in self.get_candidate_stakes(&candidate_key)? {
                if stake.id() == *staker_id {
                    grouped.entry(candidate_key).or_default().push(stake);
                }
            }
        }

        Ok(grouped)
    }

    /// The total one staker has voted onto one candidate.
    pub fn get_staker_candidate_votes(
        &self,
        staker_id: &Hash,
        candidate_key: &PublicKey,
    ) -> Result<u64, StakingError> {
        Ok(self
            .get_candidate_stakes(candidate_key)?
            .iter()
            .filter(|stake| stake.id() == *staker_id)
            .map(|stake| stake.stake)
            .sum())
    }

    // -- stake lifecycle -----------------------------------------------------

    /// Applies a committed STAKE transaction to the registry.
    ///
    /// Version 1 proposes a candidacy: the candidate must be new and the
    /// amount must be exactly the candidacy deposit. Version 2 votes for
    /// an existing candidate with at least the minimum stake.
    pub fn add_stake(&self, tx: &CommittedStakeTransaction) -> Result<(), StakingError> {
        let _guard = self.write_lock.lock();

        match tx.prefix.version {
            1 => {
                if self.candidate_exists(&tx.data.candidate_public_key)? {
                    return Err(StakingError::CandidateAlreadyExists);
                }

                if tx.data.stake_amount != config::consensus::REQUIRED_CANDIDACY_AMOUNT {
                    return Err(StakingError::CandidateAmountInvalid);
                }

                let candidate = Candidate::new(
                    tx.data.candidate_public_key,
                    tx.data.staker_public_view_key,
                    tx.data.staker_public_spend_key,
                    tx.data.stake_amount,
                );

                self.add_candidate(&candidate)?;

                info!(candidate = %candidate.candidate_public_key, "registered candidate");

                Ok(())
            }
            2 => {
                if !self.candidate_exists(&tx.data.candidate_public_key)? {
                    return Err(StakingError::CandidateNotFound);
                }

                if tx.data.stake_amount < config::consensus::MINIMUM_STAKE_AMOUNT {
                    return Err(StakingError::StakeAmount);
                }

                self.record_stake(
                    &tx.data.candidate_public_key,
                    &tx.data.staker_public_view_key,
                    &tx.data.staker_public_spend_key,
                    tx.data.stake_amount,
                )
            }
            other => Err(StakingError::InvalidVersion(other)),
        }
    }

    /// Records a vote: the stake record under the candidate, and the
    /// staker record so the stake can be recalled and rewarded later.
    pub fn record_stake(
        &self,
        candidate_key: &PublicKey,
        public_view_key: &PublicKey,
        public_spend_key: &PublicKey,
        amount: u64,
    ) -> Result<(), StakingError> {
        let stake = Stake::new(*candidate_key, *public_view_key, *public_spend_key, amount);

        self.env.with_write_transaction(|txn| {
            self.stakes
                .put_in(txn, candidate_key.as_ref(), &stake.to_bytes())?;

            // First stake creates the staker; later ones leave the record
            // (and its accrued balance) alone.
            if self.stakers.get_in(txn, stake.id().as_ref())?.is_none() {
                let staker = Staker::new(*public_view_key, *public_spend_key);

                self.stakers
                    .put_in(txn, staker.id().as_ref(), &staker.to_bytes())?;
            }

            Ok(())
        })?;

        debug!(candidate = %candidate_key, amount, "recorded stake");

        Ok(())
    }

    /// Reverses a prior stake, given the recall transaction and the refund
    /// that proves the funds went back to the staker.
    ///
    /// The pair is validated together: the refund must reference the
    /// recall by hash, the staker must exist, both recall signatures must
    /// verify over the recall digest against the staker's recorded keys,
    /// and a stake record matching (candidate, staker, amount) must exist.
    pub fn recall_stake(
        &self,
        recall_tx: &CommittedRecallStakeTransaction,
        refund_tx: &StakeRefundTransaction,
    ) -> Result<(), StakingError> {
        if refund_tx.recall_stake_tx != recall_tx.hash() {
            return Err(StakingError::RefundMismatch);
        }

        let _guard = self.write_lock.lock();

        let staker = self.get_staker(&recall_tx.data.staker_id)?;

        let digest = recall_tx.digest();

        if !keys::check_signature(&digest, &staker.public_view_key, &recall_tx.data.view_signature) {
            return Err(StakingError::RecallViewSignature);
        }

        if !keys::check_signature(
            &digest,
            &staker.public_spend_key,
            &recall_tx.data.spend_signature,
        ) {
            return Err(StakingError::RecallSpendSignature);
        }

        let candidate_key = recall_tx.data.candidate_public_key;

        let target = self
            .get_candidate_stakes(&candidate_key)?
            .into_iter()
            .find(|stake| {
                stake.id() == recall_tx.data.staker_id && stake.stake == recall_tx.data.stake_amount
            })
            .ok_or(StakingError::StakeNotFound)?;

        self.stakes
            .del_duplicate(&candidate_key, &target.to_bytes())?;

        // Remove the staker record once their last stake is gone.
        if self.get_staker_stakes(&recall_tx.data.staker_id)?.is_empty() {
            self.delete_staker(&recall_tx.data.staker_id)?;
        }

        info!(
            candidate = %candidate_key,
            staker = %recall_tx.data.staker_id,
            amount = recall_tx.data.stake_amount,
            "recalled stake"
        );

        Ok(())
    }

    /// Applies a committed staker reward transaction: outputs credit each
    /// staker's accrued balance, penalties debit it (saturating at zero).
    /// Entries naming unknown stakers are skipped.
    pub fn process_staker_tx(&self, tx: &StakerRewardTransaction) -> Result<(), StakingError> {
        let _guard = self.write_lock.lock();

        for output in &tx.staker_outputs {
            match self.get_staker(&output.staker_id) {
                Ok(mut staker) => {
                    staker.balance = staker.balance.saturating_add(output.amount);

                    self.stakers.put(&output.staker_id, &staker.to_bytes())?;
                }
                Err(StakingError::StakerNotFound) => {
                    trace!(staker = %output.staker_id, "reward for unknown staker skipped");
                }
                Err(e) => return Err(e),
            }
        }

        for penalty in &tx.staker_penalties {
            match self.get_staker(&penalty.staker_id) {
                Ok(mut staker) => {
                    staker.balance = staker.balance.saturating_sub(penalty.amount);

                    self.stakers.put(&penalty.staker_id, &staker.to_bytes())?;
                }
                Err(StakingError::StakerNotFound) => {
                    trace!(staker = %penalty.staker_id, "penalty for unknown staker skipped");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    // -- the election --------------------------------------------------------

    /// Derives the election seed from the previous round's block hashes:
    /// the seed hash, its 256-bit integer value, and whether that value is
    /// even.
    pub fn calculate_election_seed(last_round_blocks: &[Hash]) -> (Hash, BigUint, bool) {
        let seed = sha3_keys(last_round_blocks);

        let value = BigUint::from_bytes_be(seed.as_bytes());

        let evenness = !value.bit(0);

        (seed, value, evenness)
    }

    /// Elects the next round's producers and validators.
    ///
    /// Permanent candidates are seated first in both roles, consuming one
    /// slot each. The remaining slots are filled by weighted sampling over
    /// the registered candidates, driven by successive SHA3 extensions of
    /// the seed. A candidate drawn for both roles keeps the producer seat;
    /// the validator slot is re-drawn from the remaining pool. The seed's
    /// evenness decides which role draws first.
    pub fn run_election(
        &self,
        last_round_blocks: &[Hash],
        maximum_keys: usize,
    ) -> Result<(Vec<PublicKey>, Vec<PublicKey>), StakingError> {
        let permanent = &*config::PERMANENT_CANDIDATES;

        if permanent.len() < config::consensus::MINIMUM_PERMANENT_CANDIDATES {
            return Err(StakingError::InsufficientPermanentCandidates {
                required: config::consensus::MINIMUM_PERMANENT_CANDIDATES,
                actual: permanent.len(),
            });
        }

        let (seed, _value, evenness) = Self::calculate_election_seed(last_round_blocks);

        // The weighted pool, in lexicographic candidate order. Permanent
        // candidates are seated already and never drawn.
        let mut pool: Vec<(PublicKey, u64)> = Vec::new();

        for candidate_key in self.get_candidates()? {
            if permanent.contains(&candidate_key) {
                continue;
            }

            let votes = self.get_candidate_votes(&candidate_key)?;

            if votes > 0 {
                pool.push((candidate_key, votes));
            }
        }

        let slots = maximum_keys.saturating_sub(permanent.len());

        let mut counter: u64 = 0;

        let mut draw = |pool: &mut Vec<(PublicKey, u64)>, count: usize| -> Vec<PublicKey> {
            let mut drawn = Vec::new();

            while drawn.len() < count && !pool.is_empty() {
                let total: u64 = pool.iter().map(|(_, votes)| votes).sum();

                if total == 0 {
                    break;
                }

                let mut writer = Writer::new();

                writer.key(&seed);

                writer.varint(counter);

                counter += 1;

                let extension = sha3(writer.data());

                let target = BigUint::from_bytes_be(extension.as_bytes()) % BigUint::from(total);

                let mut cumulative = BigUint::default();

                let mut selected = pool.len() - 1;

                for (index, (_, votes)) in pool.iter().enumerate() {
                    cumulative += BigUint::from(*votes);

                    if target < cumulative {
                        selected = index;

                        break;
                    }
                }

                drawn.push(pool.remove(selected).0);
            }

            drawn
        };

        // The counter runs through both roles, so which role draws first
        // changes the outcome; the seed decides.
        let (drawn_producers, drawn_validators) = if evenness {
            let producers = draw(&mut pool, slots);

            let validators = draw(&mut pool, slots);

            (producers, validators)
        } else {
            let validators = draw(&mut pool, slots);

            let producers = draw(&mut pool, slots);

            (producers, validators)
        };

        let mut producers: Vec<PublicKey> = permanent.to_vec();

        producers.extend(drawn_producers);

        let mut validators: Vec<PublicKey> = permanent.to_vec();

        validators.extend(drawn_validators);

        // A candidate never holds both roles in one round: the producer
        // seat wins and the validator slot is re-drawn if the pool allows.
        let before = validators.len();

        validators.retain(|key| !producers.contains(key));

        let removed = before - validators.len();

        if removed > 0 {
            validators.extend(draw(&mut pool, removed));
        }

        debug!(
            producers = producers.len(),
            validators = validators.len(),
            "election complete"
        );

        Ok((producers, validators))
    }

    /// The number of validator signatures a block needs given the round's
    /// validator set.
    pub fn validator_quorum(validator_count: usize) -> usize {
        (validator_count * config::consensus::VALIDATOR_THRESHOLD).div_ceil(100)
    }

    pub fn id(&self) -> Hash {
        self.id
    }
}

impl Drop for StakingEngine {
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
