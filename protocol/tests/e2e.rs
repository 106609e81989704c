//! End-to-end flows across the stores, the staking registry and the
//! validator: bootstrap a chain from genesis, commit blocks with user
//! transactions, apply stake transactions, run an election, and rewind.

use obscura_protocol::codec::Serializable;
use obscura_protocol::config;
use obscura_protocol::crypto::hash::sha3;
use obscura_protocol::crypto::keys::generate_keypair;
use obscura_protocol::crypto::types::{Commitment, Hash, KeyImage, PublicKey};
use obscura_protocol::staking::{staker_id, StakingEngine};
use obscura_protocol::storage::{Block, ChainStore, RewardTransaction, StorageError};
use obscura_protocol::transaction::{
    CommittedStakeTransaction, GenesisTransaction, StakeData, StakerOutput,
    StakerRewardTransaction, Transaction, TransactionBody, TransactionOutput, TransactionPrefix,
};

fn make_output(tag: u8) -> TransactionOutput {
    TransactionOutput {
        public_ephemeral: generate_keypair().0,
        amount: 100 + tag as u64,
        commitment: Commitment::from([tag | 1; 32]),
    }
}

fn stake_transaction(version: u64, candidate: PublicKey, amount: u64) -> CommittedStakeTransaction {
    CommittedStakeTransaction {
        prefix: TransactionPrefix {
            version,
            unlock_block: 0,
            public_key: generate_keypair().0,
        },
        body: TransactionBody {
            nonce: 0,
            fee: 1,
            key_images: vec![KeyImage::from(*generate_keypair().0.as_bytes())],
            outputs: vec![make_output(10), make_output(11)],
        },
        data: StakeData {
            stake_amount: amount,
            candidate_public_key: candidate,
            staker_public_view_key: generate_keypair().0,
            staker_public_spend_key: generate_keypair().0,
        },
        suffix: Default::default(),
    }
}

fn reward_block(index: u64, previous: Hash, transactions: &[Transaction]) -> Block {
    let mut block = Block {
        version: 1,
        previous_blockhash: previous,
        timestamp: config::transaction::genesis::TIMESTAMP + index * 30,
        block_index: index,
        reward_tx: RewardTransaction::StakerReward(StakerRewardTransaction::new(
            vec![StakerOutput {
                staker_id: sha3(&index.to_le_bytes()),
                amount: 50,
            }],
            vec![],
        )),
        ..Default::default()
    };

    for tx in transactions {
        block.append_transaction_hash(tx.hash());
    }

    block
}

fn sorted(mut transactions: Vec<Transaction>) -> Vec<Transaction> {
    transactions.sort_by_key(Transaction::hash);

    transactions
}

#[test]
fn chain_bootstraps_from_genesis_and_grows() {
    let dir = tempfile::tempdir().unwrap();

    let chain = ChainStore::instance(dir.path().join("chain")).unwrap();

    // Block 0: the genesis mint. Every output re-derives from config.
    let genesis_tx = GenesisTransaction::construct().unwrap();

    assert!(genesis_tx.verify_outputs().is_ok());

    let genesis_block = Block {
        version: 1,
        previous_blockhash: Hash::empty(),
        timestamp: config::transaction::genesis::TIMESTAMP,
        block_index: 0,
        reward_tx: RewardTransaction::Genesis(genesis_tx.clone()),
        ..Default::default()
    };

    chain.put_block(&genesis_block, &[]).unwrap();

    assert_eq!(chain.get_block_count().unwrap(), 1);

    // Every genesis output landed in the global output index.
    assert_eq!(
        chain.output_count().unwrap(),
        (config::transaction::RING_SIZE * 2) as u64
    );

    // A second genesis is refused outright.
    assert_eq!(
        chain.put_block(&genesis_block, &[]),
        Err(StorageError::GenesisAlreadyExists)
    );

    // Ring material can be sampled immediately.
    let ring = chain
        .get_random_outputs(0, config::transaction::RING_SIZE)
        .unwrap();

    assert_eq!(ring.len(), config::transaction::RING_SIZE);

    // Grow the chain with user transaction blocks.
    let mut previous = genesis_block.hash();

    for index in 1..=3 {
        let candidate = generate_keypair().0;

        let txs = sorted(vec![
            Transaction::Stake(stake_transaction(
                1,
                candidate,
                config::consensus::REQUIRED_CANDIDACY_AMOUNT,
            )),
            Transaction::Stake(stake_transaction(2, candidate, 500)),
        ]);

        let block = reward_block(index, previous, &txs);

        chain.put_block(&block, &txs).unwrap();

        previous = block.hash();
    }

    assert_eq!(chain.get_block_count().unwrap(), 4);

    // Round trip: block bytes and hashes survive storage.
    let (stored, stored_txs) = chain.get_block_by_index(2).unwrap();

    assert_eq!(stored.block_index, 2);
    assert_eq!(stored_txs.len(), 2);
    assert_eq!(
        Block::from_bytes(&stored.to_bytes()).unwrap().hash(),
        stored.hash()
    );

    // Timestamp lookups find the nearest block at or after the query.
    let (by_time, actual) = chain
        .get_block_by_timestamp(config::transaction::genesis::TIMESTAMP + 31)
        .unwrap();

    assert_eq!(by_time.block_index, 2);
    assert_eq!(actual, config::transaction::genesis::TIMESTAMP + 60);
}

#[test]
fn staking_flows_feed_the_election() {
    let dir = tempfile::tempdir().unwrap();

    let chain = ChainStore::instance(dir.path().join("chain")).unwrap();

    let staking = StakingEngine::instance(dir.path().join("staking")).unwrap();

    // Commit a block of stake transactions and apply them to the
    // registry, the way the node does after validation.
    let candidate_keys: Vec<_> = (0..4).map(|_| generate_keypair().0).collect();

    let mut txs = Vec::new();

    for (i, candidate) in candidate_keys.iter().enumerate() {
        txs.push(Transaction::Stake(stake_transaction(
            1,
            *candidate,
            config::consensus::REQUIRED_CANDIDACY_AMOUNT,
        )));

        txs.push(Transaction::Stake(stake_transaction(
            2,
            *candidate,
            1_000 * (i as u64 + 1),
        )));
    }

    let txs = sorted(txs);

    let block = reward_block(0, Hash::empty(), &txs);

    chain.put_block(&block, &txs).unwrap();

    let (_, committed) = chain.get_block(&block.hash()).unwrap();

    for tx in &committed {
        if let Transaction::Stake(stake_tx) = tx {
            staking.add_stake(stake_tx).unwrap();
        }
    }

    for (i, candidate) in candidate_keys.iter().enumerate() {
        assert_eq!(
            staking.get_candidate_votes(candidate).unwrap(),
            config::consensus::REQUIRED_CANDIDACY_AMOUNT + 1_000 * (i as u64 + 1)
        );
    }

    // The election over the committed chain is identical on every run
    // and never seats one key in both roles.
    let seed_blocks = [block.hash()];

    let first = staking
        .run_election(&seed_blocks, config::consensus::ELECTOR_TARGET_COUNT)
        .unwrap();

    let second = staking
        .run_election(&seed_blocks, config::consensus::ELECTOR_TARGET_COUNT)
        .unwrap();

    assert_eq!(first, second);

    let (producers, validators) = first;

    for permanent in config::PERMANENT_CANDIDATES.iter() {
        assert!(producers.contains(permanent));
    }

    for validator in &validators {
        assert!(!producers.contains(validator));
    }
}

#[test]
fn rewind_restores_spendability() {
    let dir = tempfile::tempdir().unwrap();

    let chain = ChainStore::instance(dir.path().join("chain")).unwrap();

    let mut previous = Hash::empty();

    let mut spent_images: Vec<KeyImage> = Vec::new();

    for index in 0..6 {
        let candidate = generate_keypair().0;

        let tx = Transaction::Stake(stake_transaction(1, candidate, 100_000));

        spent_images.extend_from_slice(tx.key_images());

        let txs = vec![tx];

        let block = reward_block(index, previous, &txs);

        chain.put_block(&block, &txs).unwrap();

        previous = block.hash();
    }

    for image in &spent_images {
        assert!(chain.key_image_exists(image).unwrap());
    }

    chain.rewind(2).unwrap();

    assert_eq!(chain.get_block_count().unwrap(), 2);

    // Key images from the rewound blocks are spendable again; the
    // surviving prefix keeps its own.
    for image in &spent_images[..2] {
        assert!(chain.key_image_exists(image).unwrap());
    }

    for image in &spent_images[2..] {
        assert!(!chain.key_image_exists(image).unwrap());
    }
}

#[test]
fn staker_rewards_settle_into_the_registry() {
    let dir = tempfile::tempdir().unwrap();

    let staking = StakingEngine::instance(dir.path().join("staking")).unwrap();

    let candidate = generate_keypair().0;

    staking
        .add_stake(&stake_transaction(
            1,
            candidate,
            config::consensus::REQUIRED_CANDIDACY_AMOUNT,
        ))
        .unwrap();

    let vote = stake_transaction(2, candidate, 750);

    staking.add_stake(&vote).unwrap();

    let id = staker_id(
        &vote.data.staker_public_view_key,
        &vote.data.staker_public_spend_key,
    );

    let reward = StakerRewardTransaction::new(
        vec![StakerOutput {
            staker_id: id,
            amount: 320,
        }],
        vec![StakerOutput {
            staker_id: id,
            amount: 20,
        }],
    );

    assert!(reward.check_construction().is_ok());

    staking.process_staker_tx(&reward).unwrap();

    assert_eq!(staking.get_staker(&id).unwrap().balance, 300);

    // The staker's stakes are visible grouped by candidate.
    let grouped = staking.get_staker_stakes(&id).unwrap();

    assert_eq!(grouped.len(), 1);
    assert_eq!(grouped[&candidate].len(), 1);
    assert_eq!(grouped[&candidate][0].stake, 750);
    assert_eq!(
        staking.get_staker_candidate_votes(&id, &candidate).unwrap(),
        750
    );
}
