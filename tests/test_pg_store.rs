//! Integration tests for the Postgres store
//!
//! Need a reachable database:
//! DATABASE_URL=postgres://... cargo test --test test_pg_store -- --ignored
//!
//! Every test works on fresh token / launchpad addresses, so runs against a
//! shared database do not interfere with each other.

use ethers::types::{Address, H256, U256};
use snapshot_distributor::database::PgStore;
use snapshot_distributor::distribution::{DistributionCalculator, Exclusions, RoundingPolicy};
use snapshot_distributor::store::{DistributionStore, SnapshotStore};
use snapshot_distributor::types::{Distribution, HolderInfo, RewardLedger, Snapshot, Whitelist};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

const INIT_BLOCK: u64 = 100;

async fn store() -> PgStore {
    dotenv::dotenv().ok();
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    PgStore::connect(&url, 2, INIT_BLOCK).await.expect("connect")
}

fn unique_address() -> Address {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64;
    Address::from_low_u64_be(nanos)
}

fn holder(balance: u64) -> HolderInfo {
    HolderInfo {
        balance: U256::from(balance),
        is_contract: false,
        is_blacklisted: false,
    }
}

fn snapshot(block_number: u64) -> Snapshot {
    let mut holders = BTreeMap::new();
    holders.insert(Address::from_low_u64_be(0xA), holder(600));
    holders.insert(Address::from_low_u64_be(0xB), holder(400));
    Snapshot { block_number, holders }
}

fn round(token: Address, block_number: u64, budget: u64, previous: RewardLedger) -> Distribution {
    let calculator = DistributionCalculator::new(Exclusions::new([token]), RoundingPolicy::Unit);
    let (output, _) = calculator
        .reward_round(&[snapshot(block_number)], U256::from(budget), previous)
        .unwrap();
    Distribution {
        chain_id: 1,
        token,
        block_number,
        snapshots: 1,
        interval: 1,
        total_shares: output.total_shares,
        total_rewards: output.total_amount,
        root: output.root,
        items: output.items,
    }
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_snapshot_round_trip() {
    let store = store().await;
    let next = store.last_checkpoint().await.unwrap() + 1;

    let saved = snapshot(next);
    store.save_snapshot(&saved).await.unwrap();

    assert_eq!(store.last_checkpoint().await.unwrap(), next);
    assert_eq!(store.snapshot_at(next).await.unwrap(), Some(saved.clone()));

    // Checkpoints only move forward
    assert!(store.save_snapshot(&saved).await.is_err());
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_distribution_rounds_are_ordered() {
    let store = store().await;
    let token = unique_address();

    let first = round(token, 200, 1000, RewardLedger::new());
    store.save_distribution(&first).await.unwrap();
    let second = round(token, 300, 500, first.reward_ledger());
    store.save_distribution(&second).await.unwrap();

    let rounds = store.distributions(1, token).await.unwrap();
    assert_eq!(rounds, vec![first.clone(), second.clone()]);
    assert_eq!(store.last_distribution(1, token).await.unwrap(), Some(second));
    assert!(store.distribution_pairs().await.unwrap().contains(&(1, token)));

    // A round at or below the latest block is refused and nothing is written
    let stale = round(token, 250, 100, RewardLedger::new());
    assert!(store.save_distribution(&stale).await.is_err());
    assert_eq!(store.distributions(1, token).await.unwrap().len(), 2);
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_whitelist_is_written_once() {
    let store = store().await;
    let launchpad = unique_address();

    let whitelist = Whitelist {
        chain_id: 42161,
        launchpad,
        block_number: 500,
        min_balance: U256::from(10),
        root: H256::repeat_byte(7),
        items: vec![],
    };
    store.save_whitelist(&whitelist).await.unwrap();

    assert_eq!(store.whitelist(42161, launchpad).await.unwrap(), Some(whitelist.clone()));
    assert!(store.whitelist(1, launchpad).await.unwrap().is_none());
    assert!(store.save_whitelist(&whitelist).await.is_err());
}
