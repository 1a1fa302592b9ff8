//! End-to-end pipeline rounds against an in-memory store and a scripted chain.
//!
//! The scripted chain serves transfers, classification, balances and holder
//! sets from one event list, so every collaborator agrees with the others.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use snapshot_distributor::chain::{ChainInfo, ChainStateReader, HolderClassifier, TransferSource};
use snapshot_distributor::distribution::ProtocolAddresses;
use snapshot_distributor::merkle::{verify, Leaf};
use snapshot_distributor::pipeline::{Collaborators, Pipeline, PipelineParams, RoundRequest};
use snapshot_distributor::reconciliation::Mismatch;
use snapshot_distributor::store::{DistributionStore, MemoryStore, SnapshotStore};
use snapshot_distributor::subgraph::HolderSource;
use snapshot_distributor::types::{
    BlockInfo, Classification, HolderInfo, LaunchpadInfo, Snapshot, SupportedChain, TokenInfo, TransferEvent,
};
use snapshot_distributor::PipelineError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

const INIT_BLOCK: u64 = 100;

fn addr(n: u64) -> Address {
    Address::from_low_u64_be(n)
}

fn alice() -> Address {
    addr(0xA)
}
fn bob() -> Address {
    addr(0xB)
}
fn carol() -> Address {
    addr(0xC)
}
fn vault() -> Address {
    addr(0xC0DE)
}
fn operator() -> Address {
    addr(0x0FE)
}
fn reward_token() -> Address {
    addr(0x70)
}
fn launchpad() -> Address {
    addr(0x1A)
}

fn protocol() -> ProtocolAddresses {
    ProtocolAddresses {
        token: addr(0x7A),
        liquidity_pool: addr(0x11),
        distributor: addr(0xD1),
    }
}

struct ScriptedChain {
    events: Vec<TransferEvent>,
    contracts: BTreeSet<Address>,
    blacklisted: BTreeSet<Address>,
    finalized: u64,
    live_root: Mutex<H256>,
    token_decimals: u8,
}

impl ScriptedChain {
    fn new(events: Vec<TransferEvent>, finalized: u64) -> Self {
        Self {
            events,
            contracts: BTreeSet::new(),
            blacklisted: BTreeSet::new(),
            finalized,
            live_root: Mutex::new(H256::zero()),
            token_decimals: 18,
        }
    }

    fn set_live_root(&self, root: H256) {
        *self.live_root.lock().unwrap() = root;
    }

    fn flags(&self, address: &Address) -> Classification {
        Classification {
            is_contract: self.contracts.contains(address),
            is_blacklisted: self.blacklisted.contains(address),
        }
    }

    /// Balances straight from the event list, independent of the replayer.
    fn balances_at(&self, block: u64) -> BTreeMap<Address, U256> {
        let mut balances: BTreeMap<Address, U256> = BTreeMap::new();
        for e in self.events.iter().filter(|e| e.block_number <= block) {
            if !e.to.is_zero() {
                let entry = balances.entry(e.to).or_default();
                *entry += e.value;
            }
            if !e.from.is_zero() {
                let entry = balances.entry(e.from).or_default();
                *entry = entry.saturating_sub(e.value);
            }
        }
        balances
    }
}

#[async_trait]
impl TransferSource for ScriptedChain {
    async fn transfers(&self, from_block: u64, to_block: u64) -> Result<Vec<TransferEvent>> {
        Ok(self
            .events
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .copied()
            .collect())
    }
}

#[async_trait]
impl HolderClassifier for ScriptedChain {
    async fn classify(&self, _block: u64, addresses: &[Address]) -> Result<Vec<Classification>> {
        Ok(addresses.iter().map(|a| self.flags(a)).collect())
    }
}

#[async_trait]
impl ChainStateReader for ScriptedChain {
    async fn holder_states(&self, block: u64, addresses: &[Address]) -> Result<Vec<HolderInfo>> {
        let balances = self.balances_at(block);
        Ok(addresses
            .iter()
            .map(|a| {
                let flags = self.flags(a);
                HolderInfo {
                    balance: balances.get(a).copied().unwrap_or_default(),
                    is_contract: flags.is_contract,
                    is_blacklisted: flags.is_blacklisted,
                }
            })
            .collect())
    }
}

#[async_trait]
impl HolderSource for ScriptedChain {
    // Like the subgraph: balances and blacklist flag, no contract flag
    async fn holders(&self, block: u64, min_balance: U256) -> Result<Snapshot> {
        let mut snapshot = Snapshot {
            block_number: block,
            ..Default::default()
        };
        for (address, balance) in self.balances_at(block) {
            if balance.is_zero() || balance < min_balance {
                continue;
            }
            snapshot.holders.insert(
                address,
                HolderInfo {
                    balance,
                    is_contract: false,
                    is_blacklisted: self.blacklisted.contains(&address),
                },
            );
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl ChainInfo for ScriptedChain {
    async fn finalized_block(&self) -> Result<BlockInfo> {
        self.block(self.finalized).await
    }

    async fn block(&self, number: u64) -> Result<BlockInfo> {
        Ok(BlockInfo {
            number,
            timestamp: 1_700_000_000 + number * 12,
        })
    }

    async fn operator(&self) -> Result<Address> {
        Ok(operator())
    }

    async fn distributor_root(&self, _chain: SupportedChain, _token: Address) -> Result<H256> {
        Ok(*self.live_root.lock().unwrap())
    }

    async fn token_info(&self, _chain: SupportedChain, token: Address) -> Result<TokenInfo> {
        Ok(TokenInfo {
            name: format!("Token {:?}", token),
            symbol: "TKN".to_string(),
            decimals: self.token_decimals,
        })
    }

    async fn launchpad_info(&self, _chain: SupportedChain, address: Address) -> Result<LaunchpadInfo> {
        if address != launchpad() {
            return Err(anyhow!("execution reverted"));
        }
        Ok(LaunchpadInfo {
            name: "Launchpad".to_string(),
            token: addr(0x1B),
        })
    }
}

fn mint(block: u64, to: Address, value: u64) -> TransferEvent {
    TransferEvent::new(block, Address::zero(), to, U256::from(value))
}

fn transfer(block: u64, from: Address, to: Address, value: u64) -> TransferEvent {
    TransferEvent::new(block, from, to, U256::from(value))
}

/// Alice ends with 600, Bob with 400, the LP with 500 and a contract with 250.
fn history() -> Vec<TransferEvent> {
    vec![
        mint(100, alice(), 1_000),
        mint(100, protocol().liquidity_pool, 500),
        transfer(150, alice(), bob(), 300),
        mint(180, vault(), 250),
        transfer(220, alice(), bob(), 100),
        transfer(260, bob(), bob(), 50),
    ]
}

fn pipeline_with(chain: Arc<ScriptedChain>, store: Arc<MemoryStore>) -> Pipeline {
    let collaborators = Collaborators {
        chain: chain.clone(),
        transfers: chain.clone(),
        classifier: chain.clone(),
        state: chain.clone(),
        holders: chain,
        snapshots: store.clone(),
        rounds: store,
    };
    let params = PipelineParams {
        home_chain: SupportedChain::Mainnet,
        protocol: protocol(),
        init_block: INIT_BLOCK,
        batch_size: 40,
    };
    Pipeline::new(collaborators, params)
}

fn scripted() -> Arc<ScriptedChain> {
    let mut chain = ScriptedChain::new(history(), 1_000);
    chain.contracts.insert(vault());
    Arc::new(chain)
}

fn request(block: u64, amount: u64) -> RoundRequest {
    RoundRequest {
        chain: SupportedChain::Mainnet,
        target: reward_token(),
        amount: U256::from(amount),
        block_number: block,
        snapshots: 1,
        interval: 1,
    }
}

#[tokio::test]
async fn test_snapshot_resume_matches_single_run() {
    let chain = scripted();

    let resumed_store = Arc::new(MemoryStore::new(INIT_BLOCK));
    let resumed = pipeline_with(chain.clone(), resumed_store.clone());
    let first = resumed.run_snapshot(Some(170)).await.unwrap();
    assert_eq!(first.from_block, INIT_BLOCK);
    let second = resumed.run_snapshot(Some(300)).await.unwrap();
    assert_eq!(second.from_block, 171);

    let direct_store = Arc::new(MemoryStore::new(INIT_BLOCK));
    let direct = pipeline_with(chain, direct_store.clone());
    direct.run_snapshot(Some(300)).await.unwrap();

    let a = resumed_store.snapshot_at(300).await.unwrap().unwrap();
    let b = direct_store.snapshot_at(300).await.unwrap().unwrap();
    assert_eq!(a, b);
    assert_eq!(a.get(&alice()).unwrap().balance, U256::from(600));
    assert_eq!(a.get(&bob()).unwrap().balance, U256::from(400));
    assert!(a.get(&vault()).unwrap().is_contract);
    assert!(a.get(&Address::zero()).is_none());
}

#[tokio::test]
async fn test_snapshot_guards() {
    let store = Arc::new(MemoryStore::new(INIT_BLOCK));
    let pipeline = pipeline_with(scripted(), store.clone());

    let err = pipeline.run_snapshot(Some(1_001)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));

    pipeline.run_snapshot(Some(300)).await.unwrap();
    for target in [300, 200] {
        let err = pipeline.run_snapshot(Some(target)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)), "{}", err);
    }
    assert_eq!(store.last_checkpoint().await.unwrap(), 300);

    // Default target is the last finalized block
    let run = pipeline.run_snapshot(None).await.unwrap();
    assert_eq!(run.to_block, 1_000);
}

#[tokio::test]
async fn test_verify_clean_and_tampered() {
    let chain = scripted();
    let store = Arc::new(MemoryStore::new(INIT_BLOCK));
    let pipeline = pipeline_with(chain.clone(), store.clone());
    pipeline.run_snapshot(Some(300)).await.unwrap();

    let report = pipeline.verify(300).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.mismatches);
    assert_eq!(report.observed_holders, 4);

    // A checkpoint written by something other than the replayer
    let mut tampered = store.snapshot_at(300).await.unwrap().unwrap();
    tampered.block_number = 400;
    tampered.holders.get_mut(&alice()).unwrap().balance = U256::from(601);
    store.save_snapshot(&tampered).await.unwrap();

    let report = pipeline.verify(400).await.unwrap();
    assert!(report.mismatches.iter().any(|m| matches!(m, Mismatch::Balance { address, .. } if *address == alice())));
    assert!(matches!(report.into_result(), Err(PipelineError::IntegrityMismatch(_))));

    assert!(matches!(pipeline.verify(350).await, Err(PipelineError::Validation(_))));
}

#[tokio::test]
async fn test_distribution_splits_between_eligible_holders() {
    let chain = scripted();
    let store = Arc::new(MemoryStore::new(INIT_BLOCK));
    let pipeline = pipeline_with(chain.clone(), store.clone());

    let distribution = pipeline.new_distribution(&request(300, 1_000)).await.unwrap();

    // LP and contract holders are excluded
    assert_eq!(distribution.total_shares, U256::from(1_000));
    assert_eq!(distribution.total_rewards, U256::from(1_000));
    let amounts: BTreeMap<Address, U256> = distribution.items.iter().map(|i| (i.address, i.amount)).collect();
    assert_eq!(amounts.len(), 2);
    assert_eq!(amounts[&alice()], U256::from(600));
    assert_eq!(amounts[&bob()], U256::from(400));

    for item in &distribution.items {
        assert!(verify(distribution.root, &Leaf::with_amount(item.address, item.amount), &item.proof));
    }
    assert_eq!(store.last_distribution(1, reward_token()).await.unwrap(), Some(distribution.clone()));

    let pending = pipeline.pending_root(SupportedChain::Mainnet, reward_token()).await.unwrap();
    assert_eq!(pending.total, U256::from(1_000));
    assert_eq!(pending.root, distribution.root);
}

#[tokio::test]
async fn test_rounds_accumulate_and_stale_rounds_are_rejected() {
    let chain = scripted();
    let store = Arc::new(MemoryStore::new(INIT_BLOCK));
    let pipeline = pipeline_with(chain.clone(), store.clone());

    let first = pipeline.new_distribution(&request(300, 1_000)).await.unwrap();
    for block in [300, 250] {
        let err = pipeline.new_distribution(&request(block, 1_000)).await.unwrap_err();
        assert!(
            matches!(err, PipelineError::StaleRound { requested, existing: 300, .. } if requested == block),
            "{}",
            err
        );
        assert!(err.is_pre_commit());
    }

    let second = pipeline.new_distribution(&request(400, 500)).await.unwrap();
    assert_eq!(second.total_rewards, U256::from(500));
    let ledger = second.reward_ledger();
    assert_eq!(ledger.get(&alice()), U256::from(900));
    assert_eq!(ledger.get(&bob()), U256::from(600));
    assert_eq!(ledger.total(), U256::from(1_500));

    let report = pipeline.check_distributions(None).await.unwrap();
    assert_eq!(report.rounds, 2);
    assert!(report.is_clean(), "{:?}", report.findings);

    chain.set_live_root(first.root);
    let pending = pipeline.pending_root(SupportedChain::Mainnet, reward_token()).await.unwrap();
    assert_eq!(pending.live_block, 300);
    assert_eq!(pending.total, U256::from(500));
    assert_eq!(pending.root, second.root);

    chain.set_live_root(second.root);
    let pending = pipeline.pending_root(SupportedChain::Mainnet, reward_token()).await.unwrap();
    assert!(pending.total.is_zero());
}

#[tokio::test]
async fn test_retrospective_shares_are_summed() {
    let pipeline = pipeline_with(scripted(), Arc::new(MemoryStore::new(INIT_BLOCK)));

    // Block 200: alice 700, bob 300. Block 300: alice 600, bob 400.
    let mut req = request(300, 1_300);
    req.snapshots = 2;
    req.interval = 100;
    let distribution = pipeline.new_distribution(&req).await.unwrap();
    assert_eq!(distribution.total_shares, U256::from(2_000));
    let amounts: BTreeMap<Address, U256> = distribution.items.iter().map(|i| (i.address, i.amount)).collect();
    assert_eq!(amounts[&alice()], U256::from(845));
    assert_eq!(amounts[&bob()], U256::from(455));

    // Reaching before deployment is rejected up front
    req.snapshots = 4;
    assert!(matches!(pipeline.new_distribution(&req).await, Err(PipelineError::Validation(_))));
}

#[tokio::test]
async fn test_round_guards() {
    let pipeline = pipeline_with(scripted(), Arc::new(MemoryStore::new(INIT_BLOCK)));

    assert!(matches!(pipeline.new_distribution(&request(300, 0)).await, Err(PipelineError::Validation(_))));
    assert!(matches!(pipeline.new_distribution(&request(1_001, 10)).await, Err(PipelineError::Validation(_))));
    // 600 * 1 / 1000 and 400 * 1 / 1000 both floor to zero
    assert!(matches!(pipeline.new_distribution(&request(300, 1)).await, Err(PipelineError::ZeroBudget { .. })));

    // Only protocol and contract holders
    let mut chain = ScriptedChain::new(vec![mint(100, protocol().liquidity_pool, 500), mint(100, vault(), 10)], 1_000);
    chain.contracts.insert(vault());
    let store = Arc::new(MemoryStore::new(INIT_BLOCK));
    let pipeline = pipeline_with(Arc::new(chain), store.clone());
    assert!(matches!(pipeline.new_distribution(&request(300, 10)).await, Err(PipelineError::EmptyEligibleSet)));
    assert!(store.last_distribution(1, reward_token()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_blacklisted_holder_is_excluded() {
    // vault is not flagged as a contract in this history
    let mut chain = ScriptedChain::new(history(), 1_000);
    chain.blacklisted.insert(bob());
    let pipeline = pipeline_with(Arc::new(chain), Arc::new(MemoryStore::new(INIT_BLOCK)));

    let distribution = pipeline.new_distribution(&request(300, 1_000)).await.unwrap();
    let amounts: BTreeMap<Address, U256> = distribution.items.iter().map(|i| (i.address, i.amount)).collect();
    assert!(!amounts.contains_key(&bob()));
    assert_eq!(distribution.total_shares, U256::from(850));
    assert_eq!(amounts[&alice()], U256::from(705));
    assert_eq!(amounts[&vault()], U256::from(294));
    assert_eq!(distribution.total_rewards, U256::from(999));
}

#[tokio::test]
async fn test_allocation_floors_to_whole_tokens_once() {
    let mut chain = ScriptedChain::new(history(), 1_000);
    chain.contracts.insert(vault());
    chain.token_decimals = 2;
    let pipeline = pipeline_with(Arc::new(chain), Arc::new(MemoryStore::new(INIT_BLOCK)));

    let mut req = request(300, 1_055);
    req.target = launchpad();
    let allocation = pipeline.new_allocation(&req).await.unwrap();
    let amounts: BTreeMap<Address, U256> = allocation.items.iter().map(|i| (i.address, i.amount)).collect();
    assert_eq!(amounts[&alice()], U256::from(600));
    assert_eq!(amounts[&bob()], U256::from(400));
    assert_eq!(allocation.total_allocations, U256::from(1_000));

    assert!(matches!(pipeline.new_allocation(&req).await, Err(PipelineError::Validation(_))));
    assert_eq!(pipeline.allocation(SupportedChain::Mainnet, launchpad()).await.unwrap(), allocation);

    req.target = carol();
    assert!(matches!(pipeline.new_allocation(&req).await, Err(PipelineError::Collaborator { .. })));
}

#[tokio::test]
async fn test_whitelist_once_per_launchpad() {
    let store = Arc::new(MemoryStore::new(INIT_BLOCK));
    let pipeline = pipeline_with(scripted(), store.clone());

    let whitelist = pipeline
        .new_whitelist(SupportedChain::Arbitrum, launchpad(), U256::from(500), Some(300))
        .await
        .unwrap();
    assert_eq!(whitelist.items.len(), 1);
    assert_eq!(whitelist.items[0].address, alice());
    assert!(verify(whitelist.root, &Leaf::membership(alice()), &whitelist.items[0].proof));

    let err = pipeline
        .new_whitelist(SupportedChain::Arbitrum, launchpad(), U256::zero(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));

    let stored = pipeline.whitelist(SupportedChain::Arbitrum, launchpad()).await.unwrap();
    assert_eq!(stored.root, whitelist.root);
    assert!(pipeline.whitelist(SupportedChain::Mainnet, launchpad()).await.is_err());

    let report = pipeline.check_allocations().await.unwrap();
    assert!(report.is_clean());
}
