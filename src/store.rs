//! Persistence contracts and the in-memory store.
//!
//! Writes are all-or-nothing: a checkpoint with all its holder rows, or a
//! round with all its proof rows, is either fully visible or not at all.
//! [`crate::database::PgStore`] gets this from a transaction, [`MemoryStore`]
//! from building the new state before swapping it in under the lock.

use crate::types::{Allocation, Distribution, Snapshot, Whitelist};
use anyhow::{bail, Result};
use async_trait::async_trait;
use ethers::types::Address;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Block of the most recent checkpoint, `init_block - 1` when none exists.
    async fn last_checkpoint(&self) -> Result<u64>;

    async fn snapshot_at(&self, block: u64) -> Result<Option<Snapshot>>;

    /// Persists a new checkpoint. Checkpoints are immutable, so the block must
    /// be above the current one.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
}

#[async_trait]
pub trait DistributionStore: Send + Sync {
    async fn last_distribution(&self, chain_id: u64, token: Address) -> Result<Option<Distribution>>;

    /// Every round for the pair, ascending by block.
    async fn distributions(&self, chain_id: u64, token: Address) -> Result<Vec<Distribution>>;

    /// Every `(chain_id, token)` pair with at least one round.
    async fn distribution_pairs(&self) -> Result<Vec<(u64, Address)>>;

    async fn save_distribution(&self, distribution: &Distribution) -> Result<()>;

    async fn allocation(&self, chain_id: u64, launchpad: Address) -> Result<Option<Allocation>>;

    async fn allocations(&self) -> Result<Vec<Allocation>>;

    async fn save_allocation(&self, allocation: &Allocation) -> Result<()>;

    async fn whitelist(&self, chain_id: u64, launchpad: Address) -> Result<Option<Whitelist>>;

    async fn whitelists(&self) -> Result<Vec<Whitelist>>;

    async fn save_whitelist(&self, whitelist: &Whitelist) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    snapshots: BTreeMap<u64, Snapshot>,
    distributions: BTreeMap<(u64, Address), BTreeMap<u64, Distribution>>,
    allocations: BTreeMap<(u64, Address), Allocation>,
    whitelists: BTreeMap<(u64, Address), Whitelist>,
}

/// Process-local store, used by tests and dry runs.
#[derive(Debug)]
pub struct MemoryStore {
    init_block: u64,
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new(init_block: u64) -> Self {
        Self {
            init_block,
            state: RwLock::new(MemoryState::default()),
        }
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn last_checkpoint(&self) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .snapshots
            .keys()
            .next_back()
            .copied()
            .unwrap_or_else(|| self.init_block.saturating_sub(1)))
    }

    async fn snapshot_at(&self, block: u64) -> Result<Option<Snapshot>> {
        Ok(self.state.read().await.snapshots.get(&block).cloned())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(last) = state.snapshots.keys().next_back() {
            if snapshot.block_number <= *last {
                bail!(
                    "snapshot at block {} would not extend checkpoint {}",
                    snapshot.block_number,
                    last
                );
            }
        }
        state.snapshots.insert(snapshot.block_number, snapshot.clone());
        Ok(())
    }
}

#[async_trait]
impl DistributionStore for MemoryStore {
    async fn last_distribution(&self, chain_id: u64, token: Address) -> Result<Option<Distribution>> {
        let state = self.state.read().await;
        Ok(state
            .distributions
            .get(&(chain_id, token))
            .and_then(|rounds| rounds.values().next_back().cloned()))
    }

    async fn distributions(&self, chain_id: u64, token: Address) -> Result<Vec<Distribution>> {
        let state = self.state.read().await;
        Ok(state
            .distributions
            .get(&(chain_id, token))
            .map(|rounds| rounds.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn distribution_pairs(&self) -> Result<Vec<(u64, Address)>> {
        Ok(self.state.read().await.distributions.keys().copied().collect())
    }

    async fn save_distribution(&self, distribution: &Distribution) -> Result<()> {
        let mut state = self.state.write().await;
        let rounds = state
            .distributions
            .entry((distribution.chain_id, distribution.token))
            .or_default();
        if let Some(last) = rounds.keys().next_back() {
            if distribution.block_number <= *last {
                bail!(
                    "distribution at block {} is not after existing round {}",
                    distribution.block_number,
                    last
                );
            }
        }
        rounds.insert(distribution.block_number, distribution.clone());
        Ok(())
    }

    async fn allocation(&self, chain_id: u64, launchpad: Address) -> Result<Option<Allocation>> {
        Ok(self.state.read().await.allocations.get(&(chain_id, launchpad)).cloned())
    }

    async fn allocations(&self) -> Result<Vec<Allocation>> {
        Ok(self.state.read().await.allocations.values().cloned().collect())
    }

    async fn save_allocation(&self, allocation: &Allocation) -> Result<()> {
        let mut state = self.state.write().await;
        let key = (allocation.chain_id, allocation.launchpad);
        if state.allocations.contains_key(&key) {
            bail!("allocation already exists for launchpad {:?}", allocation.launchpad);
        }
        state.allocations.insert(key, allocation.clone());
        Ok(())
    }

    async fn whitelist(&self, chain_id: u64, launchpad: Address) -> Result<Option<Whitelist>> {
        Ok(self.state.read().await.whitelists.get(&(chain_id, launchpad)).cloned())
    }

    async fn whitelists(&self) -> Result<Vec<Whitelist>> {
        Ok(self.state.read().await.whitelists.values().cloned().collect())
    }

    async fn save_whitelist(&self, whitelist: &Whitelist) -> Result<()> {
        let mut state = self.state.write().await;
        let key = (whitelist.chain_id, whitelist.launchpad);
        if state.whitelists.contains_key(&key) {
            bail!("whitelist already exists for launchpad {:?}", whitelist.launchpad);
        }
        state.whitelists.insert(key, whitelist.clone());
        Ok(())
    }
}
