//! Domain types shared by the replay, distribution and persistence layers.

pub mod conversions;

use crate::error::{PipelineError, Result};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A decoded ERC20 `Transfer(from, to, value)` log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

impl TransferEvent {
    pub fn new(block_number: u64, from: Address, to: Address, value: U256) -> Self {
        Self {
            block_number,
            log_index: 0,
            from,
            to,
            value,
        }
    }
}

/// Contract/blacklist flags of an address as seen at some block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub is_contract: bool,
    pub is_blacklisted: bool,
}

/// Per-address entry of a ledger. The balance never goes below zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderInfo {
    pub balance: U256,
    pub is_contract: bool,
    pub is_blacklisted: bool,
}

impl HolderInfo {
    /// Fresh zero-balance entry for a newly discovered address.
    pub fn discovered(classification: Classification) -> Self {
        Self {
            balance: U256::zero(),
            is_contract: classification.is_contract,
            is_blacklisted: classification.is_blacklisted,
        }
    }

    pub fn classification(&self) -> Classification {
        Classification {
            is_contract: self.is_contract,
            is_blacklisted: self.is_blacklisted,
        }
    }
}

/// Working balance map owned by a replay run.
///
/// Unlike [`Snapshot`] it keeps addresses whose balance dropped back to zero,
/// so their classification is not re-queried later in the same run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    pub block_number: u64,
    pub holders: BTreeMap<Address, HolderInfo>,
}

impl Ledger {
    /// Empty ledger positioned right before `init_block`.
    pub fn genesis(init_block: u64) -> Self {
        Self {
            block_number: init_block.saturating_sub(1),
            holders: BTreeMap::new(),
        }
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.holders.contains_key(address)
    }

    pub fn balance_of(&self, address: &Address) -> U256 {
        self.holders
            .get(address)
            .map(|h| h.balance)
            .unwrap_or_default()
    }

    pub fn total_balance(&self) -> U256 {
        self.holders
            .values()
            .fold(U256::zero(), |acc, h| acc.saturating_add(h.balance))
    }
}

impl From<Snapshot> for Ledger {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            block_number: snapshot.block_number,
            holders: snapshot.holders,
        }
    }
}

/// Immutable checkpoint: every holder with a positive balance at `block_number`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub block_number: u64,
    pub holders: BTreeMap<Address, HolderInfo>,
}

impl Snapshot {
    pub fn from_ledger(ledger: &Ledger) -> Self {
        let holders = ledger
            .holders
            .iter()
            .filter(|(_, h)| !h.balance.is_zero())
            .map(|(a, h)| (*a, *h))
            .collect();
        Self {
            block_number: ledger.block_number,
            holders,
        }
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    pub fn get(&self, address: &Address) -> Option<&HolderInfo> {
        self.holders.get(address)
    }
}

/// Cumulative reward per address for one `(chain, token)` pair.
///
/// Entries only ever grow: each round credits on top of the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewardLedger {
    amounts: BTreeMap<Address, U256>,
}

impl RewardLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_amounts(amounts: impl IntoIterator<Item = (Address, U256)>) -> Self {
        let mut ledger = Self::new();
        for (address, amount) in amounts {
            ledger.credit(address, amount);
        }
        ledger
    }

    /// Adds `amount` to the address entry. Zero credits do not create entries.
    pub fn credit(&mut self, address: Address, amount: U256) {
        if amount.is_zero() {
            return;
        }
        let entry = self.amounts.entry(address).or_default();
        *entry = entry.saturating_add(amount);
    }

    pub fn get(&self, address: &Address) -> U256 {
        self.amounts.get(address).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &U256)> {
        self.amounts.iter()
    }

    pub fn len(&self) -> usize {
        self.amounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }

    pub fn total(&self) -> U256 {
        self.amounts
            .values()
            .fold(U256::zero(), |acc, v| acc.saturating_add(*v))
    }
}

/// One leaf of a published distribution, with its proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionItem {
    pub address: Address,
    /// Shares held in this round (zero for addresses only carried from earlier rounds).
    pub balance: U256,
    /// Cumulative claimable amount.
    pub amount: U256,
    pub proof: Vec<H256>,
}

/// A committed reward round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub chain_id: u64,
    pub token: Address,
    pub block_number: u64,
    pub snapshots: u32,
    pub interval: u64,
    pub total_shares: U256,
    pub total_rewards: U256,
    pub root: H256,
    pub items: Vec<DistributionItem>,
}

impl Distribution {
    pub fn reward_ledger(&self) -> RewardLedger {
        RewardLedger::from_amounts(self.items.iter().map(|i| (i.address, i.amount)))
    }
}

/// A launchpad allocation (one per `(chain, launchpad)`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub chain_id: u64,
    pub launchpad: Address,
    pub block_number: u64,
    pub snapshots: u32,
    pub interval: u64,
    pub total_shares: U256,
    pub total_allocations: U256,
    pub root: H256,
    pub items: Vec<DistributionItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistItem {
    pub address: Address,
    pub balance: U256,
    pub proof: Vec<H256>,
}

/// Plain-membership access list for a launchpad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Whitelist {
    pub chain_id: u64,
    pub launchpad: Address,
    pub block_number: u64,
    pub min_balance: U256,
    pub root: H256,
    pub items: Vec<WhitelistItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub number: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchpadInfo {
    pub name: String,
    pub token: Address,
}

/// Chains a distribution may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SupportedChain {
    Mainnet,
    Arbitrum,
}

impl SupportedChain {
    pub const ALL: [SupportedChain; 2] = [SupportedChain::Mainnet, SupportedChain::Arbitrum];

    pub fn id(&self) -> u64 {
        match self {
            SupportedChain::Mainnet => 1,
            SupportedChain::Arbitrum => 42161,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SupportedChain::Mainnet => "Ethereum",
            SupportedChain::Arbitrum => "Arbitrum One",
        }
    }
}

impl TryFrom<u64> for SupportedChain {
    type Error = PipelineError;

    fn try_from(chain_id: u64) -> Result<Self> {
        SupportedChain::ALL
            .into_iter()
            .find(|c| c.id() == chain_id)
            .ok_or_else(|| {
                let ids: Vec<String> = SupportedChain::ALL.iter().map(|c| c.id().to_string()).collect();
                PipelineError::validation(format!(
                    "chain_id {} is not supported, must be one of [{}]",
                    chain_id,
                    ids.join(", ")
                ))
            })
    }
}

impl fmt::Display for SupportedChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    #[test]
    fn test_snapshot_drops_zero_balances() {
        let mut ledger = Ledger::genesis(100);
        assert_eq!(ledger.block_number, 99);
        ledger.holders.insert(addr(1), HolderInfo { balance: U256::from(5), ..Default::default() });
        ledger.holders.insert(addr(2), HolderInfo::default());
        ledger.block_number = 120;

        let snapshot = Snapshot::from_ledger(&ledger);
        assert_eq!(snapshot.block_number, 120);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(&addr(2)).is_none());
    }

    #[test]
    fn test_reward_ledger_only_grows() {
        let mut rewards = RewardLedger::new();
        rewards.credit(addr(1), U256::from(10));
        rewards.credit(addr(1), U256::from(5));
        rewards.credit(addr(2), U256::zero());
        assert_eq!(rewards.get(&addr(1)), U256::from(15));
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards.total(), U256::from(15));
    }

    #[test]
    fn test_supported_chain_lookup() {
        assert_eq!(SupportedChain::try_from(1).unwrap(), SupportedChain::Mainnet);
        assert_eq!(SupportedChain::try_from(42161).unwrap(), SupportedChain::Arbitrum);
        let err = SupportedChain::try_from(10).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(err.to_string().contains("1, 42161"));
    }
}
