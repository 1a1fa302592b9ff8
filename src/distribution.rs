//! # Distribution Calculator
//!
//! Turns checkpointed balances plus a budget into a proportional split and a
//! Merkle tree:
//!
//! ```text
//! shares(a)  = Σ over snapshots of balance(a)      (eligible holders only)
//! amount(a)  = round(floor(shares(a) * budget / totalShares))
//! ```
//!
//! Rewards are cumulative: each round credits the previous [`RewardLedger`]
//! and the tree commits to the running totals. Allocations are one-shot and
//! floor each amount to whole token units.

use crate::error::{PipelineError, Result};
use crate::merkle::{Leaf, MerkleTree};
use crate::types::{DistributionItem, HolderInfo, RewardLedger, Snapshot, WhitelistItem};
use ethers::types::{Address, H256, U256, U512};
use std::collections::{BTreeMap, BTreeSet};

/// Addresses owned by the protocol itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolAddresses {
    pub token: Address,
    pub liquidity_pool: Address,
    pub distributor: Address,
}

/// Holders left out of every split. Built fresh for each run since the
/// operator can change between rounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusions {
    addresses: BTreeSet<Address>,
}

impl Exclusions {
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
        }
    }

    /// Contracts and blacklisted holders are excluded on top of the listed addresses.
    pub fn is_excluded(&self, address: &Address, holder: &HolderInfo) -> bool {
        holder.is_contract || holder.is_blacklisted || self.addresses.contains(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.addresses.iter()
    }
}

/// Token, liquidity pool, distributor and the current operator.
pub fn compute_exclusions(protocol: &ProtocolAddresses, operator: Address) -> Exclusions {
    Exclusions::new([protocol.token, protocol.liquidity_pool, protocol.distributor, operator])
}

/// Eligible shares per address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shares {
    per_address: BTreeMap<Address, U256>,
    total: U256,
}

impl Shares {
    pub fn total(&self) -> U256 {
        self.total
    }

    pub fn get(&self, address: &Address) -> U256 {
        self.per_address.get(address).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &U256)> {
        self.per_address.iter()
    }

    pub fn len(&self) -> usize {
        self.per_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_address.is_empty()
    }
}

/// How each proportional amount is rounded down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingPolicy {
    /// Floor to the smallest token unit.
    Unit,
    /// Floor to a multiple of `10^decimals`.
    Decimals(u32),
}

impl RoundingPolicy {
    pub fn decimals(decimals: u32) -> Result<Self> {
        // 10^78 no longer fits in 256 bits
        if decimals > 77 {
            return Err(PipelineError::validation(format!("decimals {} out of range", decimals)));
        }
        Ok(RoundingPolicy::Decimals(decimals))
    }

    pub fn apply(&self, value: U256) -> U256 {
        match self {
            RoundingPolicy::Unit => value,
            RoundingPolicy::Decimals(d) => {
                let unit = U256::exp10(*d as usize);
                (value / unit) * unit
            }
        }
    }
}

/// Result of a proportional split; zero amounts are left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Split {
    pub amounts: BTreeMap<Address, U256>,
    pub total: U256,
}

/// A computed round, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutput {
    pub total_shares: U256,
    /// Sum of what this round hands out (not the cumulative total).
    pub total_amount: U256,
    pub root: H256,
    pub items: Vec<DistributionItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistOutput {
    pub root: H256,
    pub items: Vec<WhitelistItem>,
}

#[derive(Debug, Clone)]
pub struct DistributionCalculator {
    exclusions: Exclusions,
    policy: RoundingPolicy,
}

impl DistributionCalculator {
    pub fn new(exclusions: Exclusions, policy: RoundingPolicy) -> Self {
        Self { exclusions, policy }
    }

    pub fn exclusions(&self) -> &Exclusions {
        &self.exclusions
    }

    /// Sums eligible balances over the given snapshots.
    pub fn shares(&self, snapshots: &[Snapshot]) -> Shares {
        let mut shares = Shares::default();
        for snapshot in snapshots {
            for (address, holder) in &snapshot.holders {
                if holder.balance.is_zero() || self.exclusions.is_excluded(address, holder) {
                    continue;
                }
                let entry = shares.per_address.entry(*address).or_default();
                *entry = entry.saturating_add(holder.balance);
                shares.total = shares.total.saturating_add(holder.balance);
            }
        }
        shares
    }

    /// `floor(shares * budget / total)` per address, then the rounding policy.
    pub fn split(&self, shares: &Shares, budget: U256) -> Result<Split> {
        if shares.total.is_zero() {
            return Err(PipelineError::EmptyEligibleSet);
        }

        let total = U512::from(shares.total);
        let mut split = Split::default();
        for (address, share) in &shares.per_address {
            let raw = share.full_mul(budget) / total;
            // share <= total, so raw <= budget
            let amount = self.policy.apply(U256::try_from(raw).map_err(|_| {
                PipelineError::IntegrityMismatch(format!("split overflow for {:?}", address))
            })?);
            if amount.is_zero() {
                continue;
            }
            split.total = split.total.saturating_add(amount);
            split.amounts.insert(*address, amount);
        }

        if split.total.is_zero() {
            return Err(PipelineError::ZeroBudget { budget });
        }
        Ok(split)
    }

    /// Splits `budget`, credits it on top of `previous` and builds the tree
    /// over the cumulative ledger. Returns the round and the new ledger.
    pub fn reward_round(
        &self,
        snapshots: &[Snapshot],
        budget: U256,
        previous: RewardLedger,
    ) -> Result<(RoundOutput, RewardLedger)> {
        let shares = self.shares(snapshots);
        let split = self.split(&shares, budget)?;

        let mut ledger = previous;
        for (address, amount) in &split.amounts {
            ledger.credit(*address, *amount);
        }

        let tree = MerkleTree::build(ledger.iter().map(|(a, v)| Leaf::with_amount(*a, *v)))?;
        let items = amount_items(&tree, &shares);
        Ok((
            RoundOutput {
                total_shares: shares.total,
                total_amount: split.total,
                root: tree.root(),
                items,
            },
            ledger,
        ))
    }

    /// One-shot split of `total_allocations`; the tree only holds this round.
    pub fn allocation_round(&self, snapshots: &[Snapshot], total_allocations: U256) -> Result<RoundOutput> {
        let shares = self.shares(snapshots);
        let split = self.split(&shares, total_allocations)?;
        let tree = MerkleTree::build(split.amounts.iter().map(|(a, v)| Leaf::with_amount(*a, *v)))?;
        Ok(RoundOutput {
            total_shares: shares.total,
            total_amount: split.total,
            root: tree.root(),
            items: amount_items(&tree, &shares),
        })
    }

    /// Membership tree of eligible holders with `balance >= min_balance`.
    pub fn whitelist(&self, snapshot: &Snapshot, min_balance: U256) -> Result<WhitelistOutput> {
        let members: BTreeMap<Address, U256> = snapshot
            .holders
            .iter()
            .filter(|(a, h)| !h.balance.is_zero() && h.balance >= min_balance && !self.exclusions.is_excluded(a, h))
            .map(|(a, h)| (*a, h.balance))
            .collect();

        let tree = MerkleTree::build(members.keys().map(|a| Leaf::membership(*a)))?;
        let items = tree
            .entries()
            .map(|(leaf, proof)| WhitelistItem {
                address: leaf.address,
                balance: members.get(&leaf.address).copied().unwrap_or_default(),
                proof,
            })
            .collect();
        Ok(WhitelistOutput {
            root: tree.root(),
            items,
        })
    }
}

fn amount_items(tree: &MerkleTree, shares: &Shares) -> Vec<DistributionItem> {
    tree.entries()
        .map(|(leaf, proof)| DistributionItem {
            address: leaf.address,
            balance: shares.get(&leaf.address),
            amount: leaf.amount.unwrap_or_default(),
            proof,
        })
        .collect()
}
