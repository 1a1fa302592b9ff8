//! Independent audits: checkpoints against live chain state, and stored
//! rounds against their own roots.
//!
//! Both are report-producing sweeps. A discrepancy is recorded and the sweep
//! keeps going; callers turn a non-empty report into
//! [`PipelineError::IntegrityMismatch`] with [`ReconciliationReport::into_result`]
//! or [`AuditReport::into_result`].

use crate::chain::{ChainStateReader, TransferSource};
use crate::error::{CollaboratorContext, PipelineError, Result};
use crate::merkle::{verify, Leaf};
use crate::metrics;
use crate::types::{Allocation, Distribution, HolderInfo, Snapshot, Whitelist};
use crate::utils::RangeBatcher;
use ethers::types::{Address, H256, U256};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

const STATE_CHUNK: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    Balance {
        address: Address,
        observed: U256,
        stored: U256,
    },
    IsContract {
        address: Address,
        observed: bool,
        stored: bool,
    },
    IsBlacklisted {
        address: Address,
        observed: bool,
        stored: bool,
    },
    /// Positive balance on chain, no entry in the checkpoint.
    Missing { address: Address, observed: U256 },
    /// Holder counts differ between chain and checkpoint.
    HolderCount { observed: usize, stored: usize },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Balance {
                address,
                observed,
                stored,
            } => write!(f, "{:?} balance: chain {} / stored {}", address, observed, stored),
            Mismatch::IsContract {
                address,
                observed,
                stored,
            } => write!(f, "{:?} isContract: chain {} / stored {}", address, observed, stored),
            Mismatch::IsBlacklisted {
                address,
                observed,
                stored,
            } => write!(f, "{:?} isBlacklisted: chain {} / stored {}", address, observed, stored),
            Mismatch::Missing { address, observed } => {
                write!(f, "{:?} holds {} on chain but is not in the snapshot", address, observed)
            }
            Mismatch::HolderCount { observed, stored } => {
                write!(f, "holder count: chain {} / stored {}", observed, stored)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub block_number: u64,
    /// Addresses queried: transfer participants plus stored holders that
    /// never appear in the log.
    pub checked: usize,
    /// Participants with a positive balance on chain.
    pub observed_holders: usize,
    pub stored_holders: usize,
    pub mismatches: Vec<Mismatch>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_clean() {
            return Ok(self);
        }
        let first = self.mismatches.first().map(|m| m.to_string()).unwrap_or_default();
        Err(PipelineError::IntegrityMismatch(format!(
            "snapshot at block {} has {} mismatch(es), first: {}",
            self.block_number,
            self.mismatches.len(),
            first
        )))
    }
}

/// Re-derives holder state from chain for every address that ever took part
/// in a transfer, and diffs it against a stored checkpoint.
pub struct ReconciliationVerifier {
    reader: Arc<dyn ChainStateReader>,
    batch_size: u64,
}

impl ReconciliationVerifier {
    pub fn new(reader: Arc<dyn ChainStateReader>, batch_size: u64) -> Self {
        Self { reader, batch_size }
    }

    pub async fn reconcile(
        &self,
        snapshot: &Snapshot,
        source: &dyn TransferSource,
        init_block: u64,
    ) -> Result<ReconciliationReport> {
        let block = snapshot.block_number;
        let mut addresses = self.participants(source, init_block, block).await?;
        let known: BTreeSet<Address> = addresses.iter().copied().collect();
        // Stored holders that never took part in a transfer still get queried
        let unexplained: Vec<Address> = snapshot.holders.keys().filter(|a| !known.contains(*a)).copied().collect();
        info!(
            "🔍 Reconciling {} participants against snapshot at block {} ({} holders, {} not in the transfer log)",
            addresses.len(),
            block,
            snapshot.len(),
            unexplained.len()
        );
        addresses.extend(unexplained);

        let mut report = ReconciliationReport {
            block_number: block,
            checked: addresses.len(),
            stored_holders: snapshot.len(),
            ..Default::default()
        };

        for chunk in addresses.chunks(STATE_CHUNK) {
            let states = self
                .reader
                .holder_states(block, chunk)
                .await
                .collaborator(|| format!("holder state of {} addresses at block {}", chunk.len(), block))?;
            if states.len() != chunk.len() {
                return Err(PipelineError::collaborator(
                    format!("holder state at block {}", block),
                    anyhow::anyhow!("expected {} results, got {}", chunk.len(), states.len()),
                ));
            }

            for (address, observed) in chunk.iter().zip(states) {
                let stored = snapshot.get(address);
                if observed.balance.is_zero() && stored.is_none() {
                    continue;
                }
                if !observed.balance.is_zero() {
                    report.observed_holders += 1;
                }
                compare(*address, &observed, stored, &mut report.mismatches);
            }
        }

        if report.observed_holders != report.stored_holders {
            report.mismatches.push(Mismatch::HolderCount {
                observed: report.observed_holders,
                stored: report.stored_holders,
            });
        }

        for m in &report.mismatches {
            warn!("❌ {}", m);
        }
        metrics::increment_mismatches(report.mismatches.len());
        Ok(report)
    }

    /// Distinct non-zero transfer participants, in order of first appearance.
    async fn participants(&self, source: &dyn TransferSource, from_block: u64, to_block: u64) -> Result<Vec<Address>> {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        for (start, end) in RangeBatcher::new(from_block, to_block, self.batch_size)? {
            let events = source
                .transfers(start, end)
                .await
                .collaborator(|| format!("eth_getLogs blocks {}..={}", start, end))?;
            debug!("blocks {}..={}: {} transfers", start, end, events.len());
            for event in events {
                for address in [event.from, event.to] {
                    if !address.is_zero() && seen.insert(address) {
                        ordered.push(address);
                    }
                }
            }
        }
        Ok(ordered)
    }
}

fn compare(address: Address, observed: &HolderInfo, stored: Option<&HolderInfo>, out: &mut Vec<Mismatch>) {
    let stored = match stored {
        Some(s) => s,
        None => {
            out.push(Mismatch::Missing {
                address,
                observed: observed.balance,
            });
            return;
        }
    };
    if observed.balance != stored.balance {
        out.push(Mismatch::Balance {
            address,
            observed: observed.balance,
            stored: stored.balance,
        });
    }
    if observed.is_contract != stored.is_contract {
        out.push(Mismatch::IsContract {
            address,
            observed: observed.is_contract,
            stored: stored.is_contract,
        });
    }
    if observed.is_blacklisted != stored.is_blacklisted {
        out.push(Mismatch::IsBlacklisted {
            address,
            observed: observed.is_blacklisted,
            stored: stored.is_blacklisted,
        });
    }
}

/// A problem found while auditing stored rounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Which round, e.g. `distribution 1/0x… @ 18800000`.
    pub scope: String,
    pub detail: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.scope, self.detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub rounds: usize,
    pub proofs: usize,
    pub findings: Vec<Finding>,
}

impl AuditReport {
    pub fn merge(&mut self, other: AuditReport) {
        self.rounds += other.rounds;
        self.proofs += other.proofs;
        self.findings.extend(other.findings);
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_clean() {
            return Ok(self);
        }
        let first = self.findings.first().map(|f| f.to_string()).unwrap_or_default();
        Err(PipelineError::IntegrityMismatch(format!(
            "{} finding(s) over {} round(s), first: {}",
            self.findings.len(),
            self.rounds,
            first
        )))
    }

    fn finding(&mut self, scope: &str, detail: String) {
        self.findings.push(Finding {
            scope: scope.to_string(),
            detail,
        });
    }

    fn check_proof(&mut self, scope: &str, root: H256, leaf: Leaf, proof: &[H256]) {
        self.proofs += 1;
        if !verify(root, &leaf, proof) {
            self.finding(scope, format!("proof for {:?} does not verify against {:?}", leaf.address, root));
        }
    }
}

/// Re-verifies every proof of every round of one `(chain, token)` pair and
/// checks that cumulative amounts never shrink from one round to the next.
/// `rounds` must be ascending by block.
pub fn audit_distributions(rounds: &[Distribution]) -> AuditReport {
    let mut report = AuditReport::default();
    let mut previous: Option<(u64, BTreeMap<Address, U256>, U256)> = None;

    for round in rounds {
        report.rounds += 1;
        let scope = format!("distribution {}/{:?} @ {}", round.chain_id, round.token, round.block_number);

        let mut amounts = BTreeMap::new();
        let mut cumulative = U256::zero();
        for item in &round.items {
            report.check_proof(&scope, round.root, Leaf::with_amount(item.address, item.amount), &item.proof);
            if amounts.insert(item.address, item.amount).is_some() {
                report.finding(&scope, format!("{:?} appears twice", item.address));
            }
            cumulative = cumulative.saturating_add(item.amount);
        }

        match &previous {
            Some((block, _, _)) if *block >= round.block_number => {
                report.finding(&scope, format!("block is not after previous round {}", block));
            }
            Some((block, before, before_total)) => {
                for (address, amount) in before {
                    let now = amounts.get(address).copied().unwrap_or_default();
                    if now < *amount {
                        report.finding(
                            &scope,
                            format!("{:?} cumulative amount went down from {} (round {}) to {}", address, amount, block, now),
                        );
                    }
                }
                if cumulative != before_total.saturating_add(round.total_rewards) {
                    report.finding(
                        &scope,
                        format!(
                            "cumulative total {} != previous {} + round rewards {}",
                            cumulative, before_total, round.total_rewards
                        ),
                    );
                }
            }
            None => {
                if cumulative != round.total_rewards {
                    report.finding(
                        &scope,
                        format!("first round total {} != round rewards {}", cumulative, round.total_rewards),
                    );
                }
            }
        }

        previous = Some((round.block_number, amounts, cumulative));
    }
    report
}

pub fn audit_allocation(allocation: &Allocation) -> AuditReport {
    let scope = format!("allocation {}/{:?}", allocation.chain_id, allocation.launchpad);
    let mut report = AuditReport {
        rounds: 1,
        ..Default::default()
    };
    let mut total = U256::zero();
    for item in &allocation.items {
        report.check_proof(&scope, allocation.root, Leaf::with_amount(item.address, item.amount), &item.proof);
        total = total.saturating_add(item.amount);
    }
    if total > allocation.total_allocations {
        report.finding(
            &scope,
            format!("items sum to {} but only {} was allocated", total, allocation.total_allocations),
        );
    }
    report
}

pub fn audit_whitelist(whitelist: &Whitelist) -> AuditReport {
    let scope = format!("whitelist {}/{:?}", whitelist.chain_id, whitelist.launchpad);
    let mut report = AuditReport {
        rounds: 1,
        ..Default::default()
    };
    for item in &whitelist.items {
        report.check_proof(&scope, whitelist.root, Leaf::membership(item.address), &item.proof);
        if item.balance < whitelist.min_balance {
            report.finding(
                &scope,
                format!("{:?} balance {} below minimum {}", item.address, item.balance, whitelist.min_balance),
            );
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{DistributionCalculator, Exclusions, RoundingPolicy};
    use crate::types::{RewardLedger, TransferEvent};
    use async_trait::async_trait;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    struct ScriptedLog(Vec<TransferEvent>);

    #[async_trait]
    impl TransferSource for ScriptedLog {
        async fn transfers(&self, from_block: u64, to_block: u64) -> anyhow::Result<Vec<TransferEvent>> {
            Ok(self
                .0
                .iter()
                .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
                .copied()
                .collect())
        }
    }

    struct FixedState(BTreeMap<Address, HolderInfo>);

    #[async_trait]
    impl ChainStateReader for FixedState {
        async fn holder_states(&self, _block: u64, addresses: &[Address]) -> anyhow::Result<Vec<HolderInfo>> {
            Ok(addresses.iter().map(|a| self.0.get(a).copied().unwrap_or_default()).collect())
        }
    }

    fn holder(balance: u64) -> HolderInfo {
        HolderInfo {
            balance: U256::from(balance),
            ..Default::default()
        }
    }

    fn setup() -> (ScriptedLog, Snapshot) {
        let events = vec![
            TransferEvent::new(10, Address::zero(), addr(1), U256::from(100)),
            TransferEvent::new(11, addr(1), addr(2), U256::from(40)),
            TransferEvent::new(12, addr(2), addr(3), U256::from(40)),
        ];
        let snapshot = Snapshot {
            block_number: 12,
            holders: [(addr(1), holder(60)), (addr(3), holder(40))].into_iter().collect(),
        };
        (ScriptedLog(events), snapshot)
    }

    #[tokio::test]
    async fn test_clean_snapshot() {
        let (log, snapshot) = setup();
        let chain = FixedState(snapshot.holders.clone());
        let verifier = ReconciliationVerifier::new(Arc::new(chain), 2);
        let report = verifier.reconcile(&snapshot, &log, 10).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.checked, 3);
        assert_eq!(report.observed_holders, 2);
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_reports_every_mismatch() {
        let (log, snapshot) = setup();
        let mut chain = snapshot.holders.clone();
        chain.insert(addr(1), holder(61));
        let mut flagged = holder(40);
        flagged.is_blacklisted = true;
        chain.insert(addr(3), flagged);
        chain.insert(addr(2), holder(5));

        let verifier = ReconciliationVerifier::new(Arc::new(FixedState(chain)), 100);
        let report = verifier.reconcile(&snapshot, &log, 10).await.unwrap();

        assert!(report.mismatches.contains(&Mismatch::Balance {
            address: addr(1),
            observed: U256::from(61),
            stored: U256::from(60),
        }));
        assert!(report.mismatches.contains(&Mismatch::IsBlacklisted {
            address: addr(3),
            observed: true,
            stored: false,
        }));
        assert!(report.mismatches.contains(&Mismatch::Missing {
            address: addr(2),
            observed: U256::from(5),
        }));
        assert!(report.mismatches.contains(&Mismatch::HolderCount { observed: 3, stored: 2 }));
        assert!(matches!(report.into_result(), Err(PipelineError::IntegrityMismatch(_))));
    }

    #[tokio::test]
    async fn test_extra_stored_holder_fails_count() {
        let (log, mut snapshot) = setup();
        let chain = FixedState(snapshot.holders.clone());
        snapshot.holders.insert(addr(9), holder(1));
        let verifier = ReconciliationVerifier::new(Arc::new(chain), 100);
        let report = verifier.reconcile(&snapshot, &log, 10).await.unwrap();
        assert_eq!(report.checked, 4);
        assert_eq!(
            report.mismatches,
            vec![
                Mismatch::Balance {
                    address: addr(9),
                    observed: U256::zero(),
                    stored: U256::from(1),
                },
                Mismatch::HolderCount { observed: 2, stored: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn test_stored_balance_emptied_on_chain() {
        // Counts agree (2 / 2) but the stored holder 2 is empty on chain
        let (log, _) = setup();
        let snapshot = Snapshot {
            block_number: 12,
            holders: [(addr(1), holder(60)), (addr(2), holder(40))].into_iter().collect(),
        };
        let chain = FixedState([(addr(1), holder(60)), (addr(3), holder(40))].into_iter().collect());
        let verifier = ReconciliationVerifier::new(Arc::new(chain), 100);
        let report = verifier.reconcile(&snapshot, &log, 10).await.unwrap();

        assert_eq!(report.observed_holders, 2);
        assert!(report.mismatches.contains(&Mismatch::Balance {
            address: addr(2),
            observed: U256::zero(),
            stored: U256::from(40),
        }));
        assert!(report.mismatches.contains(&Mismatch::Missing {
            address: addr(3),
            observed: U256::from(40),
        }));
        assert!(!report.mismatches.iter().any(|m| matches!(m, Mismatch::HolderCount { .. })));
        assert!(matches!(report.into_result(), Err(PipelineError::IntegrityMismatch(_))));
    }

    fn rounds() -> Vec<Distribution> {
        let calc = DistributionCalculator::new(Exclusions::default(), RoundingPolicy::Unit);
        let first = Snapshot {
            block_number: 100,
            holders: [(addr(1), holder(60)), (addr(2), holder(40))].into_iter().collect(),
        };
        let second = Snapshot {
            block_number: 200,
            holders: [(addr(1), holder(50)), (addr(3), holder(50))].into_iter().collect(),
        };
        let mut out = Vec::new();
        let mut ledger = RewardLedger::new();
        for (snap, budget) in [(first, 1000u64), (second, 100)] {
            let (round, next) = calc.reward_round(std::slice::from_ref(&snap), U256::from(budget), ledger).unwrap();
            ledger = next;
            out.push(Distribution {
                chain_id: 1,
                token: addr(0x70),
                block_number: snap.block_number,
                snapshots: 1,
                interval: 1,
                total_shares: round.total_shares,
                total_rewards: round.total_amount,
                root: round.root,
                items: round.items,
            });
        }
        out
    }

    #[test]
    fn test_audit_accepts_consistent_rounds() {
        let report = audit_distributions(&rounds());
        assert!(report.is_clean(), "{:?}", report.findings);
        assert_eq!(report.rounds, 2);
        assert_eq!(report.proofs, 5);
    }

    #[test]
    fn test_audit_flags_tampering_and_shrinking_amounts() {
        let mut rounds = rounds();
        rounds[1].items[0].amount = U256::from(1);
        let report = audit_distributions(&rounds);
        let details: Vec<String> = report.findings.iter().map(|f| f.detail.clone()).collect();
        assert!(details.iter().any(|d| d.contains("does not verify")));
        assert!(details.iter().any(|d| d.contains("went down")));
        assert!(details.iter().any(|d| d.contains("cumulative total")));
    }

    #[test]
    fn test_audit_flags_dropped_address() {
        let mut rounds = rounds();
        rounds[1].items.retain(|i| i.address != addr(2));
        let report = audit_distributions(&rounds);
        assert!(report
            .findings
            .iter()
            .any(|f| f.detail.contains("went down") && f.detail.contains(&format!("{:?}", addr(2)))));
    }
}
