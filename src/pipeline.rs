//! Command-level operations.
//!
//! [`Pipeline`] wires the collaborators (chain, holder index, stores) to the
//! replayer, calculator, verifier and audits. Every write-side operation runs
//! its guards first and persists at most once, at the very end.

use crate::chain::{ChainInfo, ChainStateReader, HolderClassifier, TransferSource};
use crate::distribution::{compute_exclusions, DistributionCalculator, ProtocolAddresses, RoundingPolicy};
use crate::error::{CollaboratorContext, PipelineError, Result};
use crate::reconciliation::{
    audit_allocation, audit_distributions, audit_whitelist, AuditReport, ReconciliationReport, ReconciliationVerifier,
};
use crate::replayer::{EventReplayer, ReplayStats};
use crate::settings::Settings;
use crate::store::{DistributionStore, SnapshotStore};
use crate::subgraph::{classify_holders, HolderSource};
use crate::types::{
    Allocation, BlockInfo, Distribution, Ledger, LaunchpadInfo, RewardLedger, Snapshot, SupportedChain, TokenInfo,
    Whitelist,
};
use config::ConfigError;
use ethers::types::{Address, H256, U256};
use log::{info, warn};
use std::sync::Arc;

/// Everything the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn ChainInfo>,
    pub transfers: Arc<dyn TransferSource>,
    pub classifier: Arc<dyn HolderClassifier>,
    pub state: Arc<dyn ChainStateReader>,
    pub holders: Arc<dyn HolderSource>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub rounds: Arc<dyn DistributionStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineParams {
    /// Chain of the tracked token; holder sets are read there.
    pub home_chain: SupportedChain,
    pub protocol: ProtocolAddresses,
    pub init_block: u64,
    pub batch_size: u64,
}

impl PipelineParams {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            home_chain: settings.home_chain()?,
            protocol: ProtocolAddresses {
                token: settings.token.address,
                liquidity_pool: settings.token.liquidity_pool,
                distributor: settings.token.distributor,
            },
            init_block: settings.token.init_block,
            batch_size: settings.replay.batch_size,
        })
    }
}

/// Parameters of a reward or allocation round. `target` is the reward token
/// for distributions and the launchpad for allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundRequest {
    pub chain: SupportedChain,
    pub target: Address,
    pub amount: U256,
    pub block_number: u64,
    pub snapshots: u32,
    pub interval: u64,
}

impl RoundRequest {
    /// `b, b - interval, ..., b - (n-1) * interval`
    pub fn snapshot_blocks(&self) -> Vec<u64> {
        (0..self.snapshots as u64)
            .map(|k| self.block_number.saturating_sub(k.saturating_mul(self.interval)))
            .collect()
    }
}

/// What a `new` command shows before asking for confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundPreview {
    pub block: BlockInfo,
    pub token: Address,
    pub token_info: TokenInfo,
    pub launchpad: Option<LaunchpadInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRun {
    pub from_block: u64,
    pub to_block: u64,
    pub holders: usize,
    pub stats: ReplayStats,
}

/// Arguments of the distributor's `updateRoot` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRoot {
    pub token: Address,
    /// Block of the round whose root is live on chain, 0 when none matches.
    pub live_block: u64,
    pub pending_rounds: usize,
    pub total: U256,
    pub root: H256,
}

pub struct Pipeline {
    collaborators: Collaborators,
    params: PipelineParams,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, params: PipelineParams) -> Self {
        Self { collaborators, params }
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    pub async fn finalized_block(&self) -> Result<BlockInfo> {
        self.collaborators
            .chain
            .finalized_block()
            .await
            .collaborator(|| "finalized block".to_string())
    }

    pub async fn block(&self, number: u64) -> Result<BlockInfo> {
        self.collaborators
            .chain
            .block(number)
            .await
            .collaborator(|| format!("block {}", number))
    }

    async fn ensure_finalized(&self, block: u64) -> Result<BlockInfo> {
        let finalized = self.finalized_block().await?;
        if block > finalized.number {
            return Err(PipelineError::validation(format!(
                "block {} is after the last finalized block {}",
                block, finalized.number
            )));
        }
        Ok(finalized)
    }

    /// Extends the last checkpoint up to `target` (default: last finalized
    /// block) and persists the result as a new checkpoint.
    pub async fn run_snapshot(&self, target: Option<u64>) -> Result<SnapshotRun> {
        let finalized = self.finalized_block().await?;
        let target = target.unwrap_or(finalized.number);
        if target > finalized.number {
            return Err(PipelineError::validation(format!(
                "block {} is after the last finalized block {}",
                target, finalized.number
            )));
        }

        let checkpoint = self
            .collaborators
            .snapshots
            .last_checkpoint()
            .await
            .collaborator(|| "last checkpoint".to_string())?;
        if target <= checkpoint {
            return Err(PipelineError::validation(format!(
                "block {} is not after the last checkpoint {}",
                target, checkpoint
            )));
        }

        let ledger = self.load_ledger(checkpoint).await?;
        let replayer = EventReplayer::new(self.collaborators.classifier.clone(), self.params.batch_size);
        let (ledger, stats) = replayer
            .replay(ledger, self.collaborators.transfers.as_ref(), target)
            .await?;

        let snapshot = Snapshot::from_ledger(&ledger);
        self.collaborators
            .snapshots
            .save_snapshot(&snapshot)
            .await
            .collaborator(|| format!("save checkpoint at block {}", target))?;

        info!(
            "📸 Checkpoint {} -> {}: {} holders, {} events",
            checkpoint,
            target,
            snapshot.len(),
            stats.events
        );
        Ok(SnapshotRun {
            from_block: checkpoint.saturating_add(1),
            to_block: target,
            holders: snapshot.len(),
            stats,
        })
    }

    async fn load_ledger(&self, checkpoint: u64) -> Result<Ledger> {
        if checkpoint < self.params.init_block {
            return Ok(Ledger::genesis(self.params.init_block));
        }
        let snapshot = self
            .collaborators
            .snapshots
            .snapshot_at(checkpoint)
            .await
            .collaborator(|| format!("checkpoint at block {}", checkpoint))?
            .ok_or_else(|| {
                PipelineError::IntegrityMismatch(format!("last checkpoint {} has no stored snapshot", checkpoint))
            })?;
        Ok(Ledger::from(snapshot))
    }

    /// Diffs the checkpoint at `block` against chain state. The report is
    /// returned even when it has mismatches; see
    /// [`ReconciliationReport::into_result`].
    pub async fn verify(&self, block: u64) -> Result<ReconciliationReport> {
        let snapshot = self
            .collaborators
            .snapshots
            .snapshot_at(block)
            .await
            .collaborator(|| format!("checkpoint at block {}", block))?
            .ok_or_else(|| PipelineError::validation(format!("no checkpoint at block {}", block)))?;

        let verifier = ReconciliationVerifier::new(self.collaborators.state.clone(), self.params.batch_size);
        verifier
            .reconcile(&snapshot, self.collaborators.transfers.as_ref(), self.params.init_block)
            .await
    }

    fn check_request(&self, request: &RoundRequest) -> Result<()> {
        if request.amount.is_zero() {
            return Err(PipelineError::validation("amount must be greater than 0"));
        }
        if request.snapshots == 0 {
            return Err(PipelineError::validation("snapshots must be greater than 0"));
        }
        if request.interval == 0 {
            return Err(PipelineError::validation("interval must be greater than 0"));
        }
        let span = (request.snapshots as u64 - 1).saturating_mul(request.interval);
        if request.block_number < self.params.init_block.saturating_add(span) {
            return Err(PipelineError::validation(format!(
                "{} snapshots every {} blocks from block {} reach before the token deployment at {}",
                request.snapshots, request.interval, request.block_number, self.params.init_block
            )));
        }
        Ok(())
    }

    /// Eligible-holder snapshots for a round, each with fresh contract and
    /// blacklist flags.
    async fn round_snapshots(&self, blocks: &[u64], min_balance: U256) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::with_capacity(blocks.len());
        for &block in blocks {
            let holders = self
                .collaborators
                .holders
                .holders(block, min_balance)
                .await
                .collaborator(|| format!("holders at block {}", block))?;
            let holders = classify_holders(self.collaborators.classifier.as_ref(), holders)
                .await
                .collaborator(|| format!("classify holders at block {}", block))?;
            snapshots.push(holders);
        }
        Ok(snapshots)
    }

    async fn calculator(&self, policy: RoundingPolicy) -> Result<DistributionCalculator> {
        let operator = self
            .collaborators
            .chain
            .operator()
            .await
            .collaborator(|| "token operator".to_string())?;
        Ok(DistributionCalculator::new(
            compute_exclusions(&self.params.protocol, operator),
            policy,
        ))
    }

    async fn token_info(&self, chain: SupportedChain, token: Address) -> Result<TokenInfo> {
        self.collaborators
            .chain
            .token_info(chain, token)
            .await
            .collaborator(|| format!("token info of {:?} on {}", token, chain))
    }

    async fn launchpad_info(&self, chain: SupportedChain, launchpad: Address) -> Result<LaunchpadInfo> {
        self.collaborators
            .chain
            .launchpad_info(chain, launchpad)
            .await
            .collaborator(|| format!("{:?} on {} does not look like a launchpad", launchpad, chain))
    }

    pub async fn distribution_preview(&self, request: &RoundRequest) -> Result<RoundPreview> {
        self.check_request(request)?;
        Ok(RoundPreview {
            block: self.block(request.block_number).await?,
            token: request.target,
            token_info: self.token_info(request.chain, request.target).await?,
            launchpad: None,
        })
    }

    /// Computes and persists the next reward round for `(chain, token)`.
    pub async fn new_distribution(&self, request: &RoundRequest) -> Result<Distribution> {
        self.check_request(request)?;
        self.ensure_finalized(request.block_number).await?;

        let chain_id = request.chain.id();
        let previous = self
            .collaborators
            .rounds
            .last_distribution(chain_id, request.target)
            .await
            .collaborator(|| format!("last distribution of {:?} on {}", request.target, request.chain))?;
        if let Some(last) = &previous {
            if request.block_number <= last.block_number {
                return Err(PipelineError::StaleRound {
                    chain_id,
                    token: request.target,
                    requested: request.block_number,
                    existing: last.block_number,
                });
            }
        }

        let snapshots = self.round_snapshots(&request.snapshot_blocks(), U256::zero()).await?;
        let calculator = self.calculator(RoundingPolicy::Unit).await?;
        let ledger = previous.as_ref().map(Distribution::reward_ledger).unwrap_or_else(RewardLedger::new);
        let (round, _) = calculator.reward_round(&snapshots, request.amount, ledger)?;

        let distribution = Distribution {
            chain_id,
            token: request.target,
            block_number: request.block_number,
            snapshots: request.snapshots,
            interval: request.interval,
            total_shares: round.total_shares,
            total_rewards: round.total_amount,
            root: round.root,
            items: round.items,
        };

        // Proofs and monotonicity against the previous round, before anything is written
        let window: Vec<Distribution> = previous.into_iter().chain(std::iter::once(distribution.clone())).collect();
        audit_distributions(&window).into_result()?;

        self.collaborators
            .rounds
            .save_distribution(&distribution)
            .await
            .collaborator(|| format!("save distribution at block {}", distribution.block_number))?;
        info!(
            "🎁 Distribution {} on {} at block {}: {} recipients, {} distributed",
            distribution.token,
            request.chain,
            distribution.block_number,
            distribution.items.len(),
            distribution.total_rewards
        );
        Ok(distribution)
    }

    /// Arguments for `updateRoot` that bring the distributor up to date with
    /// every stored round.
    pub async fn pending_root(&self, chain: SupportedChain, token: Address) -> Result<PendingRoot> {
        let live_root = self
            .collaborators
            .chain
            .distributor_root(chain, token)
            .await
            .collaborator(|| format!("distributor root of {:?} on {}", token, chain))?;
        let rounds = self
            .collaborators
            .rounds
            .distributions(chain.id(), token)
            .await
            .collaborator(|| format!("distributions of {:?} on {}", token, chain))?;
        pending_root(token, live_root, &rounds)
    }

    /// Audits every stored round, or only the rounds of one pair.
    pub async fn check_distributions(&self, pair: Option<(SupportedChain, Address)>) -> Result<AuditReport> {
        let pairs = match pair {
            Some((chain, token)) => vec![(chain.id(), token)],
            None => self
                .collaborators
                .rounds
                .distribution_pairs()
                .await
                .collaborator(|| "distribution pairs".to_string())?,
        };

        let mut report = AuditReport::default();
        for (chain_id, token) in pairs {
            let rounds = self
                .collaborators
                .rounds
                .distributions(chain_id, token)
                .await
                .collaborator(|| format!("distributions of {:?} on chain {}", token, chain_id))?;
            report.merge(audit_distributions(&rounds));
        }
        info!(
            "🔎 Checked {} distribution round(s), {} proofs, {} finding(s)",
            report.rounds,
            report.proofs,
            report.findings.len()
        );
        Ok(report)
    }

    pub async fn allocation_preview(&self, request: &RoundRequest) -> Result<RoundPreview> {
        self.check_request(request)?;
        let launchpad = self.launchpad_info(request.chain, request.target).await?;
        Ok(RoundPreview {
            block: self.block(request.block_number).await?,
            token: launchpad.token,
            token_info: self.token_info(request.chain, launchpad.token).await?,
            launchpad: Some(launchpad),
        })
    }

    /// One-shot allocation for a launchpad, floored to whole units of the
    /// launchpad's token.
    pub async fn new_allocation(&self, request: &RoundRequest) -> Result<Allocation> {
        self.check_request(request)?;
        self.ensure_finalized(request.block_number).await?;

        let chain_id = request.chain.id();
        let existing = self
            .collaborators
            .rounds
            .allocation(chain_id, request.target)
            .await
            .collaborator(|| format!("allocation of {:?}", request.target))?;
        if existing.is_some() {
            return Err(PipelineError::validation(format!(
                "allocation already exists for launchpad {:?} on {}",
                request.target, request.chain
            )));
        }

        let launchpad = self.launchpad_info(request.chain, request.target).await?;
        let token_info = self.token_info(request.chain, launchpad.token).await?;
        let policy = RoundingPolicy::decimals(token_info.decimals as u32)?;

        let snapshots = self.round_snapshots(&request.snapshot_blocks(), U256::zero()).await?;
        let round = self.calculator(policy).await?.allocation_round(&snapshots, request.amount)?;

        let allocation = Allocation {
            chain_id,
            launchpad: request.target,
            block_number: request.block_number,
            snapshots: request.snapshots,
            interval: request.interval,
            total_shares: round.total_shares,
            total_allocations: round.total_amount,
            root: round.root,
            items: round.items,
        };
        audit_allocation(&allocation).into_result()?;

        self.collaborators
            .rounds
            .save_allocation(&allocation)
            .await
            .collaborator(|| format!("save allocation of {:?}", allocation.launchpad))?;
        info!(
            "🚀 Allocation for {} ({:?}): {} recipients, {} {} allocated",
            launchpad.name,
            allocation.launchpad,
            allocation.items.len(),
            allocation.total_allocations,
            token_info.symbol
        );
        Ok(allocation)
    }

    pub async fn allocation(&self, chain: SupportedChain, launchpad: Address) -> Result<Allocation> {
        self.collaborators
            .rounds
            .allocation(chain.id(), launchpad)
            .await
            .collaborator(|| format!("allocation of {:?}", launchpad))?
            .ok_or_else(|| PipelineError::validation(format!("no allocation for launchpad {:?} on {}", launchpad, chain)))
    }

    pub async fn check_allocations(&self) -> Result<AuditReport> {
        let allocations = self
            .collaborators
            .rounds
            .allocations()
            .await
            .collaborator(|| "allocations".to_string())?;
        let whitelists = self
            .collaborators
            .rounds
            .whitelists()
            .await
            .collaborator(|| "whitelists".to_string())?;

        let mut report = AuditReport::default();
        for allocation in &allocations {
            report.merge(audit_allocation(allocation));
        }
        for whitelist in &whitelists {
            report.merge(audit_whitelist(whitelist));
        }
        info!(
            "🔎 Checked {} allocation(s) and {} whitelist(s): {} finding(s)",
            allocations.len(),
            whitelists.len(),
            report.findings.len()
        );
        Ok(report)
    }

    /// Launchpad info plus the tracked token, whose units `min_balance` is in.
    pub async fn whitelist_preview(
        &self,
        chain: SupportedChain,
        launchpad: Address,
        block: u64,
    ) -> Result<RoundPreview> {
        let launchpad_info = self.launchpad_info(chain, launchpad).await?;
        Ok(RoundPreview {
            block: self.block(block).await?,
            token: self.params.protocol.token,
            token_info: self.token_info(self.params.home_chain, self.params.protocol.token).await?,
            launchpad: Some(launchpad_info),
        })
    }

    /// Whitelist of non-excluded holders with at least `min_balance` tracked
    /// tokens at `block` (default: last finalized block).
    pub async fn new_whitelist(
        &self,
        chain: SupportedChain,
        launchpad: Address,
        min_balance: U256,
        block: Option<u64>,
    ) -> Result<Whitelist> {
        let block = match block {
            Some(block) => {
                self.ensure_finalized(block).await?;
                block
            }
            None => self.finalized_block().await?.number,
        };
        if block < self.params.init_block {
            return Err(PipelineError::validation(format!(
                "block {} is before the token deployment at {}",
                block, self.params.init_block
            )));
        }

        let existing = self
            .collaborators
            .rounds
            .whitelist(chain.id(), launchpad)
            .await
            .collaborator(|| format!("whitelist of {:?}", launchpad))?;
        if existing.is_some() {
            return Err(PipelineError::validation(format!(
                "whitelist already exists for launchpad {:?} on {}",
                launchpad, chain
            )));
        }

        let snapshot = self
            .round_snapshots(&[block], min_balance)
            .await?
            .pop()
            .ok_or(PipelineError::EmptyEligibleSet)?;
        let output = self
            .calculator(RoundingPolicy::Unit)
            .await?
            .whitelist(&snapshot, min_balance)?;

        let whitelist = Whitelist {
            chain_id: chain.id(),
            launchpad,
            block_number: block,
            min_balance,
            root: output.root,
            items: output.items,
        };
        audit_whitelist(&whitelist).into_result()?;

        self.collaborators
            .rounds
            .save_whitelist(&whitelist)
            .await
            .collaborator(|| format!("save whitelist of {:?}", launchpad))?;
        info!(
            "📋 Whitelist for {:?} at block {}: {} members",
            launchpad,
            block,
            whitelist.items.len()
        );
        Ok(whitelist)
    }

    pub async fn whitelist(&self, chain: SupportedChain, launchpad: Address) -> Result<Whitelist> {
        self.collaborators
            .rounds
            .whitelist(chain.id(), launchpad)
            .await
            .collaborator(|| format!("whitelist of {:?}", launchpad))?
            .ok_or_else(|| PipelineError::validation(format!("no whitelist for launchpad {:?} on {}", launchpad, chain)))
    }
}

/// Finds the round whose root is live and totals every round after it.
/// `rounds` must be ascending by block.
pub fn pending_root(token: Address, live_root: H256, rounds: &[Distribution]) -> Result<PendingRoot> {
    let latest = rounds
        .last()
        .ok_or_else(|| PipelineError::validation(format!("no distribution for token {:?}", token)))?;

    let live_block = rounds
        .iter()
        .find(|d| d.root == live_root)
        .map(|d| d.block_number)
        .unwrap_or(0);
    if live_block == 0 && !live_root.is_zero() {
        warn!("⚠️ Live root {:?} matches no stored round, every round is pending", live_root);
    }

    let pending: Vec<&Distribution> = rounds.iter().filter(|d| d.block_number > live_block).collect();
    let total = pending
        .iter()
        .fold(U256::zero(), |acc, d| acc.saturating_add(d.total_rewards));

    Ok(PendingRoot {
        token,
        live_block,
        pending_rounds: pending.len(),
        total,
        root: latest.root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(block: u64, total: u64, root: u8) -> Distribution {
        Distribution {
            chain_id: 1,
            token: Address::from_low_u64_be(0x70),
            block_number: block,
            snapshots: 1,
            interval: 1,
            total_shares: U256::from(1000),
            total_rewards: U256::from(total),
            root: H256::repeat_byte(root),
            items: Vec::new(),
        }
    }

    #[test]
    fn test_snapshot_blocks_walk_back_from_round_block() {
        let request = RoundRequest {
            chain: SupportedChain::Mainnet,
            target: Address::zero(),
            amount: U256::one(),
            block_number: 1000,
            snapshots: 3,
            interval: 100,
        };
        assert_eq!(request.snapshot_blocks(), vec![1000, 900, 800]);
    }

    #[test]
    fn test_pending_root_sums_rounds_after_live_one() {
        let token = Address::from_low_u64_be(0x70);
        let rounds = vec![round(100, 10, 1), round(200, 20, 2), round(300, 30, 3)];

        let pending = pending_root(token, H256::repeat_byte(1), &rounds).unwrap();
        assert_eq!(pending.live_block, 100);
        assert_eq!(pending.pending_rounds, 2);
        assert_eq!(pending.total, U256::from(50));
        assert_eq!(pending.root, H256::repeat_byte(3));
    }

    #[test]
    fn test_pending_root_unknown_root_means_everything_pending() {
        let token = Address::from_low_u64_be(0x70);
        let rounds = vec![round(100, 10, 1), round(200, 20, 2)];
        let pending = pending_root(token, H256::zero(), &rounds).unwrap();
        assert_eq!(pending.live_block, 0);
        assert_eq!(pending.total, U256::from(30));
    }

    #[test]
    fn test_pending_root_up_to_date_is_zero() {
        let token = Address::from_low_u64_be(0x70);
        let rounds = vec![round(100, 10, 1), round(200, 20, 2)];
        let pending = pending_root(token, H256::repeat_byte(2), &rounds).unwrap();
        assert_eq!(pending.pending_rounds, 0);
        assert!(pending.total.is_zero());
        assert_eq!(pending.root, H256::repeat_byte(2));
    }

    #[test]
    fn test_pending_root_without_rounds_is_invalid() {
        let err = pending_root(Address::zero(), H256::zero(), &[]).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
