//! # Event Replayer
//!
//! Folds ordered `Transfer` events into a [`Ledger`].
//!
//! For every event the receiver is credited before the sender is debited, and
//! a debit that would take the sender below zero leaves it at zero instead.
//! That only happens when the ledger is missing history (events before its
//! starting point), so it is logged as a warning and counted, never fatal.
//!
//! Addresses are classified (contract / blacklisted) the first time they show
//! up, as of the block of that first event. The ledger keeps zero-balance
//! entries, so within a run an address is never classified twice.
//!
//! The zero address is the mint source and burn sink: it never gets an entry.

use crate::chain::{HolderClassifier, TransferSource};
use crate::error::{CollaboratorContext, PipelineError, Result};
use crate::metrics;
use crate::types::{HolderInfo, Ledger, TransferEvent};
use crate::utils::RangeBatcher;
use ethers::types::{Address, U256};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A debit that was clamped to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegativeBalance {
    pub address: Address,
    pub block_number: u64,
    /// Balance before the debit.
    pub balance: U256,
    pub value: U256,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub ranges: usize,
    pub events: usize,
    pub discovered: usize,
    pub clamped: usize,
}

impl ReplayStats {
    fn absorb(&mut self, other: ReplayStats) {
        self.ranges += other.ranges;
        self.events += other.events;
        self.discovered += other.discovered;
        self.clamped += other.clamped;
    }
}

/// Applies one transfer to the ledger. Participants missing from the ledger
/// are inserted unclassified; [`EventReplayer`] classifies them beforehand.
pub fn apply_transfer(ledger: &mut Ledger, event: &TransferEvent) -> Option<NegativeBalance> {
    if !event.to.is_zero() {
        let to = ledger.holders.entry(event.to).or_default();
        to.balance = to.balance.saturating_add(event.value);
    }

    if event.from.is_zero() {
        return None;
    }

    let from = ledger.holders.entry(event.from).or_default();
    match from.balance.checked_sub(event.value) {
        Some(balance) => {
            from.balance = balance;
            None
        }
        None => {
            let clamped = NegativeBalance {
                address: event.from,
                block_number: event.block_number,
                balance: from.balance,
                value: event.value,
            };
            from.balance = U256::zero();
            Some(clamped)
        }
    }
}

pub struct EventReplayer {
    classifier: Arc<dyn HolderClassifier>,
    batch_size: u64,
}

impl EventReplayer {
    pub fn new(classifier: Arc<dyn HolderClassifier>, batch_size: u64) -> Self {
        Self {
            classifier,
            batch_size,
        }
    }

    /// Replays `[ledger.block_number + 1, to_block]` and returns the ledger
    /// tagged with `to_block`. On error the partially updated ledger is dropped.
    pub async fn replay(
        &self,
        mut ledger: Ledger,
        source: &dyn TransferSource,
        to_block: u64,
    ) -> Result<(Ledger, ReplayStats)> {
        let from_block = ledger.block_number.saturating_add(1);
        let batcher = RangeBatcher::new(from_block, to_block, self.batch_size)?;
        let mut stats = ReplayStats::default();

        info!(
            "🔄 Replaying blocks {}..={} in {} range(s) of at most {} blocks",
            from_block,
            to_block,
            batcher.range_count(),
            self.batch_size
        );

        for (start, end) in batcher {
            let events = source
                .transfers(start, end)
                .await
                .collaborator(|| format!("eth_getLogs blocks {}..={}", start, end))?;
            check_range(&events, start, end)?;

            let range_stats = self.apply_events(&mut ledger, &events).await?;
            ledger.block_number = end;

            debug!(
                "blocks {}..={}: {} events, {} new holders",
                start, end, range_stats.events, range_stats.discovered
            );
            stats.absorb(range_stats);
            stats.ranges += 1;
        }

        info!(
            "✅ Replay done at block {}: {} events, {} holders discovered, {} clamped debits",
            ledger.block_number, stats.events, stats.discovered, stats.clamped
        );
        Ok((ledger, stats))
    }

    /// Classifies unseen participants, then folds the events in order.
    pub async fn apply_events(&self, ledger: &mut Ledger, events: &[TransferEvent]) -> Result<ReplayStats> {
        let discovered = self.discover(ledger, events).await?;
        let mut stats = ReplayStats {
            events: events.len(),
            discovered,
            ..Default::default()
        };

        for event in events {
            if let Some(negative) = apply_transfer(ledger, event) {
                warn!(
                    "⚠️ Negative balance clamped to 0 for {:?} at block {}: balance {} < transfer {}",
                    negative.address, negative.block_number, negative.balance, negative.value
                );
                metrics::increment_negative_clamps();
                stats.clamped += 1;
            }
        }

        metrics::increment_replayed_events(events.len());
        Ok(stats)
    }

    async fn discover(&self, ledger: &mut Ledger, events: &[TransferEvent]) -> Result<usize> {
        // first-seen block -> addresses, in order of appearance
        let mut unseen: BTreeMap<u64, Vec<Address>> = BTreeMap::new();
        let mut queued = BTreeSet::new();
        for event in events {
            for address in [event.from, event.to] {
                if address.is_zero() || ledger.contains(&address) || !queued.insert(address) {
                    continue;
                }
                unseen.entry(event.block_number).or_default().push(address);
            }
        }

        for (block, addresses) in &unseen {
            let classes = self
                .classifier
                .classify(*block, addresses)
                .await
                .collaborator(|| format!("classifying {} addresses at block {}", addresses.len(), block))?;
            if classes.len() != addresses.len() {
                return Err(PipelineError::collaborator(
                    format!("classifying addresses at block {}", block),
                    anyhow::anyhow!("expected {} classifications, got {}", addresses.len(), classes.len()),
                ));
            }
            for (address, class) in addresses.iter().zip(classes) {
                ledger.holders.insert(*address, HolderInfo::discovered(class));
            }
        }

        metrics::increment_classified(queued.len());
        Ok(queued.len())
    }
}

fn check_range(events: &[TransferEvent], start: u64, end: u64) -> Result<()> {
    if let Some(e) = events.iter().find(|e| e.block_number < start || e.block_number > end) {
        return Err(PipelineError::IntegrityMismatch(format!(
            "transfer at block {} returned for range {}..={}",
            e.block_number, start, end
        )));
    }
    let ordered = events
        .windows(2)
        .all(|w| (w[0].block_number, w[0].log_index) <= (w[1].block_number, w[1].log_index));
    if !ordered {
        return Err(PipelineError::IntegrityMismatch(format!(
            "transfers for range {}..={} are not in chain order",
            start, end
        )));
    }
    Ok(())
}
