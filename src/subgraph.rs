//! Holder index served by a subgraph.
//!
//! The subgraph answers "who held at least `min_balance` at block N" without
//! replaying logs. Pages are requested with `first`/`skip`, ordered by
//! address; a short page is the end of the data. Running past `max_pages`
//! full pages is an error: returning what was read so far would silently
//! truncate the holder set.

use crate::chain::HolderClassifier;
use crate::store::SnapshotStore;
use crate::types::conversions::{string_to_address, string_to_u256};
use crate::types::{HolderInfo, Snapshot};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const ALL_HOLDERS_QUERY: &str = r#"
    query GetHolders ($blockNumber: Int!, $first: Int!, $skip: Int!) {
        holders(
            block: { number: $blockNumber },
            where: { balance_gt: "0", isBlacklisted: false },
            orderBy: address,
            orderDirection: asc,
            first: $first,
            skip: $skip
        ) {
            address
            balance
            isBlacklisted
        }
    }
"#;

const MIN_BALANCE_QUERY: &str = r#"
    query GetHolders ($blockNumber: Int!, $minBalance: String!, $first: Int!, $skip: Int!) {
        holders(
            block: { number: $blockNumber },
            where: { balance_gte: $minBalance, isBlacklisted: false },
            orderBy: address,
            orderDirection: asc,
            first: $first,
            skip: $skip
        ) {
            address
            balance
            isBlacklisted
        }
    }
"#;

/// Holder set of the tracked token at a block.
#[async_trait]
pub trait HolderSource: Send + Sync {
    /// Holders with `balance >= min_balance` (and > 0) at `block`.
    async fn holders(&self, block: u64, min_balance: U256) -> Result<Snapshot>;
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct HolderData {
    address: String,
    balance: String,
    is_blacklisted: bool,
}

#[derive(Deserialize, Debug)]
struct HoldersResponse {
    holders: Vec<HolderData>,
}

#[derive(Deserialize, Debug)]
struct GraphQLError {
    message: String,
}

#[derive(Deserialize, Debug)]
struct GraphQLResponse {
    data: Option<HoldersResponse>,
    #[serde(default)]
    errors: Vec<GraphQLError>,
}

pub struct SubgraphClient {
    client: reqwest::Client,
    url: String,
    page_size: usize,
    max_pages: usize,
}

impl SubgraphClient {
    pub fn new(url: impl Into<String>, page_size: usize, max_pages: usize) -> Result<Self> {
        if page_size == 0 || max_pages == 0 {
            bail!("subgraph page_size and max_pages must be greater than 0");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            page_size,
            max_pages,
        })
    }

    async fn query_page(&self, block: u64, min_balance: U256, skip: usize) -> Result<Vec<HolderData>> {
        let body = if min_balance.is_zero() {
            json!({
                "query": ALL_HOLDERS_QUERY,
                "variables": { "blockNumber": block, "first": self.page_size, "skip": skip },
            })
        } else {
            json!({
                "query": MIN_BALANCE_QUERY,
                "variables": {
                    "blockNumber": block,
                    "minBalance": min_balance.to_string(),
                    "first": self.page_size,
                    "skip": skip,
                },
            })
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("subgraph request failed: {}", e))?;

        if !response.status().is_success() {
            if response.status() == 429 {
                bail!("subgraph rate limited (429)");
            }
            bail!("subgraph HTTP error: {}", response.status());
        }

        let parsed: GraphQLResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("subgraph JSON parse failed: {}", e))?;

        if let Some(err) = parsed.errors.first() {
            bail!("subgraph query error: {}", err.message);
        }
        parsed
            .data
            .map(|d| d.holders)
            .ok_or_else(|| anyhow!("subgraph returned no data"))
    }
}

#[async_trait]
impl HolderSource for SubgraphClient {
    async fn holders(&self, block: u64, min_balance: U256) -> Result<Snapshot> {
        let rows = paginate(self.page_size, self.max_pages, |skip| self.query_page(block, min_balance, skip)).await?;
        let snapshot = to_snapshot(block, rows)?;
        info!(
            "📊 Subgraph: {} holders with balance >= {} at block {}",
            snapshot.len(),
            min_balance,
            block
        );
        Ok(snapshot)
    }
}

async fn paginate<T, F, Fut>(page_size: usize, max_pages: usize, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let mut rows = Vec::new();
    for page in 0..max_pages {
        let skip = page * page_size;
        let items = fetch(skip).await.with_context(|| format!("subgraph page skip={}", skip))?;
        let len = items.len();
        rows.extend(items);
        debug!("subgraph page {} returned {} rows", page, len);
        if len < page_size {
            return Ok(rows);
        }
    }
    bail!(
        "subgraph holder set exceeds {} pages of {} rows",
        max_pages,
        page_size
    )
}

fn to_snapshot(block: u64, rows: Vec<HolderData>) -> Result<Snapshot> {
    let mut snapshot = Snapshot {
        block_number: block,
        ..Default::default()
    };
    for row in rows {
        let address = string_to_address(&row.address)?;
        let balance = string_to_u256(&row.balance)?;
        if balance.is_zero() {
            continue;
        }
        let info = HolderInfo {
            balance,
            is_contract: false,
            is_blacklisted: row.is_blacklisted,
        };
        if snapshot.holders.insert(address, info).is_some() {
            bail!("subgraph returned {:?} twice", address);
        }
    }
    Ok(snapshot)
}

/// Holder source reading persisted checkpoints. The block must be an
/// existing checkpoint.
pub struct CheckpointHolders {
    store: Arc<dyn SnapshotStore>,
}

impl CheckpointHolders {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HolderSource for CheckpointHolders {
    async fn holders(&self, block: u64, min_balance: U256) -> Result<Snapshot> {
        let mut snapshot = self
            .store
            .snapshot_at(block)
            .await?
            .ok_or_else(|| anyhow!("no checkpoint at block {}, run `snapshot --to {}` first", block, block))?;
        snapshot.holders.retain(|_, h| h.balance >= min_balance && !h.balance.is_zero());
        Ok(snapshot)
    }
}

/// Fills in the contract and blacklist flags of a holder set as of its block.
/// Flags already set by the source are kept.
pub async fn classify_holders(classifier: &dyn HolderClassifier, mut snapshot: Snapshot) -> Result<Snapshot> {
    let addresses: Vec<Address> = snapshot.holders.keys().copied().collect();
    let classes = classifier.classify(snapshot.block_number, &addresses).await?;
    if classes.len() != addresses.len() {
        bail!("expected {} classifications, got {}", addresses.len(), classes.len());
    }
    for (address, class) in addresses.iter().zip(classes) {
        if let Some(holder) = snapshot.holders.get_mut(address) {
            holder.is_contract |= class.is_contract;
            holder.is_blacklisted |= class.is_blacklisted;
        }
    }
    Ok(snapshot)
}
