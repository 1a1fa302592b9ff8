//! # Chain collaborators
//!
//! The replay, distribution and reconciliation stages never talk to a node
//! directly. They consume the traits below, which the pipeline wires either to
//! [`EthersChain`] (JSON-RPC through `ethers`) or to in-memory fakes in tests.
//!
//! Every trait method returns `anyhow::Result`: transport failures are opaque
//! to the stages, which wrap them into `PipelineError::Collaborator` with the
//! block range or address that was being processed.

use crate::contracts::{IDistributor, ILaunchpad, ITaopadToken};
use crate::metrics;
use crate::multicall::{Call, Multicall};
use crate::transfer_events::{decode_transfer_logs, transfer_filter};
use crate::types::{
    BlockInfo, Classification, HolderInfo, LaunchpadInfo, SupportedChain, TokenInfo, TransferEvent,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::abi::{Function, Token};
use ethers::prelude::*;
use futures::stream::{self, StreamExt, TryStreamExt};
use log::{debug, info};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

const CODE_LOOKUP_CONCURRENCY: usize = 16;
const DEFAULT_MAX_RETRIES: usize = 3;

/// Transfer logs of the tracked token.
#[async_trait]
pub trait TransferSource: Send + Sync {
    /// Transfers in the inclusive range, ordered by `(block_number, log_index)`.
    async fn transfers(&self, from_block: u64, to_block: u64) -> Result<Vec<TransferEvent>>;
}

/// Contract / blacklist lookup for addresses seen for the first time.
#[async_trait]
pub trait HolderClassifier: Send + Sync {
    /// One classification per input address, same order.
    async fn classify(&self, block: u64, addresses: &[Address]) -> Result<Vec<Classification>>;
}

/// Authoritative per-holder state, used by reconciliation.
#[async_trait]
pub trait ChainStateReader: Send + Sync {
    async fn holder_states(&self, block: u64, addresses: &[Address]) -> Result<Vec<HolderInfo>>;
}

/// Block heights, roles and on-chain configuration used by the round builders.
#[async_trait]
pub trait ChainInfo: Send + Sync {
    /// Latest finalized block of the home chain.
    async fn finalized_block(&self) -> Result<BlockInfo>;

    async fn block(&self, number: u64) -> Result<BlockInfo>;

    /// Current `operator()` of the tracked token.
    async fn operator(&self) -> Result<Address>;

    /// Root currently published by the distributor for `token` on `chain`.
    async fn distributor_root(&self, chain: SupportedChain, token: Address) -> Result<H256>;

    async fn token_info(&self, chain: SupportedChain, token: Address) -> Result<TokenInfo>;

    async fn launchpad_info(&self, chain: SupportedChain, launchpad: Address) -> Result<LaunchpadInfo>;
}

/// JSON-RPC backed collaborator for one chain.
pub struct EthersChain<M: Middleware> {
    chain: SupportedChain,
    provider: Arc<M>,
    multicall: Multicall<M>,
    token: Address,
    max_retries: usize,
}

impl EthersChain<Provider<Http>> {
    /// Connects over HTTP and checks the node serves the expected chain.
    pub async fn connect(
        chain: SupportedChain,
        rpc_url: &str,
        multicall: Address,
        token: Address,
        batch_size: usize,
    ) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .with_context(|| format!("invalid RPC url for {}", chain))?;
        let provider = Arc::new(provider);

        let remote_id = provider
            .get_chainid()
            .await
            .with_context(|| format!("eth_chainId on {}", chain))?;
        if remote_id.as_u64() != chain.id() {
            return Err(anyhow!(
                "RPC for {} reports chain id {}, expected {}",
                chain.name(),
                remote_id,
                chain.id()
            ));
        }
        info!("🔗 Connected to {}", chain);

        Ok(Self::new(chain, provider, multicall, token, batch_size))
    }
}

impl<M: Middleware + 'static> EthersChain<M> {
    pub fn new(chain: SupportedChain, provider: Arc<M>, multicall: Address, token: Address, batch_size: usize) -> Self {
        Self {
            chain,
            multicall: Multicall::new(provider.clone(), multicall, batch_size),
            provider,
            token,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn chain(&self) -> SupportedChain {
        self.chain
    }

    async fn with_retry<T, F, Fut>(&self, method: &'static str, mut action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .map(jitter)
            .take(self.max_retries);
        Retry::spawn(strategy, || {
            metrics::increment_rpc_call(method);
            action()
        })
        .await
    }

    fn token_contract(&self, address: Address) -> ITaopadToken<M> {
        ITaopadToken::new(address, self.provider.clone())
    }

    async fn code_flags(&self, block: u64, addresses: &[Address]) -> Result<Vec<bool>> {
        let block_id = BlockId::from(block);
        stream::iter(addresses.iter().copied())
            .map(|address| async move {
                self.with_retry("eth_getCode", || async move {
                    let code = self
                        .provider
                        .get_code(address, Some(block_id))
                        .await
                        .map_err(|e| anyhow!("eth_getCode {:?}: {}", address, e))?;
                    Ok(!code.as_ref().is_empty())
                })
                .await
            })
            .buffered(CODE_LOOKUP_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn blacklist_flags(&self, block: u64, addresses: &[Address]) -> Result<Vec<bool>> {
        let token = self.token_contract(self.token);
        let function = token.abi().function("isBlacklisted")?.clone();
        let calls = addresses
            .iter()
            .map(|a| {
                token
                    .is_blacklisted(*a)
                    .calldata()
                    .map(|data| Call::new(self.token, data))
                    .ok_or_else(|| anyhow!("failed to encode isBlacklisted"))
            })
            .collect::<Result<Vec<_>>>()?;

        let results = self.multicall.run(calls, Some(BlockId::from(block))).await?;
        results
            .iter()
            .map(|raw| decode_single(&function, raw)?.into_bool().ok_or_else(|| anyhow!("isBlacklisted: not a bool")))
            .collect()
    }

    async fn balances(&self, block: u64, addresses: &[Address]) -> Result<Vec<U256>> {
        let token = self.token_contract(self.token);
        let function = token.abi().function("balanceOf")?.clone();
        let calls = addresses
            .iter()
            .map(|a| {
                token
                    .balance_of(*a)
                    .calldata()
                    .map(|data| Call::new(self.token, data))
                    .ok_or_else(|| anyhow!("failed to encode balanceOf"))
            })
            .collect::<Result<Vec<_>>>()?;

        let results = self.multicall.run(calls, Some(BlockId::from(block))).await?;
        results
            .iter()
            .map(|raw| decode_single(&function, raw)?.into_uint().ok_or_else(|| anyhow!("balanceOf: not a uint")))
            .collect()
    }

    pub async fn finalized_block(&self) -> Result<BlockInfo> {
        self.block_by_id(BlockNumber::Finalized.into()).await
    }

    pub async fn block(&self, number: u64) -> Result<BlockInfo> {
        self.block_by_id(BlockId::from(number)).await
    }

    async fn block_by_id(&self, id: BlockId) -> Result<BlockInfo> {
        let block = self
            .with_retry("eth_getBlockByNumber", || async {
                self.provider
                    .get_block(id)
                    .await
                    .map_err(|e| anyhow!("eth_getBlockByNumber {:?}: {}", id, e))
            })
            .await?
            .ok_or_else(|| anyhow!("block {:?} not found on {}", id, self.chain))?;
        let number = block
            .number
            .ok_or_else(|| anyhow!("block {:?} on {} is still pending", id, self.chain))?;
        Ok(BlockInfo {
            number: number.as_u64(),
            timestamp: block.timestamp.as_u64(),
        })
    }

    pub async fn operator(&self) -> Result<Address> {
        let token = self.token_contract(self.token);
        self.with_retry("operator", || async {
            token.operator().call().await.map_err(|e| anyhow!("operator(): {}", e))
        })
        .await
    }

    pub async fn distributor_root(&self, distributor: Address, token: Address) -> Result<H256> {
        let contract = IDistributor::new(distributor, self.provider.clone());
        let root = self
            .with_retry("roots", || async {
                contract.roots(token).call().await.map_err(|e| anyhow!("roots({:?}): {}", token, e))
            })
            .await?;
        Ok(H256::from(root))
    }

    pub async fn token_info(&self, token: Address) -> Result<TokenInfo> {
        let contract = self.token_contract(token);
        let name_fn = contract.abi().function("name")?.clone();
        let symbol_fn = contract.abi().function("symbol")?.clone();
        let decimals_fn = contract.abi().function("decimals")?.clone();

        let calls = vec![
            Call::new(token, encoded(contract.name().calldata())?),
            Call::new(token, encoded(contract.symbol().calldata())?),
            Call::new(token, encoded(contract.decimals().calldata())?),
        ];
        let results = self.multicall.run(calls, None).await?;
        let [name, symbol, decimals] = <[Bytes; 3]>::try_from(results)
            .map_err(|r| anyhow!("token info: expected 3 results, got {}", r.len()))?;

        let decimals = decode_single(&decimals_fn, &decimals)?
            .into_uint()
            .ok_or_else(|| anyhow!("decimals: not a uint"))?;
        Ok(TokenInfo {
            name: decode_single(&name_fn, &name)?
                .into_string()
                .ok_or_else(|| anyhow!("name: not a string"))?,
            symbol: decode_single(&symbol_fn, &symbol)?
                .into_string()
                .ok_or_else(|| anyhow!("symbol: not a string"))?,
            decimals: u8::try_from(decimals.low_u64()).context("decimals out of range")?,
        })
    }

    pub async fn launchpad_info(&self, launchpad: Address) -> Result<LaunchpadInfo> {
        let contract = ILaunchpad::new(launchpad, self.provider.clone());
        let name_fn = contract.abi().function("name")?.clone();
        let token_fn = contract.abi().function("token")?.clone();

        let calls = vec![
            Call::new(launchpad, encoded(contract.name().calldata())?),
            Call::new(launchpad, encoded(contract.token().calldata())?),
        ];
        let results = self.multicall.run(calls, None).await?;
        let [name, token] = <[Bytes; 2]>::try_from(results)
            .map_err(|r| anyhow!("launchpad info: expected 2 results, got {}", r.len()))?;

        Ok(LaunchpadInfo {
            name: decode_single(&name_fn, &name)?
                .into_string()
                .ok_or_else(|| anyhow!("name: not a string"))?,
            token: decode_single(&token_fn, &token)?
                .into_address()
                .ok_or_else(|| anyhow!("token: not an address"))?,
        })
    }
}

fn encoded(calldata: Option<Bytes>) -> Result<Bytes> {
    calldata.ok_or_else(|| anyhow!("failed to encode calldata"))
}

fn decode_single(function: &Function, raw: &Bytes) -> Result<Token> {
    function
        .decode_output(raw)
        .with_context(|| format!("decoding {} output", function.name))?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("{} returned nothing", function.name))
}

#[async_trait]
impl<M: Middleware + 'static> TransferSource for EthersChain<M> {
    async fn transfers(&self, from_block: u64, to_block: u64) -> Result<Vec<TransferEvent>> {
        let filter = transfer_filter(self.token, from_block, to_block);
        let logs = self
            .with_retry("eth_getLogs", || async {
                self.provider
                    .get_logs(&filter)
                    .await
                    .map_err(|e| anyhow!("eth_getLogs {}..={}: {}", from_block, to_block, e))
            })
            .await?;
        let events = decode_transfer_logs(self.token, &logs)
            .with_context(|| format!("decoding Transfer logs {}..={} on {}", from_block, to_block, self.chain))?;
        debug!(
            "📥 {} transfers in blocks {}..={} on {}",
            events.len(),
            from_block,
            to_block,
            self.chain
        );
        Ok(events)
    }
}

#[async_trait]
impl<M: Middleware + 'static> HolderClassifier for EthersChain<M> {
    async fn classify(&self, block: u64, addresses: &[Address]) -> Result<Vec<Classification>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let contracts = self.code_flags(block, addresses).await?;
        let blacklisted = self.blacklist_flags(block, addresses).await?;
        Ok(contracts
            .into_iter()
            .zip(blacklisted)
            .map(|(is_contract, is_blacklisted)| Classification {
                is_contract,
                is_blacklisted,
            })
            .collect())
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainStateReader for EthersChain<M> {
    async fn holder_states(&self, block: u64, addresses: &[Address]) -> Result<Vec<HolderInfo>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let balances = self.balances(block, addresses).await?;
        let classes = self.classify(block, addresses).await?;
        Ok(balances
            .into_iter()
            .zip(classes)
            .map(|(balance, c)| HolderInfo {
                balance,
                is_contract: c.is_contract,
                is_blacklisted: c.is_blacklisted,
            })
            .collect())
    }
}

/// Every configured chain, with the tracked token living on `home`.
pub struct Network<M: Middleware> {
    home: SupportedChain,
    distributor: Address,
    chains: BTreeMap<SupportedChain, Arc<EthersChain<M>>>,
}

impl<M: Middleware + 'static> Network<M> {
    pub fn new(home: Arc<EthersChain<M>>, distributor: Address) -> Self {
        let chain = home.chain();
        let mut chains = BTreeMap::new();
        chains.insert(chain, home);
        Self {
            home: chain,
            distributor,
            chains,
        }
    }

    pub fn with_chain(mut self, chain: Arc<EthersChain<M>>) -> Self {
        self.chains.insert(chain.chain(), chain);
        self
    }

    pub fn home(&self) -> Result<&Arc<EthersChain<M>>> {
        self.get(self.home)
    }

    pub fn get(&self, chain: SupportedChain) -> Result<&Arc<EthersChain<M>>> {
        self.chains
            .get(&chain)
            .ok_or_else(|| anyhow!("no RPC configured for {}", chain))
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainInfo for Network<M> {
    async fn finalized_block(&self) -> Result<BlockInfo> {
        self.home()?.finalized_block().await
    }

    async fn block(&self, number: u64) -> Result<BlockInfo> {
        self.home()?.block(number).await
    }

    async fn operator(&self) -> Result<Address> {
        self.home()?.operator().await
    }

    async fn distributor_root(&self, chain: SupportedChain, token: Address) -> Result<H256> {
        self.get(chain)?.distributor_root(self.distributor, token).await
    }

    async fn token_info(&self, chain: SupportedChain, token: Address) -> Result<TokenInfo> {
        self.get(chain)?.token_info(token).await
    }

    async fn launchpad_info(&self, chain: SupportedChain, launchpad: Address) -> Result<LaunchpadInfo> {
        self.get(chain)?.launchpad_info(launchpad).await
    }
}
