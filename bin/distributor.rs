//! # distributor
//!
//! Operator CLI: extends holder checkpoints, builds reward, allocation and
//! whitelist rounds, and prints the data the on-chain contracts need.
//!
//! ## Usage
//!
//! ```bash
//! distributor block
//! distributor snapshot --to 19000000
//! distributor verify 19000000
//! distributor distribution new 1 0xToken 1000000000000000000000 19000000 4 7200
//! distributor distribution data 1 0xToken
//! distributor distribution check
//! distributor allocation new 42161 0xLaunchpad 500000000000000000000000 19000000 1 1
//! distributor whitelist new 42161 0xLaunchpad 1000000000000000000000
//! ```
//!
//! `new` commands print a summary and ask for confirmation unless `--yes`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use ethers::providers::{Http, Provider};
use ethers::types::{Address, U256};
use snapshot_distributor::{
    chain::{EthersChain, Network},
    database::PgStore,
    metrics,
    pipeline::{Collaborators, PendingRoot, Pipeline, PipelineParams, RoundPreview, RoundRequest},
    reconciliation::AuditReport,
    settings::{RoundSource, Settings},
    store::SnapshotStore,
    subgraph::{CheckpointHolders, HolderSource, SubgraphClient},
    types::{conversions::format_amount, BlockInfo, Snapshot, SupportedChain},
};
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "distributor", version, about = "Holder snapshots and Merkle distributions")]
struct Cli {
    /// Skip confirmation prompts
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the last finalized block
    Block,
    /// Extend the last checkpoint up to a block (default: last finalized)
    Snapshot {
        #[arg(long)]
        to: Option<u64>,
    },
    /// Diff a stored checkpoint against chain state
    Verify { block_number: u64 },
    #[command(subcommand)]
    Distribution(DistributionCommand),
    #[command(subcommand)]
    Allocation(AllocationCommand),
    #[command(subcommand)]
    Whitelist(WhitelistCommand),
}

#[derive(Args)]
struct RoundArgs {
    /// Chain id of the round (1 or 42161)
    chain_id: u64,
    /// Reward token (distribution) or launchpad (allocation) address
    #[arg(value_parser = parse_address)]
    target: Address,
    /// Amount in the smallest unit
    #[arg(value_parser = parse_positive_u256)]
    amount: U256,
    /// Block of the most recent snapshot
    block_number: u64,
    /// Number of retrospective snapshots
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    snapshots: u32,
    /// Blocks between two retrospective snapshots
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,
}

impl RoundArgs {
    fn request(&self) -> Result<RoundRequest> {
        Ok(RoundRequest {
            chain: SupportedChain::try_from(self.chain_id)?,
            target: self.target,
            amount: self.amount,
            block_number: self.block_number,
            snapshots: self.snapshots,
            interval: self.interval,
        })
    }
}

#[derive(Subcommand)]
enum DistributionCommand {
    /// Distribute an amount of a token to holders
    New(RoundArgs),
    /// Print the `updateRoot` arguments for the distributor
    Data {
        chain_id: u64,
        #[arg(value_parser = parse_address)]
        token: Address,
    },
    /// Re-verify stored proofs (every pair unless one is given)
    Check {
        #[arg(requires = "token")]
        chain_id: Option<u64>,
        #[arg(value_parser = parse_address)]
        token: Option<Address>,
    },
}

#[derive(Subcommand)]
enum AllocationCommand {
    /// Allocate an amount of the launchpad token to holders
    New(RoundArgs),
    /// Print the stored allocation root
    Data {
        chain_id: u64,
        #[arg(value_parser = parse_address)]
        launchpad: Address,
    },
    /// Re-verify every stored allocation and whitelist
    Check,
}

#[derive(Subcommand)]
enum WhitelistCommand {
    /// Whitelist holders with at least `min_balance` (raw units)
    New {
        chain_id: u64,
        #[arg(value_parser = parse_address)]
        launchpad: Address,
        #[arg(value_parser = parse_u256)]
        min_balance: U256,
        /// Defaults to the last finalized block
        block_number: Option<u64>,
    },
    /// Print the `updateWhitelist` arguments for the launchpad
    Data {
        chain_id: u64,
        #[arg(value_parser = parse_address)]
        launchpad: Address,
    },
}

fn parse_address(value: &str) -> Result<Address, String> {
    Address::from_str(value).map_err(|_| "must be a valid address".to_string())
}

fn parse_u256(value: &str) -> Result<U256, String> {
    U256::from_dec_str(value).map_err(|_| "must be a non-negative integer".to_string())
}

fn parse_positive_u256(value: &str) -> Result<U256, String> {
    let parsed = parse_u256(value)?;
    if parsed.is_zero() {
        return Err("must be greater than 0".to_string());
    }
    Ok(parsed)
}

/// Stands in for the subgraph when no URL is configured, so commands that
/// never read holder sets still run.
struct UnconfiguredSubgraph;

#[async_trait]
impl HolderSource for UnconfiguredSubgraph {
    async fn holders(&self, _block: u64, _min_balance: U256) -> Result<Snapshot> {
        bail!("SUBGRAPH_URL must be defined (or set round_source = \"checkpoints\")")
    }
}

fn init_logging() {
    #[cfg(feature = "observability")]
    {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::INFO)
            .init();
    }
    #[cfg(not(feature = "observability"))]
    {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }
    metrics::describe_metrics();
}

async fn connect_chain(settings: &Settings, chain: SupportedChain) -> Result<Arc<EthersChain<Provider<Http>>>> {
    let endpoint = settings
        .endpoint(chain)
        .ok_or_else(|| anyhow!("no RPC configured for {}", chain))?;
    let connected = EthersChain::connect(
        chain,
        &endpoint.rpc_url,
        endpoint.multicall,
        settings.token.address,
        settings.replay.multicall_batch_size,
    )
    .await?
    .with_retries(settings.replay.max_retries);
    Ok(Arc::new(connected))
}

async fn build_pipeline(settings: &Settings) -> Result<Pipeline> {
    let home_chain = settings.home_chain()?;
    let home = connect_chain(settings, home_chain).await?;

    let mut network = Network::new(home.clone(), settings.token.distributor);
    for chain in SupportedChain::ALL {
        if chain != home_chain && settings.endpoint(chain).is_some() {
            network = network.with_chain(connect_chain(settings, chain).await?);
        }
    }

    let store = Arc::new(
        PgStore::connect(
            settings.database_url()?,
            settings.database.max_connections,
            settings.token.init_block,
        )
        .await?,
    );

    let holders: Arc<dyn HolderSource> = match (settings.round_source, settings.subgraph.url.as_deref()) {
        (RoundSource::Checkpoints, _) => Arc::new(CheckpointHolders::new(store.clone() as Arc<dyn SnapshotStore>)),
        (RoundSource::Subgraph, Some(url)) => Arc::new(SubgraphClient::new(
            url,
            settings.subgraph.page_size,
            settings.subgraph.max_pages,
        )?),
        (RoundSource::Subgraph, None) => Arc::new(UnconfiguredSubgraph),
    };

    let collaborators = Collaborators {
        chain: Arc::new(network),
        transfers: home.clone(),
        classifier: home.clone(),
        state: home,
        holders,
        snapshots: store.clone(),
        rounds: store,
    };
    Ok(Pipeline::new(collaborators, PipelineParams::from_settings(settings)?))
}

fn utc(block: &BlockInfo) -> String {
    Utc.timestamp_opt(block.timestamp as i64, 0)
        .single()
        .map(|t| t.to_rfc2822())
        .unwrap_or_else(|| format!("timestamp {}", block.timestamp))
}

fn confirm(yes: bool) -> Result<()> {
    if yes {
        return Ok(());
    }
    print!("Are you sure you want to continue? [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => Ok(()),
        _ => bail!("terminated by user"),
    }
}

fn print_round_preview(chain: SupportedChain, preview: &RoundPreview, request: &RoundRequest) {
    println!("Chain: {}", chain.name().bold());
    if let Some(launchpad) = &preview.launchpad {
        println!("Launchpad: {} ({:?})", launchpad.name.bold(), request.target);
    }
    println!("Token: {} ({:?})", preview.token_info.name.bold(), preview.token);
    println!(
        "Amount: {} ${}",
        format_amount(request.amount, preview.token_info.decimals).bold(),
        preview.token_info.symbol
    );
    println!("Block number: {} ({})", request.block_number, utc(&preview.block));
    println!("Number of snapshots: {}", request.snapshots);
    println!("Interval between snapshots: {}", request.interval);
}

fn print_update_root(pending: &PendingRoot) {
    if pending.pending_rounds == 0 {
        println!("{}", "Distributor root is up to date.".green());
    }
    println!("updateRoot(\n{:?}\n{}\n{:?}\n)", pending.token, pending.total, pending.root);
}

fn print_audit(report: AuditReport) -> Result<()> {
    for finding in &report.findings {
        println!("{} {}", "✗".red(), finding);
    }
    if report.rounds == 0 {
        println!("nothing to check");
    }
    let report = report.into_result()?;
    println!(
        "{} {} round(s), {} proof(s) verified",
        "✓".green(),
        report.rounds,
        report.proofs
    );
    Ok(())
}

async fn run(cli: Cli, settings: Settings) -> Result<()> {
    // Only needs the home chain RPC
    if let Command::Block = cli.command {
        let home = connect_chain(&settings, settings.home_chain()?).await?;
        let block = home.finalized_block().await?;
        println!("Last finalized block:");
        println!("{}", utc(&block));
        println!("{}", block.number.to_string().bold());
        return Ok(());
    }

    let pipeline = build_pipeline(&settings).await?;

    match cli.command {
        Command::Block => {}
        Command::Snapshot { to } => {
            let run = pipeline.run_snapshot(to).await?;
            println!(
                "{} checkpoint at block {}: {} holders ({} events over blocks {}..={}, {} clamped)",
                "✓".green(),
                run.to_block,
                run.holders,
                run.stats.events,
                run.from_block,
                run.to_block,
                run.stats.clamped
            );
        }
        Command::Verify { block_number } => {
            let report = pipeline.verify(block_number).await?;
            for mismatch in &report.mismatches {
                println!("{} {}", "✗".red(), mismatch);
            }
            let report = report.into_result()?;
            println!(
                "{} snapshot at block {} matches chain state ({} participants, {} holders)",
                "✓".green(),
                report.block_number,
                report.checked,
                report.observed_holders
            );
        }
        Command::Distribution(DistributionCommand::New(args)) => {
            let request = args.request()?;
            let preview = pipeline.distribution_preview(&request).await?;
            print_round_preview(request.chain, &preview, &request);
            confirm(cli.yes)?;

            let distribution = pipeline.new_distribution(&request).await?;
            println!(
                "{} {} recipients, {} distributed, root {:?}",
                "✓".green(),
                distribution.items.len(),
                format_amount(distribution.total_rewards, preview.token_info.decimals),
                distribution.root
            );
            print_update_root(&pipeline.pending_root(request.chain, request.target).await?);
        }
        Command::Distribution(DistributionCommand::Data { chain_id, token }) => {
            let chain = SupportedChain::try_from(chain_id)?;
            print_update_root(&pipeline.pending_root(chain, token).await?);
        }
        Command::Distribution(DistributionCommand::Check { chain_id, token }) => {
            let pair = match (chain_id, token) {
                (Some(chain_id), Some(token)) => Some((SupportedChain::try_from(chain_id)?, token)),
                _ => None,
            };
            print_audit(pipeline.check_distributions(pair).await?)?;
        }
        Command::Allocation(AllocationCommand::New(args)) => {
            let request = args.request()?;
            let preview = pipeline.allocation_preview(&request).await?;
            print_round_preview(request.chain, &preview, &request);
            confirm(cli.yes)?;

            let allocation = pipeline.new_allocation(&request).await?;
            println!(
                "{} {} recipients, {} ${} allocated",
                "✓".green(),
                allocation.items.len(),
                format_amount(allocation.total_allocations, preview.token_info.decimals),
                preview.token_info.symbol
            );
            println!("root: {:?}", allocation.root);
        }
        Command::Allocation(AllocationCommand::Data { chain_id, launchpad }) => {
            let chain = SupportedChain::try_from(chain_id)?;
            let allocation = pipeline.allocation(chain, launchpad).await?;
            println!("Launchpad: {:?}", allocation.launchpad);
            println!("Block number: {}", allocation.block_number);
            println!("Total allocations: {}", allocation.total_allocations);
            println!("Recipients: {}", allocation.items.len());
            println!("root: {:?}", allocation.root);
        }
        Command::Allocation(AllocationCommand::Check) => {
            print_audit(pipeline.check_allocations().await?)?;
        }
        Command::Whitelist(WhitelistCommand::New {
            chain_id,
            launchpad,
            min_balance,
            block_number,
        }) => {
            let chain = SupportedChain::try_from(chain_id)?;
            let block = match block_number {
                Some(block) => block,
                None => pipeline.finalized_block().await?.number,
            };
            let preview = pipeline.whitelist_preview(chain, launchpad, block).await?;
            println!("Chain: {}", chain.name().bold());
            if let Some(info) = &preview.launchpad {
                println!("Launchpad: {} ({:?})", info.name.bold(), launchpad);
            }
            println!(
                "Min balance: {} ${}",
                format_amount(min_balance, preview.token_info.decimals).bold(),
                preview.token_info.symbol
            );
            println!("Block number: {} ({})", block, utc(&preview.block));
            confirm(cli.yes)?;

            let whitelist = pipeline.new_whitelist(chain, launchpad, min_balance, Some(block)).await?;
            println!("{} {} members", "✓".green(), whitelist.items.len());
            println!("updateWhitelist(\n{:?}\n{:?}\n)", whitelist.launchpad, whitelist.root);
        }
        Command::Whitelist(WhitelistCommand::Data { chain_id, launchpad }) => {
            let chain = SupportedChain::try_from(chain_id)?;
            let whitelist = pipeline.whitelist(chain, launchpad).await?;
            println!("updateWhitelist(\n{:?}\n{:?}\n)", whitelist.launchpad, whitelist.root);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let outcome = match Settings::new().context("failed to load settings") {
        Ok(settings) => run(cli, settings).await,
        Err(e) => Err(e),
    };

    if let Err(e) = outcome {
        log::error!("{:#}", e);
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
