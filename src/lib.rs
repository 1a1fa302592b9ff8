//! # Snapshot Distributor
//!
//! Point-in-time holder ledgers for an ERC20 token, rebuilt from its
//! `Transfer` log, and Merkle distributions computed on top of them.
//!
//! ## Overview
//!
//! - **Snapshots**: replay transfer events block range by block range into a
//!   ledger and persist one immutable checkpoint per target block
//! - **Distributions**: split a reward budget pro rata over eligible holders,
//!   accumulate it per address and commit the totals to a Merkle root
//! - **Allocations & whitelists**: one-shot launchpad variants of the same split
//! - **Verification**: diff a checkpoint against live chain state, and audit
//!   every stored proof
//!
//! ## Architecture
//!
//! ### Core
//! [`replayer`], [`distribution`], [`merkle`] and [`reconciliation`] are pure
//! apart from the collaborator traits they are handed.
//!
//! ### Collaborators
//! [`chain`] (ethers + Multicall3), [`subgraph`] (holder index over HTTP) and
//! [`store`] / [`database`] (in-memory and Postgres persistence).
//!
//! ### Orchestration
//! [`pipeline`] sequences guards, computation and the single persistence
//! write of each command.

// Core Types
/// Ledger, snapshot, round and chain types
pub mod types;
/// Error taxonomy
pub mod error;
/// Block range batching
pub mod utils;

// Core
/// Transfer replay into a ledger
pub mod replayer;
/// Pro-rata splits and exclusions
pub mod distribution;
/// Sorted-pair Merkle trees
pub mod merkle;
/// Checkpoint reconciliation and proof audits
pub mod reconciliation;

// Collaborators
/// Chain access traits and the ethers implementation
pub mod chain;
/// Contract bindings
pub mod contracts;
/// Multicall3 batching
pub mod multicall;
/// ERC20 `Transfer` log filter and decoding
pub mod transfer_events;
/// Subgraph holder source
pub mod subgraph;
/// Persistence traits and in-memory store
pub mod store;
/// PostgreSQL store
pub mod database;

// Orchestration
/// Command-level operations
pub mod pipeline;

// Settings & Observability
/// Configuration management
pub mod settings;
/// Metrics (no-op unless the `observability` feature is enabled)
pub mod metrics;

// Re-exports for convenience
pub use error::{PipelineError, Result};
pub use pipeline::Pipeline;
pub use settings::Settings;
