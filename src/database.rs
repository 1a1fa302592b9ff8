use crate::metrics;
use crate::store::{DistributionStore, SnapshotStore};
use crate::types::conversions::{
    address_to_string, block_to_i64, h256_to_string, i64_to_block, string_to_address, string_to_h256,
    string_to_u256, u256_to_string,
};
use crate::types::{Allocation, Distribution, DistributionItem, HolderInfo, Snapshot, Whitelist, WhitelistItem};
use anyhow::{bail, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Connection, Pool, Postgres, Row};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

/// Database schema name
pub const SCHEMA: &str = "snapshot_distributor";

const MIGRATION_LOCK_ID: i64 = 0x534E41505348_4F54; // "SNAPSHOT"
// Serializes writers so the "strictly after the last one" checks see committed state.
const WRITE_LOCK_ID: i64 = 0x524F554E_44535452; // "ROUNDSTR"

// Rows per multi-VALUES insert; Postgres caps a statement at 65535 binds.
const INSERT_CHUNK_SIZE: usize = 1000;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<DbPool> {
    // Force UTF-8 client encoding to avoid sqlx issues with non-ASCII error messages
    env::set_var("PGCLIENTENCODING", "UTF8");

    let mut last_err: Option<anyhow::Error> = None;
    let max_attempts: u32 = 10;
    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                log::info!(
                    "✅ Successfully connected to database (attempt {}/{}).",
                    attempt,
                    max_attempts
                );
                if let Err(e) = initialize_database(&pool).await {
                    last_err = Some(e);
                } else {
                    return Ok(pool);
                }
            }
            Err(e) => {
                last_err = Some(e.into());
            }
        }
        let delay_ms = (1u64 << attempt.min(6)) * 200; // 400ms, 800ms, ... capped at 12.8s
        log::warn!(
            "DB connect/init attempt {}/{} failed. Retrying in {} ms...",
            attempt,
            max_attempts,
            delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Unknown DB connection error")))
}

pub async fn initialize_database(pool: &DbPool) -> Result<()> {
    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    log::info!("Acquiring database migration lock...");
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(tx.as_mut())
        .await?;

    let tables_exist = sqlx::query(&format!(
        "SELECT COUNT(*) as count FROM information_schema.tables
             WHERE table_schema = '{}'
             AND table_name IN ('checkpoints', 'snapshots', 'distributions', 'distributions_proofs',
                                'allocations', 'allocations_proofs', 'whitelists', 'whitelists_proofs')",
        SCHEMA
    ))
    .fetch_one(tx.as_mut())
    .await?
    .try_get::<i64, _>("count")?
        >= 8;

    if tables_exist {
        log::info!("✅ Database schema already exists.");
    } else {
        log::info!("📝 Creating database schema for the first time...");
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA))
            .execute(tx.as_mut())
            .await?;
    }
    // CREATE ... IF NOT EXISTS throughout, safe to rerun
    create_tables(&mut tx).await?;

    tx.commit().await?;
    log::info!("Database initialization complete, transaction committed.");
    Ok(())
}

async fn create_tables(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>) -> Result<()> {
    let statements = [
        // One row per persisted checkpoint; holder rows hang off it.
        format!(
            "CREATE TABLE IF NOT EXISTS {}.checkpoints (
                block_number BIGINT PRIMARY KEY,
                holders INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {0}.snapshots (
                block_number BIGINT NOT NULL REFERENCES {0}.checkpoints(block_number),
                address VARCHAR(42) NOT NULL,
                balance TEXT NOT NULL,
                is_contract BOOLEAN NOT NULL,
                is_blacklisted BOOLEAN NOT NULL,
                PRIMARY KEY (block_number, address)
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.distributions (
                chain_id BIGINT NOT NULL,
                token VARCHAR(42) NOT NULL,
                block_number BIGINT NOT NULL,
                snapshots INTEGER NOT NULL,
                interval_blocks BIGINT NOT NULL,
                total_shares TEXT NOT NULL,
                total_rewards TEXT NOT NULL,
                root VARCHAR(66) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (chain_id, token, block_number)
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {0}.distributions_proofs (
                chain_id BIGINT NOT NULL,
                token VARCHAR(42) NOT NULL,
                block_number BIGINT NOT NULL,
                address VARCHAR(42) NOT NULL,
                shares TEXT NOT NULL,
                amount TEXT NOT NULL,
                proof TEXT[] NOT NULL,
                PRIMARY KEY (chain_id, token, block_number, address),
                FOREIGN KEY (chain_id, token, block_number)
                    REFERENCES {0}.distributions(chain_id, token, block_number)
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.allocations (
                chain_id BIGINT NOT NULL,
                launchpad VARCHAR(42) NOT NULL,
                block_number BIGINT NOT NULL,
                snapshots INTEGER NOT NULL,
                interval_blocks BIGINT NOT NULL,
                total_shares TEXT NOT NULL,
                total_allocations TEXT NOT NULL,
                root VARCHAR(66) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (chain_id, launchpad)
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {0}.allocations_proofs (
                chain_id BIGINT NOT NULL,
                launchpad VARCHAR(42) NOT NULL,
                address VARCHAR(42) NOT NULL,
                shares TEXT NOT NULL,
                amount TEXT NOT NULL,
                proof TEXT[] NOT NULL,
                PRIMARY KEY (chain_id, launchpad, address),
                FOREIGN KEY (chain_id, launchpad) REFERENCES {0}.allocations(chain_id, launchpad)
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.whitelists (
                chain_id BIGINT NOT NULL,
                launchpad VARCHAR(42) NOT NULL,
                block_number BIGINT NOT NULL,
                min_balance TEXT NOT NULL,
                root VARCHAR(66) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (chain_id, launchpad)
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {0}.whitelists_proofs (
                chain_id BIGINT NOT NULL,
                launchpad VARCHAR(42) NOT NULL,
                address VARCHAR(42) NOT NULL,
                balance TEXT NOT NULL,
                proof TEXT[] NOT NULL,
                PRIMARY KEY (chain_id, launchpad, address),
                FOREIGN KEY (chain_id, launchpad) REFERENCES {0}.whitelists(chain_id, launchpad)
            )",
            SCHEMA
        ),
    ];

    for statement in statements.iter() {
        sqlx::query(statement).execute(tx.as_mut()).await?;
    }
    Ok(())
}

/// `($1, $2, ...), ($n+1, ...)` for `rows` rows of `columns` binds each.
fn values_clause(rows: usize, columns: usize) -> String {
    (0..rows)
        .map(|row| {
            let binds: Vec<String> = (1..=columns).map(|col| format!("${}", row * columns + col)).collect();
            format!("({})", binds.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn proof_strings(proof: &[H256]) -> Vec<String> {
    proof.iter().map(|h| h256_to_string(*h)).collect()
}

fn parse_proof(raw: Vec<String>) -> Result<Vec<H256>> {
    raw.iter().map(|s| Ok(string_to_h256(s)?)).collect()
}

fn chain_to_i64(chain_id: u64) -> Result<i64> {
    Ok(block_to_i64(chain_id)?)
}

fn parse_item(row: &PgRow, amount_column: &str) -> Result<DistributionItem> {
    Ok(DistributionItem {
        address: string_to_address(&row.try_get::<String, _>("address")?)?,
        balance: string_to_u256(&row.try_get::<String, _>("shares")?)?,
        amount: string_to_u256(&row.try_get::<String, _>(amount_column)?)?,
        proof: parse_proof(row.try_get("proof")?)?,
    })
}

/// Postgres-backed [`SnapshotStore`] and [`DistributionStore`].
///
/// Every save runs in one transaction under an advisory lock: the header row
/// and all of its holder or proof rows commit together, and the ordering
/// checks read the state the insert is going to extend.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    init_block: u64,
}

impl PgStore {
    pub fn new(pool: DbPool, init_block: u64) -> Self {
        Self { pool, init_block }
    }

    pub async fn connect(database_url: &str, max_connections: u32, init_block: u64) -> Result<Self> {
        Ok(Self::new(connect(database_url, max_connections).await?, init_block))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn load_distributions(&self, chain_id: u64, token: Address, only_block: Option<u64>) -> Result<Vec<Distribution>> {
        let chain = chain_to_i64(chain_id)?;
        let token_str = address_to_string(token);
        let block_filter = match only_block {
            Some(block) => format!("AND block_number = {}", block_to_i64(block)?),
            None => String::new(),
        };

        let rows = sqlx::query(&format!(
            "SELECT block_number, snapshots, interval_blocks, total_shares, total_rewards, root
             FROM {}.distributions
             WHERE chain_id = $1 AND token = $2 {}
             ORDER BY block_number ASC",
            SCHEMA, block_filter
        ))
        .bind(chain)
        .bind(&token_str)
        .fetch_all(&self.pool)
        .await?;

        let mut rounds = BTreeMap::new();
        for row in rows {
            let block_number = i64_to_block(row.try_get("block_number")?)?;
            rounds.insert(
                block_number,
                Distribution {
                    chain_id,
                    token,
                    block_number,
                    snapshots: row.try_get::<i32, _>("snapshots")? as u32,
                    interval: i64_to_block(row.try_get("interval_blocks")?)?,
                    total_shares: string_to_u256(&row.try_get::<String, _>("total_shares")?)?,
                    total_rewards: string_to_u256(&row.try_get::<String, _>("total_rewards")?)?,
                    root: string_to_h256(&row.try_get::<String, _>("root")?)?,
                    items: Vec::new(),
                },
            );
        }
        if rounds.is_empty() {
            return Ok(Vec::new());
        }

        let proofs = sqlx::query(&format!(
            "SELECT block_number, address, shares, amount, proof
             FROM {}.distributions_proofs
             WHERE chain_id = $1 AND token = $2 {}
             ORDER BY block_number ASC, address ASC",
            SCHEMA, block_filter
        ))
        .bind(chain)
        .bind(&token_str)
        .fetch_all(&self.pool)
        .await?;

        for row in proofs {
            let block_number = i64_to_block(row.try_get("block_number")?)?;
            let item = parse_item(&row, "amount")?;
            match rounds.get_mut(&block_number) {
                Some(round) => round.items.push(item),
                None => bail!("proof row for unknown distribution at block {}", block_number),
            }
        }
        Ok(rounds.into_values().collect())
    }

    async fn load_allocations(&self, key: Option<(u64, Address)>) -> Result<Vec<Allocation>> {
        let filter = match key {
            Some((chain_id, launchpad)) => format!(
                "WHERE chain_id = {} AND launchpad = '{}'",
                chain_to_i64(chain_id)?,
                address_to_string(launchpad)
            ),
            None => String::new(),
        };
        let rows = sqlx::query(&format!(
            "SELECT chain_id, launchpad, block_number, snapshots, interval_blocks,
                    total_shares, total_allocations, root
             FROM {}.allocations {} ORDER BY chain_id, launchpad",
            SCHEMA, filter
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut allocations = BTreeMap::new();
        for row in rows {
            let chain_id = i64_to_block(row.try_get("chain_id")?)?;
            let launchpad = string_to_address(&row.try_get::<String, _>("launchpad")?)?;
            allocations.insert(
                (chain_id, launchpad),
                Allocation {
                    chain_id,
                    launchpad,
                    block_number: i64_to_block(row.try_get("block_number")?)?,
                    snapshots: row.try_get::<i32, _>("snapshots")? as u32,
                    interval: i64_to_block(row.try_get("interval_blocks")?)?,
                    total_shares: string_to_u256(&row.try_get::<String, _>("total_shares")?)?,
                    total_allocations: string_to_u256(&row.try_get::<String, _>("total_allocations")?)?,
                    root: string_to_h256(&row.try_get::<String, _>("root")?)?,
                    items: Vec::new(),
                },
            );
        }
        if allocations.is_empty() {
            return Ok(Vec::new());
        }

        let proofs = sqlx::query(&format!(
            "SELECT chain_id, launchpad, address, shares, amount, proof
             FROM {}.allocations_proofs {} ORDER BY chain_id, launchpad, address",
            SCHEMA, filter
        ))
        .fetch_all(&self.pool)
        .await?;
        for row in proofs {
            let chain_id = i64_to_block(row.try_get("chain_id")?)?;
            let launchpad = string_to_address(&row.try_get::<String, _>("launchpad")?)?;
            let item = parse_item(&row, "amount")?;
            match allocations.get_mut(&(chain_id, launchpad)) {
                Some(allocation) => allocation.items.push(item),
                None => bail!("proof row for unknown allocation {:?}", launchpad),
            }
        }
        Ok(allocations.into_values().collect())
    }

    async fn load_whitelists(&self, key: Option<(u64, Address)>) -> Result<Vec<Whitelist>> {
        let filter = match key {
            Some((chain_id, launchpad)) => format!(
                "WHERE chain_id = {} AND launchpad = '{}'",
                chain_to_i64(chain_id)?,
                address_to_string(launchpad)
            ),
            None => String::new(),
        };
        let rows = sqlx::query(&format!(
            "SELECT chain_id, launchpad, block_number, min_balance, root
             FROM {}.whitelists {} ORDER BY chain_id, launchpad",
            SCHEMA, filter
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut whitelists = BTreeMap::new();
        for row in rows {
            let chain_id = i64_to_block(row.try_get("chain_id")?)?;
            let launchpad = string_to_address(&row.try_get::<String, _>("launchpad")?)?;
            whitelists.insert(
                (chain_id, launchpad),
                Whitelist {
                    chain_id,
                    launchpad,
                    block_number: i64_to_block(row.try_get("block_number")?)?,
                    min_balance: string_to_u256(&row.try_get::<String, _>("min_balance")?)?,
                    root: string_to_h256(&row.try_get::<String, _>("root")?)?,
                    items: Vec::new(),
                },
            );
        }
        if whitelists.is_empty() {
            return Ok(Vec::new());
        }

        let proofs = sqlx::query(&format!(
            "SELECT chain_id, launchpad, address, balance, proof
             FROM {}.whitelists_proofs {} ORDER BY chain_id, launchpad, address",
            SCHEMA, filter
        ))
        .fetch_all(&self.pool)
        .await?;
        for row in proofs {
            let chain_id = i64_to_block(row.try_get("chain_id")?)?;
            let launchpad = string_to_address(&row.try_get::<String, _>("launchpad")?)?;
            let item = WhitelistItem {
                address: string_to_address(&row.try_get::<String, _>("address")?)?,
                balance: string_to_u256(&row.try_get::<String, _>("balance")?)?,
                proof: parse_proof(row.try_get("proof")?)?,
            };
            match whitelists.get_mut(&(chain_id, launchpad)) {
                Some(whitelist) => whitelist.items.push(item),
                None => bail!("proof row for unknown whitelist {:?}", launchpad),
            }
        }
        Ok(whitelists.into_values().collect())
    }
}

async fn lock_writes(tx: &mut sqlx::Transaction<'_, Postgres>) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(WRITE_LOCK_ID)
        .execute(tx.as_mut())
        .await?;
    Ok(())
}

/// Key columns shared by every proof row of one round.
struct ProofKey<'a> {
    chain_id: i64,
    subject_column: &'a str,
    subject: String,
    block_number: Option<i64>,
}

async fn insert_proof_rows(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    table: &str,
    key: &ProofKey<'_>,
    items: &[DistributionItem],
) -> Result<()> {
    let (key_columns, key_binds) = match key.block_number {
        Some(_) => (format!("chain_id, {}, block_number", key.subject_column), 3),
        None => (format!("chain_id, {}", key.subject_column), 2),
    };
    for chunk in items.chunks(INSERT_CHUNK_SIZE) {
        let query_string = format!(
            "INSERT INTO {}.{} ({}, address, shares, amount, proof) VALUES {}",
            SCHEMA,
            table,
            key_columns,
            values_clause(chunk.len(), key_binds + 4)
        );
        let mut query = sqlx::query(&query_string);
        for item in chunk {
            query = query.bind(key.chain_id).bind(key.subject.clone());
            if let Some(block) = key.block_number {
                query = query.bind(block);
            }
            query = query
                .bind(address_to_string(item.address))
                .bind(u256_to_string(item.balance))
                .bind(u256_to_string(item.amount))
                .bind(proof_strings(&item.proof));
        }
        query.execute(tx.as_mut()).await?;
    }
    metrics::increment_persisted_rows(table, items.len());
    Ok(())
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn last_checkpoint(&self) -> Result<u64> {
        let row = sqlx::query(&format!(
            "SELECT MAX(block_number) AS block_number FROM {}.checkpoints",
            SCHEMA
        ))
        .fetch_one(&self.pool)
        .await?;
        match row.try_get::<Option<i64>, _>("block_number")? {
            Some(block) => Ok(i64_to_block(block)?),
            None => Ok(self.init_block.saturating_sub(1)),
        }
    }

    async fn snapshot_at(&self, block: u64) -> Result<Option<Snapshot>> {
        let block_i64 = block_to_i64(block)?;
        let exists = sqlx::query(&format!(
            "SELECT 1 FROM {}.checkpoints WHERE block_number = $1",
            SCHEMA
        ))
        .bind(block_i64)
        .fetch_optional(&self.pool)
        .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let rows = sqlx::query(&format!(
            "SELECT address, balance, is_contract, is_blacklisted
             FROM {}.snapshots WHERE block_number = $1",
            SCHEMA
        ))
        .bind(block_i64)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = Snapshot {
            block_number: block,
            ..Default::default()
        };
        for row in rows {
            let address = string_to_address(&row.try_get::<String, _>("address")?)?;
            snapshot.holders.insert(
                address,
                HolderInfo {
                    balance: string_to_u256(&row.try_get::<String, _>("balance")?)?,
                    is_contract: row.try_get("is_contract")?,
                    is_blacklisted: row.try_get("is_blacklisted")?,
                },
            );
        }
        Ok(Some(snapshot))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let block = block_to_i64(snapshot.block_number)?;
        let mut tx = self.pool.begin().await?;
        lock_writes(&mut tx).await?;

        let last: Option<i64> = sqlx::query(&format!(
            "SELECT MAX(block_number) AS block_number FROM {}.checkpoints",
            SCHEMA
        ))
        .fetch_one(&mut *tx)
        .await?
        .try_get("block_number")?;
        if let Some(last) = last {
            if block <= last {
                bail!("snapshot at block {} would not extend checkpoint {}", block, last);
            }
        }

        sqlx::query(&format!(
            "INSERT INTO {}.checkpoints (block_number, holders) VALUES ($1, $2)",
            SCHEMA
        ))
        .bind(block)
        .bind(snapshot.len() as i32)
        .execute(&mut *tx)
        .await?;

        let holders: Vec<_> = snapshot.holders.iter().collect();
        for chunk in holders.chunks(INSERT_CHUNK_SIZE) {
            let query_string = format!(
                "INSERT INTO {}.snapshots (block_number, address, balance, is_contract, is_blacklisted) VALUES {}",
                SCHEMA,
                values_clause(chunk.len(), 5)
            );
            let mut query = sqlx::query(&query_string);
            for (address, holder) in chunk {
                query = query
                    .bind(block)
                    .bind(address_to_string(**address))
                    .bind(u256_to_string(holder.balance))
                    .bind(holder.is_contract)
                    .bind(holder.is_blacklisted);
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        metrics::increment_persisted_rows("snapshots", holders.len());
        metrics::set_checkpoint_block(snapshot.block_number);
        log::info!(
            "💾 Saved checkpoint at block {} ({} holders)",
            snapshot.block_number,
            holders.len()
        );
        Ok(())
    }
}

#[async_trait]
impl DistributionStore for PgStore {
    async fn last_distribution(&self, chain_id: u64, token: Address) -> Result<Option<Distribution>> {
        let row = sqlx::query(&format!(
            "SELECT MAX(block_number) AS block_number FROM {}.distributions
             WHERE chain_id = $1 AND token = $2",
            SCHEMA
        ))
        .bind(chain_to_i64(chain_id)?)
        .bind(address_to_string(token))
        .fetch_one(&self.pool)
        .await?;

        let block = match row.try_get::<Option<i64>, _>("block_number")? {
            Some(block) => i64_to_block(block)?,
            None => return Ok(None),
        };
        Ok(self.load_distributions(chain_id, token, Some(block)).await?.pop())
    }

    async fn distributions(&self, chain_id: u64, token: Address) -> Result<Vec<Distribution>> {
        self.load_distributions(chain_id, token, None).await
    }

    async fn distribution_pairs(&self) -> Result<Vec<(u64, Address)>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT chain_id, token FROM {}.distributions ORDER BY chain_id, token",
            SCHEMA
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    i64_to_block(row.try_get("chain_id")?)?,
                    string_to_address(&row.try_get::<String, _>("token")?)?,
                ))
            })
            .collect()
    }

    async fn save_distribution(&self, distribution: &Distribution) -> Result<()> {
        let chain = chain_to_i64(distribution.chain_id)?;
        let token = address_to_string(distribution.token);
        let block = block_to_i64(distribution.block_number)?;

        let mut tx = self.pool.begin().await?;
        lock_writes(&mut tx).await?;

        let last: Option<i64> = sqlx::query(&format!(
            "SELECT MAX(block_number) AS block_number FROM {}.distributions
             WHERE chain_id = $1 AND token = $2",
            SCHEMA
        ))
        .bind(chain)
        .bind(&token)
        .fetch_one(&mut *tx)
        .await?
        .try_get("block_number")?;
        if let Some(last) = last {
            if block <= last {
                bail!("distribution at block {} is not after existing round {}", block, last);
            }
        }

        sqlx::query(&format!(
            "INSERT INTO {}.distributions
                (chain_id, token, block_number, snapshots, interval_blocks, total_shares, total_rewards, root)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            SCHEMA
        ))
        .bind(chain)
        .bind(&token)
        .bind(block)
        .bind(distribution.snapshots as i32)
        .bind(block_to_i64(distribution.interval)?)
        .bind(u256_to_string(distribution.total_shares))
        .bind(u256_to_string(distribution.total_rewards))
        .bind(h256_to_string(distribution.root))
        .execute(&mut *tx)
        .await?;

        insert_proof_rows(
            &mut tx,
            "distributions_proofs",
            &ProofKey {
                chain_id: chain,
                subject_column: "token",
                subject: token.clone(),
                block_number: Some(block),
            },
            &distribution.items,
        )
        .await?;

        tx.commit().await?;
        log::info!(
            "💾 Saved distribution for {} on chain {} at block {} ({} proofs)",
            token,
            distribution.chain_id,
            distribution.block_number,
            distribution.items.len()
        );
        Ok(())
    }

    async fn allocation(&self, chain_id: u64, launchpad: Address) -> Result<Option<Allocation>> {
        Ok(self.load_allocations(Some((chain_id, launchpad))).await?.pop())
    }

    async fn allocations(&self) -> Result<Vec<Allocation>> {
        self.load_allocations(None).await
    }

    async fn save_allocation(&self, allocation: &Allocation) -> Result<()> {
        let chain = chain_to_i64(allocation.chain_id)?;
        let launchpad = address_to_string(allocation.launchpad);

        let mut tx = self.pool.begin().await?;
        lock_writes(&mut tx).await?;

        let exists = sqlx::query(&format!(
            "SELECT 1 FROM {}.allocations WHERE chain_id = $1 AND launchpad = $2",
            SCHEMA
        ))
        .bind(chain)
        .bind(&launchpad)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_some() {
            bail!("allocation already exists for launchpad {}", launchpad);
        }

        sqlx::query(&format!(
            "INSERT INTO {}.allocations
                (chain_id, launchpad, block_number, snapshots, interval_blocks, total_shares, total_allocations, root)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            SCHEMA
        ))
        .bind(chain)
        .bind(&launchpad)
        .bind(block_to_i64(allocation.block_number)?)
        .bind(allocation.snapshots as i32)
        .bind(block_to_i64(allocation.interval)?)
        .bind(u256_to_string(allocation.total_shares))
        .bind(u256_to_string(allocation.total_allocations))
        .bind(h256_to_string(allocation.root))
        .execute(&mut *tx)
        .await?;

        insert_proof_rows(
            &mut tx,
            "allocations_proofs",
            &ProofKey {
                chain_id: chain,
                subject_column: "launchpad",
                subject: launchpad.clone(),
                block_number: None,
            },
            &allocation.items,
        )
        .await?;

        tx.commit().await?;
        log::info!(
            "💾 Saved allocation for launchpad {} ({} proofs)",
            launchpad,
            allocation.items.len()
        );
        Ok(())
    }

    async fn whitelist(&self, chain_id: u64, launchpad: Address) -> Result<Option<Whitelist>> {
        Ok(self.load_whitelists(Some((chain_id, launchpad))).await?.pop())
    }

    async fn whitelists(&self) -> Result<Vec<Whitelist>> {
        self.load_whitelists(None).await
    }

    async fn save_whitelist(&self, whitelist: &Whitelist) -> Result<()> {
        let chain = chain_to_i64(whitelist.chain_id)?;
        let launchpad = address_to_string(whitelist.launchpad);

        let mut tx = self.pool.begin().await?;
        lock_writes(&mut tx).await?;

        let exists = sqlx::query(&format!(
            "SELECT 1 FROM {}.whitelists WHERE chain_id = $1 AND launchpad = $2",
            SCHEMA
        ))
        .bind(chain)
        .bind(&launchpad)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_some() {
            bail!("whitelist already exists for launchpad {}", launchpad);
        }

        sqlx::query(&format!(
            "INSERT INTO {}.whitelists (chain_id, launchpad, block_number, min_balance, root)
             VALUES ($1, $2, $3, $4, $5)",
            SCHEMA
        ))
        .bind(chain)
        .bind(&launchpad)
        .bind(block_to_i64(whitelist.block_number)?)
        .bind(u256_to_string(whitelist.min_balance))
        .bind(h256_to_string(whitelist.root))
        .execute(&mut *tx)
        .await?;

        for chunk in whitelist.items.chunks(INSERT_CHUNK_SIZE) {
            let query_string = format!(
                "INSERT INTO {}.whitelists_proofs (chain_id, launchpad, address, balance, proof) VALUES {}",
                SCHEMA,
                values_clause(chunk.len(), 5)
            );
            let mut query = sqlx::query(&query_string);
            for item in chunk {
                query = query
                    .bind(chain)
                    .bind(&launchpad)
                    .bind(address_to_string(item.address))
                    .bind(u256_to_string(item.balance))
                    .bind(proof_strings(&item.proof));
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        metrics::increment_persisted_rows("whitelists_proofs", whitelist.items.len());
        log::info!(
            "💾 Saved whitelist for launchpad {} ({} entries)",
            launchpad,
            whitelist.items.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_clause_numbers_binds_row_major() {
        assert_eq!(values_clause(1, 3), "($1, $2, $3)");
        assert_eq!(values_clause(2, 2), "($1, $2), ($3, $4)");
        assert_eq!(values_clause(0, 4), "");
    }

    #[test]
    fn test_proof_strings_parse_back() {
        let proof = vec![H256::repeat_byte(0xab), H256::zero()];
        let raw = proof_strings(&proof);
        assert!(raw[0].starts_with("0xabab"));
        assert_eq!(parse_proof(raw).unwrap(), proof);
        assert!(parse_proof(vec!["0x12".into()]).is_err());
    }

    #[test]
    fn test_lock_ids_are_distinct() {
        assert_ne!(MIGRATION_LOCK_ID, WRITE_LOCK_ID);
    }
}
