//! Transactional persistence for validators, blocks, participations, and
//! transactions.
//!
//! [`Store`] wraps a shared `sqlx` connection pool. Every operation translates
//! driver errors into the error-kind taxonomy at this boundary: SQLSTATE class
//! `20` becomes `NotFound`, class `23` becomes `Conflict`, and a missing row on
//! a point query becomes `NotFound`. Other classes pass through with the
//! SQLSTATE code wrapped into the description.

mod schema;

pub use schema::ensure_schema;

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::utils::error::{MetricsError, Result};

/// Connects a pool with the collector's defaults.
///
/// # Errors
///
/// Returns a wrapped `Database` error when the pool cannot be established.
pub async fn connect(options: PgConnectOptions) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(3))
        .connect_with(options)
        .await
        .map_err(|err| cast_pg_err(err).wrap("cannot connect to postgres"))
}

/// A block as persisted, together with its participation partition and
/// transactions.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub height: i64,
    pub hash: Vec<u8>,
    pub time: DateTime<Utc>,
    pub proposer_id: i32,
    /// Validators whose precommit is part of this block.
    pub participant_ids: Vec<i32>,
    /// Validators present in the set at this height that did not sign.
    pub missing_ids: Vec<i32>,
    /// Top-level message path of every transaction, in block order. Never
    /// null; the empty sequence is a valid value.
    pub messages: Vec<String>,
    pub fee_frac: u64,
    pub transactions: Vec<Transaction>,
}

/// A transaction persisted together with its owning block.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub hash: Vec<u8>,
    /// JSON document with the message path and details.
    pub message: serde_json::Value,
}

/// Access to the metrics database.
pub struct Store {
    pool: PgPool,
}

impl Store {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts a new validator and returns its database id.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when either the public key or the address is
    /// already registered.
    pub async fn insert_validator(&self, public_key: &[u8], address: &[u8]) -> Result<i32> {
        sqlx::query_scalar::<_, i32>(
            "INSERT INTO validators (public_key, address) VALUES ($1, $2) RETURNING id",
        )
        .bind(public_key)
        .bind(address)
        .fetch_one(&self.pool)
        .await
        .map_err(cast_pg_err)
    }

    /// Returns the database id of the validator with the given address.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no validator carries that address.
    pub async fn validator_address_id(&self, address: &[u8]) -> Result<i32> {
        sqlx::query_scalar::<_, i32>("SELECT id FROM validators WHERE address = $1")
            .bind(address)
            .fetch_one(&self.pool)
            .await
            .map_err(cast_pg_err)
    }

    /// Atomically inserts a block together with all its participation rows and
    /// transactions. A block must have at least one participant.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` for an empty participant set, a duplicate height, or
    /// an unknown proposer/validator id.
    pub async fn insert_block(&self, block: &Block) -> Result<()> {
        if block.participant_ids.is_empty() {
            return Err(MetricsError::Conflict.wrap("cannot insert block without participants"));
        }

        let mut tx = self.pool.begin().await.map_err(cast_pg_err)?;

        sqlx::query(
            "
			INSERT INTO blocks (block_height, block_hash, block_time, proposer_id, messages, fee_frac)
			VALUES ($1, $2, $3, $4, $5, $6)
			",
        )
        .bind(block.height)
        .bind(&block.hash)
        .bind(block.time)
        .bind(block.proposer_id)
        .bind(&block.messages)
        .bind(i64::try_from(block.fee_frac).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await
        .map_err(cast_pg_err)?;

        for (validator_id, validated) in block
            .participant_ids
            .iter()
            .map(|id| (id, true))
            .chain(block.missing_ids.iter().map(|id| (id, false)))
        {
            sqlx::query(
                "
				INSERT INTO block_participations (validated, block_id, validator_id)
				VALUES ($1, $2, $3)
				",
            )
            .bind(validated)
            .bind(block.height)
            .bind(validator_id)
            .execute(&mut *tx)
            .await
            .map_err(cast_pg_err)?;
        }

        for transaction in &block.transactions {
            sqlx::query(
                "
				INSERT INTO transactions (transaction_hash, block_id, message)
				VALUES ($1, $2, $3)
				",
            )
            .bind(&transaction.hash)
            .bind(block.height)
            .bind(&transaction.message)
            .execute(&mut *tx)
            .await
            .map_err(cast_pg_err)?;
        }

        tx.commit().await.map_err(cast_pg_err)
    }

    /// Returns the block with the greatest height, with its participation set
    /// partitioned into participants and missing validators.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no block exists.
    pub async fn latest_block(&self) -> Result<Block> {
        let row = sqlx::query(
            "
			SELECT block_height, block_hash, block_time, proposer_id, messages, fee_frac
			FROM blocks
			ORDER BY block_height DESC
			LIMIT 1
			",
        )
        .fetch_one(&self.pool)
        .await;

        match row.map_err(cast_pg_err) {
            Ok(row) => self.hydrate_block(&row).await,
            Err(err) if err.is_not_found() => Err(err.wrap("no blocks")),
            Err(err) => Err(err.wrap("cannot select block")),
        }
    }

    /// Returns the block at the given height, with its participation set.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when that height was not ingested.
    pub async fn load_block(&self, height: i64) -> Result<Block> {
        let row = sqlx::query(
            "
			SELECT block_height, block_hash, block_time, proposer_id, messages, fee_frac
			FROM blocks
			WHERE block_height = $1
			",
        )
        .bind(height)
        .fetch_one(&self.pool)
        .await;

        match row.map_err(cast_pg_err) {
            Ok(row) => self.hydrate_block(&row).await,
            Err(err) => Err(err.wrap("cannot select block")),
        }
    }

    /// Marks a block validated or missed by the given validator. Repeating
    /// the call updates the previous value.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the block or the validator does not exist.
    pub async fn mark_block(&self, block_id: i64, validator_id: i32, validated: bool) -> Result<()> {
        sqlx::query(
            "
			INSERT INTO block_participations (block_id, validator_id, validated)
			VALUES ($1, $2, $3)
				ON CONFLICT (block_id, validator_id) DO UPDATE SET validated = $3
			",
        )
        .bind(block_id)
        .bind(validator_id)
        .bind(validated)
        .execute(&self.pool)
        .await
        .map_err(cast_pg_err)?;
        Ok(())
    }

    async fn hydrate_block(&self, row: &PgRow) -> Result<Block> {
        let height: i64 = row.try_get("block_height").map_err(cast_pg_err)?;

        let mut participant_ids = Vec::new();
        let mut missing_ids = Vec::new();
        let participations =
            sqlx::query("SELECT validator_id, validated FROM block_participations WHERE block_id = $1")
                .bind(height)
                .fetch_all(&self.pool)
                .await
                .map_err(cast_pg_err)?;
        for p in &participations {
            let validator_id: i32 = p.try_get("validator_id").map_err(cast_pg_err)?;
            if p.try_get::<bool, _>("validated").map_err(cast_pg_err)? {
                participant_ids.push(validator_id);
            } else {
                missing_ids.push(validator_id);
            }
        }

        let fee_frac: i64 = row.try_get("fee_frac").map_err(cast_pg_err)?;

        Ok(Block {
            height,
            hash: row.try_get("block_hash").map_err(cast_pg_err)?,
            time: row.try_get("block_time").map_err(cast_pg_err)?,
            proposer_id: row.try_get("proposer_id").map_err(cast_pg_err)?,
            participant_ids,
            missing_ids,
            messages: row.try_get("messages").map_err(cast_pg_err)?,
            fee_frac: u64::try_from(fee_frac).unwrap_or(0),
            transactions: Vec::new(),
        })
    }
}

/// Translates a driver error into the error-kind taxonomy.
pub(crate) fn cast_pg_err(err: sqlx::Error) -> MetricsError {
    if matches!(err, sqlx::Error::RowNotFound) {
        return MetricsError::NotFound;
    }

    let classified = match &err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| (code.into_owned(), db.message().to_string())),
        _ => None,
    };

    match classified {
        Some((code, message)) if code.starts_with("20") => MetricsError::NotFound.wrap(message),
        Some((code, message)) if code.starts_with("23") => MetricsError::Conflict.wrap(message),
        Some((code, _)) => MetricsError::Database(err).wrap(code),
        None => MetricsError::Database(err),
    }
}
