//! The ingestion loop.
//!
//! [`sync`] advances a durable cursor across block heights: for every height it
//! reconstructs the validation record (proposer, signers, absentees), extracts
//! fees and message paths from the block body, and persists the assembled
//! block in a single database transaction before moving on. Blocks are
//! committed in strict height order, so a crash between blocks leaves the
//! store at an exact prefix and recovery resumes at the next height.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::storage::{Block, Store, Transaction};
use crate::tendermint::{TendermintClient, TendermintValidator, TxMessage};
use crate::utils::error::{MetricsError, Result};
use crate::utils::logging;

/// How long to idle when the chain has not produced the next height yet.
pub const SYNC_RETRY_TIMEOUT: Duration = Duration::from_secs(3);

/// The only fee ticker this chain denominates in.
pub const NATIVE_TICKER: &str = "IOV";

/// Scaling factor applied to the whole part of a fee before summing with the
/// fractional part.
pub const FRAC_UNIT: u64 = 1_000_000_000;

/// Uploads to the local store all blocks that are not present yet, starting
/// with the block with the lowest height. It always returns the number of
/// blocks inserted, together with the error that stopped the loop; a signalled
/// `shutdown` token surfaces as `MetricsError::Cancelled`.
pub async fn sync(
    shutdown: &CancellationToken,
    tmc: &TendermintClient,
    st: &Store,
) -> (u64, MetricsError) {
    let mut inserted = 0;
    let err = match run_loop(shutdown, tmc, st, &mut inserted).await {
        Ok(infallible) => match infallible {},
        Err(err) => err,
    };
    (inserted, err)
}

async fn run_loop(
    shutdown: &CancellationToken,
    tmc: &TendermintClient,
    st: &Store,
    inserted: &mut u64,
) -> Result<Infallible> {
    let mut synced_height = match st.latest_block().await {
        Ok(block) => block.height,
        Err(err) if err.is_not_found() => 0,
        Err(err) => return Err(err.wrap("latest block")),
    };

    // Keep the mapping from validator address to database id in memory to
    // avoid querying the database for every insert.
    let mut validator_ids = ValidatorsCache::new(tmc, st);
    let mut vset: Vec<TendermintValidator> = Vec::new();
    let mut vhash: Vec<u8> = Vec::new();
    let mut last_known_height = 0;

    loop {
        if shutdown.is_cancelled() {
            return Err(MetricsError::Cancelled);
        }

        let next_height = synced_height + 1;
        if last_known_height < next_height {
            let info = tmc.abci_info().await.map_err(|err| err.wrap("info"))?;
            last_known_height = info.last_block_height;
        }

        if last_known_height < next_height {
            // Tendermint answers with an opaque error when asked for a commit
            // that does not exist yet, so wait until the tip catches up.
            tokio::select! {
                () = shutdown.cancelled() => return Err(MetricsError::Cancelled),
                () = tokio::time::sleep(SYNC_RETRY_TIMEOUT) => {}
            }
            continue;
        }

        let commit = tmc
            .commit(next_height)
            .await
            .map_err(|err| err.wrap(format!("blocks for {next_height}")))?;
        synced_height = commit.height;

        let proposer_id = validator_ids
            .database_id(&commit.proposer_address, commit.height)
            .await
            .map_err(|err| err.wrap("validator ID"))?;

        let participant_ids = validator_ids
            .database_ids(&commit.participant_addresses, commit.height)
            .await
            .map_err(|err| err.wrap("validator ID"))?;

        // Only query the full set when the validators hash changes.
        if commit.validators_hash != vhash {
            vset = tmc
                .validators(commit.height)
                .await
                .map_err(|err| err.wrap("cannot get validator set"))?;
            vhash.clone_from(&commit.validators_hash);
        }

        let missing = missing_validators(&vset, &commit.participant_addresses);
        let missing_ids = validator_ids
            .database_ids(&missing, commit.height)
            .await
            .map_err(|err| err.wrap("validator ID"))?;

        let tmblock = tmc
            .fetch_block(next_height)
            .await
            .map_err(|err| err.wrap(format!("blocks for {next_height}")))?;

        let mut fee_frac: u64 = 0;
        let mut messages = Vec::with_capacity(tmblock.transactions.len());
        let mut transactions = Vec::with_capacity(tmblock.transactions.len());
        for (k, tx) in tmblock.transactions.iter().enumerate() {
            if let Some(fee) = &tx.fees {
                if fee.ticker != NATIVE_TICKER {
                    return Err(MetricsError::Config(format!(
                        "fees in currency other than {NATIVE_TICKER} are not supported: {}",
                        fee.ticker
                    ))
                    .wrap(format!("blocks for {next_height}")));
                }
                fee_frac += fee.whole * FRAC_UNIT + fee.fractional;
            }

            messages.push(tx.message.path.clone());
            transactions.push(Transaction {
                hash: tmblock.transaction_hashes[k].clone(),
                message: message_details(&tx.message),
            });
        }

        let block = Block {
            height: commit.height,
            hash: commit.hash,
            time: commit.time,
            proposer_id,
            participant_ids,
            missing_ids,
            messages,
            fee_frac,
            transactions,
        };
        st.insert_block(&block)
            .await
            .map_err(|err| err.wrap(format!("insert block {}", block.height)))?;
        *inserted += 1;

        logging::log_block(
            block.height,
            block.participant_ids.len(),
            block.missing_ids.len(),
            block.transactions.len(),
        );
    }
}

/// Encodes a message as its persisted JSON document. A batch message is
/// flattened one level into an array of `{path, details}` entries; everything
/// else becomes a single such object.
fn message_details(msg: &TxMessage) -> serde_json::Value {
    match &msg.messages {
        Some(list) => serde_json::Value::Array(
            list.iter()
                .map(|sub| json!({"path": sub.path, "details": sub.details}))
                .collect(),
        ),
        None => json!({"path": msg.path, "details": msg.details}),
    }
}

/// Finds all validators of the set that did not sign, by address-equality
/// removal. The result order is not meaningful.
fn missing_validators(vset: &[TendermintValidator], signers: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut missing: Vec<Vec<u8>> = vset.iter().map(|v| v.address.clone()).collect();
    for signer in signers {
        if let Some(pos) = missing.iter().position(|addr| addr == signer) {
            missing.swap_remove(pos);
        }
    }
    missing
}

/// Cache for the mapping of validator address to that validator's database id.
/// Owned by one sync run; validator sets are small enough that no eviction is
/// needed.
struct ValidatorsCache<'a> {
    cache: HashMap<Vec<u8>, i32>,
    tmc: &'a TendermintClient,
    st: &'a Store,
}

impl<'a> ValidatorsCache<'a> {
    fn new(tmc: &'a TendermintClient, st: &'a Store) -> Self {
        Self {
            cache: HashMap::new(),
            tmc,
            st,
        }
    }

    /// Returns the database id of the validator with the given address. A
    /// validator not present in the database yet is looked up in the set at
    /// `block_height`, registered, and cached.
    async fn database_id(&mut self, address: &[u8], block_height: i64) -> Result<i32> {
        if let Some(id) = self.cache.get(address) {
            return Ok(*id);
        }

        if address.is_empty() {
            return Err(MetricsError::NotFound.wrap("empty validator address"));
        }

        match self.st.validator_address_id(address).await {
            Ok(id) => {
                self.cache.insert(address.to_vec(), id);
                return Ok(id);
            }
            Err(err) if err.is_not_found() => {
                // Not in the database yet.
            }
            Err(err) => return Err(err.wrap("query validator ID")),
        }

        let vs = self
            .tmc
            .validators(block_height)
            .await
            .map_err(|err| err.wrap("fetch validators"))?;

        for v in vs {
            if v.address != address {
                continue;
            }
            let id = self
                .st
                .insert_validator(&v.pub_key, &v.address)
                .await
                .map_err(|err| err.wrap("insert validator"))?;
            self.cache.insert(address.to_vec(), id);
            return Ok(id);
        }

        Err(MetricsError::NotFound.wrap(format!(
            "validator {} not present at height {block_height}",
            hex::encode(address)
        )))
    }

    /// Resolves a whole set at once, preserving input order. Any single
    /// failure aborts the batch.
    async fn database_ids(&mut self, addresses: &[Vec<u8>], block_height: i64) -> Result<Vec<i32>> {
        let mut res = Vec::with_capacity(addresses.len());
        for address in addresses {
            res.push(self.database_id(address, block_height).await?);
        }
        Ok(res)
    }
}
