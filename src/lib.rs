//! block-metrics - mirrors Tendermint block history into Postgres.
//!
//! The collector advances a durable cursor across block heights: it pulls each
//! block's signed header and body from a Tendermint node over a single
//! multiplexed WebSocket, reconstructs the validation record (proposer,
//! signers, absentees) against the validator set, and persists the result into
//! a normalized relational schema in one transaction per block. A thin
//! read-only HTTP API exposes the most recent records.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use block_metrics::{sync, Config, Store, TendermintClient};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     dotenvy::dotenv().ok();
//!     let config = Config::from_env()?;
//!
//!     let pool = block_metrics::connect(config.pg_connect_options()?).await?;
//!     block_metrics::ensure_schema(&pool).await?;
//!
//!     let client = TendermintClient::dial(&config.tendermint_ws_uri).await?;
//!     let store = Store::new(pool);
//!
//!     let shutdown = CancellationToken::new();
//!     let (inserted, err) = sync(&shutdown, &client, &store).await;
//!     println!("inserted: {inserted}, stopped: {err}");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! 1. **Tendermint client** - one WebSocket, requests correlated by id
//! 2. **Sync engine** - determines the next height, polls at the tip,
//!    assembles each block record
//! 3. **Validator cache** - memoizes address to database id, registering
//!    first-seen validators
//! 4. **Storage** - transactional persistence with an error-kind taxonomy
//! 5. **Read API** - recent blocks/transactions and point lookups

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public API exports
pub use config::Config;
pub use storage::{connect, ensure_schema, Block, Store, Transaction};
pub use sync::{sync, FRAC_UNIT, NATIVE_TICKER, SYNC_RETRY_TIMEOUT};
pub use tendermint::{
    AbciInfo, ChainTransaction, TendermintBlock, TendermintClient, TendermintCommit,
    TendermintValidator, TxFee, TxMessage,
};
pub use utils::error::{MetricsError, Result};

// Module declarations
pub mod api;
pub mod config;
pub mod storage;
pub mod sync;
pub mod tendermint;
pub mod utils;
