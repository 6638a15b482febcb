//! Shared test fixtures: an in-process mock Tendermint node speaking the
//! JSON-RPC-over-WebSocket subset the client consumes, and a throwaway
//! Postgres database per test.
//!
//! Database-backed tests connect to the Postgres instance described by the
//! `POSTGRES_TEST_*` environment variables (defaults: localhost:5432, user
//! postgres, no password, sslmode disable) and are skipped silently when it is
//! unreachable.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use tokio_tungstenite::tungstenite::Message;

pub struct TestValidator {
    pub address: Vec<u8>,
    pub pub_key: Vec<u8>,
}

pub struct TestHeight {
    pub proposer: Vec<u8>,
    /// Precommit entries; `None` renders as a null entry (absent signer).
    pub precommits: Vec<Option<Vec<u8>>>,
    /// Transactions as JSON documents; served base64-encoded.
    pub txs: Vec<Value>,
}

pub struct ChainState {
    pub tip: i64,
    pub validators: Vec<TestValidator>,
    pub heights: HashMap<i64, TestHeight>,
    pub abci_info_calls: u64,
    /// When set, requests are read but never answered.
    pub stall: bool,
}

impl ChainState {
    pub fn new(tip: i64, validators: Vec<TestValidator>) -> Self {
        Self {
            tip,
            validators,
            heights: HashMap::new(),
            abci_info_calls: 0,
            stall: false,
        }
    }

    pub fn with_height(mut self, height: i64, entry: TestHeight) -> Self {
        self.heights.insert(height, entry);
        self
    }
}

/// An in-process Tendermint stand-in bound to a random localhost port.
pub struct MockChain {
    pub url: String,
    pub state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub async fn start(state: ChainState) -> MockChain {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock chain");
        let addr = listener.local_addr().expect("mock chain address");
        let url = format!("ws://{addr}/websocket");
        let state = Arc::new(Mutex::new(state));

        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(frame)) = ws.next().await {
                        let Message::Text(text) = frame else {
                            continue;
                        };
                        let Ok(req) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        let response = {
                            let mut chain = shared.lock().expect("chain state");
                            if chain.stall {
                                continue;
                            }
                            respond(&mut chain, &req)
                        };
                        if ws.send(Message::Text(response.to_string().into())).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        MockChain { url, state }
    }

    pub fn abci_info_calls(&self) -> u64 {
        self.state.lock().expect("chain state").abci_info_calls
    }
}

fn respond(chain: &mut ChainState, req: &Value) -> Value {
    let id = req["id"].clone();
    let method = req["method"].as_str().unwrap_or_default();
    let height: i64 = req["params"][0]
        .as_str()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();

    let result = match method {
        "abci_info" => {
            chain.abci_info_calls += 1;
            Ok(json!({"response": {"last_block_height": chain.tip.to_string()}}))
        }
        "validators" => Ok(json!({
            "validators": chain
                .validators
                .iter()
                .map(|v| json!({
                    "address": hex::encode_upper(&v.address),
                    "pub_key": {"value": STANDARD.encode(&v.pub_key)},
                }))
                .collect::<Vec<_>>()
        })),
        "commit" => match chain.heights.get(&height) {
            None => Err(format!("height {height} is not available")),
            Some(entry) => Ok(json!({
                "signed_header": {
                    "header": {
                        "height": height.to_string(),
                        "time": block_time_str(height),
                        "proposer_address": hex::encode_upper(&entry.proposer),
                        "validators_hash": hex::encode_upper(validators_hash(&chain.validators)),
                    },
                    "commit": {
                        "block_id": {"hash": hex::encode_upper(block_hash(height))},
                        "precommits": entry
                            .precommits
                            .iter()
                            .map(|pc| match pc {
                                Some(addr) => json!({"validator_address": hex::encode_upper(addr)}),
                                None => Value::Null,
                            })
                            .collect::<Vec<_>>(),
                    },
                }
            })),
        },
        "block" => match chain.heights.get(&height) {
            None => Err(format!("height {height} is not available")),
            Some(entry) => Ok(json!({
                "block": {"data": {"txs": entry
                    .txs
                    .iter()
                    .map(|tx| STANDARD.encode(tx.to_string()))
                    .collect::<Vec<_>>()}}
            })),
        },
        other => Err(format!("unknown method {other}")),
    };

    match result {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(message) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32603, "message": message},
        }),
    }
}

pub fn block_hash(height: i64) -> Vec<u8> {
    vec![0, 1, u8::try_from(height % 251).unwrap_or_default()]
}

fn block_time_str(height: i64) -> String {
    format!("2019-07-01T10:{:02}:00.000001Z", height % 60)
}

pub fn validators_hash(validators: &[TestValidator]) -> Vec<u8> {
    let mut digest = Sha256::new();
    for v in validators {
        digest.update(&v.address);
    }
    digest.finalize().to_vec()
}

/// Hash of a transaction as the client computes it: SHA-256 of the raw bytes
/// the chain served.
pub fn tx_hash(tx: &Value) -> Vec<u8> {
    Sha256::digest(tx.to_string().as_bytes()).to_vec()
}

static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A database created for one test and dropped afterwards.
pub struct TestDb {
    pub pool: PgPool,
    root: PgPool,
    name: String,
}

impl TestDb {
    /// Connects to Postgres, creates a fresh database, and applies the schema.
    /// Returns `None` when no Postgres instance is reachable so callers can
    /// skip.
    pub async fn create() -> Option<TestDb> {
        let mut opts = PgConnectOptions::new()
            .host(&env_or("POSTGRES_TEST_HOST", "localhost"))
            .port(env_or("POSTGRES_TEST_PORT", "5432").parse().ok()?)
            .username(&env_or("POSTGRES_TEST_USER", "postgres"))
            .database("postgres")
            .ssl_mode(match env_or("POSTGRES_TEST_SSLMODE", "disable").as_str() {
                "disable" => PgSslMode::Disable,
                _ => PgSslMode::Prefer,
            });
        if let Ok(password) = std::env::var("POSTGRES_TEST_PASSWORD") {
            opts = opts.password(&password);
        }

        let root = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(2))
            .connect_with(opts.clone())
            .await
            .ok()?;
        sqlx::query("SELECT 1").execute(&root).await.ok()?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let name = format!(
            "test_database_{}_{}",
            nanos,
            DB_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        sqlx::raw_sql(&format!("CREATE DATABASE {name}"))
            .execute(&root)
            .await
            .expect("create test database");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(opts.database(&name))
            .await
            .expect("connect to test database");
        block_metrics::ensure_schema(&pool)
            .await
            .expect("ensure schema");

        Some(TestDb { pool, root, name })
    }

    /// Closes the pool and drops the database.
    pub async fn cleanup(self) {
        self.pool.close().await;
        let _ = sqlx::raw_sql(&format!("DROP DATABASE {}", self.name))
            .execute(&self.root)
            .await;
        self.root.close().await;
    }
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}
