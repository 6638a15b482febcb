//! Multiplexed JSON-RPC client for the Tendermint WebSocket API.
//!
//! One [`TendermintClient`] owns a single WebSocket connection. Requests are
//! correlated to responses by a monotonically increasing id: every call
//! registers a one-shot channel under its id, writes its frame under a writer
//! lock, and awaits the response that a dedicated reader task hands over. The
//! WebSocket is used instead of plain HTTP to lower latency, bypass throttling,
//! and leave room for subscription requests.

mod encoding;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::utils::error::{MetricsError, Result};
use crate::utils::logging::{self, LogLevel};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>>;

/// Client holding a WebSocket connection to a Tendermint node.
///
/// All methods are safe for concurrent use; frame writes are serialized by an
/// internal mutex and responses are routed back through the correlation map.
pub struct TendermintClient {
    id_counter: AtomicU64,
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    pending: PendingMap,
    shutdown: CancellationToken,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    params: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl TendermintClient {
    /// Dials the Tendermint WebSocket endpoint and spawns the reader task.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::Throttled` when the handshake is rejected with
    /// HTTP 429, and a wrapped `Websocket` error for any other dial failure.
    pub async fn dial(ws_url: &str) -> Result<Self> {
        let (stream, _) = connect_async(ws_url).await.map_err(|err| {
            if let tokio_tungstenite::tungstenite::Error::Http(resp) = &err {
                if resp.status().as_u16() == 429 {
                    return MetricsError::Throttled.wrap("websocket handshake");
                }
            }
            MetricsError::Websocket(err).wrap("dial")
        })?;

        let (writer, reader) = stream.split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        tokio::spawn(read_loop(reader, Arc::clone(&pending), shutdown.clone()));

        Ok(Self {
            id_counter: AtomicU64::new(0),
            writer: tokio::sync::Mutex::new(writer),
            pending,
            shutdown,
        })
    }

    /// Makes a JSON-RPC call and decodes the `result` field into `T`.
    ///
    /// Arguments must already be rendered to strings; the typed wrappers below
    /// take care of that. Safe for concurrent callers.
    ///
    /// # Errors
    ///
    /// A JSON-RPC error object becomes `FailedResponse` wrapped with
    /// `"code: message"`. A closed connection unblocks the call with an
    /// `Internal` error.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: &[String]) -> Result<T> {
        let id = (self.id_counter.fetch_add(1, Ordering::Relaxed) + 1).to_string();

        let (sender, receiver) = oneshot::channel();
        self.register(id.clone(), sender)?;

        let frame = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id: id.clone(),
            method,
            params: params.to_vec(),
        })?;

        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.send(Message::Text(frame.into())).await {
                self.unregister(&id);
                return Err(MetricsError::Websocket(err).wrap("write frame"));
            }
        }

        let resp = receiver
            .await
            .map_err(|_| MetricsError::Internal("connection closed".to_string()))?;

        if let Some(err) = resp.error {
            return Err(
                MetricsError::FailedResponse.wrap(format!("{}: {}", err.code, err.message))
            );
        }
        let result = resp.result.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(result)
            .map_err(|err| MetricsError::Decoding(err.to_string()).wrap("cannot decode result"))
    }

    /// Signals the reader task to exit and closes the socket. In-flight calls
    /// unblock with an error. Safe to call once.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
    }

    fn register(&self, id: String, sender: oneshot::Sender<RpcResponse>) -> Result<()> {
        match self.pending.lock() {
            Ok(mut map) => {
                map.insert(id, sender);
                Ok(())
            }
            Err(_) => Err(MetricsError::Internal(
                "correlation map poisoned".to_string(),
            )),
        }
    }

    fn unregister(&self, id: &str) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(id);
        }
    }

    /// Returns the tip of the chain.
    ///
    /// # Errors
    ///
    /// Propagates RPC and decoding failures.
    pub async fn abci_info(&self) -> Result<AbciInfo> {
        let payload: AbciInfoPayload = self
            .call("abci_info", &[])
            .await
            .map_err(|err| err.wrap("query tendermint"))?;
        Ok(AbciInfo {
            last_block_height: payload.response.last_block_height,
        })
    }

    /// Returns the signed header of the block at `height`, with the addresses
    /// of the validators whose precommits made it in. Absent signers arrive as
    /// null precommit entries and are skipped.
    ///
    /// # Errors
    ///
    /// Propagates RPC and decoding failures.
    pub async fn commit(&self, height: i64) -> Result<TendermintCommit> {
        let payload: CommitPayload = self
            .call("commit", &[height.to_string()])
            .await
            .map_err(|err| err.wrap("query tendermint"))?;

        let header = payload.signed_header.header;
        let commit = payload.signed_header.commit;
        let participant_addresses = commit
            .precommits
            .into_iter()
            .flatten()
            .map(|pc| pc.validator_address)
            .collect();

        Ok(TendermintCommit {
            height: header.height,
            hash: commit.block_id.hash,
            time: header.time,
            proposer_address: header.proposer_address,
            validators_hash: header.validators_hash,
            participant_addresses,
        })
    }

    /// Returns all validators as represented on the block at `height`.
    ///
    /// # Errors
    ///
    /// Propagates RPC and decoding failures.
    pub async fn validators(&self, height: i64) -> Result<Vec<TendermintValidator>> {
        let payload: ValidatorsPayload = self
            .call("validators", &[height.to_string()])
            .await
            .map_err(|err| err.wrap("query tendermint"))?;

        Ok(payload
            .validators
            .into_iter()
            .map(|v| TendermintValidator {
                address: v.address,
                pub_key: v.pub_key.value,
            })
            .collect())
    }

    /// Returns the decoded body of the block at `height`: the transactions it
    /// carries plus the SHA-256 hash of each transaction's raw bytes.
    ///
    /// # Errors
    ///
    /// Propagates RPC failures; a transaction that is not valid base64 or not
    /// a valid JSON document surfaces as a wrapped `Decoding` error.
    pub async fn fetch_block(&self, height: i64) -> Result<TendermintBlock> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;

        let payload: BlockPayload = self
            .call("block", &[height.to_string()])
            .await
            .map_err(|err| err.wrap("query tendermint"))?;

        let raw_txs = payload.block.data.txs.unwrap_or_default();
        let mut transactions = Vec::with_capacity(raw_txs.len());
        let mut transaction_hashes = Vec::with_capacity(raw_txs.len());
        for (i, raw) in raw_txs.iter().enumerate() {
            let bytes = STANDARD
                .decode(raw)
                .map_err(|err| MetricsError::Decoding(err.to_string()).wrap(format!("transaction {i}")))?;
            let tx: ChainTransaction = serde_json::from_slice(&bytes)
                .map_err(|err| MetricsError::Decoding(err.to_string()).wrap(format!("transaction {i}")))?;
            transaction_hashes.push(Sha256::digest(&bytes).to_vec());
            transactions.push(tx);
        }

        Ok(TendermintBlock {
            transactions,
            transaction_hashes,
        })
    }
}

async fn read_loop(mut reader: SplitStream<WsStream>, pending: PendingMap, shutdown: CancellationToken) {
    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let resp: RpcResponse = match serde_json::from_str(&text) {
                    Ok(resp) => resp,
                    Err(err) => {
                        logging::log(
                            LogLevel::Warning,
                            &format!("cannot decode JSON-RPC frame: {err}"),
                        );
                        continue;
                    }
                };
                let waiter = match pending.lock() {
                    Ok(mut map) => map.remove(&resp.id),
                    Err(_) => break,
                };
                if let Some(sender) = waiter {
                    // Single-slot handoff; the caller may have given up, in
                    // which case the response is dropped.
                    let _ = sender.send(resp);
                }
            }
            // Control frames are not JSON-RPC traffic.
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                logging::log_error("websocket read", &err.to_string());
                break;
            }
            None => break,
        }
    }

    // Dropping the registered senders unblocks every in-flight call.
    if let Ok(mut map) = pending.lock() {
        map.clear();
    }
}

/// Result of the `abci_info` call.
#[derive(Debug, Clone, Copy)]
pub struct AbciInfo {
    pub last_block_height: i64,
}

/// The signed header of one block.
#[derive(Debug, Clone)]
pub struct TendermintCommit {
    pub height: i64,
    pub hash: Vec<u8>,
    pub time: DateTime<Utc>,
    pub proposer_address: Vec<u8>,
    pub validators_hash: Vec<u8>,
    /// Addresses of the validators whose precommits are present.
    pub participant_addresses: Vec<Vec<u8>>,
}

/// One entry of the validator set.
#[derive(Debug, Clone)]
pub struct TendermintValidator {
    pub address: Vec<u8>,
    pub pub_key: Vec<u8>,
}

/// The decoded body of one block.
#[derive(Debug)]
pub struct TendermintBlock {
    pub transactions: Vec<ChainTransaction>,
    /// SHA-256 of each transaction's raw bytes, index-aligned with
    /// `transactions`.
    pub transaction_hashes: Vec<Vec<u8>>,
}

/// A transaction as carried in a block body.
#[derive(Debug, Deserialize)]
pub struct ChainTransaction {
    #[serde(default)]
    pub fees: Option<TxFee>,
    pub message: TxMessage,
}

/// Fee information attached to a transaction.
#[derive(Debug, Deserialize)]
pub struct TxFee {
    pub ticker: String,
    #[serde(default)]
    pub whole: u64,
    #[serde(default)]
    pub fractional: u64,
}

/// A transaction message. A batch message carries its sub-messages in
/// `messages`; a plain message carries only `path` and `details`.
#[derive(Debug, Deserialize)]
pub struct TxMessage {
    pub path: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default)]
    pub messages: Option<Vec<TxMessage>>,
}

#[derive(Deserialize)]
struct AbciInfoPayload {
    response: AbciInfoResponse,
}

#[derive(Deserialize)]
struct AbciInfoResponse {
    #[serde(with = "encoding::stringly")]
    last_block_height: i64,
}

#[derive(Deserialize)]
struct CommitPayload {
    signed_header: SignedHeader,
}

#[derive(Deserialize)]
struct SignedHeader {
    header: RawHeader,
    commit: RawCommit,
}

#[derive(Deserialize)]
struct RawHeader {
    #[serde(with = "encoding::stringly")]
    height: i64,
    time: DateTime<Utc>,
    #[serde(with = "encoding::hexstring")]
    proposer_address: Vec<u8>,
    #[serde(with = "encoding::hexstring")]
    validators_hash: Vec<u8>,
}

#[derive(Deserialize)]
struct RawCommit {
    block_id: RawBlockId,
    #[serde(default)]
    precommits: Vec<Option<RawPrecommit>>,
}

#[derive(Deserialize)]
struct RawBlockId {
    #[serde(with = "encoding::hexstring")]
    hash: Vec<u8>,
}

#[derive(Deserialize)]
struct RawPrecommit {
    #[serde(with = "encoding::hexstring")]
    validator_address: Vec<u8>,
}

#[derive(Deserialize)]
struct ValidatorsPayload {
    #[serde(default)]
    validators: Vec<RawValidator>,
}

#[derive(Deserialize)]
struct RawValidator {
    #[serde(with = "encoding::hexstring")]
    address: Vec<u8>,
    pub_key: RawPubKey,
}

#[derive(Deserialize)]
struct RawPubKey {
    #[serde(with = "encoding::base64bytes")]
    value: Vec<u8>,
}

#[derive(Deserialize)]
struct BlockPayload {
    block: RawBlock,
}

#[derive(Deserialize)]
struct RawBlock {
    data: RawBlockData,
}

#[derive(Deserialize)]
struct RawBlockData {
    #[serde(default)]
    txs: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_payload_decoding() {
        let raw = r#"{
            "signed_header": {
                "header": {
                    "height": "1882",
                    "time": "2019-07-01T10:00:00.000000001Z",
                    "proposer_address": "0A0B",
                    "validators_hash": "FFEE"
                },
                "commit": {
                    "block_id": {"hash": "0102"},
                    "precommits": [
                        {"validator_address": "0A0B"},
                        null,
                        {"validator_address": "0C0D"}
                    ]
                }
            }
        }"#;
        let payload: CommitPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.signed_header.header.height, 1882);
        assert_eq!(payload.signed_header.header.proposer_address, vec![0x0a, 0x0b]);
        let signed: Vec<_> = payload
            .signed_header
            .commit
            .precommits
            .into_iter()
            .flatten()
            .map(|pc| pc.validator_address)
            .collect();
        assert_eq!(signed, vec![vec![0x0a, 0x0b], vec![0x0c, 0x0d]]);
    }

    #[test]
    fn test_chain_transaction_decoding() {
        let raw = r#"{
            "fees": {"ticker": "IOV", "whole": 1, "fractional": 500000000},
            "message": {"path": "cash/send", "details": {"memo": "hello"}}
        }"#;
        let tx: ChainTransaction = serde_json::from_str(raw).unwrap();
        let fee = tx.fees.unwrap();
        assert_eq!(fee.ticker, "IOV");
        assert_eq!(fee.whole, 1);
        assert_eq!(fee.fractional, 500_000_000);
        assert_eq!(tx.message.path, "cash/send");
        assert!(tx.message.messages.is_none());
    }

    #[test]
    fn test_batch_transaction_decoding() {
        let raw = r#"{
            "message": {
                "path": "batch/execute",
                "messages": [
                    {"path": "cash/send", "details": {"amount": "1"}},
                    {"path": "multisig/update", "details": {}}
                ]
            }
        }"#;
        let tx: ChainTransaction = serde_json::from_str(raw).unwrap();
        assert!(tx.fees.is_none());
        let subs = tx.message.messages.unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].path, "cash/send");
    }
}
