//! Thin read-only HTTP surface over the metrics tables.
//!
//! Every handler is a single table read returning a JSON envelope of the form
//! `{"status": bool, "message": str, ...payload}`. Point lookups take the
//! hex form of the stored hash. These endpoints sit outside the sync core and
//! never write.

use axum::extract::{Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::postgres::PgPool;
use sqlx::FromRow;

use crate::storage::cast_pg_err;

const RECORD_LIMIT: i64 = 10;

/// Builds the API router on top of a shared pool.
pub fn router(pool: PgPool) -> Router {
    Router::new()
        .route("/api/last_records", get(last_records))
        .route("/api/block/:hash", get(block_by_hash))
        .route("/api/transaction/:hash", get(transaction_by_hash))
        .route("/api/blocks", get(last_blocks))
        .route("/api/transactions", get(last_transactions))
        .layer(middleware::from_fn(jwt_guard))
        .with_state(pool)
}

// Authentication is not enforced yet; requests pass through unchanged.
async fn jwt_guard(req: Request, next: Next) -> Response {
    next.run(req).await
}

#[derive(FromRow)]
struct BlockRow {
    block_height: i64,
    block_hash: Vec<u8>,
    block_time: DateTime<Utc>,
    proposer_id: i32,
    messages: Vec<String>,
    fee_frac: i64,
}

impl BlockRow {
    fn to_json(&self) -> Value {
        json!({
            "block_height": self.block_height,
            "block_hash": hex::encode(&self.block_hash),
            "block_time": self.block_time.to_rfc3339(),
            "proposer_id": self.proposer_id,
            "messages": self.messages,
            "fee_frac": self.fee_frac,
        })
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: i64,
    transaction_hash: Vec<u8>,
    block_id: i64,
    message: Option<Value>,
}

impl TransactionRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "transaction_hash": hex::encode(&self.transaction_hash),
            "block_id": self.block_id,
            "message": self.message,
        })
    }
}

fn envelope(status: bool, message: &str, payload: Value) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("status".to_string(), Value::Bool(status));
    map.insert("message".to_string(), Value::String(message.to_string()));
    if let Value::Object(extra) = payload {
        map.extend(extra);
    }
    Value::Object(map)
}

fn failure(message: &str) -> Json<Value> {
    Json(envelope(false, message, json!({})))
}

async fn recent_blocks(pool: &PgPool) -> sqlx::Result<Vec<BlockRow>> {
    sqlx::query_as(
        "
		SELECT block_height, block_hash, block_time, proposer_id, messages, fee_frac
		FROM blocks
		ORDER BY block_height DESC
		LIMIT $1
		",
    )
    .bind(RECORD_LIMIT)
    .fetch_all(pool)
    .await
}

async fn recent_transactions(pool: &PgPool) -> sqlx::Result<Vec<TransactionRow>> {
    sqlx::query_as(
        "
		SELECT id, transaction_hash, block_id, message
		FROM transactions
		ORDER BY id DESC
		LIMIT $1
		",
    )
    .bind(RECORD_LIMIT)
    .fetch_all(pool)
    .await
}

async fn last_records(State(pool): State<PgPool>) -> Json<Value> {
    let blocks = match recent_blocks(&pool).await {
        Ok(rows) => rows,
        Err(err) => return failure(&cast_pg_err(err).to_string()),
    };
    let transactions = match recent_transactions(&pool).await {
        Ok(rows) => rows,
        Err(err) => return failure(&cast_pg_err(err).to_string()),
    };

    Json(envelope(
        true,
        "success",
        json!({
            "blocks": blocks.iter().map(BlockRow::to_json).collect::<Vec<_>>(),
            "transactions": transactions.iter().map(TransactionRow::to_json).collect::<Vec<_>>(),
        }),
    ))
}

async fn last_blocks(State(pool): State<PgPool>) -> Json<Value> {
    match recent_blocks(&pool).await {
        Ok(rows) => Json(envelope(
            true,
            "success",
            json!({"blocks": rows.iter().map(BlockRow::to_json).collect::<Vec<_>>()}),
        )),
        Err(err) => failure(&cast_pg_err(err).to_string()),
    }
}

async fn last_transactions(State(pool): State<PgPool>) -> Json<Value> {
    match recent_transactions(&pool).await {
        Ok(rows) => Json(envelope(
            true,
            "success",
            json!({"transactions": rows.iter().map(TransactionRow::to_json).collect::<Vec<_>>()}),
        )),
        Err(err) => failure(&cast_pg_err(err).to_string()),
    }
}

async fn block_by_hash(State(pool): State<PgPool>, Path(hash): Path<String>) -> Json<Value> {
    let Ok(hash) = hex::decode(&hash) else {
        return failure("block hash is not valid hex");
    };

    let row: Option<BlockRow> = match sqlx::query_as(
        "
		SELECT block_height, block_hash, block_time, proposer_id, messages, fee_frac
		FROM blocks
		WHERE block_hash = $1
		",
    )
    .bind(&hash)
    .fetch_optional(&pool)
    .await
    {
        Ok(row) => row,
        Err(err) => return failure(&cast_pg_err(err).to_string()),
    };

    match row {
        Some(block) => Json(envelope(true, "success", json!({"block": block.to_json()}))),
        None => failure("not found"),
    }
}

async fn transaction_by_hash(State(pool): State<PgPool>, Path(hash): Path<String>) -> Json<Value> {
    let Ok(hash) = hex::decode(&hash) else {
        return failure("transaction hash is not valid hex");
    };

    let row: Option<TransactionRow> = match sqlx::query_as(
        "
		SELECT id, transaction_hash, block_id, message
		FROM transactions
		WHERE transaction_hash = $1
		LIMIT 1
		",
    )
    .bind(&hash)
    .fetch_optional(&pool)
    .await
    {
        Ok(row) => row,
        Err(err) => return failure(&cast_pg_err(err).to_string()),
    };

    match row {
        Some(transaction) => Json(envelope(
            true,
            "success",
            json!({"transaction": transaction.to_json()}),
        )),
        None => failure("not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_merges_payload() {
        let body = envelope(true, "success", json!({"blocks": [1, 2]}));
        assert_eq!(body["status"], json!(true));
        assert_eq!(body["message"], json!("success"));
        assert_eq!(body["blocks"], json!([1, 2]));
    }

    #[test]
    fn test_envelope_failure_has_no_payload() {
        let body = envelope(false, "not found", json!({}));
        assert_eq!(body, json!({"status": false, "message": "not found"}));
    }
}
