//! Idempotent schema bootstrap.

use sqlx::PgPool;

use super::cast_pg_err;
use crate::utils::error::Result;

/// The authoritative description of the on-disk shape. Statements are
/// separated by `---` lines and executed in order.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS validators (
	id SERIAL PRIMARY KEY,
	public_key BYTEA NOT NULL UNIQUE,
	address BYTEA NOT NULL UNIQUE,
	memo TEXT
);

---

CREATE TABLE IF NOT EXISTS blocks (
	block_height BIGINT NOT NULL PRIMARY KEY,
	block_hash BYTEA NOT NULL,
	block_time TIMESTAMPTZ NOT NULL,
	proposer_id INT NOT NULL REFERENCES validators(id),
	messages TEXT[] NOT NULL,
	fee_frac BIGINT NOT NULL
);

---

CREATE TABLE IF NOT EXISTS block_participations (
	id BIGSERIAL PRIMARY KEY,
	validated BOOLEAN NOT NULL,
	block_id BIGINT NOT NULL REFERENCES blocks(block_height),
	validator_id INT NOT NULL REFERENCES validators(id),
	UNIQUE (block_id, validator_id)
);

---

CREATE TABLE IF NOT EXISTS transactions (
	id BIGSERIAL PRIMARY KEY,
	transaction_hash BYTEA NOT NULL,
	block_id BIGINT NOT NULL REFERENCES blocks(block_height),
	message JSONB
);

---

CREATE INDEX IF NOT EXISTS transactions_transaction_hash_idx
	ON transactions (transaction_hash);
";

/// Creates all tables and indexes inside one transaction. Every statement is
/// a no-op when its object already exists; failure of any statement rolls back
/// all of them.
///
/// # Errors
///
/// Returns the failing statement wrapped into the error description.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await.map_err(cast_pg_err)?;
    for query in SCHEMA.split("\n---\n") {
        let query = query.trim();
        if query.is_empty() {
            continue;
        }
        sqlx::query(query)
            .execute(&mut *tx)
            .await
            .map_err(|err| cast_pg_err(err).wrap(format!("schema statement {query:?}")))?;
    }
    tx.commit().await.map_err(cast_pg_err)
}
