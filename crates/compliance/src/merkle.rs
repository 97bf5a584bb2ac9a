//! Append-only, SQLite-backed merkle tree.
//!
//! Leaves are domain-separated (`0x00 || data`) and internal nodes use
//! `0x01 || left || right` to prevent second-preimage attacks. Odd nodes at
//! a level are duplicated (carry-right). The root of an empty tree is the
//! 64-hex-zero sentinel.

use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::models::PreDisputeAttestationPayload;
use crate::{ComplianceError, Result};

/// Root hash of a tree with no leaves.
pub const EMPTY_ROOT: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const LEAF_DOMAIN: u8 = 0x00;
const NODE_DOMAIN: u8 = 0x01;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS merkle_leaves (
    position     INTEGER PRIMARY KEY,
    data_hash    TEXT    NOT NULL,
    payload_json TEXT    NOT NULL,
    created_at   TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS merkle_nodes (
    level    INTEGER NOT NULL,
    position INTEGER NOT NULL,
    hash     TEXT    NOT NULL,
    PRIMARY KEY (level, position)
);
";

/// Which side a proof sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

pub fn hash_leaf(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_DOMAIN]);
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn hash_node(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update([NODE_DOMAIN]);
    hasher.update(hex::decode(left).unwrap_or_default());
    hasher.update(hex::decode(right).unwrap_or_default());
    hex::encode(hasher.finalize())
}

pub struct MerkleTree {
    pool: SqlitePool,
}

impl MerkleTree {
    /// Open (or create) the tree at the given sqlite url, e.g.
    /// `sqlite://compliance.db`.
    pub async fn open(url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(opts)
            .await?;
        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn leaf_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM merkle_leaves")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn root(&self) -> Result<String> {
        let count = self.leaf_count().await?;
        if count == 0 {
            return Ok(EMPTY_ROOT.to_string());
        }
        self.stored_root(count).await
    }

    /// Append a payload, recomputing the path from the new leaf to the root.
    /// Returns `(new_root, leaf_index)`.
    pub async fn append(&self, payload: &PreDisputeAttestationPayload) -> Result<(String, i64)> {
        let canonical = payload.canonical_bytes()?;
        let leaf_hash = hash_leaf(&canonical);
        // canonical bytes are serde_json output, always valid utf-8
        let payload_json = String::from_utf8_lossy(&canonical).into_owned();

        let mut tx = self.pool.begin().await?;

        let position: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM merkle_leaves")
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO merkle_leaves (position, data_hash, payload_json, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(position)
        .bind(&leaf_hash)
        .bind(&payload_json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        store_node(&mut tx, 0, position, &leaf_hash).await?;

        let new_count = position + 1;
        rebuild_path(&mut tx, position, new_count).await?;

        tx.commit().await?;

        let root = self.stored_root(new_count).await?;
        Ok((root, position))
    }

    /// Audit proof for the leaf at `leaf_index`: ordered `(sibling, side)`
    /// pairs from the leaf level up to the root.
    pub async fn get_proof(&self, leaf_index: i64) -> Result<Vec<(String, Side)>> {
        let count = self.leaf_count().await?;
        if leaf_index < 0 || leaf_index >= count {
            return Err(ComplianceError::LeafOutOfRange {
                index: leaf_index,
                count,
            });
        }

        let mut proof = Vec::new();
        let mut level = 0i64;
        let mut pos = leaf_index;
        let mut n = count;

        while n > 1 {
            let (sibling_pos, side) = if pos % 2 == 0 {
                (pos + 1, Side::Right)
            } else {
                (pos - 1, Side::Left)
            };

            // carry-right: an odd tail node pairs with itself
            let lookup = if sibling_pos < n { sibling_pos } else { pos };
            let sibling = self.node(level, lookup).await?;

            proof.push((sibling, side));
            pos /= 2;
            n = (n + 1) / 2;
            level += 1;
        }

        Ok(proof)
    }

    /// Verify that `data_hash` is the leaf at `leaf_index` under the current
    /// root.
    pub async fn verify(&self, leaf_index: i64, data_hash: &str) -> Result<bool> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT data_hash FROM merkle_leaves WHERE position = ?")
                .bind(leaf_index)
                .fetch_optional(&self.pool)
                .await?;
        let Some(stored) = stored else {
            return Ok(false);
        };
        if stored != data_hash {
            return Ok(false);
        }

        let proof = self.get_proof(leaf_index).await?;
        let mut computed = data_hash.to_string();
        for (sibling, side) in proof {
            computed = match side {
                Side::Left => hash_node(&sibling, &computed),
                Side::Right => hash_node(&computed, &sibling),
            };
        }
        Ok(computed == self.root().await?)
    }

    /// Stored payload JSON for a leaf, if present.
    pub async fn leaf_payload(&self, leaf_index: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT payload_json FROM merkle_leaves WHERE position = ?")
            .bind(leaf_index)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("payload_json")))
    }

    async fn node(&self, level: i64, position: i64) -> Result<String> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT hash FROM merkle_nodes WHERE level = ? AND position = ?")
                .bind(level)
                .bind(position)
                .fetch_optional(&self.pool)
                .await?;
        hash.ok_or(ComplianceError::MissingNode { level, position })
    }

    async fn stored_root(&self, count: i64) -> Result<String> {
        let mut level = 0i64;
        let mut n = count;
        while n > 1 {
            n = (n + 1) / 2;
            level += 1;
        }
        self.node(level, 0).await
    }
}

async fn store_node(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    level: i64,
    position: i64,
    hash: &str,
) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO merkle_nodes (level, position, hash) VALUES (?, ?, ?)")
        .bind(level)
        .bind(position)
        .bind(hash)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn node_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    level: i64,
    position: i64,
) -> Result<String> {
    let hash: Option<String> =
        sqlx::query_scalar("SELECT hash FROM merkle_nodes WHERE level = ? AND position = ?")
            .bind(level)
            .bind(position)
            .fetch_optional(&mut **tx)
            .await?;
    hash.ok_or(ComplianceError::MissingNode { level, position })
}

/// Recompute internal nodes along the path from `position` to the root for a
/// tree of `count` leaves.
async fn rebuild_path(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    position: i64,
    count: i64,
) -> Result<()> {
    let mut level = 0i64;
    let mut n = count;
    let mut pos = position;

    while n > 1 {
        let parent_pos = pos / 2;
        let left_pos = parent_pos * 2;
        let right_pos = left_pos + 1;

        let left_hash = node_in_tx(tx, level, left_pos).await?;
        let right_hash = if right_pos < n {
            node_in_tx(tx, level, right_pos).await?
        } else {
            left_hash.clone()
        };

        let parent_hash = hash_node(&left_hash, &right_hash);
        store_node(tx, level + 1, parent_pos, &parent_hash).await?;

        pos = parent_pos;
        n = (n + 1) / 2;
        level += 1;
    }

    Ok(())
}
