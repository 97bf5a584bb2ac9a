//! The compliance log: merkle tree plus optional TSA anchoring.

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::merkle::MerkleTree;
use crate::models::PreDisputeAttestationPayload;
use crate::tsa::{TimestampAuthority, TimestampResponse};
use crate::Result;

/// What an append produced: the new root, the leaf position, and the
/// timestamp if a TSA is configured and reachable.
#[derive(Debug, Clone)]
pub struct AppendReceipt {
    pub root: String,
    pub leaf_index: i64,
    pub leaf_hash: String,
    pub timestamp: Option<TimestampResponse>,
}

pub struct ComplianceLog {
    tree: MerkleTree,
    tsa: Option<TimestampAuthority>,
}

impl ComplianceLog {
    pub async fn open(db_url: &str, tsa: Option<TimestampAuthority>) -> Result<Self> {
        let tree = MerkleTree::open(db_url).await?;
        Ok(Self { tree, tsa })
    }

    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    /// Append an attestation. TSA failures are logged, not propagated: the
    /// leaf is in the tree either way and can be re-anchored later.
    pub async fn append(&self, payload: &PreDisputeAttestationPayload) -> Result<AppendReceipt> {
        let canonical = payload.canonical_bytes()?;
        let (root, leaf_index) = self.tree.append(payload).await?;
        let leaf_hash = crate::merkle::hash_leaf(&canonical);

        let timestamp = match &self.tsa {
            Some(tsa) => {
                let digest: [u8; 32] = Sha256::digest(&canonical).into();
                match tsa.timestamp(&digest).await {
                    Ok(ts) => {
                        info!(
                            leaf_index,
                            serial = %ts.serial,
                            "attestation anchored at TSA"
                        );
                        Some(ts)
                    }
                    Err(e) => {
                        warn!(leaf_index, "TSA anchoring failed: {e}");
                        None
                    }
                }
            }
            None => None,
        };

        Ok(AppendReceipt {
            root,
            leaf_index,
            leaf_hash,
            timestamp,
        })
    }
}
