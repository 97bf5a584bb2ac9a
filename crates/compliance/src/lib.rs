//! Compliance sub-system for the settlement exchange.
//!
//! Terminal escrow events are attested into an append-only, domain-separated
//! merkle log that can optionally be anchored at an RFC 3161 time stamping
//! authority. Appends happen after settlement commits and never block it.

pub mod log;
pub mod merkle;
pub mod models;
pub mod tsa;

pub use log::{AppendReceipt, ComplianceLog};
pub use merkle::{MerkleTree, Side, EMPTY_ROOT};
pub use models::{
    Ap2MandateBinding, AttestationHeader, CryptographicProof, MediationState,
    PreDisputeAttestationPayload,
};
pub use tsa::{TimestampAuthority, TimestampResponse};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("leaf index {index} out of range [0, {count})")]
    LeafOutOfRange { index: i64, count: i64 },

    #[error("missing merkle node at level={level}, position={position}")]
    MissingNode { level: i64, position: i64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tsa request failed: {0}")]
    Tsa(String),

    #[error("malformed timestamp token: {0}")]
    MalformedToken(String),
}

pub type Result<T> = std::result::Result<T, ComplianceError>;
