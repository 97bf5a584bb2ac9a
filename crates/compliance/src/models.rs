//! Attestation payload types.
//!
//! The canonical serialization (sorted keys, no whitespace, proof excluded)
//! is what gets hashed into the merkle log, so these types must stay
//! deterministic: any field added here changes every downstream leaf hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// Versioned envelope identifying the attestation issuer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationHeader {
    pub version: String,
    pub schema_id: String,
    pub created_at: DateTime<Utc>,
    pub issuer_id: String,
    pub nonce: String,
}

impl AttestationHeader {
    pub fn new(issuer_id: impl Into<String>) -> Self {
        Self {
            version: "1.0".to_string(),
            schema_id: "urn:a2a-se:pre-dispute-attestation:v1".to_string(),
            created_at: Utc::now(),
            issuer_id: issuer_id.into(),
            nonce: Uuid::new_v4().to_string(),
        }
    }
}

/// Binding to the AP2 mandate chain (intent, cart, payment DIDs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ap2MandateBinding {
    pub intent_did: String,
    pub cart_did: String,
    pub payment_did: String,
}

/// Snapshot of the escrow's mediation-relevant state at attestation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediationState {
    pub escrow_id: String,
    pub escrow_status: String,
    pub dispute_reason: Option<String>,
    pub resolution_strategy: Option<String>,
    pub mediator_id: Option<String>,
}

/// Proof-of-inclusion material, filled in after the payload is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptographicProof {
    pub payload_hash: String,
    pub merkle_root: String,
    pub merkle_leaf_index: i64,
    pub tsa_timestamp_token: Option<Vec<u8>>,
    pub tsa_authority_url: Option<String>,
}

/// A pre-dispute attestation: header + mandate binding + mediation state,
/// optionally carrying the proof of its own inclusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreDisputeAttestationPayload {
    pub header: AttestationHeader,
    pub mandate: Ap2MandateBinding,
    pub mediation: MediationState,
    pub proof: Option<CryptographicProof>,
}

/// Proof-free view used for canonical hashing. Hashing the proof would make
/// the hash depend on proof-of-that-hash, so it is excluded.
#[derive(Serialize)]
struct CanonicalView<'a> {
    header: &'a AttestationHeader,
    mandate: &'a Ap2MandateBinding,
    mediation: &'a MediationState,
}

impl PreDisputeAttestationPayload {
    /// Deterministic JSON bytes: keys sorted, separators compact, proof
    /// excluded.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let view = CanonicalView {
            header: &self.header,
            mandate: &self.mandate,
            mediation: &self.mediation,
        };
        // round-trip through Value so maps serialize with sorted keys
        let value = serde_json::to_value(&view)?;
        Ok(serde_json::to_vec(&value)?)
    }
}
