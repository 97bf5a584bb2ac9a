//! Compliance bridge: terminal escrow events become attestations in the
//! merkle log. Appends run on spawned tasks and never block settlement.

use std::sync::Arc;
use tracing::{debug, warn};

use a2a_compliance::{
    Ap2MandateBinding, AttestationHeader, ComplianceLog, MediationState,
    PreDisputeAttestationPayload,
};

use crate::models::Escrow;

#[derive(Clone)]
pub struct ComplianceBridge {
    log: Option<Arc<ComplianceLog>>,
    issuer_id: String,
}

impl ComplianceBridge {
    pub fn new(log: Option<Arc<ComplianceLog>>, issuer_id: impl Into<String>) -> Self {
        Self {
            log,
            issuer_id: issuer_id.into(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            log: None,
            issuer_id: String::new(),
        }
    }

    /// Attest a terminal escrow transition. Fire-and-forget.
    pub fn record_terminal(&self, escrow: &Escrow, mediator_id: Option<&str>) {
        let Some(log) = self.log.clone() else {
            return;
        };
        let payload = self.build_payload(escrow, mediator_id);
        let escrow_id = escrow.id.clone();
        tokio::spawn(async move {
            match log.append(&payload).await {
                Ok(receipt) => debug!(
                    escrow_id = %escrow_id,
                    leaf_index = receipt.leaf_index,
                    root = %receipt.root,
                    "attestation appended"
                ),
                Err(e) => warn!("attestation append failed for escrow {escrow_id}: {e}"),
            }
        });
    }

    fn build_payload(
        &self,
        escrow: &Escrow,
        mediator_id: Option<&str>,
    ) -> PreDisputeAttestationPayload {
        // the mandate chain is keyed by the task when one exists, else the
        // escrow itself
        let subject = escrow.task_id.as_deref().unwrap_or(&escrow.id);
        PreDisputeAttestationPayload {
            header: AttestationHeader::new(self.issuer_id.clone()),
            mandate: Ap2MandateBinding {
                intent_did: format!("did:a2a:intent:{subject}"),
                cart_did: format!("did:a2a:cart:{subject}"),
                payment_did: format!("did:a2a:payment:{}", escrow.id),
            },
            mediation: MediationState {
                escrow_id: escrow.id.clone(),
                escrow_status: escrow.status.as_str().to_string(),
                dispute_reason: escrow.dispute_reason.clone(),
                resolution_strategy: escrow.resolution_strategy.clone(),
                mediator_id: mediator_id.map(str::to_string),
            },
            proof: None,
        }
    }
}
