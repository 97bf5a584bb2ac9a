//! Merkle log integration tests against a temp-file store.

use a2a_compliance::{
    merkle, Ap2MandateBinding, AttestationHeader, MediationState, MerkleTree,
    PreDisputeAttestationPayload, Side, EMPTY_ROOT,
};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn payload(escrow_id: &str) -> PreDisputeAttestationPayload {
    PreDisputeAttestationPayload {
        header: AttestationHeader {
            version: "1.0".to_string(),
            schema_id: "urn:a2a-se:pre-dispute-attestation:v1".to_string(),
            created_at: "2026-01-02T03:04:05Z".parse().unwrap(),
            issuer_id: "exchange-1".to_string(),
            nonce: format!("nonce-{escrow_id}"),
        },
        mandate: Ap2MandateBinding {
            intent_did: format!("did:a2a:intent:{escrow_id}"),
            cart_did: format!("did:a2a:cart:{escrow_id}"),
            payment_did: format!("did:a2a:payment:{escrow_id}"),
        },
        mediation: MediationState {
            escrow_id: escrow_id.to_string(),
            escrow_status: "released".to_string(),
            dispute_reason: None,
            resolution_strategy: None,
            mediator_id: None,
        },
        proof: None,
    }
}

async fn temp_tree() -> (TempDir, MerkleTree) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("merkle.db").display());
    let tree = MerkleTree::open(&url).await.unwrap();
    (dir, tree)
}

#[tokio::test]
async fn empty_tree_has_zero_root() {
    let (_dir, tree) = temp_tree().await;
    assert_eq!(tree.root().await.unwrap(), EMPTY_ROOT);
    assert_eq!(tree.leaf_count().await.unwrap(), 0);
}

#[tokio::test]
async fn append_advances_root_and_position() {
    let (_dir, tree) = temp_tree().await;

    let (root1, pos1) = tree.append(&payload("esc-1")).await.unwrap();
    assert_eq!(pos1, 0);
    assert_ne!(root1, EMPTY_ROOT);

    let (root2, pos2) = tree.append(&payload("esc-2")).await.unwrap();
    assert_eq!(pos2, 1);
    assert_ne!(root2, root1);
    assert_eq!(tree.root().await.unwrap(), root2);
}

#[tokio::test]
async fn proof_for_four_leaves_recomputes_root_externally() {
    let (_dir, tree) = temp_tree().await;

    let mut leaf_hashes = Vec::new();
    for i in 0..4 {
        let p = payload(&format!("esc-{i}"));
        let canonical = p.canonical_bytes().unwrap();
        leaf_hashes.push(merkle::hash_leaf(&canonical));
        tree.append(&p).await.unwrap();
    }

    let proof = tree.get_proof(2).await.unwrap();
    assert_eq!(proof.len(), 2);

    // recompute sha256(0x01 || ...) along the path by hand
    let mut computed = leaf_hashes[2].clone();
    for (sibling, side) in &proof {
        let (left, right) = match side {
            Side::Left => (sibling.clone(), computed.clone()),
            Side::Right => (computed.clone(), sibling.clone()),
        };
        let mut hasher = Sha256::new();
        hasher.update([0x01u8]);
        hasher.update(hex::decode(&left).unwrap());
        hasher.update(hex::decode(&right).unwrap());
        computed = hex::encode(hasher.finalize());
    }

    assert_eq!(computed, tree.root().await.unwrap());
}

#[tokio::test]
async fn verify_accepts_all_leaves_and_rejects_tampering() {
    let (_dir, tree) = temp_tree().await;

    let mut hashes = Vec::new();
    for i in 0..5 {
        let p = payload(&format!("esc-{i}"));
        hashes.push(merkle::hash_leaf(&p.canonical_bytes().unwrap()));
        tree.append(&p).await.unwrap();
    }

    for (i, h) in hashes.iter().enumerate() {
        assert!(tree.verify(i as i64, h).await.unwrap(), "leaf {i}");
    }

    // a tampered payload's hash must not verify at any position
    let tampered = merkle::hash_leaf(
        &payload("esc-evil").canonical_bytes().unwrap(),
    );
    assert!(!tree.verify(2, &tampered).await.unwrap());
}

#[tokio::test]
async fn odd_leaf_counts_carry_right() {
    let (_dir, tree) = temp_tree().await;

    for i in 0..3 {
        tree.append(&payload(&format!("esc-{i}"))).await.unwrap();
    }

    // leaf 2 has no right neighbour; its first sibling is itself
    let proof = tree.get_proof(2).await.unwrap();
    assert_eq!(proof.len(), 2);
    let h2 = merkle::hash_leaf(&payload("esc-2").canonical_bytes().unwrap());
    assert_eq!(proof[0].0, h2);
    assert_eq!(proof[0].1, Side::Right);
}

#[tokio::test]
async fn proof_out_of_range_is_an_error() {
    let (_dir, tree) = temp_tree().await;
    tree.append(&payload("esc-1")).await.unwrap();
    assert!(tree.get_proof(1).await.is_err());
    assert!(tree.get_proof(-1).await.is_err());
}

#[tokio::test]
async fn tree_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("merkle.db").display());

    let root = {
        let tree = MerkleTree::open(&url).await.unwrap();
        for i in 0..4 {
            tree.append(&payload(&format!("esc-{i}"))).await.unwrap();
        }
        tree.root().await.unwrap()
    };

    let tree = MerkleTree::open(&url).await.unwrap();
    assert_eq!(tree.leaf_count().await.unwrap(), 4);
    assert_eq!(tree.root().await.unwrap(), root);

    let h = merkle::hash_leaf(&payload("esc-3").canonical_bytes().unwrap());
    assert!(tree.verify(3, &h).await.unwrap());
}
