//! Ledger and escrow state machine scenarios.

mod common;

use common::*;
use rust_decimal::Decimal;

use a2a_exchange::ledger::{EscrowSpec, Resolution};
use a2a_exchange::models::{Account, EscrowStatus};
use a2a_exchange::{ExchangeError, Settings};

fn spec(provider_id: &str, amount: i64) -> EscrowSpec {
    EscrowSpec {
        provider_id: provider_id.to_string(),
        amount,
        ..EscrowSpec::default()
    }
}

async fn operator(state: &a2a_exchange::AppState) -> Account {
    let id = create_account_with_status(state, "OperatorBot", 0, "operator").await;
    sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
        .bind(&id)
        .fetch_one(state.store.pool())
        .await
        .expect("operator account")
}

#[tokio::test]
async fn release_pays_provider_and_collects_fee() {
    // fee 3% of 50 = 1.5 -> 2, total held 52
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 100).await;

    let escrow = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 50))
        .await
        .unwrap()
        .escrow;
    assert_eq!(escrow.fee_amount, 2);
    assert_eq!(escrow.total_held(), 52);

    let bal = balance_of(&ex.state, &requester).await;
    assert_eq!(bal.available, 48);
    assert_eq!(bal.held_in_escrow, 52);

    ex.state.ledger.release(&escrow.id, &requester).await.unwrap();

    let requester_bal = balance_of(&ex.state, &requester).await;
    assert_eq!(requester_bal.available, 48);
    assert_eq!(requester_bal.held_in_escrow, 0);
    assert_eq!(requester_bal.total_spent, 52);

    let provider_bal = balance_of(&ex.state, &provider).await;
    assert_eq!(provider_bal.available, 150);
    assert_eq!(provider_bal.total_earned, 50);

    let fee_total: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM transactions WHERE tx_type = 'fee' AND escrow_id = ?",
    )
    .bind(&escrow.id)
    .fetch_one(ex.state.store.pool())
    .await
    .unwrap();
    assert_eq!(fee_total, 2);

    assert_conservation(&ex.state).await;
}

#[tokio::test]
async fn refund_restores_the_full_hold_including_min_fee() {
    // 0.25% of 10 rounds up to 1 == min fee, total 11
    let ex = setup_with(Settings {
        fee_percent: Decimal::new(25, 2),
        min_fee: 1,
        ..Settings::default()
    })
    .await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 100).await;

    let escrow = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 10))
        .await
        .unwrap()
        .escrow;
    assert_eq!(escrow.fee_amount, 1);
    assert_eq!(balance_of(&ex.state, &requester).await.held_in_escrow, 11);

    let outcome = ex
        .state
        .ledger
        .refund(&escrow.id, &requester, Some("provider unresponsive"))
        .await
        .unwrap();
    assert_eq!(outcome.escrow.status, EscrowStatus::Refunded);

    let bal = balance_of(&ex.state, &requester).await;
    assert_eq!(bal.available, 100);
    assert_eq!(bal.held_in_escrow, 0);
    assert_conservation(&ex.state).await;
}

#[tokio::test]
async fn create_rejects_bad_amounts_and_self_escrow() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 100).await;

    let err = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Validation(_)));

    let err = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 1_000_000))
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Validation(_)));

    let err = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&requester, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Validation(_)));
}

#[tokio::test]
async fn create_requires_funds_and_active_provider() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 10).await;

    let err = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 100))
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::InsufficientFunds(_)));

    let suspended =
        create_account_with_status(&ex.state, "SuspendedBot", 100, "suspended").await;
    let err = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&suspended, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::InactiveProvider(_)));

    let err = ex
        .state
        .ledger
        .create_escrow(&requester, spec("missing-id", 5))
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::NotFound(_)));
}

#[tokio::test]
async fn duplicate_task_for_same_pair_conflicts_while_held() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 100).await;

    let mut with_task = spec(&provider, 10);
    with_task.task_id = Some("task-1".to_string());

    let first = ex
        .state
        .ledger
        .create_escrow(&requester, with_task.clone())
        .await
        .unwrap()
        .escrow;

    let err = ex
        .state
        .ledger
        .create_escrow(&requester, with_task.clone())
        .await
        .unwrap_err();
    match err {
        ExchangeError::TaskConflict(msg) => assert!(msg.contains(&first.id)),
        other => panic!("expected TaskConflict, got {other:?}"),
    }

    // once the escrow leaves held, the task id frees up
    ex.state.ledger.release(&first.id, &requester).await.unwrap();
    ex.state
        .ledger
        .create_escrow(&requester, with_task)
        .await
        .unwrap();
}

#[tokio::test]
async fn release_is_gated_on_upstream_dependencies() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 100).await;

    let upstream = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 10))
        .await
        .unwrap()
        .escrow;

    let mut downstream_spec = spec(&provider, 10);
    downstream_spec.task_id = Some("downstream".to_string());
    downstream_spec.depends_on = Some(vec![upstream.id.clone()]);
    let downstream = ex
        .state
        .ledger
        .create_escrow(&requester, downstream_spec)
        .await
        .unwrap()
        .escrow;

    let err = ex
        .state
        .ledger
        .release(&downstream.id, &requester)
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::DependencyUnresolved(_)));

    ex.state.ledger.release(&upstream.id, &requester).await.unwrap();
    ex.state
        .ledger
        .release(&downstream.id, &requester)
        .await
        .unwrap();
    assert_conservation(&ex.state).await;
}

#[tokio::test]
async fn depends_on_must_belong_to_the_requester() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 100).await;
    let other = create_account(&ex.state, "OtherBot", 100).await;

    let foreign = ex
        .state
        .ledger
        .create_escrow(&other, spec(&provider, 10))
        .await
        .unwrap()
        .escrow;

    let mut bad = spec(&provider, 10);
    bad.depends_on = Some(vec![foreign.id]);
    let err = ex
        .state
        .ledger
        .create_escrow(&requester, bad)
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Validation(_)));
}

#[tokio::test]
async fn refund_cascades_through_the_dependency_chain() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 200).await;

    let e1 = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 10))
        .await
        .unwrap()
        .escrow;

    let mut s2 = spec(&provider, 10);
    s2.task_id = Some("t2".to_string());
    s2.depends_on = Some(vec![e1.id.clone()]);
    let e2 = ex
        .state
        .ledger
        .create_escrow(&requester, s2)
        .await
        .unwrap()
        .escrow;

    let mut s3 = spec(&provider, 10);
    s3.task_id = Some("t3".to_string());
    s3.depends_on = Some(vec![e2.id.clone()]);
    let e3 = ex
        .state
        .ledger
        .create_escrow(&requester, s3)
        .await
        .unwrap()
        .escrow;

    let outcome = ex
        .state
        .ledger
        .refund(&e1.id, &requester, None)
        .await
        .unwrap();

    let cascaded_ids: Vec<&str> = outcome.cascaded.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(cascaded_ids, vec![e2.id.as_str(), e3.id.as_str()]);

    for id in [&e1.id, &e2.id, &e3.id] {
        assert_eq!(escrow_status(&ex.state, id).await, "refunded");
    }
    let bal = balance_of(&ex.state, &requester).await;
    assert_eq!(bal.available, 200);
    assert_eq!(bal.held_in_escrow, 0);
    assert_conservation(&ex.state).await;
}

#[tokio::test]
async fn dispute_blocks_release_and_refund_until_resolved() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 100).await;
    let op = operator(&ex.state).await;

    let escrow = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 50))
        .await
        .unwrap()
        .escrow;

    // the provider may dispute too
    let disputed = ex
        .state
        .ledger
        .dispute(&escrow.id, &provider, "work rejected")
        .await
        .unwrap();
    assert_eq!(disputed.status, EscrowStatus::Disputed);
    assert!(disputed.dispute_expires_at.is_some());

    let err = ex
        .state
        .ledger
        .release(&escrow.id, &requester)
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Validation(ref msg) if msg.contains("disputed")));
    let err = ex
        .state
        .ledger
        .refund(&escrow.id, &requester, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Validation(ref msg) if msg.contains("disputed")));

    // non-operators cannot resolve
    let requester_acct = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
        .bind(&requester)
        .fetch_one(ex.state.store.pool())
        .await
        .unwrap();
    let err = ex
        .state
        .ledger
        .resolve(&escrow.id, &requester_acct, Resolution::Release, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Forbidden(_)));

    let resolved = ex
        .state
        .ledger
        .resolve(&escrow.id, &op, Resolution::Release, Some("evidence-reviewed"))
        .await
        .unwrap();
    assert_eq!(resolved.status, EscrowStatus::Released);

    let provider_bal = balance_of(&ex.state, &provider).await;
    assert_eq!(provider_bal.available, 150);
    assert_conservation(&ex.state).await;
}

#[tokio::test]
async fn resolve_refund_returns_the_hold() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 100).await;
    let op = operator(&ex.state).await;

    let escrow = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 50))
        .await
        .unwrap()
        .escrow;
    ex.state
        .ledger
        .dispute(&escrow.id, &requester, "not delivered")
        .await
        .unwrap();

    let resolved = ex
        .state
        .ledger
        .resolve(&escrow.id, &op, Resolution::Refund, None)
        .await
        .unwrap();
    assert_eq!(resolved.status, EscrowStatus::Refunded);

    let bal = balance_of(&ex.state, &requester).await;
    assert_eq!(bal.available, 100);
    assert_eq!(bal.held_in_escrow, 0);
    assert_conservation(&ex.state).await;
}

#[tokio::test]
async fn terminal_escrows_never_transition_again() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 100).await;

    let escrow = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 10))
        .await
        .unwrap()
        .escrow;
    ex.state.ledger.release(&escrow.id, &requester).await.unwrap();

    for result in [
        ex.state.ledger.release(&escrow.id, &requester).await.err(),
        ex.state
            .ledger
            .refund(&escrow.id, &requester, None)
            .await
            .err(),
        ex.state
            .ledger
            .dispute(&escrow.id, &requester, "too late")
            .await
            .err(),
    ] {
        assert!(matches!(result, Some(ExchangeError::Validation(_))));
    }
    assert_eq!(escrow_status(&ex.state, &escrow.id).await, "released");
}

#[tokio::test]
async fn only_parties_touch_their_escrow() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 100).await;
    let outsider = create_account(&ex.state, "OutsiderBot", 100).await;

    let escrow = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 10))
        .await
        .unwrap()
        .escrow;

    let err = ex
        .state
        .ledger
        .release(&escrow.id, &provider)
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Forbidden(_)));
    let err = ex
        .state
        .ledger
        .refund(&escrow.id, &outsider, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Forbidden(_)));
    let err = ex
        .state
        .ledger
        .dispute(&escrow.id, &outsider, "not mine")
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Forbidden(_)));
}

#[tokio::test]
async fn deposit_credits_and_validates() {
    let ex = setup().await;
    let account = create_account(&ex.state, "DepositBot", 100).await;

    let outcome = ex
        .state
        .ledger
        .deposit(&account, 40, Some("wire-1"))
        .await
        .unwrap();
    assert_eq!(outcome.new_balance, 140);

    let err = ex.state.ledger.deposit(&account, 0, None).await.unwrap_err();
    assert!(matches!(err, ExchangeError::Validation(_)));
    assert_conservation(&ex.state).await;
}

#[tokio::test]
async fn reputation_follows_release_and_refund() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 500).await;

    let escrow = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 10))
        .await
        .unwrap()
        .escrow;
    ex.state.ledger.release(&escrow.id, &requester).await.unwrap();
    // 0.9 * 0.5 + 0.1 * 1 = 0.55
    assert!((reputation_of(&ex.state, &provider).await - 0.55).abs() < 1e-9);

    let escrow = ex
        .state
        .ledger
        .create_escrow(&requester, spec(&provider, 10))
        .await
        .unwrap()
        .escrow;
    ex.state
        .ledger
        .refund(&escrow.id, &requester, None)
        .await
        .unwrap();
    // 0.9 * 0.55 = 0.495
    assert!((reputation_of(&ex.state, &provider).await - 0.495).abs() < 1e-9);

    // repeated refunds stay within [0, 1]
    for i in 0..20 {
        let mut s = spec(&provider, 5);
        s.task_id = Some(format!("rep-{i}"));
        let e = ex
            .state
            .ledger
            .create_escrow(&requester, s)
            .await
            .unwrap()
            .escrow;
        ex.state.ledger.refund(&e.id, &requester, None).await.unwrap();
        let r = reputation_of(&ex.state, &provider).await;
        assert!((0.0..=1.0).contains(&r));
    }
}

#[tokio::test]
async fn batch_creates_a_group_atomically() {
    let ex = setup().await;
    let provider_a = create_account(&ex.state, "ProviderA", 100).await;
    let provider_b = create_account(&ex.state, "ProviderB", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 100).await;

    let mut second = spec(&provider_b, 10);
    second.task_id = Some("step-2".to_string());
    second.depends_on = Some(vec!["$0".to_string()]);

    let batch = ex
        .state
        .ledger
        .create_batch(&requester, None, &[spec(&provider_a, 10), second])
        .await
        .unwrap();

    assert_eq!(batch.escrows.len(), 2);
    assert!(batch
        .escrows
        .iter()
        .all(|e| e.group_id.as_deref() == Some(batch.group_id.as_str())));
    assert_eq!(
        batch.escrows[1].depends_on,
        Some(vec![batch.escrows[0].id.clone()])
    );
    assert_conservation(&ex.state).await;
}

#[tokio::test]
async fn batch_is_all_or_nothing() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 25).await;

    // second item pushes the total past the balance
    let mut second = spec(&provider, 15);
    second.task_id = Some("too-much".to_string());
    let err = ex
        .state
        .ledger
        .create_batch(&requester, None, &[spec(&provider, 10), second])
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::InsufficientFunds(_)));

    let bal = balance_of(&ex.state, &requester).await;
    assert_eq!(bal.available, 25);
    assert_eq!(bal.held_in_escrow, 0);
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM escrows")
        .fetch_one(ex.state.store.pool())
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn batch_forward_references_are_rejected() {
    let ex = setup().await;
    let provider = create_account(&ex.state, "ProviderBot", 100).await;
    let requester = create_account(&ex.state, "RequesterBot", 100).await;

    let mut first = spec(&provider, 10);
    first.depends_on = Some(vec!["$1".to_string()]);
    let mut second = spec(&provider, 10);
    second.task_id = Some("later".to_string());

    let err = ex
        .state
        .ledger
        .create_batch(&requester, None, &[first, second])
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Validation(_)));
}
