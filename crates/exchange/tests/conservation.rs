//! Property test: no operation sequence creates or destroys tokens.

mod common;

use common::*;
use proptest::prelude::*;

use a2a_exchange::ledger::EscrowSpec;

#[derive(Debug, Clone)]
enum Op {
    Deposit { amount: i64 },
    Create { amount: i64, ttl_ok: bool },
    Release,
    Refund,
    Dispute,
    Sweep,
}

fn op_strategy() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![
            (1i64..200).prop_map(|amount| Op::Deposit { amount }),
            ((1i64..80), any::<bool>()).prop_map(|(amount, ttl_ok)| Op::Create { amount, ttl_ok }),
            Just(Op::Release),
            Just(Op::Refund),
            Just(Op::Dispute),
            Just(Op::Sweep),
        ],
        1..14,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn conservation_holds_for_any_op_sequence(ops in op_strategy()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");

        rt.block_on(async move {
            let ex = setup().await;
            let provider = create_account(&ex.state, "ProviderBot", 100).await;
            let requester = create_account(&ex.state, "RequesterBot", 100).await;
            let observer = a2a_exchange::observer::PaymentTimeoutObserver::new(
                ex.state.store.clone(),
                &ex.state.settings,
            );

            let mut open: Vec<String> = Vec::new();
            let mut task_counter = 0u32;

            for op in ops {
                match op {
                    Op::Deposit { amount } => {
                        let _ = ex.state.ledger.deposit(&requester, amount, None).await;
                    }
                    Op::Create { amount, ttl_ok } => {
                        task_counter += 1;
                        let spec = EscrowSpec {
                            provider_id: provider.clone(),
                            amount,
                            task_id: Some(format!("task-{task_counter}")),
                            ttl_minutes: Some(if ttl_ok { 30 } else { 1 }),
                            ..EscrowSpec::default()
                        };
                        if let Ok(outcome) =
                            ex.state.ledger.create_escrow(&requester, spec).await
                        {
                            open.push(outcome.escrow.id);
                        }
                    }
                    Op::Release => {
                        if let Some(id) = open.pop() {
                            let _ = ex.state.ledger.release(&id, &requester).await;
                        }
                    }
                    Op::Refund => {
                        if let Some(id) = open.pop() {
                            let _ = ex.state.ledger.refund(&id, &requester, None).await;
                        }
                    }
                    Op::Dispute => {
                        if let Some(id) = open.last() {
                            let _ = ex.state.ledger.dispute(id, &requester, "prop").await;
                        }
                    }
                    Op::Sweep => {
                        let _ = observer
                            .sweep_at(chrono::Utc::now() + chrono::Duration::minutes(5))
                            .await;
                    }
                }

                // invariant after every committed operation
                assert_conservation(&ex.state).await;
                let bal = balance_of(&ex.state, &requester).await;
                assert!(bal.available >= 0 && bal.held_in_escrow >= 0);
            }
        });
    }
}
