//! Property tests for balance conservation, idempotency and reversal.

use std::sync::Arc;

use proptest::prelude::*;

use corebank_common::{AccountId, Amount, Currency, TransactionId, TransactionStatus};
use corebank_ledger::{LedgerEngine, MemoryStore, NewAccount, TransactionRequest};

#[derive(Debug, Clone)]
enum Op {
    Deposit { account: usize, amount: i64 },
    Withdrawal { account: usize, amount: i64 },
    Transfer { from: usize, to: usize, amount: i64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..3usize, 1..50_000i64).prop_map(|(account, amount)| Op::Deposit { account, amount }),
        (0..3usize, 1..50_000i64).prop_map(|(account, amount)| Op::Withdrawal { account, amount }),
        (0..3usize, 1..3usize, 1..50_000i64).prop_map(|(from, offset, amount)| Op::Transfer {
            from,
            to: (from + offset) % 3,
            amount,
        }),
    ]
}

fn request(key: String, op: &Op, ids: &[AccountId]) -> TransactionRequest {
    match *op {
        Op::Deposit { account, amount } => {
            TransactionRequest::deposit(key, ids[account], Amount::from_minor(amount))
        }
        Op::Withdrawal { account, amount } => {
            TransactionRequest::withdrawal(key, ids[account], Amount::from_minor(amount))
        }
        Op::Transfer { from, to, amount } => {
            TransactionRequest::transfer(key, ids[from], ids[to], Amount::from_minor(amount))
        }
    }
}

/// Reference model: apply `op` to plain balances, honoring the funds check.
fn model_apply(balances: &mut [i64], op: &Op) -> bool {
    match *op {
        Op::Deposit { account, amount } => {
            balances[account] += amount;
            true
        }
        Op::Withdrawal { account, amount } => {
            if balances[account] < amount {
                return false;
            }
            balances[account] -= amount;
            true
        }
        Op::Transfer { from, to, amount } => {
            if balances[from] < amount {
                return false;
            }
            balances[from] -= amount;
            balances[to] += amount;
            true
        }
    }
}

async fn setup(initial: &[i64]) -> (LedgerEngine, Vec<AccountId>) {
    let engine = LedgerEngine::new(Arc::new(MemoryStore::new()));
    let mut ids = Vec::new();
    for (i, balance) in initial.iter().enumerate() {
        let account = engine
            .open_account(NewAccount::new(format!("prop-{i}").as_str(), Currency::usd()))
            .await
            .unwrap();
        if *balance > 0 {
            engine
                .submit(TransactionRequest::deposit(
                    format!("init-{i}"),
                    account.id,
                    Amount::from_minor(*balance),
                ))
                .await
                .unwrap();
        }
        ids.push(account.id);
    }
    (engine, ids)
}

async fn balances(engine: &LedgerEngine, ids: &[AccountId]) -> Vec<i64> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        out.push(engine.get_account_balance(id).await.unwrap().balance.minor());
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn transfers_conserve_total(
        initial in prop::collection::vec(0..200_000i64, 3),
        transfers in prop::collection::vec((0..3usize, 1..3usize, 1..80_000i64), 1..40),
    ) {
        tokio_test::block_on(async {
            let (engine, ids) = setup(&initial).await;
            let total: i64 = initial.iter().sum();

            for (n, (from, offset, amount)) in transfers.iter().enumerate() {
                let op = Op::Transfer { from: *from, to: (from + offset) % 3, amount: *amount };
                engine.submit(request(format!("t-{n}"), &op, &ids)).await.unwrap();

                let now = balances(&engine, &ids).await;
                prop_assert_eq!(now.iter().sum::<i64>(), total);
                prop_assert!(now.iter().all(|b| *b >= 0));
            }
            Ok(())
        })?;
    }

    #[test]
    fn duplicates_apply_once(
        ops in prop::collection::vec((op_strategy(), 1..4usize), 1..30),
    ) {
        tokio_test::block_on(async {
            let (engine, ids) = setup(&[10_000, 10_000, 10_000]).await;
            let mut model = vec![10_000i64; 3];

            for (n, (op, copies)) in ops.iter().enumerate() {
                let key = format!("op-{n}");
                let applied = model_apply(&mut model, op);

                let first = engine.submit(request(key.clone(), op, &ids)).await.unwrap();
                prop_assert_eq!(first.transaction.status == TransactionStatus::Applied, applied);

                for _ in 1..*copies {
                    let again = engine.submit(request(key.clone(), op, &ids)).await.unwrap();
                    prop_assert_eq!(&again, &first);
                }
            }

            prop_assert_eq!(balances(&engine, &ids).await, model);
            Ok(())
        })?;
    }

    #[test]
    fn overdrawn_withdrawal_fails(
        balance in 0..100_000i64,
        overdraft in 0..50_000i64,
        excess in 1..100_000i64,
    ) {
        tokio_test::block_on(async {
            let engine = LedgerEngine::new(Arc::new(MemoryStore::new()));
            let account = engine
                .open_account(
                    NewAccount::new("overdraft", Currency::usd())
                        .with_overdraft(Amount::from_minor(overdraft)),
                )
                .await
                .unwrap();
            if balance > 0 {
                engine
                    .submit(TransactionRequest::deposit("seed", account.id, Amount::from_minor(balance)))
                    .await
                    .unwrap();
            }

            let result = engine
                .submit(TransactionRequest::withdrawal(
                    "w",
                    account.id,
                    Amount::from_minor(balance + overdraft + excess),
                ))
                .await
                .unwrap();

            prop_assert_eq!(result.transaction.status, TransactionStatus::Failed);
            prop_assert!(result.balances.is_empty());
            let after = engine.get_account_balance(&account.id).await.unwrap();
            prop_assert_eq!(after.balance.minor(), balance);
            Ok(())
        })?;
    }

    #[test]
    fn reverse_restores_transfer(
        a in 1..100_000i64,
        b in 0..100_000i64,
        fraction in 1..=100i64,
    ) {
        tokio_test::block_on(async {
            let (engine, ids) = setup(&[a, b]).await;
            let amount = (a * fraction / 100).max(1);

            let op = Op::Transfer { from: 0, to: 1, amount };
            let applied = engine.submit(request("x".to_string(), &op, &ids)).await.unwrap();
            prop_assert_eq!(applied.transaction.status, TransactionStatus::Applied);

            let reversal = engine.reverse(&TransactionId::new("x")).await.unwrap();
            prop_assert_eq!(reversal.transaction.status, TransactionStatus::Applied);
            prop_assert_eq!(balances(&engine, &ids).await, vec![a, b]);
            Ok(())
        })?;
    }
}
