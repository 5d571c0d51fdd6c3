//! End-to-end engine behaviour against the in-memory store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Barrier;

use corebank_common::{AccountId, Amount, Currency, LedgerError, TransactionId, TransactionStatus};
use corebank_ledger::{
    Account, AccountStatus, Claim, CommitBatch, EngineConfig, FailureReason, JournalEntry,
    LedgerEngine, LedgerStore, MemoryStore, NewAccount, StoreError, Transaction,
    TransactionRequest, TransactionResult,
};

type StoreResult<T> = std::result::Result<T, StoreError>;

/// Loses the connection on the first commit, after the key was claimed.
struct OutageAtCommit {
    inner: Arc<MemoryStore>,
    tripped: AtomicBool,
}

#[async_trait]
impl LedgerStore for OutageAtCommit {
    async fn insert_account(&self, account: &Account) -> StoreResult<()> {
        self.inner.insert_account(account).await
    }

    async fn load_account(&self, id: &AccountId) -> StoreResult<Option<Account>> {
        self.inner.load_account(id).await
    }

    async fn update_account_status(
        &self,
        id: &AccountId,
        expected_version: u64,
        status: AccountStatus,
    ) -> StoreResult<Account> {
        self.inner
            .update_account_status(id, expected_version, status)
            .await
    }

    async fn claim(&self, pending: &Transaction) -> StoreResult<Claim> {
        self.inner.claim(pending).await
    }

    async fn take_over(&self, stale: &Transaction, fresh: &Transaction) -> StoreResult<bool> {
        self.inner.take_over(stale, fresh).await
    }

    async fn release_claim(&self, claim: &Transaction) -> StoreResult<()> {
        self.inner.release_claim(claim).await
    }

    async fn load_transaction(&self, id: &TransactionId) -> StoreResult<Option<Transaction>> {
        self.inner.load_transaction(id).await
    }

    async fn load_journal(&self, id: &TransactionId) -> StoreResult<Vec<JournalEntry>> {
        self.inner.load_journal(id).await
    }

    async fn commit(&self, batch: CommitBatch) -> StoreResult<()> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            self.inner.set_unavailable(true);
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.commit(batch).await
    }
}

fn usd(minor: i64) -> Amount {
    Amount::from_minor(minor)
}

async fn setup(balances: &[i64]) -> (Arc<LedgerEngine>, Arc<MemoryStore>, Vec<AccountId>) {
    setup_with(balances, EngineConfig::default()).await
}

async fn setup_with(
    balances: &[i64],
    config: EngineConfig,
) -> (Arc<LedgerEngine>, Arc<MemoryStore>, Vec<AccountId>) {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(LedgerEngine::with_config(store.clone(), config).unwrap());

    let mut ids = Vec::new();
    for (i, balance) in balances.iter().enumerate() {
        let account = engine
            .open_account(NewAccount::new(format!("customer-{i}").as_str(), Currency::usd()))
            .await
            .unwrap();
        if *balance > 0 {
            engine
                .submit(TransactionRequest::deposit(
                    format!("opening-{i}"),
                    account.id,
                    usd(*balance),
                ))
                .await
                .unwrap();
        }
        ids.push(account.id);
    }

    (engine, store, ids)
}

async fn balance(engine: &LedgerEngine, id: &AccountId) -> i64 {
    engine.get_account_balance(id).await.unwrap().balance.minor()
}

/// Resubmit on transient errors, the way a client would.
async fn submit_until_settled(
    engine: &LedgerEngine,
    request: TransactionRequest,
) -> TransactionResult {
    loop {
        match engine.submit(request.clone()).await {
            Ok(result) => return result,
            Err(err) if err.is_retryable() => tokio::task::yield_now().await,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
}

#[tokio::test]
async fn test_walkthrough() {
    let (engine, _, ids) = setup(&[1_000, 500]).await;
    let (a, b) = (ids[0], ids[1]);

    let first = engine
        .submit(TransactionRequest::transfer("t1", a, b, usd(300)))
        .await
        .unwrap();
    assert_eq!(first.transaction.status, TransactionStatus::Applied);
    assert_eq!(first.balance_of(&a), Some(usd(700)));
    assert_eq!(first.balance_of(&b), Some(usd(800)));

    let replay = engine
        .submit(TransactionRequest::transfer("t1", a, b, usd(300)))
        .await
        .unwrap();
    assert_eq!(replay, first);
    assert_eq!(balance(&engine, &a).await, 700);

    let withdrawal = engine
        .submit(TransactionRequest::withdrawal("t2", a, usd(5_000)))
        .await
        .unwrap();
    assert_eq!(withdrawal.transaction.status, TransactionStatus::Failed);
    assert_eq!(
        withdrawal.transaction.failure,
        Some(FailureReason::InsufficientFunds {
            account_id: a,
            available: usd(700),
            requested: usd(5_000),
        })
    );
    assert_eq!(balance(&engine, &a).await, 700);

    let reversal = engine.reverse(&TransactionId::new("t1")).await.unwrap();
    assert_eq!(reversal.transaction.status, TransactionStatus::Applied);
    assert_eq!(reversal.transaction.reversal_of, Some(TransactionId::new("t1")));
    assert_eq!(balance(&engine, &a).await, 1_000);
    assert_eq!(balance(&engine, &b).await, 500);

    let original = engine.get_transaction(&TransactionId::new("t1")).await.unwrap();
    assert_eq!(original.status, TransactionStatus::Reversed);
    assert_eq!(original.reversed_by, Some(reversal.transaction.id.clone()));
}

#[tokio::test]
async fn test_failed_outcome_is_replayed() {
    let (engine, _, ids) = setup(&[100]).await;

    let first = engine
        .submit(TransactionRequest::withdrawal("w1", ids[0], usd(500)))
        .await
        .unwrap();
    engine
        .submit(TransactionRequest::deposit("d1", ids[0], usd(1_000)))
        .await
        .unwrap();

    // Funds are now sufficient, but the key already holds a FAILED outcome.
    let again = engine
        .submit(TransactionRequest::withdrawal("w1", ids[0], usd(500)))
        .await
        .unwrap();
    assert_eq!(again, first);
    assert_eq!(balance(&engine, &ids[0]).await, 1_100);
}

#[tokio::test]
async fn test_key_reuse_with_different_body() {
    let (engine, _, ids) = setup(&[1_000, 0]).await;

    engine
        .submit(TransactionRequest::transfer("t1", ids[0], ids[1], usd(300)))
        .await
        .unwrap();

    let err = engine
        .submit(TransactionRequest::transfer("t1", ids[0], ids[1], usd(301)))
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::IdempotencyConflict(TransactionId::new("t1")));
    assert_eq!(balance(&engine, &ids[0]).await, 700);
}

#[tokio::test]
async fn test_malformed_requests_leave_no_record() {
    let (engine, store, ids) = setup(&[1_000]).await;
    let records = store.transaction_count();

    let cases = [
        TransactionRequest::withdrawal("bad-1", ids[0], Amount::ZERO),
        TransactionRequest::withdrawal("bad-2", ids[0], usd(-5)),
        TransactionRequest::transfer("bad-3", ids[0], ids[0], usd(5)),
        TransactionRequest::deposit(" ", ids[0], usd(5)),
    ];
    for request in cases {
        let err = engine.submit(request).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REQUEST");
    }

    assert_eq!(store.transaction_count(), records);
    assert_eq!(engine.metrics().snapshot().invalid_requests, 4);
}

#[tokio::test]
async fn test_generated_key() {
    let (engine, _, ids) = setup(&[0]).await;

    let result = engine
        .submit(TransactionRequest::deposit("ignored", ids[0], usd(250)).without_key())
        .await
        .unwrap();

    assert!(result.transaction.id.is_valid());
    let stored = engine.get_transaction(&result.transaction.id).await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Applied);
}

#[tokio::test]
async fn test_overdraft_limit() {
    let store = Arc::new(MemoryStore::new());
    let engine = LedgerEngine::new(store);
    let account = engine
        .open_account(NewAccount::new("carol", Currency::usd()).with_overdraft(usd(200)))
        .await
        .unwrap();
    engine
        .submit(TransactionRequest::deposit("d1", account.id, usd(100)))
        .await
        .unwrap();

    let within = engine
        .submit(TransactionRequest::withdrawal("w1", account.id, usd(300)))
        .await
        .unwrap();
    assert_eq!(within.transaction.status, TransactionStatus::Applied);
    assert_eq!(within.balance_of(&account.id), Some(usd(-200)));

    let beyond = engine
        .submit(TransactionRequest::withdrawal("w2", account.id, usd(1)))
        .await
        .unwrap();
    assert_eq!(beyond.transaction.failure.map(|r| r.code()), Some("INSUFFICIENT_FUNDS"));
    assert_eq!(balance(&engine, &account.id).await, -200);
}

#[tokio::test]
async fn test_inactive_accounts_reject_transactions() {
    let (engine, _, ids) = setup(&[1_000, 1_000]).await;

    engine.freeze_account(&ids[1]).await.unwrap();
    let frozen = engine
        .submit(TransactionRequest::transfer("t1", ids[0], ids[1], usd(10)))
        .await
        .unwrap();
    assert_eq!(frozen.transaction.status, TransactionStatus::Failed);
    assert!(matches!(
        frozen.transaction.failure,
        Some(FailureReason::AccountNotActive { account_id, .. }) if account_id == ids[1]
    ));
    assert_eq!(balance(&engine, &ids[0]).await, 1_000);

    engine.unfreeze_account(&ids[1]).await.unwrap();
    let thawed = engine
        .submit(TransactionRequest::transfer("t2", ids[0], ids[1], usd(10)))
        .await
        .unwrap();
    assert_eq!(thawed.transaction.status, TransactionStatus::Applied);

    engine
        .submit(TransactionRequest::transfer("t3", ids[1], ids[0], usd(1_010)))
        .await
        .unwrap();
    engine.close_account(&ids[1]).await.unwrap();
    let closed = engine
        .submit(TransactionRequest::deposit("d1", ids[1], usd(10)))
        .await
        .unwrap();
    assert_eq!(closed.transaction.failure.map(|r| r.code()), Some("ACCOUNT_NOT_ACTIVE"));
}

#[tokio::test]
async fn test_status_changes_bump_version() {
    let (engine, _, ids) = setup(&[0]).await;

    let before = engine.get_account(&ids[0]).await.unwrap().version;
    let frozen = engine.freeze_account(&ids[0]).await.unwrap();
    let active = engine.unfreeze_account(&ids[0]).await.unwrap();

    assert_eq!(frozen.version, before + 1);
    assert_eq!(active.version, before + 2);

    let err = engine.unfreeze_account(&ids[0]).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_ACCOUNT_TRANSITION");
}

#[tokio::test]
async fn test_currency_mismatch() {
    let store = Arc::new(MemoryStore::new());
    let engine = LedgerEngine::new(store);
    let dollars = engine
        .open_account(NewAccount::new("dave", Currency::usd()))
        .await
        .unwrap();
    let euros = engine
        .open_account(NewAccount::new("dave", Currency::eur()))
        .await
        .unwrap();
    engine
        .submit(TransactionRequest::deposit("d1", dollars.id, usd(100)))
        .await
        .unwrap();

    let result = engine
        .submit(TransactionRequest::transfer("t1", dollars.id, euros.id, usd(50)))
        .await
        .unwrap();
    assert_eq!(
        result.transaction.failure,
        Some(FailureReason::CurrencyMismatch {
            source: Currency::usd(),
            destination: Currency::eur(),
        })
    );
    assert_eq!(balance(&engine, &dollars.id).await, 100);
}

#[tokio::test]
async fn test_unknown_account() {
    let (engine, _, ids) = setup(&[100]).await;
    let ghost = AccountId::new();

    let result = engine
        .submit(TransactionRequest::transfer("t1", ids[0], ghost, usd(10)))
        .await
        .unwrap();
    assert_eq!(
        result.transaction.failure,
        Some(FailureReason::UnknownAccount { account_id: ghost })
    );
    assert_eq!(balance(&engine, &ids[0]).await, 100);

    let err = engine.get_account_balance(&ghost).await.unwrap_err();
    assert_eq!(err, LedgerError::AccountNotFound(ghost));
}

#[tokio::test]
async fn test_reverse_rules() {
    let (engine, _, ids) = setup(&[1_000, 0]).await;

    let missing = engine.reverse(&TransactionId::new("nope")).await.unwrap_err();
    assert_eq!(missing, LedgerError::TransactionNotFound(TransactionId::new("nope")));

    engine
        .submit(TransactionRequest::withdrawal("w1", ids[0], usd(9_999)))
        .await
        .unwrap();
    let failed = engine.reverse(&TransactionId::new("w1")).await.unwrap_err();
    assert_eq!(failed.error_code(), "NOT_REVERSIBLE");

    engine
        .submit(TransactionRequest::transfer("t1", ids[0], ids[1], usd(400)))
        .await
        .unwrap();
    let first = engine.reverse(&TransactionId::new("t1")).await.unwrap();
    let again = engine.reverse(&TransactionId::new("t1")).await.unwrap();
    assert_eq!(again.transaction, first.transaction);
    assert_eq!(again.balances, first.balances);

    let other_key = engine
        .reverse_with_key(&TransactionId::new("t1"), TransactionId::new("undo-2"))
        .await
        .unwrap_err();
    assert!(matches!(other_key, LedgerError::NotReversible { .. }));

    let of_reversal = engine.reverse(&first.transaction.id).await.unwrap_err();
    assert!(matches!(of_reversal, LedgerError::NotReversible { .. }));

    assert_eq!(balance(&engine, &ids[0]).await, 1_000);
    assert_eq!(balance(&engine, &ids[1]).await, 0);
}

#[tokio::test]
async fn test_reverse_transaction_with_longest_key() {
    let (engine, _, ids) = setup(&[0]).await;
    let key = TransactionId::new("k".repeat(TransactionId::MAX_LEN));

    engine
        .submit(TransactionRequest::deposit(key.clone(), ids[0], usd(250)))
        .await
        .unwrap();
    let reversal = engine.reverse(&key).await.unwrap();

    assert_eq!(reversal.transaction.status, TransactionStatus::Applied);
    assert!(reversal.transaction.id.is_valid());
    assert_eq!(reversal, engine.reverse(&key).await.unwrap());
    assert_eq!(
        engine.get_transaction(&key).await.unwrap().status,
        TransactionStatus::Reversed
    );
    assert_eq!(balance(&engine, &ids[0]).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reversals_apply_once() {
    let (engine, _, ids) = setup(&[1_000, 0]).await;
    let (a, b) = (ids[0], ids[1]);
    engine
        .submit(TransactionRequest::transfer("t1", a, b, usd(1_000)))
        .await
        .unwrap();

    let barrier = Arc::new(Barrier::new(8));
    let tasks = (0..8).map(|i| {
        let engine = engine.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            let original = TransactionId::new("t1");
            barrier.wait().await;
            if i % 2 == 0 {
                engine.reverse(&original).await
            } else {
                engine
                    .reverse_with_key(&original, TransactionId::new(format!("undo-{i}")))
                    .await
            }
        })
    });

    let mut applied = HashSet::new();
    for joined in join_all(tasks).await {
        match joined.unwrap() {
            Ok(result) => {
                assert_eq!(result.transaction.status, TransactionStatus::Applied);
                applied.insert(result.transaction.id);
            }
            Err(err) => assert!(matches!(err, LedgerError::NotReversible { .. }), "{err}"),
        }
    }

    assert_eq!(applied.len(), 1);
    let original = engine.get_transaction(&TransactionId::new("t1")).await.unwrap();
    assert_eq!(original.status, TransactionStatus::Reversed);
    assert_eq!(original.reversed_by.as_ref(), applied.iter().next());
    assert_eq!(balance(&engine, &a).await, 1_000);
    assert_eq!(balance(&engine, &b).await, 0);
}

#[tokio::test]
async fn test_reversal_checks_funds() {
    let (engine, _, ids) = setup(&[0, 0]).await;

    engine
        .submit(TransactionRequest::deposit("d1", ids[0], usd(500)))
        .await
        .unwrap();
    engine
        .submit(TransactionRequest::transfer("t1", ids[0], ids[1], usd(500)))
        .await
        .unwrap();

    // The deposit's money has left the account; undoing it would overdraw.
    let result = engine.reverse(&TransactionId::new("d1")).await.unwrap();
    assert_eq!(result.transaction.failure.map(|r| r.code()), Some("INSUFFICIENT_FUNDS"));
    assert_eq!(
        engine.get_transaction(&TransactionId::new("d1")).await.unwrap().status,
        TransactionStatus::Applied
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_apply_once() {
    let (engine, _, ids) = setup(&[10_000, 0]).await;
    let barrier = Arc::new(Barrier::new(16));

    let handles = (0..16).map(|_| {
        let engine = engine.clone();
        let barrier = barrier.clone();
        let (a, b) = (ids[0], ids[1]);
        tokio::spawn(async move {
            barrier.wait().await;
            engine
                .submit(TransactionRequest::transfer("dup", a, b, usd(100)))
                .await
        })
    });

    let results: Vec<TransactionResult> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    for result in &results {
        assert_eq!(result, &results[0]);
    }
    assert_eq!(balance(&engine, &ids[0]).await, 9_900);
    assert_eq!(balance(&engine, &ids[1]).await, 100);
    assert_eq!(engine.journal_entries(&TransactionId::new("dup")).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_transfers_do_not_deadlock() {
    let (engine, _, ids) = setup(&[100_000, 100_000]).await;
    let (a, b) = (ids[0], ids[1]);

    let tasks = (0..200).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move {
            let request = if i % 2 == 0 {
                TransactionRequest::transfer(format!("ab-{i}"), a, b, usd(7))
            } else {
                TransactionRequest::transfer(format!("ba-{i}"), b, a, usd(5))
            };
            submit_until_settled(&engine, request).await
        })
    });

    let results = tokio::time::timeout(Duration::from_secs(30), join_all(tasks))
        .await
        .expect("transfers deadlocked");

    for joined in results {
        assert_eq!(joined.unwrap().transaction.status, TransactionStatus::Applied);
    }
    assert_eq!(balance(&engine, &a).await, 100_000 - 100 * 7 + 100 * 5);
    assert_eq!(balance(&engine, &b).await, 100_000 + 100 * 7 - 100 * 5);
}

#[tokio::test]
async fn test_conflicts_are_retried() {
    let (engine, store, ids) = setup(&[1_000, 0]).await;

    store.inject_version_conflicts(2);
    let result = engine
        .submit(TransactionRequest::transfer("t1", ids[0], ids[1], usd(100)))
        .await
        .unwrap();

    assert_eq!(result.transaction.status, TransactionStatus::Applied);
    assert_eq!(engine.metrics().snapshot().version_conflicts, 2);
}

#[tokio::test]
async fn test_contention_releases_claim() {
    let (engine, store, ids) = setup(&[1_000, 0]).await;
    let request = TransactionRequest::transfer("t1", ids[0], ids[1], usd(100));

    store.inject_version_conflicts(5);
    let err = engine.submit(request.clone()).await.unwrap_err();
    assert_eq!(err, LedgerError::Contention { attempts: 5 });
    assert!(err.is_retryable());
    assert_eq!(balance(&engine, &ids[0]).await, 1_000);
    assert!(engine.get_transaction(&TransactionId::new("t1")).await.is_err());

    let retried = engine.submit(request).await.unwrap();
    assert_eq!(retried.transaction.status, TransactionStatus::Applied);
    assert_eq!(balance(&engine, &ids[0]).await, 900);
}

#[tokio::test]
async fn test_storage_outage_is_transient() {
    let (engine, store, ids) = setup(&[1_000]).await;
    let request = TransactionRequest::withdrawal("w1", ids[0], usd(100));

    store.set_unavailable(true);
    let err = engine.submit(request.clone()).await.unwrap_err();
    assert!(matches!(err, LedgerError::StorageUnavailable(_)));
    assert!(err.is_retryable());

    store.set_unavailable(false);
    let result = engine.submit(request).await.unwrap();
    assert_eq!(result.transaction.status, TransactionStatus::Applied);
    assert_eq!(balance(&engine, &ids[0]).await, 900);
    assert_eq!(engine.metrics().snapshot().storage_errors, 1);
}

#[tokio::test]
async fn test_outage_at_commit_does_not_strand_the_key() {
    let config = EngineConfig {
        claim_lease: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let (_, store, ids) = setup(&[1_000]).await;
    let flaky = Arc::new(OutageAtCommit {
        inner: store.clone(),
        tripped: AtomicBool::new(false),
    });
    let engine = LedgerEngine::with_config(flaky, config).unwrap();
    let request = TransactionRequest::deposit("d1", ids[0], usd(100));

    let err = engine.submit(request.clone()).await.unwrap_err();
    assert!(matches!(err, LedgerError::StorageUnavailable(_)));
    assert!(err.is_retryable());

    // The release ran while storage was down, so the claim is still there.
    store.set_unavailable(false);
    assert_eq!(
        engine.get_transaction(&TransactionId::new("d1")).await.unwrap().status,
        TransactionStatus::Pending
    );

    let result = engine.submit(request.clone()).await.unwrap();
    assert_eq!(result.transaction.status, TransactionStatus::Applied);
    assert_eq!(balance(&engine, &ids[0]).await, 1_100);

    let replay = engine.submit(request).await.unwrap();
    assert_eq!(replay, result);
    assert_eq!(balance(&engine, &ids[0]).await, 1_100);
}

#[tokio::test]
async fn test_abandoned_claim_is_taken_over() {
    let config = EngineConfig {
        claim_lease: Duration::from_millis(20),
        ..EngineConfig::default()
    };
    let (engine, store, ids) = setup_with(&[1_000], config).await;

    let request = TransactionRequest::withdrawal("w1", ids[0], usd(100));
    let abandoned = Transaction::pending(TransactionId::new("w1"), &request, None);
    store.claim(&abandoned).await.unwrap();

    let result = engine.submit(request).await.unwrap();
    assert_eq!(result.transaction.status, TransactionStatus::Applied);
    assert!(!result.transaction.same_claim(&abandoned));
    assert_eq!(balance(&engine, &ids[0]).await, 900);

    // The abandoned owner can no longer release the key.
    store.release_claim(&abandoned).await.unwrap();
    assert_eq!(
        engine.get_transaction(&TransactionId::new("w1")).await.unwrap().status,
        TransactionStatus::Applied
    );
}

#[tokio::test]
async fn test_duplicate_of_stuck_claim_reports_in_flight() {
    let config = EngineConfig {
        pending_wait: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let (engine, store, ids) = setup_with(&[1_000], config).await;

    // A claim whose owner never completes.
    let request = TransactionRequest::withdrawal("w1", ids[0], usd(100));
    let stuck = Transaction::pending(TransactionId::new("w1"), &request, None);
    store.claim(&stuck).await.unwrap();

    let err = engine.submit(request.clone()).await.unwrap_err();
    assert_eq!(err, LedgerError::InFlight(TransactionId::new("w1")));

    store.release_claim(&stuck).await.unwrap();
    let result = engine.submit(request).await.unwrap();
    assert_eq!(result.transaction.status, TransactionStatus::Applied);
}

#[tokio::test]
async fn test_metrics_export() {
    let (engine, _, ids) = setup(&[100]).await;
    engine
        .submit(TransactionRequest::withdrawal("w1", ids[0], usd(500)))
        .await
        .unwrap();

    let snapshot = engine.metrics().snapshot();
    assert_eq!(snapshot.applied, 1);
    assert_eq!(snapshot.failed, 1);
    assert!(engine
        .metrics()
        .to_prometheus()
        .contains("corebank_ledger_failed_total 1"));
}
