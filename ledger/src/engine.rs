//! Core ledger engine implementation.
//!
//! The engine is stateless per call. Every submission claims its idempotency
//! key in the store, evaluates the request against a fresh read of the
//! touched accounts and commits the outcome with a compare-and-swap on each
//! account version. Lost races are retried with jittered exponential backoff
//! up to `max_attempts`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use corebank_common::{
    now, AccountId, Amount, Currency, LedgerError, Result, TransactionId, TransactionStatus,
};

use crate::account::{Account, AccountStatus, NewAccount};
use crate::balance::AccountBalance;
use crate::config::EngineConfig;
use crate::journal::{posted_balances, JournalBatch, JournalEntry};
use crate::metrics::EngineMetrics;
use crate::store::{AccountUpdate, Claim, CommitBatch, LedgerStore, StoreError};
use crate::transaction::{FailureReason, Transaction, TransactionRequest, TransactionResult};

/// Outcome of evaluating a request against the current account state.
enum Plan {
    Apply {
        transaction: Transaction,
        updates: Vec<AccountUpdate>,
        journal: JournalBatch,
    },
    Reject {
        reason: FailureReason,
        currency: Option<Currency>,
    },
}

/// What a duplicate submission found while waiting on a PENDING record.
enum Waited {
    /// The owner completed the record.
    Completed(Transaction),
    /// The claim was released; the key is free again.
    Released,
    /// The claim outlived its lease.
    Abandoned(Transaction),
}

/// Outcome of one commit attempt.
enum Attempt {
    Done(TransactionResult),
    Retry(Option<AccountId>),
}

/// The ledger engine validates and atomically applies balance changes.
pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
}

impl LedgerEngine {
    /// Create an engine with the default configuration.
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
            metrics: Arc::new(EngineMetrics::new()),
        }
    }

    /// Create an engine with a custom configuration.
    pub fn with_config(store: Arc<dyn LedgerStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            metrics: Arc::new(EngineMetrics::new()),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Engine counters.
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    // ---------------------------------------------------------------------
    // Accounts
    // ---------------------------------------------------------------------

    /// Open an account with a zero balance.
    #[instrument(skip(self, new), fields(owner = %new.owner, currency = %new.currency))]
    pub async fn open_account(&self, new: NewAccount) -> Result<Account> {
        if !new.owner.is_valid() {
            return Err(LedgerError::invalid_field(
                "owner",
                "owner must be 1-64 alphanumeric, '_' or '-' characters",
            ));
        }
        if !new.currency.is_valid() {
            return Err(LedgerError::invalid_field(
                "currency",
                format!("invalid currency code: {}", new.currency),
            ));
        }
        if new.overdraft_limit.is_negative() {
            return Err(LedgerError::invalid_field(
                "overdraft_limit",
                "overdraft limit cannot be negative",
            ));
        }

        let account = Account::open(new);
        self.store
            .insert_account(&account)
            .await
            .map_err(|e| self.store_error(e))?;

        info!(account_id = %account.id, "Account opened");
        Ok(account)
    }

    /// Get an account.
    pub async fn get_account(&self, id: &AccountId) -> Result<Account> {
        self.store
            .load_account(id)
            .await
            .map_err(|e| self.store_error(e))?
            .ok_or(LedgerError::AccountNotFound(*id))
    }

    /// Get account balance.
    pub async fn get_account_balance(&self, id: &AccountId) -> Result<AccountBalance> {
        let account = self.get_account(id).await?;
        Ok(AccountBalance::from(&account))
    }

    /// Freeze an account. Frozen accounts reject transactions.
    pub async fn freeze_account(&self, id: &AccountId) -> Result<Account> {
        self.change_status(id, AccountStatus::Frozen).await
    }

    /// Return a frozen account to ACTIVE.
    pub async fn unfreeze_account(&self, id: &AccountId) -> Result<Account> {
        self.change_status(id, AccountStatus::Active).await
    }

    /// Close an account. The balance must be zero.
    pub async fn close_account(&self, id: &AccountId) -> Result<Account> {
        self.change_status(id, AccountStatus::Closed).await
    }

    #[instrument(skip(self, id, target), fields(account_id = %id, target = %target))]
    async fn change_status(&self, id: &AccountId, target: AccountStatus) -> Result<Account> {
        for attempt in 1..=self.config.max_attempts {
            let account = self.get_account(id).await?;

            if !account.status.can_transition_to(target) {
                return Err(LedgerError::InvalidAccountTransition {
                    account_id: *id,
                    reason: format!("cannot move from {} to {}", account.status, target),
                });
            }
            if target == AccountStatus::Closed && account.balance != Amount::ZERO {
                return Err(LedgerError::InvalidAccountTransition {
                    account_id: *id,
                    reason: format!("balance must be zero to close, is {}", account.balance),
                });
            }

            match self
                .store
                .update_account_status(id, account.version, target)
                .await
            {
                Ok(updated) => {
                    info!(version = updated.version, "Account status changed");
                    return Ok(updated);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    EngineMetrics::incr(&self.metrics.version_conflicts);
                    warn!(attempt, "Version conflict on status change");
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(err) => return Err(self.store_error(err)),
            }
        }

        EngineMetrics::incr(&self.metrics.contention_exhausted);
        Err(LedgerError::Contention {
            attempts: self.config.max_attempts,
        })
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    /// Validate and apply a transaction request.
    ///
    /// Returns the APPLIED or FAILED record. Submitting the same key again
    /// returns the recorded outcome without reapplying anything.
    #[instrument(skip(self, request), fields(kind = %request.kind, amount = %request.amount))]
    pub async fn submit(&self, request: TransactionRequest) -> Result<TransactionResult> {
        EngineMetrics::incr(&self.metrics.submitted);

        if let Err(err) = request.validate() {
            EngineMetrics::incr(&self.metrics.invalid_requests);
            debug!(error = %err, "Rejected malformed request");
            return Err(err);
        }

        let id = request
            .idempotency_key
            .clone()
            .unwrap_or_else(TransactionId::generate);
        let pending = Transaction::pending(id, &request, None);

        self.execute(pending).await
    }

    /// Reverse an applied transaction under the key derived from its id.
    pub async fn reverse(&self, original: &TransactionId) -> Result<TransactionResult> {
        self.reverse_with_key(original, TransactionId::reversal_of(original))
            .await
    }

    /// Reverse an applied transaction under an explicit idempotency key.
    #[instrument(skip(self, original, key), fields(original = %original, key = %key))]
    pub async fn reverse_with_key(
        &self,
        original: &TransactionId,
        key: TransactionId,
    ) -> Result<TransactionResult> {
        EngineMetrics::incr(&self.metrics.submitted);

        if !key.is_valid() {
            EngineMetrics::incr(&self.metrics.invalid_requests);
            return Err(LedgerError::invalid_field(
                "idempotency_key",
                format!(
                    "idempotency key must be 1-{} printable characters",
                    TransactionId::MAX_LEN
                ),
            ));
        }

        let record = self.get_transaction(original).await?;
        if record.is_reversal() {
            return Err(LedgerError::NotReversible {
                id: original.clone(),
                reason: "reversals cannot be reversed".to_string(),
            });
        }

        let request = record.inverse_request(key.clone());
        let pending = Transaction::pending(key, &request, Some(record.id.clone()));

        self.execute(pending).await
    }

    /// Get a transaction record.
    pub async fn get_transaction(&self, id: &TransactionId) -> Result<Transaction> {
        self.store
            .load_transaction(id)
            .await
            .map_err(|e| self.store_error(e))?
            .ok_or_else(|| LedgerError::TransactionNotFound(id.clone()))
    }

    /// Journal entries recorded for a transaction (empty unless applied).
    pub async fn journal_entries(&self, id: &TransactionId) -> Result<Vec<JournalEntry>> {
        self.get_transaction(id).await?;
        self.store
            .load_journal(id)
            .await
            .map_err(|e| self.store_error(e))
    }

    /// Claim the key of `pending` and apply it, or replay what the key holds.
    async fn execute(&self, pending: Transaction) -> Result<TransactionResult> {
        let deadline = Instant::now() + self.config.pending_wait;

        loop {
            let claim = self
                .store
                .claim(&pending)
                .await
                .map_err(|e| self.store_error(e))?;

            let existing = match claim {
                Claim::Claimed => return self.apply_claimed(&pending).await,
                Claim::Existing(existing) => existing,
            };

            if existing.fingerprint != pending.fingerprint {
                warn!(id = %pending.id, "Idempotency key reused with a different request");
                return Err(LedgerError::IdempotencyConflict(pending.id.clone()));
            }

            let completed = if existing.status == TransactionStatus::Pending {
                match self.await_outcome(existing, deadline).await? {
                    Waited::Completed(completed) => completed,
                    Waited::Released => continue,
                    Waited::Abandoned(stale) => {
                        let fresh = pending.reclaimed();
                        let taken = self
                            .store
                            .take_over(&stale, &fresh)
                            .await
                            .map_err(|e| self.store_error(e))?;
                        if taken {
                            warn!(
                                id = %fresh.id,
                                claimed_at = %stale.created_at,
                                "Took over abandoned claim"
                            );
                            return self.apply_claimed(&fresh).await;
                        }
                        continue;
                    }
                }
            } else {
                existing
            };

            EngineMetrics::incr(&self.metrics.replayed);
            debug!(id = %completed.id, status = %completed.status, "Replaying recorded outcome");
            return self.result_for(completed).await;
        }
    }

    /// Poll a PENDING record until it completes, disappears, outlives its
    /// lease or `deadline` passes.
    async fn await_outcome(&self, claim: Transaction, deadline: Instant) -> Result<Waited> {
        let id = claim.id.clone();
        let mut current = claim;

        loop {
            if self.is_abandoned(&current) {
                return Ok(Waited::Abandoned(current));
            }

            if Instant::now() >= deadline {
                debug!(id = %id, "Gave up waiting for in-flight submission");
                return Err(LedgerError::InFlight(id));
            }
            tokio::time::sleep(self.config.pending_poll_interval).await;

            match self
                .store
                .load_transaction(&id)
                .await
                .map_err(|e| self.store_error(e))?
            {
                None => return Ok(Waited::Released),
                Some(record) if record.status != TransactionStatus::Pending => {
                    return Ok(Waited::Completed(record))
                }
                Some(record) => current = record,
            }
        }
    }

    fn is_abandoned(&self, claim: &Transaction) -> bool {
        now()
            .signed_duration_since(claim.created_at)
            .to_std()
            .map_or(false, |age| age >= self.config.claim_lease)
    }

    /// Result for a completed record, with balances rebuilt from its journal.
    async fn result_for(&self, transaction: Transaction) -> Result<TransactionResult> {
        let balances = match transaction.status {
            TransactionStatus::Applied | TransactionStatus::Reversed => {
                let entries = self
                    .store
                    .load_journal(&transaction.id)
                    .await
                    .map_err(|e| self.store_error(e))?;
                posted_balances(&entries)
            }
            _ => Vec::new(),
        };

        Ok(TransactionResult {
            transaction,
            balances,
        })
    }

    /// Run commit attempts for a claimed key. Releases the claim on error.
    async fn apply_claimed(&self, pending: &Transaction) -> Result<TransactionResult> {
        let outcome = self.retry_attempts(pending).await;

        if outcome.is_err() {
            if let Err(err) = self.store.release_claim(pending).await {
                warn!(id = %pending.id, error = %err, "Failed to release claim");
            }
        }

        outcome
    }

    async fn retry_attempts(&self, pending: &Transaction) -> Result<TransactionResult> {
        for attempt in 1..=self.config.max_attempts {
            match self.attempt(pending).await? {
                Attempt::Done(result) => return Ok(result),
                Attempt::Retry(account_id) => {
                    EngineMetrics::incr(&self.metrics.version_conflicts);
                    warn!(
                        id = %pending.id,
                        attempt,
                        account_id = ?account_id,
                        "Version conflict, retrying"
                    );
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        EngineMetrics::incr(&self.metrics.contention_exhausted);
        warn!(id = %pending.id, attempts = self.config.max_attempts, "Contention, giving up");
        Err(LedgerError::Contention {
            attempts: self.config.max_attempts,
        })
    }

    /// Read, validate and commit once.
    async fn attempt(&self, pending: &Transaction) -> Result<Attempt> {
        if let Some(original) = &pending.reversal_of {
            self.ensure_reversible(original).await?;
        }

        let batch = match self.plan(pending).await? {
            Plan::Apply {
                transaction,
                updates,
                journal,
            } => CommitBatch {
                transaction,
                account_updates: updates,
                journal: journal.into_entries(),
                reverses: pending.reversal_of.clone(),
            },
            Plan::Reject { reason, currency } => {
                let failed = pending
                    .to_failed(reason, currency)
                    .map_err(|e| LedgerError::Internal(e.to_string()))?;
                CommitBatch::failed(failed)
            }
        };

        let transaction = batch.transaction.clone();
        let balances = posted_balances(&batch.journal);

        match self.store.commit(batch).await {
            Ok(()) => {}
            Err(StoreError::VersionConflict { account_id }) => {
                return Ok(Attempt::Retry(account_id))
            }
            // Our claim was taken over after its lease ran out.
            Err(StoreError::TransactionConflict { id }) if id == pending.id => {
                return Err(LedgerError::InFlight(id))
            }
            Err(StoreError::TransactionConflict { id })
                if pending.reversal_of.as_ref() == Some(&id) =>
            {
                return Err(LedgerError::NotReversible {
                    id,
                    reason: "already reversed".to_string(),
                });
            }
            Err(err) => return Err(self.store_error(err)),
        }

        self.record_outcome(&transaction);
        Ok(Attempt::Done(TransactionResult {
            transaction,
            balances,
        }))
    }

    fn record_outcome(&self, transaction: &Transaction) {
        match &transaction.failure {
            None => {
                EngineMetrics::incr(&self.metrics.applied);
                if transaction.is_reversal() {
                    EngineMetrics::incr(&self.metrics.reversals);
                }
                info!(
                    id = %transaction.id,
                    kind = %transaction.kind,
                    amount = %transaction.amount,
                    reversal_of = ?transaction.reversal_of,
                    "Transaction applied"
                );
            }
            Some(reason) => {
                EngineMetrics::incr(&self.metrics.failed);
                info!(
                    id = %transaction.id,
                    kind = %transaction.kind,
                    code = reason.code(),
                    reason = %reason,
                    "Transaction failed"
                );
            }
        }
    }

    async fn ensure_reversible(&self, original: &TransactionId) -> Result<()> {
        let record = self.get_transaction(original).await?;

        match record.status {
            TransactionStatus::Applied => Ok(()),
            TransactionStatus::Reversed => Err(LedgerError::NotReversible {
                id: original.clone(),
                reason: match &record.reversed_by {
                    Some(by) => format!("already reversed by {by}"),
                    None => "already reversed".to_string(),
                },
            }),
            status => Err(LedgerError::NotReversible {
                id: original.clone(),
                reason: format!("transaction is {status}"),
            }),
        }
    }

    /// Evaluate `pending` against fresh account state.
    ///
    /// Checks run in a fixed order: existence, status, currency, funds,
    /// then credit overflow. The first failing check decides the reason.
    async fn plan(&self, pending: &Transaction) -> Result<Plan> {
        let source = self.load_leg(pending.source).await?;
        let destination = self.load_leg(pending.destination).await?;

        for (id, account) in [&source, &destination].into_iter().flatten() {
            if account.is_none() {
                let currency = [&source, &destination]
                    .into_iter()
                    .flatten()
                    .find_map(|(_, a)| a.as_ref().map(|a| a.currency.clone()));
                return Ok(Plan::Reject {
                    reason: FailureReason::UnknownAccount { account_id: *id },
                    currency,
                });
            }
        }

        let source = source.and_then(|(_, account)| account);
        let destination = destination.and_then(|(_, account)| account);

        let currency = match source.as_ref().or(destination.as_ref()) {
            Some(account) => account.currency.clone(),
            None => return Err(LedgerError::Internal("transaction has no legs".to_string())),
        };

        for account in [&source, &destination].into_iter().flatten() {
            if !account.can_transact() {
                return Ok(Plan::Reject {
                    reason: FailureReason::AccountNotActive {
                        account_id: account.id,
                        status: account.status,
                    },
                    currency: Some(currency),
                });
            }
        }

        if let (Some(from), Some(to)) = (&source, &destination) {
            if from.currency != to.currency {
                return Ok(Plan::Reject {
                    reason: FailureReason::CurrencyMismatch {
                        source: from.currency.clone(),
                        destination: to.currency.clone(),
                    },
                    currency: Some(currency),
                });
            }
        }

        let amount = pending.amount;
        let mut updates = Vec::with_capacity(2);
        let mut journal = JournalBatch::new(pending.id.clone());

        if let Some(from) = &source {
            let Some(new_balance) = from.debited(amount) else {
                return Ok(Plan::Reject {
                    reason: FailureReason::InsufficientFunds {
                        account_id: from.id,
                        available: from.available(),
                        requested: amount,
                    },
                    currency: Some(currency),
                });
            };
            updates.push(AccountUpdate {
                account_id: from.id,
                expected_version: from.version,
                new_balance,
            });
            journal.add_entry(JournalEntry::debit(
                pending.id.clone(),
                from.id,
                amount,
                currency.clone(),
                (new_balance, from.version + 1),
            ));
        }

        if let Some(to) = &destination {
            let Some(new_balance) = to.credited(amount) else {
                return Ok(Plan::Reject {
                    reason: FailureReason::BalanceOverflow { account_id: to.id },
                    currency: Some(currency),
                });
            };
            updates.push(AccountUpdate {
                account_id: to.id,
                expected_version: to.version,
                new_balance,
            });
            journal.add_entry(JournalEntry::credit(
                pending.id.clone(),
                to.id,
                amount,
                currency.clone(),
                (new_balance, to.version + 1),
            ));
        }

        debug_assert!(source.is_none() || destination.is_none() || journal.is_balanced());
        updates.sort_by_key(|u| u.account_id);

        let transaction = pending
            .to_applied(currency)
            .map_err(|e| LedgerError::Internal(e.to_string()))?;

        Ok(Plan::Apply {
            transaction,
            updates,
            journal,
        })
    }

    async fn load_leg(
        &self,
        id: Option<AccountId>,
    ) -> Result<Option<(AccountId, Option<Account>)>> {
        match id {
            Some(id) => {
                let account = self
                    .store
                    .load_account(&id)
                    .await
                    .map_err(|e| self.store_error(e))?;
                Ok(Some((id, account)))
            }
            None => Ok(None),
        }
    }

    /// Jittered exponential backoff before attempt `attempt + 1`.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff.as_micros() as u64;
        let ceiling = self.config.max_backoff.as_micros() as u64;
        let exp = base
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
            .min(ceiling);
        let half = exp / 2;
        let jitter = rand::thread_rng().gen_range(0..=half);
        Duration::from_micros(half + jitter)
    }

    fn store_error(&self, err: StoreError) -> LedgerError {
        if matches!(err, StoreError::Unavailable(_)) {
            EngineMetrics::incr(&self.metrics.storage_errors);
            warn!(error = %err, "Storage unavailable");
        }
        err.into()
    }
}
