//! Simulated bank: named customer accounts on top of a ledger engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use corebank_common::{AccountId, Amount, Currency, LedgerError, TransactionId};
use corebank_ledger::{LedgerEngine, MemoryStore, NewAccount, TransactionRequest, TransactionResult};

/// How many times a client resubmits after a transient error.
const MAX_RESUBMITS: usize = 100;

/// A simulated bank.
pub struct SimulatedBank {
    engine: Arc<LedgerEngine>,
    /// Fault hooks, present when running on the in-memory store.
    faults: Option<Arc<MemoryStore>>,
    /// Prefix that keeps idempotency keys unique across runs.
    run_id: TransactionId,
    accounts: HashMap<String, AccountId>,
}

impl SimulatedBank {
    /// Create a bank over `engine`.
    pub fn new(engine: Arc<LedgerEngine>, faults: Option<Arc<MemoryStore>>) -> Self {
        Self {
            engine,
            faults,
            run_id: TransactionId::generate(),
            accounts: HashMap::new(),
        }
    }

    /// The engine.
    pub fn engine(&self) -> &Arc<LedgerEngine> {
        &self.engine
    }

    /// Fault hooks, or an error when the store does not support them.
    pub fn faults(&self) -> anyhow::Result<&MemoryStore> {
        self.faults
            .as_deref()
            .context("fault injection needs the in-memory store")
    }

    /// Idempotency key for a scenario-local name.
    pub fn key(&self, name: &str) -> TransactionId {
        TransactionId::new(format!("{}:{}", self.run_id, name))
    }

    /// Open an account under `name` and fund it with `balance` minor units.
    pub async fn open_account(&mut self, name: &str, balance: i64) -> anyhow::Result<AccountId> {
        let account = self
            .engine
            .open_account(NewAccount::new(name, Currency::usd()))
            .await
            .with_context(|| format!("opening account {name}"))?;

        if balance > 0 {
            let request = TransactionRequest::deposit(
                self.key(&format!("opening-{name}")),
                account.id,
                Amount::from_minor(balance),
            );
            let result = settle(&self.engine, request).await?;
            anyhow::ensure!(result.is_applied(), "opening deposit for {name} was not applied");
        }

        self.accounts.insert(name.to_string(), account.id);
        Ok(account.id)
    }

    /// Look up an account by name.
    pub fn account(&self, name: &str) -> anyhow::Result<AccountId> {
        self.accounts
            .get(name)
            .copied()
            .with_context(|| format!("unknown account name {name}"))
    }

    /// All accounts opened so far.
    pub fn account_ids(&self) -> Vec<AccountId> {
        self.accounts.values().copied().collect()
    }

    /// Current balance in minor units.
    pub async fn balance(&self, id: &AccountId) -> anyhow::Result<i64> {
        Ok(self.engine.get_account_balance(id).await?.balance.minor())
    }
}

/// Submit `request`, resubmitting with the same key on transient errors.
pub async fn settle(
    engine: &LedgerEngine,
    request: TransactionRequest,
) -> Result<TransactionResult, LedgerError> {
    let mut attempt = 0;
    loop {
        match engine.submit(request.clone()).await {
            Err(err) if err.is_retryable() && attempt < MAX_RESUBMITS => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(1 + attempt as u64 % 10)).await;
            }
            other => return other,
        }
    }
}

/// Reverse `original`, resubmitting on transient errors.
pub async fn settle_reversal(
    engine: &LedgerEngine,
    original: &TransactionId,
) -> Result<TransactionResult, LedgerError> {
    let mut attempt = 0;
    loop {
        match engine.reverse(original).await {
            Err(err) if err.is_retryable() && attempt < MAX_RESUBMITS => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(1 + attempt as u64 % 10)).await;
            }
            other => return other,
        }
    }
}
