//! Simulation controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Barrier, Mutex, RwLock};
use tracing::{debug, info, warn};

use corebank_common::{
    AccountId, Amount, LedgerError, TransactionId, TransactionKind, TransactionStatus,
};
use corebank_ledger::{LedgerEngine, TransactionRequest, TransactionResult};

use crate::bank::{settle, settle_reversal, SimulatedBank};
use crate::metrics::SimulationMetrics;
use crate::scenario::{Expect, Kind, Scenario, ScenarioStep};

/// Random workload parameters.
#[derive(Debug, Clone)]
pub struct WorkloadOptions {
    /// Accounts to open.
    pub accounts: usize,
    /// Opening balance of each account, in minor units.
    pub initial_balance: i64,
    /// Concurrent client tasks.
    pub concurrency: usize,
    /// Transactions to submit across all tasks.
    pub transactions: usize,
    /// Probability of resubmitting a transaction under the same key.
    pub duplicate_rate: f64,
    /// Probability of reversing an earlier applied transaction.
    pub reversal_rate: f64,
    /// Seed for the workload generators.
    pub seed: u64,
}

type Outcomes = Arc<Mutex<HashMap<TransactionId, TransactionResult>>>;
type Violations = Arc<Mutex<Vec<String>>>;

/// Controls the simulation.
pub struct SimulationController {
    /// The simulated bank.
    bank: SimulatedBank,
    /// Simulation metrics.
    metrics: Arc<RwLock<SimulationMetrics>>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(bank: SimulatedBank) -> Self {
        Self {
            bank,
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
        }
    }

    /// Run a scenario. Fails on the first step whose expectation does not hold.
    pub async fn run_scenario(&mut self, scenario: Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        for (index, step) in scenario.steps.iter().enumerate() {
            debug!(index, step = ?step, "Executing step");
            if let Err(err) = self.execute_step(step).await {
                bail!("scenario {} failed at step {}: {:#}", scenario.name, index + 1, err);
            }
        }

        info!("Scenario {} passed", scenario.name);
        Ok(())
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::OpenAccount { name, balance } => {
                let id = self.bank.open_account(name, *balance).await?;
                info!("Opened account {} ({}) with {}", name, id, balance);
            }
            ScenarioStep::Submit {
                key,
                kind,
                from,
                to,
                amount,
                expect,
            } => {
                let request = self.request(key, *kind, from.as_deref(), to.as_deref(), *amount)?;
                let started = Instant::now();
                let outcome = self.bank.engine().submit(request).await;
                self.record(&outcome, started).await;
                check_expectation(expect, &outcome)?;
            }
            ScenarioStep::Reverse { key, expect } => {
                let started = Instant::now();
                let outcome = self.bank.engine().reverse(&self.bank.key(key)).await;
                self.record(&outcome, started).await;
                check_expectation(expect, &outcome)?;
            }
            ScenarioStep::Freeze { account } => {
                self.bank
                    .engine()
                    .freeze_account(&self.bank.account(account)?)
                    .await?;
            }
            ScenarioStep::Unfreeze { account } => {
                self.bank
                    .engine()
                    .unfreeze_account(&self.bank.account(account)?)
                    .await?;
            }
            ScenarioStep::Close { account } => {
                self.bank
                    .engine()
                    .close_account(&self.bank.account(account)?)
                    .await?;
            }
            ScenarioStep::StorageOutage { offline } => {
                info!("Storage {}", if *offline { "offline" } else { "online" });
                self.bank.faults()?.set_unavailable(*offline);
            }
            ScenarioStep::InjectConflicts { count } => {
                info!("Injecting {} version conflicts", count);
                self.bank.faults()?.inject_version_conflicts(*count);
            }
            ScenarioStep::OppositeTransfers {
                first,
                second,
                count,
                amount,
            } => {
                self.opposite_transfers(first, second, *count, *amount).await?;
            }
            ScenarioStep::DuplicateStorm {
                key,
                from,
                to,
                amount,
                copies,
            } => {
                self.duplicate_storm(key, from, to, *amount, *copies).await?;
            }
            ScenarioStep::AssertBalance { account, amount } => {
                let actual = self.bank.balance(&self.bank.account(account)?).await?;
                ensure!(
                    actual == *amount,
                    "balance of {} is {}, expected {}",
                    account,
                    actual,
                    amount
                );
            }
        }

        Ok(())
    }

    fn request(
        &self,
        key: &str,
        kind: Kind,
        from: Option<&str>,
        to: Option<&str>,
        amount: i64,
    ) -> anyhow::Result<TransactionRequest> {
        let key = self.bank.key(key);
        let amount = Amount::from_minor(amount);
        let account = |name: Option<&str>| -> anyhow::Result<AccountId> {
            match name {
                Some(name) => self.bank.account(name),
                None => bail!("{:?} step is missing an account", kind),
            }
        };

        Ok(match kind {
            Kind::Deposit => TransactionRequest::deposit(key, account(to)?, amount),
            Kind::Withdrawal => TransactionRequest::withdrawal(key, account(from)?, amount),
            Kind::Transfer => {
                TransactionRequest::transfer(key, account(from)?, account(to)?, amount)
            }
        })
    }

    async fn record(&self, outcome: &Result<TransactionResult, LedgerError>, started: Instant) {
        let mut metrics = self.metrics.write().await;
        match outcome {
            Ok(result) => metrics.record_outcome(
                result.is_applied(),
                result.transaction.is_reversal(),
                started.elapsed().as_micros() as u64,
            ),
            Err(_) => metrics.record_error(),
        }
    }

    async fn opposite_transfers(
        &self,
        first: &str,
        second: &str,
        count: usize,
        amount: i64,
    ) -> anyhow::Result<()> {
        let a = self.bank.account(first)?;
        let b = self.bank.account(second)?;

        let tasks = (0..count * 2).map(|i| {
            let engine = self.bank.engine().clone();
            let metrics = self.metrics.clone();
            let (from, to, key) = if i % 2 == 0 {
                (a, b, self.bank.key(&format!("ab-{i}")))
            } else {
                (b, a, self.bank.key(&format!("ba-{i}")))
            };
            tokio::spawn(async move {
                let started = Instant::now();
                let request = TransactionRequest::transfer(key, from, to, Amount::from_minor(amount));
                let outcome = settle(&engine, request).await;
                if let Ok(result) = &outcome {
                    metrics.write().await.record_outcome(
                        result.is_applied(),
                        false,
                        started.elapsed().as_micros() as u64,
                    );
                }
                outcome
            })
        });

        let joined = tokio::time::timeout(Duration::from_secs(60), join_all(tasks))
            .await
            .map_err(|_| anyhow::anyhow!("opposite transfers did not finish: deadlock?"))?;

        for outcome in joined {
            let result = outcome??;
            ensure!(
                result.transaction.status == TransactionStatus::Applied,
                "transfer {} was not applied: {:?}",
                result.transaction.id,
                result.transaction.failure
            );
        }

        info!("{} opposite-direction transfers applied", count * 2);
        Ok(())
    }

    async fn duplicate_storm(
        &self,
        key: &str,
        from: &str,
        to: &str,
        amount: i64,
        copies: usize,
    ) -> anyhow::Result<()> {
        let request = self.request(key, Kind::Transfer, Some(from), Some(to), amount)?;
        let barrier = Arc::new(Barrier::new(copies));

        let tasks = (0..copies).map(|_| {
            let engine = self.bank.engine().clone();
            let barrier = barrier.clone();
            let request = request.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                settle(&engine, request).await
            })
        });

        let mut results = Vec::with_capacity(copies);
        for outcome in join_all(tasks).await {
            results.push(outcome??);
        }
        self.metrics.write().await.duplicates += copies.saturating_sub(1) as u64;

        let Some(first) = results.first() else {
            bail!("duplicate storm needs at least one copy");
        };
        ensure!(first.is_applied(), "storm transfer was not applied");
        for result in &results {
            ensure!(result == first, "duplicate submissions returned different results");
        }

        info!("{} concurrent duplicates resolved to one transaction", copies);
        Ok(())
    }

    /// Run the seeded random workload and return the invariant violations found.
    pub async fn run_random(&mut self, options: &WorkloadOptions) -> anyhow::Result<Vec<String>> {
        info!(
            accounts = options.accounts,
            concurrency = options.concurrency,
            transactions = options.transactions,
            seed = options.seed,
            "Running random workload"
        );
        ensure!(options.accounts >= 2, "random workload needs at least two accounts");
        ensure!(options.concurrency >= 1, "concurrency must be at least 1");

        for i in 0..options.accounts {
            self.bank
                .open_account(&format!("acct-{i}"), options.initial_balance)
                .await?;
        }
        let mut accounts = self.bank.account_ids();
        accounts.sort();
        let accounts = Arc::new(accounts);

        let outcomes: Outcomes = Arc::new(Mutex::new(HashMap::new()));
        let violations: Violations = Arc::new(Mutex::new(Vec::new()));
        let per_worker = options.transactions.div_ceil(options.concurrency);

        let workers = (0..options.concurrency).map(|index| {
            let worker = Worker {
                index,
                engine: self.bank.engine().clone(),
                accounts: accounts.clone(),
                prefix: self.bank.key(&format!("w{index}")),
                rng: StdRng::seed_from_u64(options.seed.wrapping_add(index as u64)),
                options: options.clone(),
                outcomes: outcomes.clone(),
                violations: violations.clone(),
                metrics: self.metrics.clone(),
                applied: Vec::new(),
            };
            tokio::spawn(worker.run(per_worker))
        });

        for joined in join_all(workers).await {
            joined?;
        }

        let mut found = std::mem::take(&mut *violations.lock().await);
        let outcomes = outcomes.lock().await;
        found.extend(self.check_invariants(options, &accounts, &outcomes).await?);
        Ok(found)
    }

    async fn check_invariants(
        &self,
        options: &WorkloadOptions,
        accounts: &[AccountId],
        outcomes: &HashMap<TransactionId, TransactionResult>,
    ) -> anyhow::Result<Vec<String>> {
        let engine = self.bank.engine();
        let mut violations = Vec::new();

        let mut expected = i128::from(options.initial_balance) * accounts.len() as i128;
        for result in outcomes.values().filter(|r| r.is_applied()) {
            let amount = i128::from(result.transaction.amount.minor());
            match result.transaction.kind {
                TransactionKind::Deposit => expected += amount,
                TransactionKind::Withdrawal => expected -= amount,
                TransactionKind::Transfer => {
                    let entries = engine.journal_entries(&result.transaction.id).await?;
                    let net: i128 = entries.iter().map(|e| e.signed_amount()).sum();
                    if entries.len() != 2 || net != 0 {
                        violations.push(format!(
                            "transfer {} has unbalanced journal ({} entries, net {})",
                            result.transaction.id,
                            entries.len(),
                            net
                        ));
                    }
                }
            }
        }

        let mut actual: i128 = 0;
        for id in accounts {
            let balance = engine.get_account_balance(id).await?;
            actual += i128::from(balance.balance.minor());
            if balance.balance.minor() < -balance.overdraft_limit.minor() {
                violations.push(format!(
                    "account {} balance {} is below its overdraft limit {}",
                    id, balance.balance, balance.overdraft_limit
                ));
            }
        }

        if actual != expected {
            violations.push(format!(
                "sum of balances is {actual}, expected {expected} from deposits minus withdrawals"
            ));
        }

        info!(
            transactions = outcomes.len(),
            total_balance = %actual,
            "Invariant check complete"
        );
        Ok(violations)
    }

    /// Get simulation metrics.
    pub async fn get_metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }
}

/// One concurrent client of the random workload.
struct Worker {
    index: usize,
    engine: Arc<LedgerEngine>,
    accounts: Arc<Vec<AccountId>>,
    prefix: TransactionId,
    rng: StdRng,
    options: WorkloadOptions,
    outcomes: Outcomes,
    violations: Violations,
    metrics: Arc<RwLock<SimulationMetrics>>,
    /// Keys this worker applied and may later reverse.
    applied: Vec<TransactionId>,
}

impl Worker {
    async fn run(mut self, count: usize) {
        for n in 0..count {
            if !self.applied.is_empty() && self.rng.gen_bool(self.options.reversal_rate) {
                let pick = self.rng.gen_range(0..self.applied.len());
                let original = self.applied.swap_remove(pick);
                self.reverse(&original).await;
            } else {
                let request = self.random_request(n);
                self.submit(request).await;
            }
        }
        debug!(worker = self.index, "Worker finished");
    }

    fn random_request(&mut self, n: usize) -> TransactionRequest {
        let key = TransactionId::new(format!("{}-{n}", self.prefix));
        let max = (self.options.initial_balance / 4).max(1);
        let amount = Amount::from_minor(self.rng.gen_range(1..=max));
        let from = self.accounts[self.rng.gen_range(0..self.accounts.len())];

        match self.rng.gen_range(0..10) {
            0..=1 => TransactionRequest::deposit(key, from, amount),
            2..=3 => TransactionRequest::withdrawal(key, from, amount),
            _ => {
                let mut to = from;
                while to == from {
                    to = self.accounts[self.rng.gen_range(0..self.accounts.len())];
                }
                TransactionRequest::transfer(key, from, to, amount)
            }
        }
    }

    async fn submit(&mut self, request: TransactionRequest) {
        let started = Instant::now();
        let outcome = settle(&self.engine, request.clone()).await;

        let first = match outcome {
            Ok(result) => result,
            Err(err) => return self.on_error(err).await,
        };
        self.metrics.write().await.record_outcome(
            first.is_applied(),
            false,
            started.elapsed().as_micros() as u64,
        );
        if first.is_applied() {
            self.applied.push(first.transaction.id.clone());
        }

        if self.rng.gen_bool(self.options.duplicate_rate) {
            self.metrics.write().await.record_duplicate();
            match settle(&self.engine, request).await {
                Ok(again) if same_outcome(&first, &again) => {}
                Ok(again) => {
                    self.violate(format!(
                        "duplicate of {} returned a different result: {:?} vs {:?}",
                        first.transaction.id, first.transaction.status, again.transaction.status
                    ))
                    .await
                }
                Err(err) => self.on_error(err).await,
            }
        }

        self.outcomes
            .lock()
            .await
            .insert(first.transaction.id.clone(), first);
    }

    async fn reverse(&mut self, original: &TransactionId) {
        let started = Instant::now();
        match settle_reversal(&self.engine, original).await {
            Ok(result) => {
                self.metrics.write().await.record_outcome(
                    result.is_applied(),
                    true,
                    started.elapsed().as_micros() as u64,
                );
                self.outcomes
                    .lock()
                    .await
                    .insert(result.transaction.id.clone(), result);
            }
            Err(err) => self.on_error(err).await,
        }
    }

    async fn on_error(&self, err: LedgerError) {
        self.metrics.write().await.record_error();
        if err.is_retryable() {
            warn!(worker = self.index, error = %err, "Gave up after repeated transient errors");
        } else {
            self.violate(format!("unexpected error for a well-formed request: {err}"))
                .await;
        }
    }

    async fn violate(&self, message: String) {
        warn!(worker = self.index, "{}", message);
        self.violations.lock().await.push(message);
    }
}

/// Replays are identical, except that the record may since have been reversed.
fn same_outcome(first: &TransactionResult, again: &TransactionResult) -> bool {
    let status_matches = first.transaction.status == again.transaction.status
        || matches!(
            (first.transaction.status, again.transaction.status),
            (TransactionStatus::Applied, TransactionStatus::Reversed)
        );

    status_matches
        && first.transaction.id == again.transaction.id
        && first.transaction.failure == again.transaction.failure
        && first.balances == again.balances
}

fn check_expectation(
    expect: &Expect,
    outcome: &Result<TransactionResult, LedgerError>,
) -> anyhow::Result<()> {
    match (expect, outcome) {
        (Expect::Applied, Ok(result)) if result.is_applied() => Ok(()),
        (Expect::Failed { code }, Ok(result))
            if result.transaction.failure.as_ref().map(|f| f.code()) == Some(code.as_str()) =>
        {
            Ok(())
        }
        (Expect::Error { code }, Err(err)) if err.error_code() == code.as_str() => Ok(()),
        (_, Ok(result)) => bail!(
            "expected {:?}, got {} {}",
            expect,
            result.transaction.status,
            result
                .transaction
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_default()
        ),
        (_, Err(err)) => bail!("expected {:?}, got error {}", expect, err),
    }
}
