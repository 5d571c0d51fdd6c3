//! Simulation scenarios.

use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// Transaction kind as written in scenarios.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Kind {
    Deposit,
    Withdrawal,
    Transfer,
}

/// What a step expects back from the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expect {
    /// The transaction is applied.
    Applied,
    /// The transaction is recorded as FAILED with this reason code.
    Failed { code: String },
    /// The call returns an error with this error code.
    Error { code: String },
}

/// A step in a scenario. Accounts are referred to by scenario-local names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Open an account funded with `balance` minor units.
    OpenAccount { name: String, balance: i64 },
    /// Submit a transaction.
    Submit {
        key: String,
        kind: Kind,
        from: Option<String>,
        to: Option<String>,
        amount: i64,
        expect: Expect,
    },
    /// Reverse a transaction by key.
    Reverse { key: String, expect: Expect },
    /// Freeze an account.
    Freeze { account: String },
    /// Unfreeze an account.
    Unfreeze { account: String },
    /// Close an account.
    Close { account: String },
    /// Take storage offline or bring it back.
    StorageOutage { offline: bool },
    /// Make the next commits lose their version race.
    InjectConflicts { count: u32 },
    /// Transfer `amount` in both directions between two accounts, `count`
    /// times each way, all at once.
    OppositeTransfers {
        first: String,
        second: String,
        count: usize,
        amount: i64,
    },
    /// Submit the same transfer `copies` times concurrently under one key.
    DuplicateStorm {
        key: String,
        from: String,
        to: String,
        amount: i64,
        copies: usize,
    },
    /// Assert an account balance.
    AssertBalance { account: String, amount: i64 },
}

impl Scenario {
    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "walkthrough" => Ok(Self::walkthrough()),
            "opposite-transfers" => Ok(Self::opposite_transfers()),
            "duplicate-storm" => Ok(Self::duplicate_storm()),
            "storage-outage" => Ok(Self::storage_outage()),
            "frozen-account" => Ok(Self::frozen_account()),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Names accepted by [`Scenario::load`].
    pub fn names() -> &'static [&'static str] {
        &[
            "walkthrough",
            "opposite-transfers",
            "duplicate-storm",
            "storage-outage",
            "frozen-account",
        ]
    }

    /// Whether the scenario injects faults, which only the in-memory store supports.
    pub fn needs_fault_hooks(&self) -> bool {
        self.steps.iter().any(|step| {
            matches!(
                step,
                ScenarioStep::StorageOutage { .. } | ScenarioStep::InjectConflicts { .. }
            )
        })
    }

    /// Transfer, replay, overdraw and reverse.
    fn walkthrough() -> Self {
        Self {
            name: "walkthrough".to_string(),
            description: "Transfer, idempotent replay, insufficient funds and reversal".to_string(),
            steps: vec![
                open("A", 1_000),
                open("B", 500),
                transfer("t1", "A", "B", 300, Expect::Applied),
                balance("A", 700),
                balance("B", 800),
                transfer("t1", "A", "B", 300, Expect::Applied),
                balance("A", 700),
                balance("B", 800),
                withdrawal("t2", "A", 5_000, failed("INSUFFICIENT_FUNDS")),
                balance("A", 700),
                ScenarioStep::Reverse {
                    key: "t1".to_string(),
                    expect: Expect::Applied,
                },
                balance("A", 1_000),
                balance("B", 500),
            ],
        }
    }

    /// Concurrent transfers in both directions on one account pair.
    fn opposite_transfers() -> Self {
        Self {
            name: "opposite-transfers".to_string(),
            description: "Concurrent A->B and B->A transfers complete without deadlock"
                .to_string(),
            steps: vec![
                open("A", 100_000),
                open("B", 100_000),
                ScenarioStep::OppositeTransfers {
                    first: "A".to_string(),
                    second: "B".to_string(),
                    count: 250,
                    amount: 40,
                },
                balance("A", 100_000),
                balance("B", 100_000),
            ],
        }
    }

    /// Many concurrent submissions of one key.
    fn duplicate_storm() -> Self {
        Self {
            name: "duplicate-storm".to_string(),
            description: "Concurrent duplicates of one transfer apply exactly once".to_string(),
            steps: vec![
                open("A", 10_000),
                open("B", 0),
                ScenarioStep::DuplicateStorm {
                    key: "storm".to_string(),
                    from: "A".to_string(),
                    to: "B".to_string(),
                    amount: 2_500,
                    copies: 64,
                },
                balance("A", 7_500),
                balance("B", 2_500),
                transfer("storm", "A", "B", 2_500, Expect::Applied),
                balance("A", 7_500),
            ],
        }
    }

    /// Storage outage and exhausted retries, followed by safe resubmission.
    fn storage_outage() -> Self {
        Self {
            name: "storage-outage".to_string(),
            description: "Transient failures surface as retryable errors and resubmits succeed"
                .to_string(),
            steps: vec![
                open("A", 1_000),
                ScenarioStep::StorageOutage { offline: true },
                withdrawal("w1", "A", 100, error("STORAGE_UNAVAILABLE")),
                ScenarioStep::StorageOutage { offline: false },
                withdrawal("w1", "A", 100, Expect::Applied),
                balance("A", 900),
                ScenarioStep::InjectConflicts { count: 2 },
                deposit("d1", "A", 50, Expect::Applied),
                balance("A", 950),
                ScenarioStep::InjectConflicts { count: 5 },
                deposit("d2", "A", 50, error("CONTENTION")),
                balance("A", 950),
                deposit("d2", "A", 50, Expect::Applied),
                balance("A", 1_000),
            ],
        }
    }

    /// Frozen and closed accounts reject transactions.
    fn frozen_account() -> Self {
        Self {
            name: "frozen-account".to_string(),
            description: "Frozen and closed accounts reject money movement".to_string(),
            steps: vec![
                open("A", 1_000),
                open("B", 0),
                ScenarioStep::Freeze {
                    account: "B".to_string(),
                },
                transfer("t1", "A", "B", 100, failed("ACCOUNT_NOT_ACTIVE")),
                balance("A", 1_000),
                ScenarioStep::Unfreeze {
                    account: "B".to_string(),
                },
                transfer("t2", "A", "B", 100, Expect::Applied),
                transfer("t3", "B", "A", 100, Expect::Applied),
                ScenarioStep::Close {
                    account: "B".to_string(),
                },
                deposit("d1", "B", 10, failed("ACCOUNT_NOT_ACTIVE")),
                balance("A", 1_000),
                balance("B", 0),
            ],
        }
    }
}

fn open(name: &str, balance: i64) -> ScenarioStep {
    ScenarioStep::OpenAccount {
        name: name.to_string(),
        balance,
    }
}

fn balance(account: &str, amount: i64) -> ScenarioStep {
    ScenarioStep::AssertBalance {
        account: account.to_string(),
        amount,
    }
}

fn failed(code: &str) -> Expect {
    Expect::Failed {
        code: code.to_string(),
    }
}

fn error(code: &str) -> Expect {
    Expect::Error {
        code: code.to_string(),
    }
}

fn deposit(key: &str, to: &str, amount: i64, expect: Expect) -> ScenarioStep {
    ScenarioStep::Submit {
        key: key.to_string(),
        kind: Kind::Deposit,
        from: None,
        to: Some(to.to_string()),
        amount,
        expect,
    }
}

fn withdrawal(key: &str, from: &str, amount: i64, expect: Expect) -> ScenarioStep {
    ScenarioStep::Submit {
        key: key.to_string(),
        kind: Kind::Withdrawal,
        from: Some(from.to_string()),
        to: None,
        amount,
        expect,
    }
}

fn transfer(key: &str, from: &str, to: &str, amount: i64, expect: Expect) -> ScenarioStep {
    ScenarioStep::Submit {
        key: key.to_string(),
        kind: Kind::Transfer,
        from: Some(from.to_string()),
        to: Some(to.to_string()),
        amount,
        expect,
    }
}
