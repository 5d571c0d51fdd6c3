//! PostgreSQL ledger store.
//!
//! Balance updates are compare-and-swaps on the `version` column, issued in
//! ascending account order inside one database transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use corebank_common::{
    now, AccountId, Amount, Currency, OwnerId, TransactionId, TransactionKind, TransactionStatus,
};

use crate::account::{Account, AccountStatus};
use crate::config::StoreConfig;
use crate::journal::{EntryType, JournalEntry};
use crate::store::{Claim, CommitBatch, LedgerStore, StoreError, StoreResult};
use crate::transaction::{FailureReason, Transaction};

const ACCOUNT_COLUMNS: &str =
    "id, owner, currency, balance, overdraft_limit, status, version, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, kind, amount, source, destination, currency, status, \
     failure, reversal_of, reversed_by, fingerprint, created_at, completed_at";

const JOURNAL_COLUMNS: &str = "id, transaction_id, account_id, entry_type, amount, currency, \
     balance_after, version_after, created_at";

/// Ledger store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect using `config.database_url`.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::Backend("database_url is not set".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await
            .map_err(map_sqlx)?;

        info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization_failure, deadlock_detected
            Some("40001") | Some("40P01") => StoreError::VersionConflict { account_id: None },
            _ => StoreError::Backend(err.to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn to_db_version(version: u64) -> StoreResult<i64> {
    i64::try_from(version).map_err(|_| StoreError::Backend(format!("version {version} out of range")))
}

fn from_db_version(version: i64) -> StoreResult<u64> {
    u64::try_from(version).map_err(|_| StoreError::Backend(format!("negative version {version}")))
}

fn corrupt(column: &str, value: &str) -> StoreError {
    StoreError::Backend(format!("unexpected {column} value: {value}"))
}

fn account_from_row(row: &PgRow) -> StoreResult<Account> {
    let status: String = row.try_get("status").map_err(map_sqlx)?;

    Ok(Account {
        id: AccountId::from_uuid(row.try_get("id").map_err(map_sqlx)?),
        owner: OwnerId::new(row.try_get::<String, _>("owner").map_err(map_sqlx)?),
        currency: Currency::new(row.try_get::<String, _>("currency").map_err(map_sqlx)?),
        balance: Amount::from_minor(row.try_get("balance").map_err(map_sqlx)?),
        overdraft_limit: Amount::from_minor(row.try_get("overdraft_limit").map_err(map_sqlx)?),
        status: AccountStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        version: from_db_version(row.try_get("version").map_err(map_sqlx)?)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
    })
}

fn transaction_from_row(row: &PgRow) -> StoreResult<Transaction> {
    let kind: String = row.try_get("kind").map_err(map_sqlx)?;
    let status: String = row.try_get("status").map_err(map_sqlx)?;
    let failure: Option<String> = row.try_get("failure").map_err(map_sqlx)?;
    let failure = failure
        .map(|json| serde_json::from_str::<FailureReason>(&json))
        .transpose()
        .map_err(|e| StoreError::Backend(format!("unreadable failure reason: {e}")))?;

    Ok(Transaction {
        id: TransactionId::new(row.try_get::<String, _>("id").map_err(map_sqlx)?),
        kind: TransactionKind::parse(&kind).ok_or_else(|| corrupt("kind", &kind))?,
        amount: Amount::from_minor(row.try_get("amount").map_err(map_sqlx)?),
        source: row
            .try_get::<Option<Uuid>, _>("source")
            .map_err(map_sqlx)?
            .map(AccountId::from_uuid),
        destination: row
            .try_get::<Option<Uuid>, _>("destination")
            .map_err(map_sqlx)?
            .map(AccountId::from_uuid),
        currency: row
            .try_get::<Option<String>, _>("currency")
            .map_err(map_sqlx)?
            .map(Currency::new),
        status: TransactionStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        failure,
        reversal_of: row
            .try_get::<Option<String>, _>("reversal_of")
            .map_err(map_sqlx)?
            .map(TransactionId::new),
        reversed_by: row
            .try_get::<Option<String>, _>("reversed_by")
            .map_err(map_sqlx)?
            .map(TransactionId::new),
        fingerprint: row.try_get("fingerprint").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        completed_at: row.try_get("completed_at").map_err(map_sqlx)?,
    })
}

fn journal_from_row(row: &PgRow) -> StoreResult<JournalEntry> {
    let entry_type: String = row.try_get("entry_type").map_err(map_sqlx)?;

    Ok(JournalEntry {
        id: row.try_get("id").map_err(map_sqlx)?,
        transaction_id: TransactionId::new(
            row.try_get::<String, _>("transaction_id").map_err(map_sqlx)?,
        ),
        account_id: AccountId::from_uuid(row.try_get("account_id").map_err(map_sqlx)?),
        entry_type: EntryType::parse(&entry_type)
            .ok_or_else(|| corrupt("entry_type", &entry_type))?,
        amount: Amount::from_minor(row.try_get("amount").map_err(map_sqlx)?),
        currency: Currency::new(row.try_get::<String, _>("currency").map_err(map_sqlx)?),
        balance_after: Amount::from_minor(row.try_get("balance_after").map_err(map_sqlx)?),
        version_after: from_db_version(row.try_get("version_after").map_err(map_sqlx)?)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
    })
}

fn failure_json(failure: &Option<FailureReason>) -> StoreResult<Option<String>> {
    failure
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Backend(e.to_string()))
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn insert_account(&self, account: &Account) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(account.id.as_uuid())
        .bind(account.owner.as_str())
        .bind(account.currency.code())
        .bind(account.balance.minor())
        .bind(account.overdraft_limit.minor())
        .bind(account.status.as_str())
        .bind(to_db_version(account.version)?)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::DuplicateAccount(account.id)),
            Err(err) => Err(map_sqlx(err)),
        }
    }

    async fn load_account(&self, id: &AccountId) -> StoreResult<Option<Account>> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn update_account_status(
        &self,
        id: &AccountId,
        expected_version: u64,
        status: AccountStatus,
    ) -> StoreResult<Account> {
        let row = sqlx::query(&format!(
            "UPDATE accounts SET status = $3, version = version + 1, updated_at = $4 \
             WHERE id = $1 AND version = $2 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(to_db_version(expected_version)?)
        .bind(status.as_str())
        .bind(now())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => account_from_row(&row),
            None if self.load_account(id).await?.is_some() => Err(StoreError::VersionConflict {
                account_id: Some(*id),
            }),
            None => Err(StoreError::AccountNotFound(*id)),
        }
    }

    async fn claim(&self, pending: &Transaction) -> StoreResult<Claim> {
        // A concurrent release can delete the record between the insert and
        // the read; go around again in that case.
        for _ in 0..3 {
            let inserted = sqlx::query(&format!(
                "INSERT INTO transactions ({TRANSACTION_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
                 ON CONFLICT (id) DO NOTHING"
            ))
            .bind(pending.id.as_str())
            .bind(pending.kind.as_str())
            .bind(pending.amount.minor())
            .bind(pending.source.map(|id| *id.as_uuid()))
            .bind(pending.destination.map(|id| *id.as_uuid()))
            .bind(pending.currency.as_ref().map(|c| c.code().to_string()))
            .bind(pending.status.as_str())
            .bind(failure_json(&pending.failure)?)
            .bind(pending.reversal_of.as_ref().map(|id| id.as_str().to_string()))
            .bind(pending.reversed_by.as_ref().map(|id| id.as_str().to_string()))
            .bind(pending.fingerprint.as_str())
            .bind(pending.created_at)
            .bind(pending.completed_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

            if inserted.rows_affected() == 1 {
                return Ok(Claim::Claimed);
            }

            if let Some(existing) = self.load_transaction(&pending.id).await? {
                return Ok(Claim::Existing(existing));
            }
            debug!(id = %pending.id, "Claim vanished between insert and read");
        }

        Err(StoreError::TransactionConflict {
            id: pending.id.clone(),
        })
    }

    async fn take_over(&self, stale: &Transaction, fresh: &Transaction) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE transactions SET created_at = $3 \
             WHERE id = $1 AND status = 'PENDING' AND created_at = $2",
        )
        .bind(stale.id.as_str())
        .bind(stale.created_at)
        .bind(fresh.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(&self, claim: &Transaction) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM transactions WHERE id = $1 AND status = 'PENDING' AND created_at = $2",
        )
        .bind(claim.id.as_str())
        .bind(claim.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_transaction(&self, id: &TransactionId) -> StoreResult<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn load_journal(&self, id: &TransactionId) -> StoreResult<Vec<JournalEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOURNAL_COLUMNS} FROM journal_entries \
             WHERE transaction_id = $1 ORDER BY account_id"
        ))
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(journal_from_row).collect()
    }

    async fn commit(&self, batch: CommitBatch) -> StoreResult<()> {
        let mut updates = batch.account_updates;
        updates.sort_by_key(|u| u.account_id);
        let transaction = batch.transaction;
        let updated_at: DateTime<Utc> = now();

        // Dropping `tx` without commit rolls everything back.
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        for update in &updates {
            let result = sqlx::query(
                "UPDATE accounts SET balance = $3, version = version + 1, updated_at = $4 \
                 WHERE id = $1 AND version = $2",
            )
            .bind(update.account_id.as_uuid())
            .bind(to_db_version(update.expected_version)?)
            .bind(update.new_balance.minor())
            .bind(updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::VersionConflict {
                    account_id: Some(update.account_id),
                });
            }
        }

        let result = sqlx::query(
            "UPDATE transactions SET status = $2, currency = $3, failure = $4, completed_at = $5 \
             WHERE id = $1 AND status = 'PENDING' AND created_at = $6",
        )
        .bind(transaction.id.as_str())
        .bind(transaction.status.as_str())
        .bind(transaction.currency.as_ref().map(|c| c.code().to_string()))
        .bind(failure_json(&transaction.failure)?)
        .bind(transaction.completed_at)
        .bind(transaction.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TransactionConflict {
                id: transaction.id.clone(),
            });
        }

        if let (None, Some(original)) = (&batch.reverses, &transaction.reversal_of) {
            let applied = sqlx::query(
                "SELECT 1 FROM transactions WHERE id = $1 AND status = 'APPLIED' FOR SHARE",
            )
            .bind(original.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            if applied.is_none() {
                return Err(StoreError::TransactionConflict {
                    id: original.clone(),
                });
            }
        }

        if let Some(original) = &batch.reverses {
            let result = sqlx::query(
                "UPDATE transactions SET status = 'REVERSED', reversed_by = $2 \
                 WHERE id = $1 AND status = 'APPLIED'",
            )
            .bind(original.as_str())
            .bind(transaction.id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::TransactionConflict {
                    id: original.clone(),
                });
            }
        }

        for entry in &batch.journal {
            sqlx::query(&format!(
                "INSERT INTO journal_entries ({JOURNAL_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            ))
            .bind(entry.id)
            .bind(entry.transaction_id.as_str())
            .bind(entry.account_id.as_uuid())
            .bind(entry.entry_type.as_str())
            .bind(entry.amount.minor())
            .bind(entry.currency.code())
            .bind(entry.balance_after.minor())
            .bind(to_db_version(entry.version_after)?)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }
}

/// Connect and migrate, retrying while the database is starting up.
pub async fn connect_with_retry(config: &StoreConfig, attempts: u32) -> StoreResult<PgStore> {
    let mut last_err = StoreError::Unavailable("no connection attempt made".to_string());

    for attempt in 1..=attempts.max(1) {
        match PgStore::connect(config).await {
            Ok(store) => {
                store.migrate().await?;
                return Ok(store);
            }
            Err(err @ StoreError::Unavailable(_)) => {
                debug!(attempt, error = %err, "Database not reachable yet");
                last_err = err;
                tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err)
}
