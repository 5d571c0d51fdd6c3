//! Transaction requests, records and results.

use std::fmt;

use corebank_common::{
    now, AccountId, Amount, Currency, InvalidTransition, LedgerError, Result, Timestamp,
    TransactionId, TransactionKind, TransactionStatus,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::account::AccountStatus;
use crate::balance::PostedBalance;

/// A request to move money.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Client-supplied idempotency key; generated when absent.
    pub idempotency_key: Option<TransactionId>,
    /// Operation kind.
    pub kind: TransactionKind,
    /// Amount in minor units of the accounts' currency.
    pub amount: Amount,
    /// Debited account (withdrawal, transfer).
    pub source: Option<AccountId>,
    /// Credited account (deposit, transfer).
    pub destination: Option<AccountId>,
}

impl TransactionRequest {
    /// Deposit into `destination`.
    pub fn deposit(key: impl Into<TransactionId>, destination: AccountId, amount: Amount) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            kind: TransactionKind::Deposit,
            amount,
            source: None,
            destination: Some(destination),
        }
    }

    /// Withdraw from `source`.
    pub fn withdrawal(key: impl Into<TransactionId>, source: AccountId, amount: Amount) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            kind: TransactionKind::Withdrawal,
            amount,
            source: Some(source),
            destination: None,
        }
    }

    /// Transfer from `source` to `destination`.
    pub fn transfer(
        key: impl Into<TransactionId>,
        source: AccountId,
        destination: AccountId,
        amount: Amount,
    ) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            kind: TransactionKind::Transfer,
            amount,
            source: Some(source),
            destination: Some(destination),
        }
    }

    /// Let the engine generate the idempotency key.
    pub fn without_key(mut self) -> Self {
        self.idempotency_key = None;
        self
    }

    /// Check the request is well formed.
    pub fn validate(&self) -> Result<()> {
        if let Some(key) = &self.idempotency_key {
            if !key.is_valid() {
                return Err(LedgerError::invalid_field(
                    "idempotency_key",
                    format!(
                        "idempotency key must be 1-{} printable characters",
                        TransactionId::MAX_LEN
                    ),
                ));
            }
        }

        if !self.amount.is_positive() {
            return Err(LedgerError::invalid_field("amount", "amount must be positive"));
        }

        match (self.kind.has_source(), self.source) {
            (true, None) => {
                return Err(LedgerError::invalid_field(
                    "source",
                    format!("{} requires a source account", self.kind),
                ))
            }
            (false, Some(_)) => {
                return Err(LedgerError::invalid_field(
                    "source",
                    format!("{} does not take a source account", self.kind),
                ))
            }
            _ => {}
        }

        match (self.kind.has_destination(), self.destination) {
            (true, None) => {
                return Err(LedgerError::invalid_field(
                    "destination",
                    format!("{} requires a destination account", self.kind),
                ))
            }
            (false, Some(_)) => {
                return Err(LedgerError::invalid_field(
                    "destination",
                    format!("{} does not take a destination account", self.kind),
                ))
            }
            _ => {}
        }

        if self.source.is_some() && self.source == self.destination {
            return Err(LedgerError::invalid_field(
                "destination",
                "source and destination must be different",
            ));
        }

        Ok(())
    }
}

/// Why a transaction was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// A referenced account does not exist.
    UnknownAccount { account_id: AccountId },
    /// A referenced account is frozen or closed.
    AccountNotActive {
        account_id: AccountId,
        status: AccountStatus,
    },
    /// Transfer between accounts of different currencies.
    CurrencyMismatch {
        source: Currency,
        destination: Currency,
    },
    /// Debit exceeds balance plus overdraft limit.
    InsufficientFunds {
        account_id: AccountId,
        available: Amount,
        requested: Amount,
    },
    /// Credit would overflow the balance representation.
    BalanceOverflow { account_id: AccountId },
}

impl FailureReason {
    /// Stable code for transport layers.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::UnknownAccount { .. } => "UNKNOWN_ACCOUNT",
            FailureReason::AccountNotActive { .. } => "ACCOUNT_NOT_ACTIVE",
            FailureReason::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            FailureReason::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            FailureReason::BalanceOverflow { .. } => "BALANCE_OVERFLOW",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::UnknownAccount { account_id } => {
                write!(f, "unknown account {account_id}")
            }
            FailureReason::AccountNotActive { account_id, status } => {
                write!(f, "account {account_id} is {status}")
            }
            FailureReason::CurrencyMismatch {
                source,
                destination,
            } => write!(f, "currency mismatch: {source} -> {destination}"),
            FailureReason::InsufficientFunds {
                account_id,
                available,
                requested,
            } => write!(
                f,
                "insufficient funds in {account_id}: available {available}, requested {requested}"
            ),
            FailureReason::BalanceOverflow { account_id } => {
                write!(f, "balance overflow in {account_id}")
            }
        }
    }
}

/// A transaction record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction identifier (the idempotency key).
    pub id: TransactionId,
    /// Operation kind.
    pub kind: TransactionKind,
    /// Amount in minor units.
    pub amount: Amount,
    /// Debited account.
    pub source: Option<AccountId>,
    /// Credited account.
    pub destination: Option<AccountId>,
    /// Currency, resolved from the touched accounts.
    pub currency: Option<Currency>,
    /// Current status.
    pub status: TransactionStatus,
    /// Failure information (if failed).
    pub failure: Option<FailureReason>,
    /// Original transaction, when this record is a reversal.
    pub reversal_of: Option<TransactionId>,
    /// Reversal transaction, once this record has been reversed.
    pub reversed_by: Option<TransactionId>,
    /// Digest of the request, used to detect key reuse.
    pub fingerprint: String,
    /// When the key was claimed.
    pub created_at: Timestamp,
    /// When the outcome was committed.
    pub completed_at: Option<Timestamp>,
}

impl Transaction {
    /// Create a PENDING record for `request` under `id`.
    pub fn pending(
        id: TransactionId,
        request: &TransactionRequest,
        reversal_of: Option<TransactionId>,
    ) -> Self {
        let fingerprint = fingerprint(request, reversal_of.as_ref());
        Self {
            id,
            kind: request.kind,
            amount: request.amount,
            source: request.source,
            destination: request.destination,
            currency: None,
            status: TransactionStatus::Pending,
            failure: None,
            reversal_of,
            reversed_by: None,
            fingerprint,
            created_at: now(),
            completed_at: None,
        }
    }

    /// Fresh claim on the same key, used to take over an abandoned one.
    ///
    /// `created_at` identifies the owner of a PENDING record, so the copy
    /// gets a new one.
    pub fn reclaimed(&self) -> Self {
        Self {
            created_at: now(),
            ..self.clone()
        }
    }

    /// Whether `self` and `other` are the same claim on a key.
    pub fn same_claim(&self, other: &Transaction) -> bool {
        self.id == other.id && self.created_at == other.created_at
    }

    /// Transition to a new status.
    pub fn transition_to(
        &mut self,
        new_status: TransactionStatus,
    ) -> std::result::Result<(), InvalidTransition> {
        if !self.status.can_transition_to(new_status) {
            return Err(InvalidTransition {
                from: self.status,
                to: new_status,
            });
        }

        self.status = new_status;
        if matches!(new_status, TransactionStatus::Applied | TransactionStatus::Failed) {
            self.completed_at = Some(now());
        }

        Ok(())
    }

    /// Copy of this record marked APPLIED.
    pub fn to_applied(&self, currency: Currency) -> std::result::Result<Self, InvalidTransition> {
        let mut applied = self.clone();
        applied.transition_to(TransactionStatus::Applied)?;
        applied.currency = Some(currency);
        Ok(applied)
    }

    /// Copy of this record marked FAILED.
    pub fn to_failed(
        &self,
        reason: FailureReason,
        currency: Option<Currency>,
    ) -> std::result::Result<Self, InvalidTransition> {
        let mut failed = self.clone();
        failed.transition_to(TransactionStatus::Failed)?;
        failed.failure = Some(reason);
        failed.currency = currency;
        Ok(failed)
    }

    /// Whether this record undoes another transaction.
    pub fn is_reversal(&self) -> bool {
        self.reversal_of.is_some()
    }

    /// Request applying the inverse delta of this transaction.
    pub fn inverse_request(&self, key: TransactionId) -> TransactionRequest {
        let (source, destination) = match self.kind {
            TransactionKind::Deposit => (self.destination, None),
            TransactionKind::Withdrawal => (None, self.source),
            TransactionKind::Transfer => (self.destination, self.source),
        };

        TransactionRequest {
            idempotency_key: Some(key),
            kind: self.kind.inverse(),
            amount: self.amount,
            source,
            destination,
        }
    }
}

/// Digest of the fields that define a request's effect.
fn fingerprint(request: &TransactionRequest, reversal_of: Option<&TransactionId>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.kind.as_str().as_bytes());
    hasher.update(request.amount.minor().to_be_bytes());
    for account in [request.source, request.destination] {
        match account {
            Some(id) => hasher.update(id.as_uuid().as_bytes()),
            None => hasher.update([0u8; 16]),
        }
    }
    if let Some(original) = reversal_of {
        hasher.update(b"reversal:");
        hasher.update(original.as_str().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Outcome of `submit` or `reverse`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    /// The transaction record (APPLIED or FAILED, or REVERSED on replay).
    pub transaction: Transaction,
    /// Post-transaction balances of touched accounts, in ascending account
    /// order. Empty unless the transaction was applied.
    pub balances: Vec<PostedBalance>,
}

impl TransactionResult {
    /// Whether the balance deltas were committed.
    pub fn is_applied(&self) -> bool {
        matches!(
            self.transaction.status,
            TransactionStatus::Applied | TransactionStatus::Reversed
        )
    }

    /// Posted balance of `account_id`, if touched.
    pub fn balance_of(&self, account_id: &AccountId) -> Option<Amount> {
        self.balances
            .iter()
            .find(|b| &b.account_id == account_id)
            .map(|b| b.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        let a = AccountId::new();
        let b = AccountId::new();

        assert!(TransactionRequest::transfer("t1", a, b, Amount::from_minor(1)).validate().is_ok());
        assert!(TransactionRequest::deposit("t2", a, Amount::from_minor(1)).validate().is_ok());

        let zero = TransactionRequest::withdrawal("t3", a, Amount::ZERO).validate();
        assert!(matches!(zero, Err(LedgerError::InvalidRequest { field: Some(ref f), .. }) if f == "amount"));

        let to_self = TransactionRequest::transfer("t4", a, a, Amount::from_minor(5)).validate();
        assert!(to_self.is_err());

        let mut stray_source = TransactionRequest::deposit("t5", a, Amount::from_minor(5));
        stray_source.source = Some(b);
        assert!(stray_source.validate().is_err());

        let bad_key = TransactionRequest::deposit("", a, Amount::from_minor(5)).validate();
        assert!(bad_key.is_err());

        let generated = TransactionRequest::deposit("x", a, Amount::from_minor(5)).without_key();
        assert!(generated.validate().is_ok());
    }

    #[test]
    fn test_fingerprint_tracks_request_body() {
        let a = AccountId::new();
        let b = AccountId::new();

        let first = Transaction::pending(
            TransactionId::new("t1"),
            &TransactionRequest::transfer("t1", a, b, Amount::from_minor(300)),
            None,
        );
        let same = Transaction::pending(
            TransactionId::new("t1"),
            &TransactionRequest::transfer("t1", a, b, Amount::from_minor(300)),
            None,
        );
        let other = Transaction::pending(
            TransactionId::new("t1"),
            &TransactionRequest::transfer("t1", a, b, Amount::from_minor(301)),
            None,
        );

        assert_eq!(first.fingerprint, same.fingerprint);
        assert_ne!(first.fingerprint, other.fingerprint);
        assert_eq!(first.fingerprint.len(), 64);
    }

    #[test]
    fn test_status_changes() {
        let a = AccountId::new();
        let pending = Transaction::pending(
            TransactionId::new("t1"),
            &TransactionRequest::deposit("t1", a, Amount::from_minor(10)),
            None,
        );

        let applied = pending.to_applied(Currency::usd()).unwrap();
        assert_eq!(applied.status, TransactionStatus::Applied);
        assert!(applied.completed_at.is_some());
        assert!(applied.to_failed(FailureReason::UnknownAccount { account_id: a }, None).is_err());

        let failed = pending
            .to_failed(FailureReason::UnknownAccount { account_id: a }, None)
            .unwrap();
        assert_eq!(failed.failure.as_ref().map(FailureReason::code), Some("UNKNOWN_ACCOUNT"));
    }

    #[test]
    fn test_inverse_request_swaps_legs() {
        let a = AccountId::new();
        let b = AccountId::new();
        let original = Transaction::pending(
            TransactionId::new("t1"),
            &TransactionRequest::transfer("t1", a, b, Amount::from_minor(300)),
            None,
        );

        let inverse = original.inverse_request(TransactionId::reversal_of(&original.id));
        assert_eq!(inverse.kind, TransactionKind::Transfer);
        assert_eq!(inverse.source, Some(b));
        assert_eq!(inverse.destination, Some(a));
        assert!(inverse.validate().is_ok());

        let deposit = Transaction::pending(
            TransactionId::new("d1"),
            &TransactionRequest::deposit("d1", a, Amount::from_minor(50)),
            None,
        );
        let inverse = deposit.inverse_request(TransactionId::new("r1"));
        assert_eq!(inverse.kind, TransactionKind::Withdrawal);
        assert_eq!(inverse.source, Some(a));
        assert_eq!(inverse.destination, None);
    }

    #[test]
    fn test_failure_reason_serialization() {
        let reason = FailureReason::InsufficientFunds {
            account_id: AccountId::new(),
            available: Amount::from_minor(700),
            requested: Amount::from_minor(5_000),
        };
        let json = serde_json::to_string(&reason).unwrap();
        assert!(json.contains("\"code\":\"INSUFFICIENT_FUNDS\""));
        let back: FailureReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reason);
    }
}
