//! Ledger configuration.

use std::time::Duration;

use corebank_common::{LedgerError, Result};

/// Engine retry and idempotency configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempts per submission before giving up with a contention error.
    pub max_attempts: u32,
    /// Base delay of the jittered exponential backoff between attempts.
    pub retry_backoff: Duration,
    /// Ceiling for a single backoff delay.
    pub max_backoff: Duration,
    /// How long a duplicate submission waits for a PENDING original.
    pub pending_wait: Duration,
    /// Poll interval while waiting for a PENDING original.
    pub pending_poll_interval: Duration,
    /// Age after which a PENDING claim is considered abandoned and may be
    /// taken over by a duplicate submission.
    pub claim_lease: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(50),
            pending_wait: Duration::from_secs(5),
            pending_poll_interval: Duration::from_millis(10),
            claim_lease: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(LedgerError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry_backoff > self.max_backoff {
            return Err(LedgerError::Configuration(
                "retry_backoff cannot exceed max_backoff".to_string(),
            ));
        }

        if self.pending_poll_interval.is_zero() {
            return Err(LedgerError::Configuration(
                "pending_poll_interval must be non-zero".to_string(),
            ));
        }

        if self.claim_lease.is_zero() {
            return Err(LedgerError::Configuration(
                "claim_lease must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// PostgreSQL URL. The in-memory store is used when absent.
    pub database_url: Option<String>,
    /// Maximum pool connections.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 16,
            acquire_timeout: Duration::from_secs(3),
        }
    }
}

/// Main ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Engine configuration.
    pub engine: EngineConfig,
    /// Storage configuration.
    pub store: StoreConfig,
    /// Log level.
    pub log_level: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(attempts) = std::env::var("LEDGER_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                config.engine.max_attempts = attempts;
            }
        }

        if let Ok(ms) = std::env::var("LEDGER_RETRY_BACKOFF_MS") {
            if let Ok(ms) = ms.parse() {
                config.engine.retry_backoff = Duration::from_millis(ms);
            }
        }

        if let Ok(ms) = std::env::var("LEDGER_PENDING_WAIT_MS") {
            if let Ok(ms) = ms.parse() {
                config.engine.pending_wait = Duration::from_millis(ms);
            }
        }

        if let Ok(ms) = std::env::var("LEDGER_CLAIM_LEASE_MS") {
            if let Ok(ms) = ms.parse() {
                config.engine.claim_lease = Duration::from_millis(ms);
            }
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                config.store.database_url = Some(url);
            }
        }

        if let Ok(max) = std::env::var("LEDGER_DB_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                config.store.max_connections = max;
            }
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        if self.store.max_connections == 0 {
            return Err(LedgerError::Configuration(
                "max_connections must be at least 1".to_string(),
            ));
        }

        if matches!(&self.store.database_url, Some(url) if !url.starts_with("postgres")) {
            return Err(LedgerError::Configuration(
                "database_url must be a postgres:// URL".to_string(),
            ));
        }

        Ok(())
    }
}
