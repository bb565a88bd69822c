use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{Instrument, PositionId, WatchKind};

/// Configuration-related errors with structured variants.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

/// Watcher registry misuse. Recoverable: callers log and continue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("already watching {kind} for position {position} on {instrument}")]
    AlreadyWatching {
        instrument: Instrument,
        position: PositionId,
        kind: WatchKind,
    },

    #[error("not watching {kind} for position {position} on {instrument}")]
    NotWatching {
        instrument: Instrument,
        position: PositionId,
        kind: WatchKind,
    },

    #[error("position {position} is not tracked for margin")]
    NotTracked { position: PositionId },
}

/// Position store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("position {0} not found")]
    NotFound(PositionId),

    #[error("position {0} is already closed")]
    AlreadyClosed(PositionId),

    #[error("position {0} already exists")]
    DuplicateId(PositionId),
}

/// Payment leg rejections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("no account for user {0}")]
    UnknownUser(String),

    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error("insufficient funds on {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: String,
        balance: Decimal,
        requested: Decimal,
    },

    #[error("transfer amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error("operation canceled")]
    Canceled,

    #[error("{service} unavailable: {reason}")]
    Upstream {
        service: &'static str,
        reason: String,
    },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("no price available for {0}")]
    MissingPrice(Instrument),

    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("threshold must be positive, got {0}")]
    InvalidThreshold(Decimal),

    #[error("{0} exceeds the decimal range")]
    Overflow(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build an upstream failure for the named collaborator.
    pub fn upstream(service: &'static str, reason: impl Into<String>) -> Self {
        Self::Upstream {
            service,
            reason: reason.into(),
        }
    }

    /// True for the shutdown signal. Never logged as a failure.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// True when the failure came from a collaborator and the enclosing loop
    /// should retry with backoff.
    #[must_use]
    pub const fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::Upstream { .. } | Self::Timeout { .. } | Self::Payment(_) | Self::MissingPrice(_)
        )
    }

    /// True for the benign close race.
    #[must_use]
    pub const fn is_already_closed(&self) -> bool {
        matches!(self, Self::Store(StoreError::AlreadyClosed(_)))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
