// src/error.rs
use thiserror::Error;
use uuid::Uuid;

/// Closed failure taxonomy for the coordinator. Every operation boundary
/// returns one of these; errors are never thrown across task boundaries.
#[derive(Error, Debug, Clone)]
pub enum MixerError {
    #[error("validation failed: {0}")]
    InputValidation(String),

    #[error("request rejected by policy: {0}")]
    PolicyRejection(String),

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("pool liquidity shortage for {currency}: requested {requested}")]
    PoolShortage { currency: String, requested: f64 },

    #[error("key image already spent: {0}")]
    DoubleSpend(String),

    #[error("protocol violation by {participant}: {reason}")]
    ProtocolViolation { participant: String, reason: String },

    #[error("{entity} timed out: {reason}")]
    Timeout { entity: String, reason: String },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("mix request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("wallet not found: {0}")]
    WalletNotFound(Uuid),

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("session is full")]
    SessionFull,

    #[error("participant {0} is banned")]
    Banned(String),

    #[error("operation not valid in phase {0}")]
    WrongPhase(String),

    #[error("no standard denomination matches amount {amount} for {currency}")]
    NoMatchingDenomination { currency: String, amount: f64 },

    #[error("invalid state transition {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("crypto operation failed: {0}")]
    Crypto(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("chain client error: {0}")]
    Chain(String),

    #[error("invalid address {address} for {currency}")]
    InvalidAddress { currency: String, address: String },

    #[error("invalid derivation path: {0}")]
    InvalidDerivationPath(String),

    #[error("amount {amount} outside limits [{min}, {max}] for {currency}")]
    AmountOutOfRange {
        currency: String,
        amount: f64,
        min: f64,
        max: f64,
    },

    #[error("health check failed: {0}")]
    HealthCheck(String),
}

/// The coarse kind an error maps onto. Drives retry and surfacing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputValidation,
    PolicyRejection,
    InsufficientFunds,
    DoubleSpend,
    ProtocolViolation,
    Timeout,
    Transient,
    Fatal,
}

impl MixerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MixerError::InputValidation(_)
            | MixerError::InvalidAddress { .. }
            | MixerError::InvalidDerivationPath(_)
            | MixerError::AmountOutOfRange { .. }
            | MixerError::NoMatchingDenomination { .. } => ErrorKind::InputValidation,

            MixerError::PolicyRejection(_) | MixerError::Banned(_) => ErrorKind::PolicyRejection,

            MixerError::InsufficientFunds { .. } | MixerError::PoolShortage { .. } => {
                ErrorKind::InsufficientFunds
            }

            MixerError::DoubleSpend(_) => ErrorKind::DoubleSpend,

            MixerError::ProtocolViolation { .. }
            | MixerError::WrongPhase(_)
            | MixerError::SessionFull => ErrorKind::ProtocolViolation,

            MixerError::Timeout { .. } => ErrorKind::Timeout,

            MixerError::Transient(_)
            | MixerError::Repository(_)
            | MixerError::Chain(_) => ErrorKind::Transient,

            MixerError::Fatal(_)
            | MixerError::InvalidStateTransition { .. }
            | MixerError::Crypto(_)
            | MixerError::EncryptionFailed(_)
            | MixerError::DecryptionFailed(_)
            | MixerError::NotFound(_)
            | MixerError::RequestNotFound(_)
            | MixerError::WalletNotFound(_)
            | MixerError::SessionNotFound(_)
            | MixerError::HealthCheck(_) => ErrorKind::Fatal,
        }
    }

    /// Only transient failures participate in the retry budget.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Pool shortages are retried by the engine with backoff; user-side
    /// shortages are surfaced to the caller.
    pub fn is_pool_shortage(&self) -> bool {
        matches!(self, MixerError::PoolShortage { .. })
    }
}

pub type MixerResult<T> = Result<T, MixerError>;
