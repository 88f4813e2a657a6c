use thiserror::Error;

use crate::chain::ChainViolation;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Canonical encoding failed. Intake guarantees this cannot happen for
    /// transactions built through `Transaction::new`.
    #[error("canonical serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("field `{0}` is not a finite number")]
    NonFiniteField(String),

    #[error("chain failed verification: {0}")]
    InvalidChain(#[from] ChainViolation),
}
