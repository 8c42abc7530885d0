//! Error types for the EFD helpers

use thiserror::Error;

/// Result type alias for EFD helper operations
pub type Result<T> = std::result::Result<T, EfdError>;

/// Errors raised while interpreting raw ledger text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EfdError {
    #[error("Invalid amount: {0:?}")]
    InvalidAmount(String),

    #[error("Invalid date (expected DDMMYYYY): {0:?}")]
    InvalidDate(String),

    #[error("Invalid document number: {0:?}")]
    InvalidDocument(String),
}
