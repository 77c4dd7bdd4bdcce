//! Error taxonomy for the simulation core.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by the repository, position manager and engine.
#[derive(Error, Debug)]
pub enum SimError {
    #[error("Insufficient balance: margin {required} exceeds balance {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("Invalid close ratio {0}: must be within (0, 1)")]
    InvalidRatio(Decimal),

    #[error("No price available for {0}")]
    PriceUnavailable(String),

    #[error("Position {0} is not open")]
    PositionNotOpen(String),

    #[error("Trader not found: {0}")]
    TraderNotFound(String),

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl SimError {
    /// Recoverable per-trader or per-symbol conditions that should not abort a loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SimError::InsufficientBalance { .. }
                | SimError::PriceUnavailable(_)
                | SimError::PositionNotOpen(_)
        )
    }
}

pub type SimResult<T> = std::result::Result<T, SimError>;
