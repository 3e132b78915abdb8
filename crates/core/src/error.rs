//! Errors raised by pure domain checks.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic rule failures: bad input, illegal state changes and
/// unparseable identifiers. Storage and transport failures have their own
/// error types in the layers that own them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input rejected before any state change (empty order, zero count).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A rule of the order lifecycle would be broken.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_detail() {
        assert_eq!(
            DomainError::validation("order must contain at least one item").to_string(),
            "validation failed: order must contain at least one item"
        );
        assert_eq!(
            DomainError::invalid_id("Sku: must be positive").to_string(),
            "invalid identifier: Sku: must be positive"
        );
    }
}
