//! Error types for Strata.

use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in Strata operations.
#[derive(Debug, Error)]
pub enum StrataError {
    // Storage errors
    #[error("Tier not found: {address}")]
    TierNotFound { address: u64 },

    #[error("Tier corrupted: {address}, reason: {reason}")]
    TierCorrupted { address: u64, reason: String },

    // Tree errors
    #[error("Tree corrupted: {0}")]
    Corrupt(String),

    #[error("Remove retried {attempts} times without locating the predecessor leaf")]
    RetryExhausted { attempts: usize },

    // Configuration errors
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Builds an internal error from anything displayable.
    pub fn internal(message: impl Into<String>) -> Self {
        StrataError::Internal(message.into())
    }

    /// Returns true if this error reports a structural invariant violation.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StrataError::Corrupt(_) | StrataError::TierCorrupted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_not_found_display() {
        let err = StrataError::TierNotFound { address: 42 };
        assert_eq!(err.to_string(), "Tier not found: 42");
    }

    #[test]
    fn test_tier_corrupted_display() {
        let err = StrataError::TierCorrupted {
            address: 100,
            reason: "truncated branch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Tier corrupted: 100, reason: truncated branch"
        );
        assert!(err.is_corruption());
    }

    #[test]
    fn test_tree_errors_display() {
        let err = StrataError::Corrupt("pivot out of order".to_string());
        assert_eq!(err.to_string(), "Tree corrupted: pivot out of order");
        assert!(err.is_corruption());

        let err = StrataError::RetryExhausted { attempts: 3 };
        assert_eq!(
            err.to_string(),
            "Remove retried 3 times without locating the predecessor leaf"
        );
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_invalid_parameter_display() {
        let err = StrataError::InvalidParameter {
            name: "leaf_capacity".to_string(),
            value: "1".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid parameter: leaf_capacity = 1");
    }

    #[test]
    fn test_internal_error_display() {
        let err = StrataError::internal("level missing");
        assert_eq!(err.to_string(), "Internal error: level missing");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StrataError>();
    }
}
