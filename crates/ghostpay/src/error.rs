use thiserror::Error;

use crate::invoice::InvoiceStatus;

/// Errors returned by settlement engine operations.
#[derive(Debug, Error)]
pub enum GhostpayError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("chain error: {0}")]
    TransientChain(String),

    #[error("transaction {tx} not mined within {timeout_secs}s")]
    ReceiptTimeout { tx: String, timeout_secs: u64 },

    #[error("transaction {0} reverted")]
    Reverted(String),

    #[error("settlement error: {0}")]
    Settlement(String),

    #[error("invoice {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: InvoiceStatus,
        to: InvoiceStatus,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GhostpayError {
    /// Stable machine-readable code for structured error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_input",
            Self::Configuration(_) => "configuration_error",
            Self::TransientChain(_) => "chain_unavailable",
            Self::ReceiptTimeout { .. } => "receipt_timeout",
            Self::Reverted(_) => "transaction_reverted",
            Self::Settlement(_) => "settlement_error",
            Self::InvalidTransition { .. } => "invalid_state",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Database(_) | Self::Serialization(_) => "internal_error",
        }
    }

    /// Whether the failure is expected to clear by itself on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientChain(_) | Self::ReceiptTimeout { .. } | Self::Settlement(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GhostpayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_and_revoked_credentials_share_one_shape() {
        let err = GhostpayError::Unauthorized;
        assert_eq!(err.code(), "unauthorized");
        assert_eq!(err.to_string(), "unauthorized");
    }

    #[test]
    fn receipt_timeout_is_transient() {
        let err = GhostpayError::ReceiptTimeout {
            tx: "0xabc".to_string(),
            timeout_secs: 120,
        };
        assert!(err.is_transient());
        assert!(!GhostpayError::Configuration("missing seed".into()).is_transient());
    }
}
