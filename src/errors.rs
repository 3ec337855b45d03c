use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

/// Application-level errors.
///
/// Monetary rejections carry the exact constraint violated (shortfall,
/// minimum, policy value) so callers can render a precise message.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Withdrawal request not found: {0}")]
    WithdrawalNotFound(String),

    #[error("Payout batch not found: {0}")]
    BatchNotFound(String),

    #[error("Bank detail not found: {0}")]
    BankDetailNotFound(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid settlement policy: {0}")]
    InvalidPolicy(String),

    #[error("Insufficient funds: short by {shortfall}, available {available}")]
    InsufficientFunds {
        shortfall: Decimal,
        available: Decimal,
    },

    #[error("Insufficient available balance: short by {shortfall}, available {available}")]
    InsufficientAvailableBalance {
        shortfall: Decimal,
        available: Decimal,
    },

    #[error("Amount {amount} is below the minimum withdrawal of {minimum}")]
    BelowMinimum { amount: Decimal, minimum: Decimal },

    #[error("Bank account {0} is not verified")]
    UnverifiedBankAccount(String),

    #[error("No drivers eligible for payout")]
    NoEligibleDrivers,

    #[error("Batch {0} has already been processed")]
    BatchAlreadyProcessed(String),

    #[error("Disbursement timed out after {0} seconds")]
    DisbursementTimeout(u64),

    #[error("Disbursement rejected: {0}")]
    DisbursementRejected(String),

    #[error("Wallet {0} is frozen")]
    WalletFrozen(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Concurrent update detected. Please retry.")]
    OptimisticLock,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Convert SettlementError to HTTP responses.
///
/// Validation failures are 4xx; infrastructure failures are 5xx with
/// details kept out of the response body.
impl IntoResponse for SettlementError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            SettlementError::WalletNotFound(_)
            | SettlementError::TransactionNotFound(_)
            | SettlementError::WithdrawalNotFound(_)
            | SettlementError::BatchNotFound(_)
            | SettlementError::BankDetailNotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }

            SettlementError::InvalidAmount(_)
            | SettlementError::InvalidPolicy(_)
            | SettlementError::InsufficientFunds { .. }
            | SettlementError::InsufficientAvailableBalance { .. }
            | SettlementError::BelowMinimum { .. }
            | SettlementError::UnverifiedBankAccount(_)
            | SettlementError::NoEligibleDrivers => (StatusCode::BAD_REQUEST, self.to_string()),

            SettlementError::BatchAlreadyProcessed(_)
            | SettlementError::WalletFrozen(_)
            | SettlementError::InvalidStateTransition(_)
            | SettlementError::OptimisticLock => (StatusCode::CONFLICT, self.to_string()),

            SettlementError::DisbursementTimeout(_) => {
                (StatusCode::GATEWAY_TIMEOUT, self.to_string())
            }

            SettlementError::DisbursementRejected(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }

            SettlementError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database operation failed".to_string(),
                )
            }

            SettlementError::Kafka(ref e) => {
                tracing::error!("Kafka error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Event publishing failed".to_string(),
                )
            }

            SettlementError::Internal(ref e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An unexpected error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "success": false,
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Helper type for Results in this application
pub type SettlementResult<T> = Result<T, SettlementError>;
