use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Wallet entity - one per user, the balance side of the ledger.
///
/// Key design decisions:
/// - `balance` is Decimal (never f64!) - prevents floating point errors
/// - `version` enables optimistic locking - prevents lost updates
/// - `pending_withdrawals` tracks holds: available = balance - pending_withdrawals
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub user_id: String,
    pub balance: Decimal,
    pub pending_withdrawals: Decimal,
    pub status: WalletStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Balance minus amounts already committed to pending withdrawals.
    pub fn available_balance(&self) -> Decimal {
        self.balance - self.pending_withdrawals
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Active,
    Frozen,
}

impl std::fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletStatus::Active => write!(f, "active"),
            WalletStatus::Frozen => write!(f, "frozen"),
        }
    }
}

/// Immutable ledger entry - the source of truth for all money movements.
///
/// `previous_balance`/`new_balance` are snapshots taken when the posting
/// takes effect: at creation for completed postings, at settlement for
/// pending holds. Rows never change after creation except for the single
/// pending -> completed/failed transition.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: String,
    pub wallet_id: String,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    TripEarning,
    PlatformFee,
    Withdrawal,
    Refund,
    Adjustment,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::TripEarning => write!(f, "trip_earning"),
            TransactionType::PlatformFee => write!(f, "platform_fee"),
            TransactionType::Withdrawal => write!(f, "withdrawal"),
            TransactionType::Refund => write!(f, "refund"),
            TransactionType::Adjustment => write!(f, "adjustment"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "pending"),
            TransactionStatus::Completed => write!(f, "completed"),
            TransactionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How the rider paid. Keys the gateway fee rate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    LocalCardOnline,
    LocalCardInPerson,
    InternationalOnline,
    InternationalInPerson,
    Amex,
    InstantEft,
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentMethod::LocalCardOnline => write!(f, "local_card_online"),
            PaymentMethod::LocalCardInPerson => write!(f, "local_card_in_person"),
            PaymentMethod::InternationalOnline => write!(f, "international_online"),
            PaymentMethod::InternationalInPerson => write!(f, "international_in_person"),
            PaymentMethod::Amex => write!(f, "amex"),
            PaymentMethod::InstantEft => write!(f, "instant_eft"),
        }
    }
}

/// How a payout batch or withdrawal is disbursed to the bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DisbursementMethod {
    Manual,
    Eft,
}

impl std::fmt::Display for DisbursementMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisbursementMethod::Manual => write!(f, "manual"),
            DisbursementMethod::Eft => write!(f, "eft"),
        }
    }
}

/// One per settled trip charge. Immutable once written.
///
/// total_amount == net_driver_amount + platform_amount
///               + payment_gateway_fee + road_levy, exactly.
/// policy_version pins the rate table the split was computed under.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentSplit {
    pub id: String,
    pub trip_reference: String,
    pub rider_wallet_id: Option<String>,
    pub total_amount: Decimal,
    pub payment_gateway_fee: Decimal,
    pub road_levy: Decimal,
    pub driver_percentage: i32,
    pub net_driver_amount: Decimal,
    pub platform_amount: Decimal,
    pub payment_method: PaymentMethod,
    pub policy_version: String,
    pub split_date: DateTime<Utc>,
}

/// Derived per-driver aggregate. Read-optimized, never authoritative.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DriverEarnings {
    pub user_id: String,
    pub available_balance: Decimal,
    pub pending_balance: Decimal,
    pub last_payout_date: Option<DateTime<Utc>>,
}

impl DriverEarnings {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            available_balance: Decimal::ZERO,
            pending_balance: Decimal::ZERO,
            last_payout_date: None,
        }
    }
}

/// User-initiated request to move available balance to a bank account.
/// Audit record: kept forever, terminal states reached exactly once.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: String,
    pub wallet_id: String,
    pub user_id: String,
    pub requested_amount: Decimal,
    pub processing_fee: Decimal,
    pub net_amount: Decimal,
    pub bank_detail_id: String,
    pub status: WithdrawalStatus,
    pub reference: String,
    pub reason: Option<String>,
    pub failure_reason: Option<String>,
    pub ledger_transaction_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WithdrawalStatus::Pending => write!(f, "pending"),
            WithdrawalStatus::Processing => write!(f, "processing"),
            WithdrawalStatus::Completed => write!(f, "completed"),
            WithdrawalStatus::Failed => write!(f, "failed"),
            WithdrawalStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Groups driver payouts for disbursement.
/// State machine: draft -> processing -> completed | failed.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PayoutBatch {
    pub id: String,
    pub batch_number: String,
    pub driver_count: i32,
    pub total_amount: Decimal,
    pub status: BatchStatus,
    pub payment_method: Option<DisbursementMethod>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Draft,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Draft => write!(f, "draft"),
            BatchStatus::Processing => write!(f, "processing"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One driver's (id, amount) entry within a batch, frozen at creation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PayoutItem {
    pub id: String,
    pub batch_id: String,
    pub user_id: String,
    pub wallet_id: String,
    pub bank_detail_id: String,
    pub amount: Decimal,
    pub status: PayoutItemStatus,
    pub failure_reason: Option<String>,
    pub channel_reference: Option<String>,
    pub ledger_transaction_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutItemStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for PayoutItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayoutItemStatus::Pending => write!(f, "pending"),
            PayoutItemStatus::Completed => write!(f, "completed"),
            PayoutItemStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A user's bank account for disbursement. Only verified accounts may
/// receive withdrawals or payouts.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserBankDetail {
    pub id: String,
    pub user_id: String,
    pub bank_name: String,
    pub account_type: String,
    pub account_holder: String,
    pub account_number: String,
    pub branch_code: String,
    pub is_default: bool,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

// === API Request/Response Models ===

#[derive(Debug, Deserialize)]
pub struct CreateWalletRequest {
    pub user_id: String,
}

/// Trip-completion webhook payload from the payment gateway.
#[derive(Debug, Deserialize)]
pub struct SettleTripRequest {
    pub trip_reference: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub gross_amount: Decimal,
    pub payment_method: PaymentMethod,
    pub driver_id: String,
    pub rider_wallet_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReversePostingRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateWithdrawalRequest {
    pub wallet_id: String,
    pub user_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub bank_detail_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessWithdrawalRequest {
    pub payment_method: DisbursementMethod,
}

#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    pub driver_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessBatchRequest {
    pub payment_method: DisbursementMethod,
}

#[derive(Debug, Deserialize)]
pub struct AddBankDetailRequest {
    pub user_id: String,
    pub bank_name: String,
    pub account_type: String,
    pub account_holder: String,
    pub account_number: String,
    pub branch_code: String,
    pub is_default: Option<bool>,
}

/// Generic API response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn error(message: String) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            message: Some(message),
        }
    }
}

/// Trip settlement outcome: the split plus the postings it produced.
/// `duplicate` is set when the trip had already been settled and no new
/// postings were made.
#[derive(Debug, Serialize)]
pub struct TripSettlementResponse {
    pub split: PaymentSplit,
    pub transactions: Vec<WalletTransaction>,
    pub duplicate: bool,
}

/// Batch with its per-item statuses. Partial success is visible here,
/// not just in the rolled-up batch status.
#[derive(Debug, Serialize)]
pub struct BatchDetailResponse {
    pub batch: PayoutBatch,
    pub items: Vec<PayoutItem>,
}
