use crate::bank_details::BankDetailRepository;
use crate::earnings::EarningsAggregator;
use crate::errors::SettlementResult;
use crate::kafka::{EventProducer, SettlementEvent};
use crate::ledger::LedgerRepository;
use crate::models::*;
use crate::payouts::PayoutProcessor;
use crate::policy::SettlementPolicy;
use crate::split::compute_split;
use crate::withdrawals::WithdrawalManager;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub ledger: LedgerRepository,
    pub earnings: EarningsAggregator,
    pub withdrawals: WithdrawalManager,
    pub payouts: PayoutProcessor,
    pub bank_details: BankDetailRepository,
    pub policy: SettlementPolicy,
    pub producer: Arc<EventProducer>,
}

/// Events are informational; the ledger commit has already happened.
/// A publish failure is logged and never surfaced to the caller.
async fn publish_best_effort(state: &AppState, event: SettlementEvent) {
    if let Err(e) = state.producer.publish(event).await {
        tracing::warn!(
            error = %e,
            "Event publish failed; committed state is unaffected"
        );
    }
}

// === Wallets ===

pub async fn create_wallet(
    State(state): State<AppState>,
    Json(payload): Json<CreateWalletRequest>,
) -> SettlementResult<Json<ApiResponse<Wallet>>> {
    tracing::info!(user_id = %payload.user_id, "Creating wallet");
    let wallet = state.ledger.create_wallet(&payload.user_id).await?;
    Ok(Json(ApiResponse::success(wallet)))
}

pub async fn get_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<Wallet>>> {
    let wallet = state.ledger.find_by_id(&wallet_id).await?;
    Ok(Json(ApiResponse::success(wallet)))
}

pub async fn get_user_wallets(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<Vec<Wallet>>>> {
    let wallets = state.ledger.find_by_user_id(&user_id).await?;
    Ok(Json(ApiResponse::success(wallets)))
}

pub async fn get_wallet_transactions(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<Vec<WalletTransaction>>>> {
    let transactions = state.ledger.list_transactions(&wallet_id).await?;
    Ok(Json(ApiResponse::success(transactions)))
}

pub async fn freeze_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<Wallet>>> {
    tracing::info!(wallet_id = %wallet_id, "Freezing wallet");
    let wallet = state
        .ledger
        .set_wallet_status(&wallet_id, WalletStatus::Frozen)
        .await?;
    Ok(Json(ApiResponse::success(wallet)))
}

pub async fn unfreeze_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<Wallet>>> {
    tracing::info!(wallet_id = %wallet_id, "Unfreezing wallet");
    let wallet = state
        .ledger
        .set_wallet_status(&wallet_id, WalletStatus::Active)
        .await?;
    Ok(Json(ApiResponse::success(wallet)))
}

// === Trip settlement ===

/// Trip-completion webhook: split the gross charge and post the driver
/// and platform credits. Redelivery of the same trip_reference returns
/// the recorded settlement without new postings.
pub async fn settle_trip(
    State(state): State<AppState>,
    Json(payload): Json<SettleTripRequest>,
) -> SettlementResult<Json<ApiResponse<TripSettlementResponse>>> {
    tracing::info!(
        trip_reference = %payload.trip_reference,
        gross_amount = %payload.gross_amount,
        payment_method = %payload.payment_method,
        driver_id = %payload.driver_id,
        "Settling trip charge"
    );

    let split = compute_split(
        &payload.trip_reference,
        payload.gross_amount,
        payload.payment_method,
        payload.rider_wallet_id.as_deref(),
        &state.policy,
    )?;

    let settlement = state.ledger.settle_trip(&split, &payload.driver_id).await?;

    for transaction in &settlement.transactions {
        state.earnings.apply_transaction(transaction).await?;
    }

    if settlement.duplicate {
        tracing::info!(
            trip_reference = %payload.trip_reference,
            "Trip already settled; returning recorded split"
        );
    } else if let Some(earning) = settlement.transactions.first() {
        publish_best_effort(
            &state,
            SettlementEvent::TripSettled {
                trip_reference: payload.trip_reference.clone(),
                driver_wallet_id: earning.wallet_id.clone(),
                driver_user_id: payload.driver_id.clone(),
                net_driver_amount: settlement.split.net_driver_amount,
                transaction_id: earning.id.clone(),
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    Ok(Json(ApiResponse::success(settlement)))
}

/// Compensate a completed posting. The original is never touched.
pub async fn reverse_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
    Json(payload): Json<ReversePostingRequest>,
) -> SettlementResult<Json<ApiResponse<WalletTransaction>>> {
    tracing::info!(
        transaction_id = %transaction_id,
        reason = %payload.reason,
        "Reversing posting"
    );

    let reversal = state
        .ledger
        .reverse_posting(&transaction_id, &payload.reason)
        .await?;
    state.earnings.apply_transaction(&reversal).await?;

    publish_best_effort(
        &state,
        SettlementEvent::PostingReversed {
            original_transaction_id: transaction_id,
            reversal_transaction_id: reversal.id.clone(),
            wallet_id: reversal.wallet_id.clone(),
            amount: reversal.amount,
            timestamp: Utc::now(),
        },
    )
    .await;

    Ok(Json(ApiResponse::success(reversal)))
}

// === Driver earnings ===

pub async fn get_driver_earnings(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<DriverEarnings>>> {
    let earnings = state.earnings.get_earnings(&user_id).await?;
    Ok(Json(ApiResponse::success(earnings)))
}

pub async fn rebuild_driver_earnings(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<DriverEarnings>>> {
    tracing::info!(user_id = %user_id, "Rebuilding earnings projection");
    let earnings = state.earnings.rebuild(&user_id).await?;
    Ok(Json(ApiResponse::success(earnings)))
}

// === Bank details ===

pub async fn add_bank_detail(
    State(state): State<AppState>,
    Json(payload): Json<AddBankDetailRequest>,
) -> SettlementResult<Json<ApiResponse<UserBankDetail>>> {
    let detail = state
        .bank_details
        .add(
            &payload.user_id,
            &payload.bank_name,
            &payload.account_type,
            &payload.account_holder,
            &payload.account_number,
            &payload.branch_code,
            payload.is_default.unwrap_or(false),
        )
        .await?;
    Ok(Json(ApiResponse::success(detail)))
}

pub async fn verify_bank_detail(
    State(state): State<AppState>,
    Path(detail_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<UserBankDetail>>> {
    tracing::info!(detail_id = %detail_id, "Marking bank detail verified");
    let detail = state.bank_details.mark_verified(&detail_id).await?;
    Ok(Json(ApiResponse::success(detail)))
}

pub async fn get_user_bank_details(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<Vec<UserBankDetail>>>> {
    let details = state.bank_details.find_by_user_id(&user_id).await?;
    Ok(Json(ApiResponse::success(details)))
}

// === Withdrawals ===

pub async fn create_withdrawal(
    State(state): State<AppState>,
    Json(payload): Json<CreateWithdrawalRequest>,
) -> SettlementResult<Json<ApiResponse<WithdrawalRequest>>> {
    let request = state
        .withdrawals
        .create_withdrawal(
            &payload.wallet_id,
            &payload.user_id,
            payload.amount,
            &payload.bank_detail_id,
            payload.reason.as_deref(),
        )
        .await?;

    publish_best_effort(
        &state,
        SettlementEvent::WithdrawalRequested {
            request_id: request.id.clone(),
            wallet_id: request.wallet_id.clone(),
            user_id: request.user_id.clone(),
            requested_amount: request.requested_amount,
            net_amount: request.net_amount,
            timestamp: Utc::now(),
        },
    )
    .await;

    Ok(Json(ApiResponse::success(request)))
}

pub async fn cancel_withdrawal(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<WithdrawalRequest>>> {
    let request = state.withdrawals.cancel_withdrawal(&request_id).await?;

    publish_best_effort(
        &state,
        SettlementEvent::WithdrawalCancelled {
            request_id: request.id.clone(),
            wallet_id: request.wallet_id.clone(),
            user_id: request.user_id.clone(),
            requested_amount: request.requested_amount,
            timestamp: Utc::now(),
        },
    )
    .await;

    Ok(Json(ApiResponse::success(request)))
}

pub async fn process_withdrawal(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(payload): Json<ProcessWithdrawalRequest>,
) -> SettlementResult<Json<ApiResponse<WithdrawalRequest>>> {
    let request = state
        .withdrawals
        .process_withdrawal(&request_id, payload.payment_method)
        .await?;

    publish_best_effort(
        &state,
        SettlementEvent::WithdrawalSettled {
            request_id: request.id.clone(),
            wallet_id: request.wallet_id.clone(),
            user_id: request.user_id.clone(),
            requested_amount: request.requested_amount,
            success: request.status == WithdrawalStatus::Completed,
            timestamp: Utc::now(),
        },
    )
    .await;

    Ok(Json(ApiResponse::success(request)))
}

pub async fn get_wallet_withdrawals(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<Vec<WithdrawalRequest>>>> {
    let requests = state.withdrawals.list_by_wallet(&wallet_id).await?;
    Ok(Json(ApiResponse::success(requests)))
}

// === Payout batches ===

pub async fn create_batch(
    State(state): State<AppState>,
    Json(payload): Json<CreateBatchRequest>,
) -> SettlementResult<Json<ApiResponse<BatchDetailResponse>>> {
    tracing::info!(
        driver_count = payload.driver_ids.len(),
        "Creating payout batch"
    );
    let detail = state.payouts.create_batch(&payload.driver_ids).await?;
    Ok(Json(ApiResponse::success(detail)))
}

pub async fn process_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Json(payload): Json<ProcessBatchRequest>,
) -> SettlementResult<Json<ApiResponse<BatchDetailResponse>>> {
    let detail = state
        .payouts
        .process_batch(&batch_id, payload.payment_method)
        .await?;

    publish_best_effort(
        &state,
        SettlementEvent::BatchProcessed {
            batch_id: detail.batch.id.clone(),
            batch_number: detail.batch.batch_number.clone(),
            status: detail.batch.status.to_string(),
            driver_count: detail.batch.driver_count,
            total_amount: detail.batch.total_amount,
            timestamp: Utc::now(),
        },
    )
    .await;

    Ok(Json(ApiResponse::success(detail)))
}

pub async fn retry_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<BatchDetailResponse>>> {
    let detail = state.payouts.retry_batch(&batch_id).await?;

    publish_best_effort(
        &state,
        SettlementEvent::BatchProcessed {
            batch_id: detail.batch.id.clone(),
            batch_number: detail.batch.batch_number.clone(),
            status: detail.batch.status.to_string(),
            driver_count: detail.batch.driver_count,
            total_amount: detail.batch.total_amount,
            timestamp: Utc::now(),
        },
    )
    .await;

    Ok(Json(ApiResponse::success(detail)))
}

pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> SettlementResult<Json<ApiResponse<BatchDetailResponse>>> {
    let detail = state.payouts.batch_detail(&batch_id).await?;
    Ok(Json(ApiResponse::success(detail)))
}

pub async fn list_batches(
    State(state): State<AppState>,
) -> SettlementResult<Json<ApiResponse<Vec<PayoutBatch>>>> {
    let batches = state.payouts.list_batches(50).await?;
    Ok(Json(ApiResponse::success(batches)))
}

/// Health check endpoint
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
