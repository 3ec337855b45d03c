use crate::bank_details::BankDetailRepository;
use crate::disbursement::{DisbursementChannel, DisbursementInstruction, DisbursementOutcome};
use crate::earnings::EarningsAggregator;
use crate::errors::{SettlementError, SettlementResult};
use crate::ledger::{finalize_hold_in_tx, lock_wallet_in_tx, place_hold_in_tx};
use crate::models::{DisbursementMethod, WithdrawalRequest, WithdrawalStatus};
use crate::policy::SettlementPolicy;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

/// Validates and records user-initiated withdrawals.
///
/// A request, its ledger hold and the wallet's pending_withdrawals
/// increment commit as one database transaction; there is no state in
/// which one exists without the others.
#[derive(Clone)]
pub struct WithdrawalManager {
    pool: PgPool,
    earnings: EarningsAggregator,
    bank_details: BankDetailRepository,
    policy: SettlementPolicy,
    channel: Arc<dyn DisbursementChannel>,
}

impl WithdrawalManager {
    pub fn new(
        pool: PgPool,
        earnings: EarningsAggregator,
        bank_details: BankDetailRepository,
        policy: SettlementPolicy,
        channel: Arc<dyn DisbursementChannel>,
    ) -> Self {
        Self {
            pool,
            earnings,
            bank_details,
            policy,
            channel,
        }
    }

    /// Create a withdrawal request.
    ///
    /// Validation order: minimum, bank account, then available balance
    /// under the wallet lock. Nothing is written until every check has
    /// passed.
    pub async fn create_withdrawal(
        &self,
        wallet_id: &str,
        user_id: &str,
        amount: Decimal,
        bank_detail_id: &str,
        reason: Option<&str>,
    ) -> SettlementResult<WithdrawalRequest> {
        if amount < self.policy.minimum_withdrawal {
            return Err(SettlementError::BelowMinimum {
                amount,
                minimum: self.policy.minimum_withdrawal,
            });
        }

        let bank_detail = self.bank_details.find_by_id(bank_detail_id).await?;
        if bank_detail.user_id != user_id {
            return Err(SettlementError::BankDetailNotFound(
                bank_detail_id.to_string(),
            ));
        }
        if !bank_detail.verified {
            return Err(SettlementError::UnverifiedBankAccount(
                bank_detail_id.to_string(),
            ));
        }

        let processing_fee = self.policy.processing_fee(amount);
        let net_amount = amount - processing_fee;
        let reference = format!("WD-{}", &Uuid::new_v4().simple().to_string()[..10]);

        let mut tx = self.pool.begin().await?;

        let wallet = lock_wallet_in_tx(&mut tx, wallet_id).await?;
        if wallet.user_id != user_id {
            return Err(SettlementError::WalletNotFound(wallet_id.to_string()));
        }

        let hold = place_hold_in_tx(&mut tx, &wallet, amount, Some(&reference)).await?;

        let request = sqlx::query_as::<_, WithdrawalRequest>(
            r#"
            INSERT INTO withdrawal_requests
                (id, wallet_id, user_id, requested_amount, processing_fee, net_amount,
                 bank_detail_id, status, reference, reason, failure_reason,
                 ledger_transaction_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9, NULL, $10, $11)
            RETURNING id, wallet_id, user_id, requested_amount, processing_fee, net_amount,
                      bank_detail_id, status, reference, reason, failure_reason,
                      ledger_transaction_id, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(wallet_id)
        .bind(user_id)
        .bind(amount)
        .bind(processing_fee)
        .bind(net_amount)
        .bind(bank_detail_id)
        .bind(&reference)
        .bind(reason)
        .bind(&hold.id)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        self.earnings.apply_transaction(&hold).await?;

        tracing::info!(
            request_id = %request.id,
            wallet_id = %wallet_id,
            amount = %amount,
            processing_fee = %processing_fee,
            "Withdrawal request created"
        );

        Ok(request)
    }

    /// Cancel a withdrawal while it is still pending. The hold is
    /// released and the available balance restored.
    pub async fn cancel_withdrawal(
        &self,
        request_id: &str,
    ) -> SettlementResult<WithdrawalRequest> {
        let mut tx = self.pool.begin().await?;

        let request = lock_request_in_tx(&mut tx, request_id).await?;
        if request.status != WithdrawalStatus::Pending {
            return Err(SettlementError::InvalidStateTransition(format!(
                "withdrawal {} cannot be cancelled from {}",
                request.id, request.status
            )));
        }

        let (released_hold, _wallet) =
            finalize_hold_in_tx(&mut tx, &request.ledger_transaction_id, false).await?;
        let cancelled =
            update_request_status_in_tx(&mut tx, request_id, WithdrawalStatus::Cancelled, None)
                .await?;

        tx.commit().await?;

        self.earnings.apply_transaction(&released_hold).await?;

        tracing::info!(request_id = %request_id, "Withdrawal cancelled");
        Ok(cancelled)
    }

    /// Disburse a single withdrawal request through the bank channel.
    ///
    /// pending -> processing is claimed under the request row lock, so a
    /// concurrent second processor cannot double-disburse. The channel
    /// call runs under the policy timeout; a timeout fails the request
    /// and releases the hold, it never leaves it processing forever.
    pub async fn process_withdrawal(
        &self,
        request_id: &str,
        method: DisbursementMethod,
    ) -> SettlementResult<WithdrawalRequest> {
        // Claim the request.
        let mut tx = self.pool.begin().await?;
        let request = lock_request_in_tx(&mut tx, request_id).await?;
        if request.status != WithdrawalStatus::Pending {
            return Err(SettlementError::InvalidStateTransition(format!(
                "withdrawal {} cannot be processed from {}",
                request.id, request.status
            )));
        }
        update_request_status_in_tx(&mut tx, request_id, WithdrawalStatus::Processing, None)
            .await?;
        tx.commit().await?;

        let bank_detail = self.bank_details.find_by_id(&request.bank_detail_id).await?;
        let instruction = DisbursementInstruction {
            account_number: bank_detail.account_number.clone(),
            branch_code: bank_detail.branch_code.clone(),
            account_holder: bank_detail.account_holder.clone(),
            amount: request.net_amount,
            reference: request.reference.clone(),
        };

        tracing::info!(
            request_id = %request_id,
            method = %method,
            channel = %self.channel.name(),
            net_amount = %request.net_amount,
            "Disbursing withdrawal"
        );

        let outcome = tokio::time::timeout(
            self.policy.disbursement_timeout(),
            self.channel.disburse(&instruction),
        )
        .await;

        let failure_reason = match outcome {
            Ok(Ok(DisbursementOutcome::Accepted { channel_reference })) => {
                tracing::info!(
                    request_id = %request_id,
                    channel_reference = %channel_reference,
                    "Withdrawal disbursed"
                );
                None
            }
            Ok(Ok(DisbursementOutcome::Rejected { reason })) => {
                Some(SettlementError::DisbursementRejected(reason).to_string())
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(
                SettlementError::DisbursementTimeout(self.policy.disbursement_timeout_secs)
                    .to_string(),
            ),
        };

        // Settle: hold finalization and request status commit together.
        let mut tx = self.pool.begin().await?;
        let success = failure_reason.is_none();
        let (finalized_hold, _wallet) =
            finalize_hold_in_tx(&mut tx, &request.ledger_transaction_id, success).await?;
        let status = if success {
            WithdrawalStatus::Completed
        } else {
            WithdrawalStatus::Failed
        };
        let updated = update_request_status_in_tx(
            &mut tx,
            request_id,
            status,
            failure_reason.as_deref(),
        )
        .await?;
        tx.commit().await?;

        self.earnings.apply_transaction(&finalized_hold).await?;

        if let Some(reason) = &updated.failure_reason {
            tracing::warn!(
                request_id = %request_id,
                reason = %reason,
                "Withdrawal disbursement failed, hold released"
            );
        }

        Ok(updated)
    }

    pub async fn find_by_id(&self, request_id: &str) -> SettlementResult<WithdrawalRequest> {
        let request = sqlx::query_as::<_, WithdrawalRequest>(
            r#"
            SELECT id, wallet_id, user_id, requested_amount, processing_fee, net_amount,
                   bank_detail_id, status, reference, reason, failure_reason,
                   ledger_transaction_id, created_at
            FROM withdrawal_requests
            WHERE id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SettlementError::WithdrawalNotFound(request_id.to_string()))?;

        Ok(request)
    }

    pub async fn list_by_wallet(
        &self,
        wallet_id: &str,
    ) -> SettlementResult<Vec<WithdrawalRequest>> {
        let requests = sqlx::query_as::<_, WithdrawalRequest>(
            r#"
            SELECT id, wallet_id, user_id, requested_amount, processing_fee, net_amount,
                   bank_detail_id, status, reference, reason, failure_reason,
                   ledger_transaction_id, created_at
            FROM withdrawal_requests
            WHERE wallet_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(requests)
    }
}

async fn lock_request_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    request_id: &str,
) -> SettlementResult<WithdrawalRequest> {
    let request = sqlx::query_as::<_, WithdrawalRequest>(
        r#"
        SELECT id, wallet_id, user_id, requested_amount, processing_fee, net_amount,
               bank_detail_id, status, reference, reason, failure_reason,
               ledger_transaction_id, created_at
        FROM withdrawal_requests
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(request_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| SettlementError::WithdrawalNotFound(request_id.to_string()))?;

    Ok(request)
}

async fn update_request_status_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    request_id: &str,
    status: WithdrawalStatus,
    failure_reason: Option<&str>,
) -> SettlementResult<WithdrawalRequest> {
    let request = sqlx::query_as::<_, WithdrawalRequest>(
        r#"
        UPDATE withdrawal_requests
        SET status = $1, failure_reason = $2
        WHERE id = $3
        RETURNING id, wallet_id, user_id, requested_amount, processing_fee, net_amount,
                  bank_detail_id, status, reference, reason, failure_reason,
                  ledger_transaction_id, created_at
        "#,
    )
    .bind(status.to_string())
    .bind(failure_reason)
    .bind(request_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(request)
}
