use crate::bank_details::BankDetailRepository;
use crate::disbursement::{DisbursementChannel, DisbursementInstruction, DisbursementOutcome};
use crate::earnings::EarningsAggregator;
use crate::errors::{SettlementError, SettlementResult};
use crate::ledger::{finalize_hold_in_tx, place_hold_in_tx};
use crate::models::{
    BatchDetailResponse, BatchStatus, DisbursementMethod, PayoutBatch, PayoutItem,
    PayoutItemStatus, Wallet, WalletStatus,
};
use crate::policy::SettlementPolicy;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

/// Groups eligible driver earnings into batches and drives them through
/// draft -> processing -> completed | failed.
///
/// Double-claim prevention is structural: selecting a driver inserts a
/// reservation row (primary-keyed on the driver) and places a ledger
/// hold in the same database transaction. A concurrent batch creation
/// either loses the reservation insert or fails the availability check
/// under the wallet lock; it can never claim the same earnings.
#[derive(Clone)]
pub struct PayoutProcessor {
    pool: PgPool,
    earnings: EarningsAggregator,
    bank_details: BankDetailRepository,
    policy: SettlementPolicy,
    channel: Arc<dyn DisbursementChannel>,
}

impl PayoutProcessor {
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

    /// Create a draft batch from the eligible subset of the given
    /// drivers. Each selected driver's payable amount is their available
    /// balance at creation time, frozen into the line item; later
    /// earnings do not enlarge the batch.
    pub async fn create_batch(
        &self,
        driver_ids: &[String],
    ) -> SettlementResult<BatchDetailResponse> {
        let now = Utc::now();
        let batch_id = Uuid::new_v4().to_string();
        let batch_number = format!(
            "PB-{}-{}",
            now.format("%Y%m%d"),
            &Uuid::new_v4().simple().to_string()[..6]
        );

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO payout_batches
                (id, batch_number, driver_count, total_amount, status, payment_method, created_at, processed_at)
            VALUES ($1, $2, 0, 0, 'draft', NULL, $3, NULL)
            "#,
        )
        .bind(&batch_id)
        .bind(&batch_number)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut seen = std::collections::HashSet::new();
        let mut items = Vec::new();
        let mut holds = Vec::new();

        for driver_id in driver_ids {
            if !seen.insert(driver_id.as_str()) {
                continue;
            }

            let Some(bank_detail) = self.bank_details.find_payable_for_user(driver_id).await?
            else {
                tracing::debug!(driver_id = %driver_id, "Skipping driver without a verified bank account");
                continue;
            };

            let Some(wallet) = lock_driver_wallet_in_tx(&mut tx, driver_id).await? else {
                tracing::debug!(driver_id = %driver_id, "Skipping driver without a wallet");
                continue;
            };
            if wallet.status != WalletStatus::Active {
                tracing::debug!(driver_id = %driver_id, "Skipping driver with frozen wallet");
                continue;
            }

            let amount = wallet.available_balance();
            if amount < self.policy.payout_threshold {
                tracing::debug!(
                    driver_id = %driver_id,
                    available = %amount,
                    threshold = %self.policy.payout_threshold,
                    "Skipping driver below payout threshold"
                );
                continue;
            }

            if !reserve_driver_in_tx(&mut tx, driver_id, &batch_id, amount).await? {
                tracing::debug!(driver_id = %driver_id, "Skipping driver reserved by another batch");
                continue;
            }

            let hold = place_hold_in_tx(&mut tx, &wallet, amount, Some(&batch_number)).await?;

            let item = sqlx::query_as::<_, PayoutItem>(
                r#"
                INSERT INTO payout_items
                    (id, batch_id, user_id, wallet_id, bank_detail_id, amount, status,
                     failure_reason, channel_reference, ledger_transaction_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, 'pending', NULL, NULL, $7, $8)
                RETURNING id, batch_id, user_id, wallet_id, bank_detail_id, amount, status,
                          failure_reason, channel_reference, ledger_transaction_id, created_at
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&batch_id)
            .bind(driver_id)
            .bind(&wallet.id)
            .bind(&bank_detail.id)
            .bind(amount)
            .bind(&hold.id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            holds.push(hold);
            items.push(item);
        }

        if items.is_empty() {
            // Rolls back the empty batch shell.
            return Err(SettlementError::NoEligibleDrivers);
        }

        let total_amount: Decimal = items.iter().map(|i| i.amount).sum();
        let batch = sqlx::query_as::<_, PayoutBatch>(
            r#"
            UPDATE payout_batches
            SET driver_count = $1, total_amount = $2
            WHERE id = $3
            RETURNING id, batch_number, driver_count, total_amount, status, payment_method,
                      created_at, processed_at
            "#,
        )
        .bind(items.len() as i32)
        .bind(total_amount)
        .bind(&batch_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        for hold in &holds {
            self.earnings.apply_transaction(hold).await?;
        }

        tracing::info!(
            batch_id = %batch.id,
            batch_number = %batch.batch_number,
            driver_count = batch.driver_count,
            total_amount = %batch.total_amount,
            "Payout batch created"
        );

        Ok(BatchDetailResponse { batch, items })
    }

    /// Process a draft batch: disburse every line item independently
    /// and roll the batch up to completed or failed.
    ///
    /// Idempotent: invoking this on a batch that already left draft
    /// returns the recorded state and disburses nothing.
    pub async fn process_batch(
        &self,
        batch_id: &str,
        method: DisbursementMethod,
    ) -> SettlementResult<BatchDetailResponse> {
        // Claim the batch under its row lock; concurrent invocations
        // serialize here and the loser sees a non-draft status.
        let mut tx = self.pool.begin().await?;
        let batch = lock_batch_in_tx(&mut tx, batch_id).await?;
        match batch.status {
            BatchStatus::Draft => {}
            _ => {
                drop(tx);
                tracing::info!(
                    batch_id = %batch_id,
                    status = %batch.status,
                    "Batch already left draft; returning recorded state"
                );
                return self.batch_detail(batch_id).await;
            }
        }
        sqlx::query(
            "UPDATE payout_batches SET status = 'processing', payment_method = $1 WHERE id = $2",
        )
        .bind(method.to_string())
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.run_disbursements(batch_id).await
    }

    /// Re-run the failed line items of a failed batch. Succeeded items
    /// are untouched. Items whose earnings are no longer available (or
    /// are reserved elsewhere) stay failed with the reason recorded.
    pub async fn retry_batch(&self, batch_id: &str) -> SettlementResult<BatchDetailResponse> {
        let mut tx = self.pool.begin().await?;
        let batch = lock_batch_in_tx(&mut tx, batch_id).await?;
        match batch.status {
            BatchStatus::Failed => {}
            BatchStatus::Completed => {
                return Err(SettlementError::BatchAlreadyProcessed(batch_id.to_string()));
            }
            other => {
                return Err(SettlementError::InvalidStateTransition(format!(
                    "batch {batch_id} cannot be retried from {other}"
                )));
            }
        }

        let failed_items = sqlx::query_as::<_, PayoutItem>(
            r#"
            SELECT id, batch_id, user_id, wallet_id, bank_detail_id, amount, status,
                   failure_reason, channel_reference, ledger_transaction_id, created_at
            FROM payout_items
            WHERE batch_id = $1 AND status = 'failed'
            ORDER BY created_at
            "#,
        )
        .bind(batch_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut holds = Vec::new();
        for item in &failed_items {
            let Some(wallet) = lock_driver_wallet_in_tx(&mut tx, &item.user_id).await? else {
                continue;
            };
            if wallet.available_balance() < item.amount {
                set_item_failure_in_tx(
                    &mut tx,
                    &item.id,
                    "earnings no longer available for retry",
                )
                .await?;
                continue;
            }
            if !reserve_driver_in_tx(&mut tx, &item.user_id, batch_id, item.amount).await? {
                set_item_failure_in_tx(&mut tx, &item.id, "earnings reserved by another batch")
                    .await?;
                continue;
            }

            let hold =
                place_hold_in_tx(&mut tx, &wallet, item.amount, Some(&batch.batch_number))
                    .await?;
            sqlx::query(
                r#"
                UPDATE payout_items
                SET status = 'pending', failure_reason = NULL, ledger_transaction_id = $1
                WHERE id = $2
                "#,
            )
            .bind(&hold.id)
            .bind(&item.id)
            .execute(&mut *tx)
            .await?;
            holds.push(hold);
        }

        sqlx::query("UPDATE payout_batches SET status = 'processing' WHERE id = $1")
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        for hold in &holds {
            self.earnings.apply_transaction(hold).await?;
        }

        tracing::info!(
            batch_id = %batch_id,
            retried = holds.len(),
            "Retrying failed payout items"
        );

        self.run_disbursements(batch_id).await
    }

    pub async fn batch_detail(&self, batch_id: &str) -> SettlementResult<BatchDetailResponse> {
        let batch = sqlx::query_as::<_, PayoutBatch>(
            r#"
            SELECT id, batch_number, driver_count, total_amount, status, payment_method,
                   created_at, processed_at
            FROM payout_batches
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SettlementError::BatchNotFound(batch_id.to_string()))?;

        let items = self.list_items(batch_id).await?;
        Ok(BatchDetailResponse { batch, items })
    }

    pub async fn list_batches(&self, limit: i64) -> SettlementResult<Vec<PayoutBatch>> {
        let batches = sqlx::query_as::<_, PayoutBatch>(
            r#"
            SELECT id, batch_number, driver_count, total_amount, status, payment_method,
                   created_at, processed_at
            FROM payout_batches
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(batches)
    }

    async fn list_items(&self, batch_id: &str) -> SettlementResult<Vec<PayoutItem>> {
        let items = sqlx::query_as::<_, PayoutItem>(
            r#"
            SELECT id, batch_id, user_id, wallet_id, bank_detail_id, amount, status,
                   failure_reason, channel_reference, ledger_transaction_id, created_at
            FROM payout_items
            WHERE batch_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    /// Disburse the batch's pending items and roll the batch up.
    async fn run_disbursements(&self, batch_id: &str) -> SettlementResult<BatchDetailResponse> {
        let items = self.list_items(batch_id).await?;

        for item in &items {
            if item.status != PayoutItemStatus::Pending {
                continue;
            }
            // One driver's failure never blocks the others.
            if let Err(e) = self.disburse_item(item).await {
                tracing::error!(
                    item_id = %item.id,
                    error = %e,
                    "Unexpected error settling payout item"
                );
            }
        }

        // Roll up: completed only if every item succeeded.
        let items = self.list_items(batch_id).await?;
        let all_completed = items
            .iter()
            .all(|i| i.status == PayoutItemStatus::Completed);
        let final_status = if all_completed {
            BatchStatus::Completed
        } else {
            BatchStatus::Failed
        };

        let mut tx = self.pool.begin().await?;
        let batch = sqlx::query_as::<_, PayoutBatch>(
            r#"
            UPDATE payout_batches
            SET status = $1, processed_at = $2
            WHERE id = $3
            RETURNING id, batch_number, driver_count, total_amount, status, payment_method,
                      created_at, processed_at
            "#,
        )
        .bind(final_status.to_string())
        .bind(Utc::now())
        .bind(batch_id)
        .fetch_one(&mut *tx)
        .await?;
        // The batch has resolved; drivers become claimable again.
        sqlx::query("DELETE FROM payout_reservations WHERE batch_id = $1")
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            batch_id = %batch.id,
            status = %batch.status,
            completed = items.iter().filter(|i| i.status == PayoutItemStatus::Completed).count(),
            failed = items.iter().filter(|i| i.status == PayoutItemStatus::Failed).count(),
            "Payout batch processed"
        );

        Ok(BatchDetailResponse { batch, items })
    }

    /// Disburse one line item and settle its hold. The hold
    /// finalization and the item's terminal status commit together.
    async fn disburse_item(&self, item: &PayoutItem) -> SettlementResult<()> {
        let bank_detail = self.bank_details.find_by_id(&item.bank_detail_id).await?;
        let instruction = DisbursementInstruction {
            account_number: bank_detail.account_number.clone(),
            branch_code: bank_detail.branch_code.clone(),
            account_holder: bank_detail.account_holder.clone(),
            amount: item.amount,
            reference: item.id.clone(),
        };

        let outcome = tokio::time::timeout(
            self.policy.disbursement_timeout(),
            self.channel.disburse(&instruction),
        )
        .await;

        let (channel_reference, failure_reason) = match outcome {
            Ok(Ok(DisbursementOutcome::Accepted { channel_reference })) => {
                (Some(channel_reference), None)
            }
            Ok(Ok(DisbursementOutcome::Rejected { reason })) => (
                None,
                Some(SettlementError::DisbursementRejected(reason).to_string()),
            ),
            Ok(Err(e)) => (None, Some(e.to_string())),
            Err(_) => (
                None,
                Some(
                    SettlementError::DisbursementTimeout(self.policy.disbursement_timeout_secs)
                        .to_string(),
                ),
            ),
        };

        let success = failure_reason.is_none();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let (finalized_hold, _wallet) =
            finalize_hold_in_tx(&mut tx, &item.ledger_transaction_id, success).await?;
        if success {
            sqlx::query(
                r#"
                UPDATE payout_items
                SET status = 'completed', channel_reference = $1, failure_reason = NULL
                WHERE id = $2
                "#,
            )
            .bind(&channel_reference)
            .bind(&item.id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE payout_items
                SET status = 'failed', failure_reason = $1
                WHERE id = $2
                "#,
            )
            .bind(&failure_reason)
            .bind(&item.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.earnings.apply_transaction(&finalized_hold).await?;
        if success {
            self.earnings.mark_paid_out(&item.user_id, now).await?;
            tracing::info!(
                item_id = %item.id,
                user_id = %item.user_id,
                amount = %item.amount,
                "Payout item disbursed"
            );
        } else {
            tracing::warn!(
                item_id = %item.id,
                user_id = %item.user_id,
                reason = failure_reason.as_deref().unwrap_or("unknown"),
                "Payout item failed, hold released"
            );
        }

        Ok(())
    }
}

async fn lock_batch_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    batch_id: &str,
) -> SettlementResult<PayoutBatch> {
    let batch = sqlx::query_as::<_, PayoutBatch>(
        r#"
        SELECT id, batch_number, driver_count, total_amount, status, payment_method,
               created_at, processed_at
        FROM payout_batches
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(batch_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| SettlementError::BatchNotFound(batch_id.to_string()))?;

    Ok(batch)
}

async fn lock_driver_wallet_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
) -> SettlementResult<Option<Wallet>> {
    let wallet = sqlx::query_as::<_, Wallet>(
        r#"
        SELECT id, user_id, balance, pending_withdrawals, status, version, created_at, updated_at
        FROM wallets
        WHERE user_id = $1
        ORDER BY created_at
        LIMIT 1
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(wallet)
}

/// Returns false if the driver is already claimed by a live batch.
async fn reserve_driver_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    batch_id: &str,
    amount: Decimal,
) -> SettlementResult<bool> {
    let rows_affected = sqlx::query(
        r#"
        INSERT INTO payout_reservations (user_id, batch_id, amount, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(batch_id)
    .bind(amount)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?
    .rows_affected();

    Ok(rows_affected > 0)
}

async fn set_item_failure_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    item_id: &str,
    reason: &str,
) -> SettlementResult<()> {
    sqlx::query("UPDATE payout_items SET failure_reason = $1 WHERE id = $2")
        .bind(reason)
        .bind(item_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}
