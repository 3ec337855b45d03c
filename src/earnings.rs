use crate::errors::SettlementResult;
use crate::models::{DriverEarnings, TransactionStatus, TransactionType, WalletTransaction};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};

/// Read-optimized projection of per-driver earnings.
///
/// The ledger remains the source of truth; this aggregate is folded
/// incrementally from committed transactions and can be rebuilt from a
/// full replay at any time. Application is idempotent under
/// at-least-once delivery: each (transaction, lifecycle phase) is
/// folded in exactly once, tracked in earnings_applied.
#[derive(Clone)]
pub struct EarningsAggregator {
    pool: PgPool,
}

impl EarningsAggregator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read-only snapshot; zeroes if the driver has no history yet.
    pub async fn get_earnings(&self, user_id: &str) -> SettlementResult<DriverEarnings> {
        let earnings = sqlx::query_as::<_, DriverEarnings>(
            r#"
            SELECT user_id, available_balance, pending_balance, last_payout_date
            FROM driver_earnings
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(earnings.unwrap_or_else(|| DriverEarnings::empty(user_id)))
    }

    /// Fold a committed ledger transaction into the projection.
    ///
    /// Safe to call more than once for the same transaction and phase;
    /// duplicates are skipped. A withdrawal hold and its settlement are
    /// two phases of the same ledger row and are deduplicated
    /// independently.
    pub async fn apply_transaction(
        &self,
        transaction: &WalletTransaction,
    ) -> SettlementResult<()> {
        let user_id: Option<String> =
            sqlx::query_scalar("SELECT user_id FROM wallets WHERE id = $1")
                .bind(&transaction.wallet_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(user_id) = user_id else {
            tracing::warn!(
                transaction_id = %transaction.id,
                wallet_id = %transaction.wallet_id,
                "Skipping earnings update for unknown wallet"
            );
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;

        match (transaction.transaction_type, transaction.status) {
            (TransactionType::Withdrawal, TransactionStatus::Pending) => {
                self.apply_hold_phase(&mut tx, transaction, &user_id).await?;
            }
            (TransactionType::Withdrawal, terminal) => {
                // A terminal withdrawal implies its hold; fold the hold
                // phase first if it was never delivered.
                self.apply_hold_phase(&mut tx, transaction, &user_id).await?;
                let hold_amount = -transaction.amount;
                if apply_phase_once(&mut tx, &transaction.id, &terminal.to_string(), &user_id)
                    .await?
                {
                    let (available_delta, pending_delta) = match terminal {
                        // Settled: leaves pending, balance was debited.
                        TransactionStatus::Completed => (Decimal::ZERO, -hold_amount),
                        // Released: back from pending into available.
                        _ => (hold_amount, -hold_amount),
                    };
                    bump_earnings(&mut tx, &user_id, available_delta, pending_delta).await?;
                }
            }
            (_, TransactionStatus::Completed) => {
                if apply_phase_once(&mut tx, &transaction.id, "completed", &user_id).await? {
                    bump_earnings(&mut tx, &user_id, transaction.amount, Decimal::ZERO).await?;
                }
            }
            _ => {
                // Non-withdrawal postings only reach the projection once
                // completed.
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Record a successful disbursement time.
    pub async fn mark_paid_out(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> SettlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO driver_earnings (user_id, available_balance, pending_balance, last_payout_date)
            VALUES ($1, 0, 0, $2)
            ON CONFLICT (user_id) DO UPDATE SET last_payout_date = EXCLUDED.last_payout_date
            "#,
        )
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Throw the projection away and recompute it from the ledger.
    ///
    /// The replay rules collapse to:
    /// - completed postings contribute their signed amount to available
    /// - pending withdrawal holds move their amount from available to
    ///   pending
    /// - failed withdrawals contribute nothing
    pub async fn rebuild(&self, user_id: &str) -> SettlementResult<DriverEarnings> {
        let mut tx = self.pool.begin().await?;

        let transactions = sqlx::query_as::<_, WalletTransaction>(
            r#"
            SELECT t.id, t.wallet_id, t.type AS transaction_type, t.amount, t.status,
                   t.previous_balance, t.new_balance, t.reference, t.created_at
            FROM wallet_transactions t
            JOIN wallets w ON w.id = t.wallet_id
            WHERE w.user_id = $1
            ORDER BY t.created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut available = Decimal::ZERO;
        let mut pending = Decimal::ZERO;
        for t in &transactions {
            match (t.transaction_type, t.status) {
                (TransactionType::Withdrawal, TransactionStatus::Pending) => {
                    available += t.amount;
                    pending -= t.amount;
                }
                (TransactionType::Withdrawal, TransactionStatus::Completed) => {
                    available += t.amount;
                }
                (TransactionType::Withdrawal, TransactionStatus::Failed) => {}
                (_, TransactionStatus::Completed) => {
                    available += t.amount;
                }
                _ => {}
            }
        }

        sqlx::query("DELETE FROM earnings_applied WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        // Re-seed the idempotency markers so a late redelivery of an
        // already-replayed transaction is still a no-op.
        for t in &transactions {
            let phases: &[&str] = match (t.transaction_type, t.status) {
                (TransactionType::Withdrawal, TransactionStatus::Completed) => {
                    &["pending", "completed"]
                }
                (TransactionType::Withdrawal, TransactionStatus::Failed) => {
                    &["pending", "failed"]
                }
                (_, TransactionStatus::Pending) => &["pending"],
                (_, TransactionStatus::Completed) => &["completed"],
                (_, TransactionStatus::Failed) => &["failed"],
            };
            for phase in phases {
                sqlx::query(
                    r#"
                    INSERT INTO earnings_applied (transaction_id, phase, user_id, applied_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (transaction_id, phase) DO NOTHING
                    "#,
                )
                .bind(&t.id)
                .bind(phase)
                .bind(user_id)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
            }
        }

        let earnings = sqlx::query_as::<_, DriverEarnings>(
            r#"
            INSERT INTO driver_earnings (user_id, available_balance, pending_balance, last_payout_date)
            VALUES ($1, $2, $3, NULL)
            ON CONFLICT (user_id) DO UPDATE
                SET available_balance = EXCLUDED.available_balance,
                    pending_balance = EXCLUDED.pending_balance
            RETURNING user_id, available_balance, pending_balance, last_payout_date
            "#,
        )
        .bind(user_id)
        .bind(available)
        .bind(pending)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            available = %earnings.available_balance,
            pending = %earnings.pending_balance,
            "Rebuilt earnings projection from ledger"
        );

        Ok(earnings)
    }

    async fn apply_hold_phase(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        transaction: &WalletTransaction,
        user_id: &str,
    ) -> SettlementResult<()> {
        if apply_phase_once(tx, &transaction.id, "pending", user_id).await? {
            let hold_amount = -transaction.amount;
            bump_earnings(tx, user_id, -hold_amount, hold_amount).await?;
        }
        Ok(())
    }
}

/// Returns true exactly once per (transaction, phase).
async fn apply_phase_once(
    tx: &mut Transaction<'_, Postgres>,
    transaction_id: &str,
    phase: &str,
    user_id: &str,
) -> SettlementResult<bool> {
    let rows_affected = sqlx::query(
        r#"
        INSERT INTO earnings_applied (transaction_id, phase, user_id, applied_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (transaction_id, phase) DO NOTHING
        "#,
    )
    .bind(transaction_id)
    .bind(phase)
    .bind(user_id)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        tracing::debug!(
            transaction_id = %transaction_id,
            phase = %phase,
            "Earnings phase already applied, skipping (idempotent)"
        );
        return Ok(false);
    }

    Ok(true)
}

async fn bump_earnings(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    available_delta: Decimal,
    pending_delta: Decimal,
) -> SettlementResult<()> {
    sqlx::query(
        r#"
        INSERT INTO driver_earnings (user_id, available_balance, pending_balance, last_payout_date)
        VALUES ($1, $2, $3, NULL)
        ON CONFLICT (user_id) DO UPDATE
            SET available_balance = driver_earnings.available_balance + EXCLUDED.available_balance,
                pending_balance = driver_earnings.pending_balance + EXCLUDED.pending_balance
        "#,
    )
    .bind(user_id)
    .bind(available_delta)
    .bind(pending_delta)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
