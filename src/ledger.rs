use crate::errors::{SettlementError, SettlementResult};
use crate::models::{
    PaymentSplit, TransactionStatus, TransactionType, TripSettlementResponse, Wallet,
    WalletStatus, WalletTransaction,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Reserved user id for the platform's own wallet, credited with the
/// platform share and road levy of every settled trip.
pub const PLATFORM_USER_ID: &str = "platform";

/// Repository for the wallet ledger.
///
/// All database logic for wallets and transactions lives here; handlers
/// don't know SQL, the repository doesn't know HTTP. Every balance-
/// affecting operation locks the wallet row and commits the ledger
/// append together with the balance update - partial application is not
/// representable.
#[derive(Clone)]
pub struct LedgerRepository {
    pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create a new wallet for a user. Starts at zero, version 0.
    pub async fn create_wallet(&self, user_id: &str) -> SettlementResult<Wallet> {
        let wallet_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            INSERT INTO wallets (id, user_id, balance, pending_withdrawals, status, version, created_at, updated_at)
            VALUES ($1, $2, 0, 0, 'active', 0, $3, $3)
            RETURNING id, user_id, balance, pending_withdrawals, status, version, created_at, updated_at
            "#,
        )
        .bind(&wallet_id)
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(wallet)
    }

    pub async fn find_by_id(&self, wallet_id: &str) -> SettlementResult<Wallet> {
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, user_id, balance, pending_withdrawals, status, version, created_at, updated_at
            FROM wallets
            WHERE id = $1
            "#,
        )
        .bind(wallet_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SettlementError::WalletNotFound(wallet_id.to_string()))?;

        Ok(wallet)
    }

    pub async fn find_by_user_id(&self, user_id: &str) -> SettlementResult<Vec<Wallet>> {
        let wallets = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, user_id, balance, pending_withdrawals, status, version, created_at, updated_at
            FROM wallets
            WHERE user_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(wallets)
    }

    /// Freeze or unfreeze a wallet. Frozen wallets reject every
    /// balance-affecting operation until reactivated.
    pub async fn set_wallet_status(
        &self,
        wallet_id: &str,
        status: WalletStatus,
    ) -> SettlementResult<Wallet> {
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            UPDATE wallets
            SET status = $1, version = version + 1, updated_at = $2
            WHERE id = $3
            RETURNING id, user_id, balance, pending_withdrawals, status, version, created_at, updated_at
            "#,
        )
        .bind(status.to_string())
        .bind(Utc::now())
        .bind(wallet_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SettlementError::WalletNotFound(wallet_id.to_string()))?;

        Ok(wallet)
    }

    /// Ledger entries for a wallet in creation (effect) order.
    pub async fn list_transactions(
        &self,
        wallet_id: &str,
    ) -> SettlementResult<Vec<WalletTransaction>> {
        let transactions = sqlx::query_as::<_, WalletTransaction>(
            r#"
            SELECT id, wallet_id, type AS transaction_type, amount, status,
                   previous_balance, new_balance, reference, created_at
            FROM wallet_transactions
            WHERE wallet_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }

    pub async fn find_transaction(
        &self,
        transaction_id: &str,
    ) -> SettlementResult<WalletTransaction> {
        let transaction = sqlx::query_as::<_, WalletTransaction>(
            r#"
            SELECT id, wallet_id, type AS transaction_type, amount, status,
                   previous_balance, new_balance, reference, created_at
            FROM wallet_transactions
            WHERE id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SettlementError::TransactionNotFound(transaction_id.to_string()))?;

        Ok(transaction)
    }

    /// The balance a wallet would have if rebuilt from its completed
    /// ledger entries alone. Used by reconciliation and tests.
    pub async fn replayed_balance(&self, wallet_id: &str) -> SettlementResult<Decimal> {
        let sum: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT SUM(amount)
            FROM wallet_transactions
            WHERE wallet_id = $1 AND status = 'completed'
            "#,
        )
        .bind(wallet_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(sum.unwrap_or(Decimal::ZERO))
    }

    /// Post an immediately-completed transaction: lock the wallet,
    /// validate, append the ledger row and apply the balance change as
    /// one atomic unit.
    pub async fn post_transaction(
        &self,
        wallet_id: &str,
        transaction_type: TransactionType,
        amount: Decimal,
        reference: Option<&str>,
    ) -> SettlementResult<WalletTransaction> {
        if amount == Decimal::ZERO {
            return Err(SettlementError::InvalidAmount(
                "posting amount cannot be zero".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let wallet = lock_wallet_in_tx(&mut tx, wallet_id).await?;
        let transaction =
            apply_completed_posting_in_tx(&mut tx, &wallet, transaction_type, amount, reference)
                .await?;
        tx.commit().await?;

        Ok(transaction)
    }

    /// Place a pending withdrawal hold: the gross balance is untouched,
    /// but the amount is committed to `pending_withdrawals` so the
    /// available balance drops immediately.
    pub async fn post_hold(
        &self,
        wallet_id: &str,
        amount: Decimal,
        reference: Option<&str>,
    ) -> SettlementResult<WalletTransaction> {
        if amount <= Decimal::ZERO {
            return Err(SettlementError::InvalidAmount(
                "hold amount must be positive".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let wallet = lock_wallet_in_tx(&mut tx, wallet_id).await?;
        let transaction = place_hold_in_tx(&mut tx, &wallet, amount, reference).await?;
        tx.commit().await?;

        Ok(transaction)
    }

    /// Finalize a pending hold exactly once.
    ///
    /// Success debits the balance and releases the hold; failure only
    /// releases the hold. Either way the transaction row reaches its
    /// terminal status and the wallet is updated in the same commit.
    pub async fn finalize_hold(
        &self,
        transaction_id: &str,
        success: bool,
    ) -> SettlementResult<(WalletTransaction, Wallet)> {
        let mut tx = self.pool.begin().await?;
        let result = finalize_hold_in_tx(&mut tx, transaction_id, success).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Create a compensating posting for a completed transaction.
    ///
    /// The original row is never touched: corrections are additive,
    /// which is what keeps the ledger append-only. Reversing a credit
    /// posts a `refund` debit, reversing a debit posts an `adjustment`
    /// credit.
    pub async fn reverse_posting(
        &self,
        transaction_id: &str,
        reason: &str,
    ) -> SettlementResult<WalletTransaction> {
        let mut tx = self.pool.begin().await?;

        let original = sqlx::query_as::<_, WalletTransaction>(
            r#"
            SELECT id, wallet_id, type AS transaction_type, amount, status,
                   previous_balance, new_balance, reference, created_at
            FROM wallet_transactions
            WHERE id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| SettlementError::TransactionNotFound(transaction_id.to_string()))?;

        if original.status != TransactionStatus::Completed {
            return Err(SettlementError::InvalidStateTransition(format!(
                "only completed transactions can be reversed, {} is {}",
                original.id, original.status
            )));
        }

        let wallet = lock_wallet_in_tx(&mut tx, &original.wallet_id).await?;
        let compensating_type = if original.amount > Decimal::ZERO {
            TransactionType::Refund
        } else {
            TransactionType::Adjustment
        };
        let reference = format!("reversal:{}:{}", original.id, reason);
        let transaction = apply_completed_posting_in_tx(
            &mut tx,
            &wallet,
            compensating_type,
            -original.amount,
            Some(&reference),
        )
        .await?;

        tx.commit().await?;
        Ok(transaction)
    }

    /// Settle a completed trip charge: persist the split and post the
    /// driver and platform credits, all in one atomic unit.
    ///
    /// The unique trip_reference makes this safe under webhook
    /// redelivery: a duplicate settlement returns the original split
    /// with no new postings.
    pub async fn settle_trip(
        &self,
        split: &PaymentSplit,
        driver_id: &str,
    ) -> SettlementResult<TripSettlementResponse> {
        let mut tx = self.pool.begin().await?;

        let inserted = insert_split_in_tx(&mut tx, split).await;
        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                // Lost the race (or a webhook retry): the trip is
                // already settled. Drop our transaction and hand back
                // the recorded split.
                drop(tx);
                let existing = self.find_split(&split.trip_reference).await?;
                return Ok(TripSettlementResponse {
                    split: existing,
                    transactions: vec![],
                    duplicate: true,
                });
            }
            return Err(e.into());
        }

        let driver_wallet = find_or_create_wallet_in_tx(&mut tx, driver_id).await?;
        let earning = apply_completed_posting_in_tx(
            &mut tx,
            &driver_wallet,
            TransactionType::TripEarning,
            split.net_driver_amount,
            Some(&split.trip_reference),
        )
        .await?;

        let platform_wallet = find_or_create_wallet_in_tx(&mut tx, PLATFORM_USER_ID).await?;
        let platform_fee = apply_completed_posting_in_tx(
            &mut tx,
            &platform_wallet,
            TransactionType::PlatformFee,
            split.platform_amount + split.road_levy,
            Some(&split.trip_reference),
        )
        .await?;

        tx.commit().await?;

        Ok(TripSettlementResponse {
            split: split.clone(),
            transactions: vec![earning, platform_fee],
            duplicate: false,
        })
    }

    pub async fn find_split(&self, trip_reference: &str) -> SettlementResult<PaymentSplit> {
        let split = sqlx::query_as::<_, PaymentSplit>(
            r#"
            SELECT id, trip_reference, rider_wallet_id, total_amount, payment_gateway_fee,
                   road_levy, driver_percentage, net_driver_amount, platform_amount,
                   payment_method, policy_version, split_date
            FROM payment_splits
            WHERE trip_reference = $1
            "#,
        )
        .bind(trip_reference)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            SettlementError::Internal(format!("payment split missing for {trip_reference}"))
        })?;

        Ok(split)
    }
}

// === Helpers shared with the withdrawal and payout repositories ===
//
// These compose into larger atomic units: the caller owns the sqlx
// transaction, so a withdrawal request row and its ledger hold commit
// or roll back together.

/// Lock a wallet row for the duration of the surrounding transaction.
/// This is the per-wallet serialization boundary.
pub(crate) async fn lock_wallet_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    wallet_id: &str,
) -> SettlementResult<Wallet> {
    let wallet = sqlx::query_as::<_, Wallet>(
        r#"
        SELECT id, user_id, balance, pending_withdrawals, status, version, created_at, updated_at
        FROM wallets
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(wallet_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| SettlementError::WalletNotFound(wallet_id.to_string()))?;

    Ok(wallet)
}

/// First wallet for a user, created if missing. Locked either way.
pub(crate) async fn find_or_create_wallet_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
) -> SettlementResult<Wallet> {
    let existing = sqlx::query_as::<_, Wallet>(
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

    if let Some(wallet) = existing {
        return Ok(wallet);
    }

    let now = Utc::now();
    let wallet = sqlx::query_as::<_, Wallet>(
        r#"
        INSERT INTO wallets (id, user_id, balance, pending_withdrawals, status, version, created_at, updated_at)
        VALUES ($1, $2, 0, 0, 'active', 0, $3, $3)
        RETURNING id, user_id, balance, pending_withdrawals, status, version, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;

    Ok(wallet)
}

/// Append a completed posting and apply it to the wallet balance.
/// Caller must hold the wallet lock (`wallet` came from
/// `lock_wallet_in_tx`).
pub(crate) async fn apply_completed_posting_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    wallet: &Wallet,
    transaction_type: TransactionType,
    amount: Decimal,
    reference: Option<&str>,
) -> SettlementResult<WalletTransaction> {
    ensure_active(wallet)?;

    let new_balance = wallet.balance + amount;
    if new_balance < Decimal::ZERO {
        return Err(SettlementError::InsufficientFunds {
            shortfall: -new_balance,
            available: wallet.balance,
        });
    }
    // A completed debit must also leave room for the holds already
    // committed against this wallet.
    if new_balance < wallet.pending_withdrawals {
        return Err(SettlementError::InsufficientFunds {
            shortfall: wallet.pending_withdrawals - new_balance,
            available: wallet.available_balance(),
        });
    }

    update_wallet_in_tx(tx, wallet, new_balance, wallet.pending_withdrawals).await?;
    insert_transaction_in_tx(
        tx,
        &wallet.id,
        transaction_type,
        amount,
        TransactionStatus::Completed,
        wallet.balance,
        new_balance,
        reference,
    )
    .await
}

/// Append a pending hold: balance untouched, pending_withdrawals
/// incremented. The balance snapshots record the balance at hold time;
/// the settlement snapshots are written by `finalize_hold_in_tx`.
pub(crate) async fn place_hold_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    wallet: &Wallet,
    amount: Decimal,
    reference: Option<&str>,
) -> SettlementResult<WalletTransaction> {
    ensure_active(wallet)?;

    let available = wallet.available_balance();
    if available < amount {
        return Err(SettlementError::InsufficientAvailableBalance {
            shortfall: amount - available,
            available,
        });
    }

    update_wallet_in_tx(
        tx,
        wallet,
        wallet.balance,
        wallet.pending_withdrawals + amount,
    )
    .await?;
    insert_transaction_in_tx(
        tx,
        &wallet.id,
        TransactionType::Withdrawal,
        -amount,
        TransactionStatus::Pending,
        wallet.balance,
        wallet.balance,
        reference,
    )
    .await
}

/// Drive a pending hold to its terminal status, exactly once.
pub(crate) async fn finalize_hold_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    transaction_id: &str,
    success: bool,
) -> SettlementResult<(WalletTransaction, Wallet)> {
    // Lock the transaction row first so two finalizations serialize.
    let hold = sqlx::query_as::<_, WalletTransaction>(
        r#"
        SELECT id, wallet_id, type AS transaction_type, amount, status,
               previous_balance, new_balance, reference, created_at
        FROM wallet_transactions
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(transaction_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| SettlementError::TransactionNotFound(transaction_id.to_string()))?;

    if hold.transaction_type != TransactionType::Withdrawal
        || hold.status != TransactionStatus::Pending
    {
        return Err(SettlementError::InvalidStateTransition(format!(
            "transaction {} is not a pending hold ({} {})",
            hold.id, hold.transaction_type, hold.status
        )));
    }

    let wallet = lock_wallet_in_tx(tx, &hold.wallet_id).await?;
    let hold_amount = -hold.amount; // holds are stored as negative postings

    let (status, previous_balance, new_balance) = if success {
        let settled_balance = wallet.balance - hold_amount;
        update_wallet_in_tx(
            tx,
            &wallet,
            settled_balance,
            wallet.pending_withdrawals - hold_amount,
        )
        .await?;
        (TransactionStatus::Completed, wallet.balance, settled_balance)
    } else {
        update_wallet_in_tx(
            tx,
            &wallet,
            wallet.balance,
            wallet.pending_withdrawals - hold_amount,
        )
        .await?;
        (TransactionStatus::Failed, hold.previous_balance, hold.new_balance)
    };

    let finalized = sqlx::query_as::<_, WalletTransaction>(
        r#"
        UPDATE wallet_transactions
        SET status = $1, previous_balance = $2, new_balance = $3
        WHERE id = $4
        RETURNING id, wallet_id, type AS transaction_type, amount, status,
                  previous_balance, new_balance, reference, created_at
        "#,
    )
    .bind(status.to_string())
    .bind(previous_balance)
    .bind(new_balance)
    .bind(&hold.id)
    .fetch_one(&mut **tx)
    .await?;

    let updated_wallet = sqlx::query_as::<_, Wallet>(
        r#"
        SELECT id, user_id, balance, pending_withdrawals, status, version, created_at, updated_at
        FROM wallets
        WHERE id = $1
        "#,
    )
    .bind(&wallet.id)
    .fetch_one(&mut **tx)
    .await?;

    Ok((finalized, updated_wallet))
}

fn ensure_active(wallet: &Wallet) -> SettlementResult<()> {
    if wallet.status != WalletStatus::Active {
        return Err(SettlementError::WalletFrozen(wallet.id.clone()));
    }
    Ok(())
}

async fn update_wallet_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    wallet: &Wallet,
    balance: Decimal,
    pending_withdrawals: Decimal,
) -> SettlementResult<()> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE wallets
        SET balance = $1, pending_withdrawals = $2, version = $3, updated_at = $4
        WHERE id = $5 AND version = $6
        "#,
    )
    .bind(balance)
    .bind(pending_withdrawals)
    .bind(wallet.version + 1)
    .bind(Utc::now())
    .bind(&wallet.id)
    .bind(wallet.version)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    // The row lock makes this unreachable in practice; the version
    // check stays as a second line of defense against a stale read.
    if rows_affected == 0 {
        return Err(SettlementError::OptimisticLock);
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert_transaction_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    wallet_id: &str,
    transaction_type: TransactionType,
    amount: Decimal,
    status: TransactionStatus,
    previous_balance: Decimal,
    new_balance: Decimal,
    reference: Option<&str>,
) -> SettlementResult<WalletTransaction> {
    let transaction = sqlx::query_as::<_, WalletTransaction>(
        r#"
        INSERT INTO wallet_transactions
            (id, wallet_id, type, amount, status, previous_balance, new_balance, reference, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id, wallet_id, type AS transaction_type, amount, status,
                  previous_balance, new_balance, reference, created_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(wallet_id)
    .bind(transaction_type.to_string())
    .bind(amount)
    .bind(status.to_string())
    .bind(previous_balance)
    .bind(new_balance)
    .bind(reference)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;

    Ok(transaction)
}

async fn insert_split_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    split: &PaymentSplit,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO payment_splits
            (id, trip_reference, rider_wallet_id, total_amount, payment_gateway_fee,
             road_levy, driver_percentage, net_driver_amount, platform_amount,
             payment_method, policy_version, split_date)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(&split.id)
    .bind(&split.trip_reference)
    .bind(&split.rider_wallet_id)
    .bind(split.total_amount)
    .bind(split.payment_gateway_fee)
    .bind(split.road_levy)
    .bind(split.driver_percentage)
    .bind(split.net_driver_amount)
    .bind(split.platform_amount)
    .bind(split.payment_method.to_string())
    .bind(&split.policy_version)
    .bind(split.split_date)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}
