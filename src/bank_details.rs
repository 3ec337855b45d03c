use crate::errors::{SettlementError, SettlementResult};
use crate::models::UserBankDetail;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

/// Repository for users' bank accounts. Disbursements may only target
/// verified accounts; verification itself happens out of band (admin
/// review) and is recorded here.
#[derive(Clone)]
pub struct BankDetailRepository {
    pool: PgPool,
}

impl BankDetailRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn add(
        &self,
        user_id: &str,
        bank_name: &str,
        account_type: &str,
        account_holder: &str,
        account_number: &str,
        branch_code: &str,
        is_default: bool,
    ) -> SettlementResult<UserBankDetail> {
        let mut tx = self.pool.begin().await?;

        if is_default {
            sqlx::query("UPDATE user_bank_details SET is_default = FALSE WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }

        let detail = sqlx::query_as::<_, UserBankDetail>(
            r#"
            INSERT INTO user_bank_details
                (id, user_id, bank_name, account_type, account_holder,
                 account_number, branch_code, is_default, verified, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, $9)
            RETURNING id, user_id, bank_name, account_type, account_holder,
                      account_number, branch_code, is_default, verified, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(bank_name)
        .bind(account_type)
        .bind(account_holder)
        .bind(account_number)
        .bind(branch_code)
        .bind(is_default)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(detail)
    }

    pub async fn find_by_id(&self, id: &str) -> SettlementResult<UserBankDetail> {
        let detail = sqlx::query_as::<_, UserBankDetail>(
            r#"
            SELECT id, user_id, bank_name, account_type, account_holder,
                   account_number, branch_code, is_default, verified, created_at
            FROM user_bank_details
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SettlementError::BankDetailNotFound(id.to_string()))?;

        Ok(detail)
    }

    pub async fn find_by_user_id(&self, user_id: &str) -> SettlementResult<Vec<UserBankDetail>> {
        let details = sqlx::query_as::<_, UserBankDetail>(
            r#"
            SELECT id, user_id, bank_name, account_type, account_holder,
                   account_number, branch_code, is_default, verified, created_at
            FROM user_bank_details
            WHERE user_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(details)
    }

    /// The account a payout batch disburses to: the user's default
    /// verified detail, or their only verified one.
    pub async fn find_payable_for_user(
        &self,
        user_id: &str,
    ) -> SettlementResult<Option<UserBankDetail>> {
        let detail = sqlx::query_as::<_, UserBankDetail>(
            r#"
            SELECT id, user_id, bank_name, account_type, account_holder,
                   account_number, branch_code, is_default, verified, created_at
            FROM user_bank_details
            WHERE user_id = $1 AND verified = TRUE
            ORDER BY is_default DESC, created_at
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(detail)
    }

    pub async fn mark_verified(&self, id: &str) -> SettlementResult<UserBankDetail> {
        let detail = sqlx::query_as::<_, UserBankDetail>(
            r#"
            UPDATE user_bank_details
            SET verified = TRUE
            WHERE id = $1
            RETURNING id, user_id, bank_name, account_type, account_holder,
                      account_number, branch_code, is_default, verified, created_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SettlementError::BankDetailNotFound(id.to_string()))?;

        Ok(detail)
    }
}
