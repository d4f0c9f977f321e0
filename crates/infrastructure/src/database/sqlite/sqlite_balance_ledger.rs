use async_trait::async_trait;
use chrono::Utc;
use gpu_scheduler_domain::{
    entities::{BalanceReservation, RechargeCode, RechargeRecord},
    repositories::{BalanceLedger, RedeemOutcome},
    SchedulerError, SchedulerResult,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

pub struct SqliteBalanceLedger {
    pool: SqlitePool,
}

impl SqliteBalanceLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_reservation(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<BalanceReservation> {
        Ok(BalanceReservation {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            task_id: row.try_get("task_id")?,
            amount: row.try_get("amount")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// 删除预留并把refund金额退回账户，结算与释放共用
    async fn close_reservation(
        &self,
        reservation: &BalanceReservation,
        refund: f64,
    ) -> SchedulerResult<()> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        let deleted = sqlx::query("DELETE FROM balance_reservations WHERE id = $1")
            .bind(&reservation.id)
            .execute(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?;
        if deleted.rows_affected() == 0 {
            // 并发结算/释放竞争，另一方已经关闭了该预留
            return Err(SchedulerError::ReservationNotFound {
                id: reservation.id.clone(),
            });
        }

        if refund > 0.0 {
            sqlx::query(
                "UPDATE user_accounts SET balance = balance + $1, updated_at = $2 WHERE user_id = $3",
            )
            .bind(refund)
            .bind(Utc::now())
            .bind(&reservation.user_id)
            .execute(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?;
        }

        tx.commit().await.map_err(SchedulerError::Database)?;
        Ok(())
    }

    async fn get_reservation(
        &self,
        reservation_id: &str,
    ) -> SchedulerResult<BalanceReservation> {
        let row = sqlx::query(
            "SELECT id, user_id, task_id, amount, created_at FROM balance_reservations WHERE id = $1",
        )
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Self::row_to_reservation(&row),
            None => Err(SchedulerError::ReservationNotFound {
                id: reservation_id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl BalanceLedger for SqliteBalanceLedger {
    async fn reserve(
        &self,
        user_id: &str,
        task_id: &str,
        amount: f64,
    ) -> SchedulerResult<BalanceReservation> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        // 余额校验与扣减是同一条条件UPDATE，并发预留不会透支
        let result = sqlx::query(
            "UPDATE user_accounts SET balance = balance - $1, updated_at = $2 WHERE user_id = $3 AND balance >= $1",
        )
        .bind(amount)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::InsufficientBalance { required: amount });
        }

        let reservation = BalanceReservation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            task_id: task_id.to_string(),
            amount,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO balance_reservations (id, user_id, task_id, amount, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&reservation.id)
        .bind(&reservation.user_id)
        .bind(&reservation.task_id)
        .bind(reservation.amount)
        .bind(reservation.created_at)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        tx.commit().await.map_err(SchedulerError::Database)?;
        debug!("用户 {} 预留余额 {} (任务 {})", user_id, amount, task_id);
        Ok(reservation)
    }

    async fn settle(&self, reservation_id: &str, final_cost: f64) -> SchedulerResult<f64> {
        let reservation = self.get_reservation(reservation_id).await?;
        // 实际扣费封顶为预留额，差额退还
        let charged = final_cost.clamp(0.0, reservation.amount);
        self.close_reservation(&reservation, reservation.amount - charged)
            .await?;

        info!(
            "结算预留 {}: 冻结 {} 实扣 {}",
            reservation_id, reservation.amount, charged
        );
        Ok(charged)
    }

    async fn release(&self, reservation_id: &str) -> SchedulerResult<()> {
        let reservation = self.get_reservation(reservation_id).await?;
        self.close_reservation(&reservation, reservation.amount)
            .await?;
        debug!("释放预留 {}: 退还 {}", reservation_id, reservation.amount);
        Ok(())
    }

    async fn release_for_task(&self, task_id: &str) -> SchedulerResult<()> {
        match self.reservation_for_task(task_id).await? {
            Some(reservation) => {
                self.close_reservation(&reservation, reservation.amount)
                    .await
            }
            None => Ok(()),
        }
    }

    async fn reservation_for_task(
        &self,
        task_id: &str,
    ) -> SchedulerResult<Option<BalanceReservation>> {
        let row = sqlx::query(
            "SELECT id, user_id, task_id, amount, created_at FROM balance_reservations WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_reservation).transpose()
    }

    async fn balance(&self, user_id: &str) -> SchedulerResult<f64> {
        let row = sqlx::query("SELECT balance FROM user_accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(row.try_get("balance")?),
            None => Ok(0.0),
        }
    }

    async fn redeem(&self, user_id: &str, code: &str) -> SchedulerResult<RedeemOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        let row = sqlx::query(
            "SELECT id, amount, max_uses, used_count, expires_at FROM recharge_codes WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        let Some(row) = row else {
            return Err(SchedulerError::CodeInvalid);
        };
        let code_id: String = row.try_get("id")?;
        let amount: f64 = row.try_get("amount")?;
        let expires_at: Option<chrono::DateTime<Utc>> = row.try_get("expires_at")?;

        if expires_at.is_some_and(|exp| exp <= now) {
            return Err(SchedulerError::CodeExpired);
        }

        // used_count的检查与自增在同一条语句里，并发兑换不会超过max_uses
        let result = sqlx::query(
            "UPDATE recharge_codes SET used_count = used_count + 1 WHERE id = $1 AND used_count < max_uses",
        )
        .bind(&code_id)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::CodeExhausted);
        }

        sqlx::query(
            r#"
            INSERT INTO user_accounts (user_id, balance, updated_at) VALUES ($1, $2, $3)
            ON CONFLICT(user_id) DO UPDATE SET
                balance = user_accounts.balance + excluded.balance,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        let balance_row = sqlx::query("SELECT balance FROM user_accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?;
        let new_balance: f64 = balance_row.try_get("balance")?;

        let record_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO recharge_records (id, user_id, recharge_code_id, amount, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&record_id)
        .bind(user_id)
        .bind(&code_id)
        .bind(amount)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        tx.commit().await.map_err(SchedulerError::Database)?;
        info!("用户 {} 兑换充值码成功，到账 {}", user_id, amount);
        Ok(RedeemOutcome {
            amount,
            new_balance,
            recharge_record_id: record_id,
        })
    }

    async fn create_code(&self, code: &RechargeCode) -> SchedulerResult<()> {
        sqlx::query(
            "INSERT INTO recharge_codes (id, code, amount, max_uses, used_count, expires_at, created_by, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&code.id)
        .bind(&code.code)
        .bind(code.amount)
        .bind(code.max_uses)
        .bind(code.used_count)
        .bind(code.expires_at)
        .bind(&code.created_by)
        .bind(code.created_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("创建充值码成功: {} (面额 {})", code.code, code.amount);
        Ok(())
    }

    async fn recharge_records(&self, user_id: &str) -> SchedulerResult<Vec<RechargeRecord>> {
        let rows = sqlx::query(
            "SELECT id, user_id, recharge_code_id, amount, created_at FROM recharge_records WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter()
            .map(|row| {
                Ok(RechargeRecord {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    recharge_code_id: row.try_get("recharge_code_id")?,
                    amount: row.try_get("amount")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
