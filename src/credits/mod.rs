//! Credit ledger: subscription + purchased pools, atomic deduction with
//! usage recording, allocation, and debit-trail-aware refunds.
//!
//! Every mutation runs in a single transaction on the user's rows, which
//! closes the check-then-deduct race: the balance check happens inside the
//! same transaction that drains the pools.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{
    DebitEntry, DeductionOutcome, DetailedBalance, GatewayError, PurchasedBalance, Result,
    SubscriptionBalance, UsageRecord,
};
use crate::storage::repository::insert_usage;

#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn get_detailed(&self, user_id: &str) -> Result<DetailedBalance>;

    async fn has_available(&self, user_id: &str, amount: i64) -> Result<bool>;

    /// Atomically drain `amount` credits (subscription pool first, purchased
    /// pools oldest-first) and insert the usage record in the same
    /// transaction. Fails with `InsufficientCredits` before any write when
    /// the pools cannot cover the amount.
    async fn deduct(
        &self,
        user_id: &str,
        amount: i64,
        usage: UsageRecord,
    ) -> Result<DeductionOutcome>;

    /// Start a new subscription pool; the prior current pool is demoted.
    async fn allocate(
        &self,
        user_id: &str,
        subscription_id: &str,
        amount: i64,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<()>;

    /// Register a purchased credit pack (called by the external billing
    /// collaborator on purchase events).
    async fn add_purchased(&self, user_id: &str, purchase_id: &str, amount: i64) -> Result<()>;

    /// Return the credits of a past usage to the pools they were drawn from
    /// where those pools still exist, falling back to the purchased pool.
    async fn refund(&self, user_id: &str, usage_id: Uuid) -> Result<i64>;
}

#[derive(Clone)]
pub struct SqliteCreditLedger {
    pool: SqlitePool,
    /// Per-user mutation locks. SQLite transactions start deferred, so two
    /// concurrent deductions could read the same balance snapshot; taking
    /// the user's lock first makes check-then-deduct serializable per user.
    user_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

struct SubscriptionPoolRow {
    id: String,
    total: i64,
    used: i64,
    period_end: DateTime<Utc>,
}

struct PurchasedPoolRow {
    id: String,
    purchase_id: String,
    total: i64,
    used: i64,
}

impl SqliteCreditLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            user_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.user_locks.lock().expect("lock map poisoned");
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn current_subscription<'e, E>(
        executor: E,
        user_id: &str,
    ) -> Result<Option<SubscriptionPoolRow>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let row = sqlx::query(
            r#"
            SELECT id, total_credits, used_credits, billing_period_end
            FROM credits
            WHERE user_id = ? AND is_current = 1
            ORDER BY billing_period_start DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(executor)
        .await?;

        row.map(|row| {
            Ok(SubscriptionPoolRow {
                id: row.try_get("id")?,
                total: row.try_get("total_credits")?,
                used: row.try_get("used_credits")?,
                period_end: row.try_get("billing_period_end")?,
            })
        })
        .transpose()
    }

    async fn purchased_pools<'e, E>(executor: E, user_id: &str) -> Result<Vec<PurchasedPoolRow>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let rows = sqlx::query(
            r#"
            SELECT id, purchase_id, total_credits, used_credits
            FROM credits_purchased
            WHERE user_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(executor)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PurchasedPoolRow {
                    id: row.try_get("id")?,
                    purchase_id: row.try_get("purchase_id")?,
                    total: row.try_get("total_credits")?,
                    used: row.try_get("used_credits")?,
                })
            })
            .collect()
    }

    fn subscription_remaining(pool: &Option<SubscriptionPoolRow>, now: DateTime<Utc>) -> i64 {
        match pool {
            Some(p) if p.period_end >= now => (p.total - p.used).max(0),
            _ => 0,
        }
    }
}

#[async_trait]
impl CreditLedger for SqliteCreditLedger {
    async fn get_detailed(&self, user_id: &str) -> Result<DetailedBalance> {
        let now = Utc::now();
        let subscription = Self::current_subscription(&self.pool, user_id).await?;
        let purchased = Self::purchased_pools(&self.pool, user_id).await?;

        let sub_remaining = Self::subscription_remaining(&subscription, now);
        let (sub_total, period_end) = match &subscription {
            Some(p) if p.period_end >= now => (p.total, Some(p.period_end)),
            _ => (0, None),
        };

        let purchased_total: i64 = purchased.iter().map(|p| p.total).sum();
        let purchased_remaining: i64 = purchased.iter().map(|p| (p.total - p.used).max(0)).sum();

        Ok(DetailedBalance {
            subscription: SubscriptionBalance {
                remaining: sub_remaining,
                total: sub_total,
                period_end,
            },
            purchased: PurchasedBalance {
                remaining: purchased_remaining,
                total: purchased_total,
            },
            total_available: sub_remaining + purchased_remaining,
            last_updated: now,
        })
    }

    async fn has_available(&self, user_id: &str, amount: i64) -> Result<bool> {
        Ok(self.get_detailed(user_id).await?.total_available >= amount)
    }

    async fn deduct(
        &self,
        user_id: &str,
        amount: i64,
        mut usage: UsageRecord,
    ) -> Result<DeductionOutcome> {
        if amount <= 0 {
            return Err(GatewayError::validation("deduction amount must be positive"));
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut txn = self.pool.begin().await?;

        let subscription = Self::current_subscription(&mut *txn, user_id).await?;
        let purchased = Self::purchased_pools(&mut *txn, user_id).await?;

        let sub_remaining = Self::subscription_remaining(&subscription, now);
        let purchased_remaining: i64 = purchased.iter().map(|p| (p.total - p.used).max(0)).sum();
        let available = sub_remaining + purchased_remaining;

        if available < amount {
            // Abort before any write; the transaction drops without changes.
            return Err(GatewayError::InsufficientCredits {
                required: amount,
                available,
            });
        }

        let mut trail: Vec<DebitEntry> = Vec::new();
        let mut left = amount;

        // Subscription pool first.
        if let Some(pool) = subscription.as_ref() {
            if left > 0 && sub_remaining > 0 {
                let slice = left.min(sub_remaining);
                sqlx::query("UPDATE credits SET used_credits = used_credits + ? WHERE id = ?")
                    .bind(slice)
                    .bind(&pool.id)
                    .execute(&mut *txn)
                    .await?;
                trail.push(DebitEntry::Subscription {
                    credit_id: pool.id.clone(),
                    amount: slice,
                });
                left -= slice;
            }
        }

        // Then purchased pools, oldest first.
        for pool in &purchased {
            if left == 0 {
                break;
            }
            let pool_remaining = (pool.total - pool.used).max(0);
            if pool_remaining == 0 {
                continue;
            }
            let slice = left.min(pool_remaining);
            sqlx::query("UPDATE credits_purchased SET used_credits = used_credits + ? WHERE id = ?")
                .bind(slice)
                .bind(&pool.id)
                .execute(&mut *txn)
                .await?;
            trail.push(DebitEntry::Purchased {
                purchase_id: pool.purchase_id.clone(),
                amount: slice,
            });
            left -= slice;
        }

        debug_assert_eq!(left, 0);

        usage.credits_used = amount;
        usage.debit_trail = trail.clone();
        insert_usage(&mut *txn, &usage).await?;

        txn.commit().await?;

        let sub_drained: i64 = trail
            .iter()
            .filter_map(|e| match e {
                DebitEntry::Subscription { amount, .. } => Some(*amount),
                _ => None,
            })
            .sum();

        let subscription_remaining = sub_remaining - sub_drained;
        let purchased_remaining = purchased_remaining - (amount - sub_drained);

        debug!(
            user_id,
            deducted = amount,
            subscription_remaining,
            purchased_remaining,
            "credits deducted"
        );

        metrics::counter!("gateway_credits_deducted_total", amount as u64);

        Ok(DeductionOutcome {
            deducted: amount,
            remaining: subscription_remaining + purchased_remaining,
            subscription_remaining,
            purchased_remaining,
            debit_trail: trail,
        })
    }

    async fn allocate(
        &self,
        user_id: &str,
        subscription_id: &str,
        amount: i64,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<()> {
        if amount < 0 {
            return Err(GatewayError::validation("allocation must be non-negative"));
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut txn = self.pool.begin().await?;

        sqlx::query("UPDATE credits SET is_current = 0 WHERE user_id = ? AND is_current = 1")
            .bind(user_id)
            .execute(&mut *txn)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO credits (
                id, user_id, subscription_id, total_credits, used_credits,
                billing_period_start, billing_period_end, is_current
            ) VALUES (?, ?, ?, ?, 0, ?, ?, 1)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(subscription_id)
        .bind(amount)
        .bind(period_start)
        .bind(period_end)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;

        debug!(user_id, subscription_id, amount, "subscription pool allocated");
        Ok(())
    }

    async fn add_purchased(&self, user_id: &str, purchase_id: &str, amount: i64) -> Result<()> {
        if amount <= 0 {
            return Err(GatewayError::validation("purchase must be positive"));
        }

        sqlx::query(
            r#"
            INSERT INTO credits_purchased (id, user_id, purchase_id, total_credits, used_credits, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(purchase_id)
        .bind(amount)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn refund(&self, user_id: &str, usage_id: Uuid) -> Result<i64> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut txn = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT credits_used, debit_trail FROM usage_history WHERE id = ? AND user_id = ?",
        )
        .bind(usage_id.to_string())
        .bind(user_id)
        .fetch_optional(&mut *txn)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("usage record {}", usage_id)))?;

        let credits_used: i64 = row.try_get("credits_used")?;
        let trail_json: String = row.try_get("debit_trail")?;
        let trail: Vec<DebitEntry> = serde_json::from_str(&trail_json).unwrap_or_default();

        let mut refunded = 0i64;
        let mut orphaned = 0i64;

        for entry in &trail {
            match entry {
                DebitEntry::Subscription { credit_id, amount } => {
                    let result = sqlx::query(
                        r#"
                        UPDATE credits
                        SET used_credits = MAX(used_credits - ?, 0)
                        WHERE id = ? AND user_id = ? AND is_current = 1
                        "#,
                    )
                    .bind(amount)
                    .bind(credit_id)
                    .bind(user_id)
                    .execute(&mut *txn)
                    .await?;

                    if result.rows_affected() > 0 {
                        refunded += amount;
                    } else {
                        // Period rolled over; the pool is gone.
                        orphaned += amount;
                    }
                }
                DebitEntry::Purchased { purchase_id, amount } => {
                    let result = sqlx::query(
                        r#"
                        UPDATE credits_purchased
                        SET used_credits = MAX(used_credits - ?, 0)
                        WHERE purchase_id = ? AND user_id = ?
                        "#,
                    )
                    .bind(amount)
                    .bind(purchase_id)
                    .bind(user_id)
                    .execute(&mut *txn)
                    .await?;

                    if result.rows_affected() > 0 {
                        refunded += amount;
                    } else {
                        orphaned += amount;
                    }
                }
            }
        }

        // Records written before debit trails existed refund wholesale.
        if trail.is_empty() {
            orphaned = credits_used;
        }

        if orphaned > 0 {
            warn!(user_id, %usage_id, orphaned, "refund target pool gone, granting purchased credits");
            sqlx::query(
                r#"
                INSERT INTO credits_purchased (id, user_id, purchase_id, total_credits, used_credits, created_at)
                VALUES (?, ?, ?, ?, 0, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(user_id)
            .bind(format!("refund-{}", usage_id))
            .bind(orphaned)
            .bind(Utc::now())
            .execute(&mut *txn)
            .await?;
            refunded += orphaned;
        }

        txn.commit().await?;
        Ok(refunded)
    }
}
