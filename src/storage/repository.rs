//! Repositories over the SQLite schema. All row mapping is explicit so the
//! TEXT-encoded decimal and JSON columns stay in one place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{
    GatewayError, ModelRecord, MultiplierStatus, Operation, Provider, Result, Tier,
    TierMultiplier, TierRestrictionMode, UsageRecord, UserProfile, VendorPricing,
};

// ===== Capability traits =====

#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ModelRecord>>;
    async fn list(&self, include_archived: bool) -> Result<Vec<ModelRecord>>;
}

#[async_trait]
pub trait PricingStore: Send + Sync {
    /// Largest `effective_from <= at` wins; ties resolve to the largest id.
    async fn get_active(
        &self,
        provider: Provider,
        model: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<VendorPricing>>;

    /// Approved multiplier rows that could match; the engine picks by
    /// specificity.
    async fn candidate_multipliers(
        &self,
        tier: Tier,
        provider: Provider,
        model: &str,
    ) -> Result<Vec<TierMultiplier>>;
}

#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub model_id: Option<String>,
    pub operation: Option<Operation>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub total_requests: i64,
    pub total_tokens: i64,
    pub total_credits: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatBucket {
    pub bucket: String,
    pub requests: i64,
    pub total_tokens: i64,
    pub credits_used: i64,
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn list(&self, user_id: &str, filter: &UsageFilter) -> Result<Vec<UsageRecord>>;
    async fn count(&self, user_id: &str, filter: &UsageFilter) -> Result<i64>;
    async fn summarize(&self, user_id: &str, filter: &UsageFilter) -> Result<UsageSummary>;
    async fn stats(
        &self,
        user_id: &str,
        group_by: &str,
        filter: &UsageFilter,
    ) -> Result<Vec<UsageStatBucket>>;
}

#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    async fn record(&self, user_id: &str, usage: &UsageRecord, reason: &str) -> Result<Uuid>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserProfile>>;
}

// ===== Row mapping =====

pub(crate) fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s)
        .map_err(|e| GatewayError::Internal(format!("bad decimal column '{}': {}", s, e)))
}

fn parse_decimal_opt(s: Option<String>) -> Result<Option<Decimal>> {
    s.as_deref().map(parse_decimal).transpose()
}

fn parse_provider(s: &str) -> Result<Provider> {
    Provider::from_str(s).map_err(GatewayError::Internal)
}

fn parse_tier(s: &str) -> Tier {
    Tier::from_str(s).unwrap_or_default()
}

fn map_model(row: &SqliteRow) -> Result<ModelRecord> {
    let capabilities: String = row.try_get("capabilities")?;
    let allowed_tiers: String = row.try_get("allowed_tiers")?;
    let meta: String = row.try_get("meta")?;
    let provider: String = row.try_get("provider")?;
    let required_tier: String = row.try_get("required_tier")?;
    let mode: String = row.try_get("tier_restriction_mode")?;

    Ok(ModelRecord {
        id: row.try_get("id")?,
        provider: parse_provider(&provider)?,
        display_name: row.try_get("display_name")?,
        capabilities: serde_json::from_str(&capabilities).unwrap_or_default(),
        context_window: row.try_get::<i64, _>("context_window")? as u32,
        max_output_tokens: row.try_get::<i64, _>("max_output_tokens")? as u32,
        meta: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
        is_available: row.try_get::<i64, _>("is_available")? != 0,
        is_legacy: row.try_get::<i64, _>("is_legacy")? != 0,
        is_archived: row.try_get::<i64, _>("is_archived")? != 0,
        required_tier: parse_tier(&required_tier),
        tier_restriction_mode: TierRestrictionMode::parse(&mode),
        allowed_tiers: serde_json::from_str(&allowed_tiers).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_pricing(row: &SqliteRow) -> Result<VendorPricing> {
    let provider: String = row.try_get("provider")?;
    let input: String = row.try_get("input_price_per_1k")?;
    let output: String = row.try_get("output_price_per_1k")?;

    Ok(VendorPricing {
        id: row.try_get("id")?,
        provider: parse_provider(&provider)?,
        model: row.try_get("model")?,
        input_price_per_1k: parse_decimal(&input)?,
        output_price_per_1k: parse_decimal(&output)?,
        cache_write_price_per_1k: parse_decimal_opt(row.try_get("cache_write_price_per_1k")?)?,
        cache_read_price_per_1k: parse_decimal_opt(row.try_get("cache_read_price_per_1k")?)?,
        context_threshold_tokens: row
            .try_get::<Option<i64>, _>("context_threshold_tokens")?
            .map(|v| v as u64),
        input_price_per_1k_high_context: parse_decimal_opt(
            row.try_get("input_price_per_1k_high_context")?,
        )?,
        output_price_per_1k_high_context: parse_decimal_opt(
            row.try_get("output_price_per_1k_high_context")?,
        )?,
        cache_write_price_per_1k_high_context: parse_decimal_opt(
            row.try_get("cache_write_price_per_1k_high_context")?,
        )?,
        cache_read_price_per_1k_high_context: parse_decimal_opt(
            row.try_get("cache_read_price_per_1k_high_context")?,
        )?,
        effective_from: row.try_get("effective_from")?,
        effective_until: row.try_get("effective_until")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
    })
}

fn map_usage(row: &SqliteRow) -> Result<UsageRecord> {
    let id: String = row.try_get("id")?;
    let provider: String = row.try_get("provider")?;
    let operation: String = row.try_get("operation")?;
    let vendor_cost: String = row.try_get("vendor_cost")?;
    let margin: String = row.try_get("margin_multiplier")?;
    let gross: String = row.try_get("gross_margin")?;
    let trail: String = row.try_get("debit_trail")?;

    Ok(UsageRecord {
        id: Uuid::parse_str(&id)
            .map_err(|e| GatewayError::Internal(format!("bad usage id: {}", e)))?,
        user_id: row.try_get("user_id")?,
        model_id: row.try_get("model_id")?,
        provider: parse_provider(&provider)?,
        operation: Operation::parse(&operation)
            .ok_or_else(|| GatewayError::Internal(format!("bad operation: {}", operation)))?,
        prompt_tokens: row.try_get::<i64, _>("prompt_tokens")? as u64,
        completion_tokens: row.try_get::<i64, _>("completion_tokens")? as u64,
        total_tokens: row.try_get::<i64, _>("total_tokens")? as u64,
        cache_creation_tokens: row
            .try_get::<Option<i64>, _>("cache_creation_tokens")?
            .map(|v| v as u64),
        cache_read_tokens: row
            .try_get::<Option<i64>, _>("cache_read_tokens")?
            .map(|v| v as u64),
        cached_prompt_tokens: row
            .try_get::<Option<i64>, _>("cached_prompt_tokens")?
            .map(|v| v as u64),
        credits_used: row.try_get("credits_used")?,
        vendor_cost: parse_decimal(&vendor_cost)?,
        margin_multiplier: parse_decimal(&margin)?,
        gross_margin: parse_decimal(&gross)?,
        credit_breakdown: crate::domain::CreditBreakdown {
            input_credits: row.try_get("input_credits")?,
            output_credits: row.try_get("output_credits")?,
            cache_write_credits: row.try_get("cache_write_credits")?,
            cache_read_credits: row.try_get("cache_read_credits")?,
        },
        cache_hit_rate: row.try_get("cache_hit_rate")?,
        cost_savings_percent: row.try_get("cost_savings_percent")?,
        finish_reason: row.try_get("finish_reason")?,
        debit_trail: serde_json::from_str(&trail).unwrap_or_default(),
        executed_at: row.try_get("executed_at")?,
        duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
    })
}

/// Insert a usage row. Generic over the executor so the credit ledger can run
/// it inside its deduction transaction.
pub async fn insert_usage<'e, E>(executor: E, record: &UsageRecord) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO usage_history (
            id, user_id, model_id, provider, operation,
            prompt_tokens, completion_tokens, total_tokens,
            cache_creation_tokens, cache_read_tokens, cached_prompt_tokens,
            credits_used, vendor_cost, margin_multiplier, gross_margin,
            input_credits, output_credits, cache_write_credits, cache_read_credits,
            cache_hit_rate, cost_savings_percent, finish_reason, debit_trail,
            executed_at, executed_day, duration_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.id.to_string())
    .bind(&record.user_id)
    .bind(&record.model_id)
    .bind(record.provider.as_str())
    .bind(record.operation.as_str())
    .bind(record.prompt_tokens as i64)
    .bind(record.completion_tokens as i64)
    .bind(record.total_tokens as i64)
    .bind(record.cache_creation_tokens.map(|v| v as i64))
    .bind(record.cache_read_tokens.map(|v| v as i64))
    .bind(record.cached_prompt_tokens.map(|v| v as i64))
    .bind(record.credits_used)
    .bind(record.vendor_cost.to_string())
    .bind(record.margin_multiplier.to_string())
    .bind(record.gross_margin.to_string())
    .bind(record.credit_breakdown.input_credits)
    .bind(record.credit_breakdown.output_credits)
    .bind(record.credit_breakdown.cache_write_credits)
    .bind(record.credit_breakdown.cache_read_credits)
    .bind(record.cache_hit_rate)
    .bind(record.cost_savings_percent)
    .bind(&record.finish_reason)
    .bind(serde_json::to_string(&record.debit_trail)?)
    .bind(record.executed_at)
    .bind(record.executed_at.format("%Y-%m-%d").to_string())
    .bind(record.duration_ms as i64)
    .execute(executor)
    .await?;

    Ok(())
}

// ===== SQLite implementations =====

#[derive(Clone)]
pub struct SqliteModelStore {
    pool: SqlitePool,
}

impl SqliteModelStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ModelStore for SqliteModelStore {
    async fn get(&self, id: &str) -> Result<Option<ModelRecord>> {
        let row = sqlx::query("SELECT * FROM models WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(map_model).transpose()
    }

    async fn list(&self, include_archived: bool) -> Result<Vec<ModelRecord>> {
        let sql = if include_archived {
            "SELECT * FROM models ORDER BY id"
        } else {
            "SELECT * FROM models WHERE is_archived = 0 ORDER BY id"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(map_model).collect()
    }
}

#[derive(Clone)]
pub struct SqlitePricingStore {
    pool: SqlitePool,
}

impl SqlitePricingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PricingStore for SqlitePricingStore {
    async fn get_active(
        &self,
        provider: Provider,
        model: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<VendorPricing>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM model_provider_pricing
            WHERE provider = ? AND model = ? AND is_active = 1
              AND effective_from <= ?
              AND (effective_until IS NULL OR effective_until >= ?)
            ORDER BY effective_from DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(provider.as_str())
        .bind(model)
        .bind(at)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_pricing).transpose()
    }

    async fn candidate_multipliers(
        &self,
        tier: Tier,
        provider: Provider,
        model: &str,
    ) -> Result<Vec<TierMultiplier>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tier_multipliers
            WHERE status = 'approved'
              AND (tier IS NULL OR tier = ?)
              AND (provider IS NULL OR provider = ?)
              AND (model IS NULL OR model = ?)
            "#,
        )
        .bind(tier.as_str())
        .bind(provider.as_str())
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let tier: Option<String> = row.try_get("tier")?;
                let provider: Option<String> = row.try_get("provider")?;
                let multiplier: String = row.try_get("multiplier")?;
                let status: String = row.try_get("status")?;
                Ok(TierMultiplier {
                    id: row.try_get("id")?,
                    tier: tier.as_deref().map(parse_tier),
                    provider: provider.as_deref().map(parse_provider).transpose()?,
                    model: row.try_get("model")?,
                    multiplier: parse_decimal(&multiplier)?,
                    status: MultiplierStatus::parse(&status),
                })
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct SqliteUsageStore {
    pool: SqlitePool,
}

impl SqliteUsageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn push_filters(
        builder: &mut sqlx::QueryBuilder<'_, sqlx::Sqlite>,
        user_id: &str,
        filter: &UsageFilter,
    ) {
        builder.push(" WHERE user_id = ").push_bind(user_id.to_string());
        if let Some(start) = filter.start_date {
            builder.push(" AND executed_at >= ").push_bind(start);
        }
        if let Some(end) = filter.end_date {
            builder.push(" AND executed_at <= ").push_bind(end);
        }
        if let Some(model_id) = &filter.model_id {
            builder.push(" AND model_id = ").push_bind(model_id.clone());
        }
        if let Some(operation) = filter.operation {
            builder
                .push(" AND operation = ")
                .push_bind(operation.as_str());
        }
    }
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn list(&self, user_id: &str, filter: &UsageFilter) -> Result<Vec<UsageRecord>> {
        let mut builder = sqlx::QueryBuilder::new("SELECT * FROM usage_history");
        Self::push_filters(&mut builder, user_id, filter);
        builder
            .push(" ORDER BY executed_at DESC LIMIT ")
            .push_bind(filter.limit.clamp(1, 100))
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(map_usage).collect()
    }

    async fn count(&self, user_id: &str, filter: &UsageFilter) -> Result<i64> {
        let mut builder = sqlx::QueryBuilder::new("SELECT COUNT(*) AS n FROM usage_history");
        Self::push_filters(&mut builder, user_id, filter);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get("n")?)
    }

    async fn summarize(&self, user_id: &str, filter: &UsageFilter) -> Result<UsageSummary> {
        let mut builder = sqlx::QueryBuilder::new(
            "SELECT COUNT(*) AS requests, \
             COALESCE(SUM(total_tokens), 0) AS tokens, \
             COALESCE(SUM(credits_used), 0) AS credits \
             FROM usage_history",
        );
        Self::push_filters(&mut builder, user_id, filter);
        let row = builder.build().fetch_one(&self.pool).await?;

        Ok(UsageSummary {
            total_requests: row.try_get("requests")?,
            total_tokens: row.try_get("tokens")?,
            total_credits: row.try_get("credits")?,
        })
    }

    async fn stats(
        &self,
        user_id: &str,
        group_by: &str,
        filter: &UsageFilter,
    ) -> Result<Vec<UsageStatBucket>> {
        let bucket_expr = match group_by {
            "hour" => "substr(executed_at, 1, 13)",
            "model" => "model_id",
            _ => "executed_day",
        };

        let mut builder = sqlx::QueryBuilder::new(format!(
            "SELECT {} AS bucket, COUNT(*) AS requests, \
             COALESCE(SUM(total_tokens), 0) AS tokens, \
             COALESCE(SUM(credits_used), 0) AS credits \
             FROM usage_history",
            bucket_expr
        ));
        Self::push_filters(&mut builder, user_id, filter);
        builder.push(" GROUP BY bucket ORDER BY bucket");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(UsageStatBucket {
                    bucket: row.try_get("bucket")?,
                    requests: row.try_get("requests")?,
                    total_tokens: row.try_get("tokens")?,
                    credits_used: row.try_get("credits")?,
                })
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct SqliteReconciliationStore {
    pool: SqlitePool,
}

impl SqliteReconciliationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReconciliationStore for SqliteReconciliationStore {
    async fn record(&self, user_id: &str, usage: &UsageRecord, reason: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO reconciliation_records (id, user_id, usage_payload, reason, created_at, resolved)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(id.to_string())
        .bind(user_id)
        .bind(serde_json::to_string(usage)?)
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }
}

#[derive(Clone)]
pub struct SqliteIdentityStore {
    pool: SqlitePool,
}

impl SqliteIdentityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_user(row: &SqliteRow) -> Result<UserProfile> {
        let tier: String = row.try_get("tier")?;
        Ok(UserProfile {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            email_verified: row.try_get::<i64, _>("email_verified")? != 0,
            name: row.try_get("name")?,
            picture: row.try_get("picture")?,
            is_active: row.try_get::<i64, _>("is_active")? != 0,
            role: row.try_get("role")?,
            tier: parse_tier(&tier),
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_user).transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_user).transpose()
    }
}
