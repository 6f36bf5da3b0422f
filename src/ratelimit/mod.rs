//! Tier-aware rate limiting over a shared store with per-process fallback.
//!
//! Requests/min uses a fixed one-minute window (burst tolerance = limit).
//! Credits/day uses the weighted two-bucket approximation of a sliding
//! 24-hour window. Keys are `(subject, window_start)` and expire with the
//! window. When the shared store is unreachable the limiter degrades to the
//! in-memory window and logs it; it never silently fails open.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::domain::{Result, Tier};

/// Per-tier limits: requests/min, tokens/min, credits/day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    pub credits_per_day: u64,
}

impl TierLimits {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Free => TierLimits {
                requests_per_minute: 10,
                tokens_per_minute: 10_000,
                credits_per_day: 200,
            },
            Tier::Pro | Tier::Perpetual => TierLimits {
                requests_per_minute: 60,
                tokens_per_minute: 100_000,
                credits_per_day: 5_000,
            },
            Tier::ProMax => TierLimits {
                requests_per_minute: 120,
                tokens_per_minute: 200_000,
                credits_per_day: 10_000,
            },
            Tier::EnterprisePro | Tier::EnterpriseMax => TierLimits {
                requests_per_minute: 300,
                tokens_per_minute: 500_000,
                credits_per_day: 50_000,
            },
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow {
        limit: u64,
        remaining: u64,
        reset_at: i64,
    },
    Deny {
        retry_after_secs: u64,
        limit: u64,
        remaining: u64,
        reset_at: i64,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow { .. })
    }

    pub fn limit(&self) -> u64 {
        match self {
            Admission::Allow { limit, .. } | Admission::Deny { limit, .. } => *limit,
        }
    }

    pub fn remaining(&self) -> u64 {
        match self {
            Admission::Allow { remaining, .. } | Admission::Deny { remaining, .. } => *remaining,
        }
    }

    pub fn reset_at(&self) -> i64 {
        match self {
            Admission::Allow { reset_at, .. } | Admission::Deny { reset_at, .. } => *reset_at,
        }
    }
}

/// Current standing for `/v1/rate-limit` and response headers.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub tier: Tier,
    pub requests_per_minute: u64,
    pub requests_remaining: u64,
    pub reset_at: i64,
    pub tokens_per_minute: u64,
    pub credits_per_day: u64,
    pub credits_used_today: u64,
    pub degraded: bool,
}

/// Atomic counter store keyed by window.
#[async_trait]
pub trait RateStore: Send + Sync {
    async fn incr_by(&self, key: &str, amount: u64, ttl_secs: u64) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<u64>;
}

// ===== Shared (Redis) store =====

/// INCR + first-write EXPIRE as one scripted operation.
const INCR_SCRIPT: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if tonumber(count) == tonumber(ARGV[1]) then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

#[derive(Clone)]
pub struct RedisRateStore {
    client: redis::Client,
    script: redis::Script,
}

impl RedisRateStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            crate::domain::GatewayError::Config(format!("shared store connection failed: {}", e))
        })?;
        Ok(Self {
            client,
            script: redis::Script::new(INCR_SCRIPT),
        })
    }

    /// Boot probe; callers decide whether failure is fatal.
    pub async fn ping(&self) -> Result<()> {
        let mut con = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut con)
            .await
            .map_err(|e| {
                crate::domain::GatewayError::UpstreamUnavailable(format!("shared store: {}", e))
            })?;
        Ok(())
    }

    async fn connection(&self) -> Result<redis::aio::Connection> {
        self.client.get_async_connection().await.map_err(|e| {
            crate::domain::GatewayError::UpstreamUnavailable(format!("shared store: {}", e))
        })
    }
}

#[async_trait]
impl RateStore for RedisRateStore {
    async fn incr_by(&self, key: &str, amount: u64, ttl_secs: u64) -> Result<u64> {
        let mut con = self.connection().await?;
        self.script
            .key(key)
            .arg(amount)
            .arg(ttl_secs)
            .invoke_async::<_, u64>(&mut con)
            .await
            .map_err(|e| {
                crate::domain::GatewayError::UpstreamUnavailable(format!("shared store: {}", e))
            })
    }

    async fn get(&self, key: &str) -> Result<u64> {
        let mut con = self.connection().await?;
        let value: Option<u64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut con)
            .await
            .map_err(|e| {
                crate::domain::GatewayError::UpstreamUnavailable(format!("shared store: {}", e))
            })?;
        Ok(value.unwrap_or(0))
    }
}

// ===== In-memory fallback store =====

#[derive(Clone, Default)]
pub struct MemoryRateStore {
    windows: Arc<Mutex<HashMap<String, (u64, Instant)>>>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(windows: &mut HashMap<String, (u64, Instant)>) {
        let now = Instant::now();
        windows.retain(|_, (_, expiry)| *expiry > now);
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn incr_by(&self, key: &str, amount: u64, ttl_secs: u64) -> Result<u64> {
        let mut windows = self.windows.lock().await;
        Self::prune(&mut windows);
        let entry = windows
            .entry(key.to_string())
            .or_insert((0, Instant::now() + Duration::from_secs(ttl_secs)));
        entry.0 += amount;
        Ok(entry.0)
    }

    async fn get(&self, key: &str) -> Result<u64> {
        let mut windows = self.windows.lock().await;
        Self::prune(&mut windows);
        Ok(windows.get(key).map(|(count, _)| *count).unwrap_or(0))
    }
}

// ===== Limiter =====

pub struct RateLimiter {
    shared: Option<Arc<dyn RateStore>>,
    fallback: MemoryRateStore,
    degraded: AtomicBool,
    rpm_overrides: HashMap<String, u64>,
    oauth_ip_rpm: u64,
}

const MINUTE: u64 = 60;
const DAY: u64 = 86_400;

fn minute_window(now_secs: i64) -> (i64, i64) {
    let start = now_secs - now_secs.rem_euclid(60);
    (start, start + 60)
}

impl RateLimiter {
    pub fn new(shared: Option<Arc<dyn RateStore>>, config: &Config) -> Self {
        Self {
            shared,
            fallback: MemoryRateStore::new(),
            degraded: AtomicBool::new(false),
            rpm_overrides: config.ratelimit.rpm_overrides.clone(),
            oauth_ip_rpm: config.ratelimit.oauth_ip_rpm,
        }
    }

    pub fn in_memory(config: &Config) -> Self {
        Self::new(None, config)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn limits_for(&self, tier: Tier) -> TierLimits {
        let mut limits = TierLimits::for_tier(tier);
        if let Some(rpm) = self.rpm_overrides.get(tier.as_str()) {
            limits.requests_per_minute = *rpm;
        }
        limits
    }

    /// Run an operation against the shared store, falling back to the
    /// per-process window when it fails.
    async fn incr(&self, key: &str, amount: u64, ttl_secs: u64) -> u64 {
        if let Some(shared) = &self.shared {
            match shared.incr_by(key, amount, ttl_secs).await {
                Ok(count) => {
                    if self.degraded.swap(false, Ordering::Relaxed) {
                        debug!("shared rate-limit store recovered");
                    }
                    return count;
                }
                Err(e) => {
                    if !self.degraded.swap(true, Ordering::Relaxed) {
                        warn!(error = %e, "shared rate-limit store unreachable, using in-memory fallback");
                        metrics::increment_counter!("gateway_ratelimit_degraded_total");
                    }
                }
            }
        }
        // The fallback store cannot fail.
        self.fallback
            .incr_by(key, amount, ttl_secs)
            .await
            .unwrap_or(u64::MAX)
    }

    async fn read(&self, key: &str) -> u64 {
        if let Some(shared) = &self.shared {
            if let Ok(count) = shared.get(key).await {
                return count;
            }
        }
        self.fallback.get(key).await.unwrap_or(0)
    }

    /// Sliding 24h credit spend: current day plus the previous day weighted
    /// by how much of it still falls inside the window.
    async fn credits_last_day(&self, user_id: &str) -> u64 {
        let now = Utc::now();
        let today = now.format("%Y-%m-%d").to_string();
        let yesterday = (now - chrono::Duration::days(1))
            .format("%Y-%m-%d")
            .to_string();

        let current = self.read(&format!("rl:cpd:{}:{}", user_id, today)).await;
        let previous = self.read(&format!("rl:cpd:{}:{}", user_id, yesterday)).await;

        let day_elapsed = (now.timestamp().rem_euclid(DAY as i64)) as f64 / DAY as f64;
        current + (previous as f64 * (1.0 - day_elapsed)) as u64
    }

    /// Admission for an authenticated inference request.
    pub async fn admit(&self, user_id: &str, tier: Tier) -> Admission {
        let limits = self.limits_for(tier);
        let now_secs = Utc::now().timestamp();
        let (window_start, window_end) = minute_window(now_secs);

        // Credits/day gate first: a user over budget gets no window slot.
        if limits.credits_per_day > 0 {
            let spent = self.credits_last_day(user_id).await;
            if spent >= limits.credits_per_day {
                return Admission::Deny {
                    retry_after_secs: (DAY as i64 - now_secs.rem_euclid(DAY as i64)) as u64,
                    limit: limits.requests_per_minute,
                    remaining: 0,
                    reset_at: window_end,
                };
            }
        }

        let key = format!("rl:rpm:{}:{}", user_id, window_start);
        let count = self.incr(&key, 1, MINUTE + 10).await;

        if count > limits.requests_per_minute {
            metrics::increment_counter!("gateway_ratelimit_denied_total");
            Admission::Deny {
                retry_after_secs: (window_end - now_secs).max(1) as u64,
                limit: limits.requests_per_minute,
                remaining: 0,
                reset_at: window_end,
            }
        } else {
            Admission::Allow {
                limit: limits.requests_per_minute,
                remaining: limits.requests_per_minute - count,
                reset_at: window_end,
            }
        }
    }

    /// IP-keyed admission for unauthenticated OAuth endpoints.
    pub async fn admit_ip(&self, ip: &str) -> Admission {
        let now_secs = Utc::now().timestamp();
        let (window_start, window_end) = minute_window(now_secs);
        let key = format!("rl:ip:{}:{}", ip, window_start);
        let count = self.incr(&key, 1, MINUTE + 10).await;

        if count > self.oauth_ip_rpm {
            Admission::Deny {
                retry_after_secs: (window_end - now_secs).max(1) as u64,
                limit: self.oauth_ip_rpm,
                remaining: 0,
                reset_at: window_end,
            }
        } else {
            Admission::Allow {
                limit: self.oauth_ip_rpm,
                remaining: self.oauth_ip_rpm - count,
                reset_at: window_end,
            }
        }
    }

    /// Record post-inference consumption for the token and credit windows.
    pub async fn record_usage(&self, user_id: &str, tokens: u64, credits: u64) {
        let now = Utc::now();
        if tokens > 0 {
            let (window_start, _) = minute_window(now.timestamp());
            let key = format!("rl:tpm:{}:{}", user_id, window_start);
            self.incr(&key, tokens, MINUTE + 10).await;
        }
        if credits > 0 {
            let day = now.format("%Y-%m-%d").to_string();
            let key = format!("rl:cpd:{}:{}", user_id, day);
            // Keep yesterday's bucket alive for the sliding window read.
            self.incr(&key, credits, DAY * 2).await;
        }
    }

    pub async fn status(&self, user_id: &str, tier: Tier) -> RateLimitStatus {
        let limits = self.limits_for(tier);
        let now_secs = Utc::now().timestamp();
        let (window_start, window_end) = minute_window(now_secs);

        let used = self
            .read(&format!("rl:rpm:{}:{}", user_id, window_start))
            .await;
        let credits_used_today = self.credits_last_day(user_id).await;

        RateLimitStatus {
            tier,
            requests_per_minute: limits.requests_per_minute,
            requests_remaining: limits.requests_per_minute.saturating_sub(used),
            reset_at: window_end,
            tokens_per_minute: limits.tokens_per_minute,
            credits_per_day: limits.credits_per_day,
            credits_used_today,
            degraded: self.is_degraded(),
        }
    }
}
