//! Model registry: catalog reads through a 5-minute in-process cache with
//! explicit invalidation. Staleness within the TTL is acceptable because
//! lifecycle flags are not security-critical.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::{
    AccessStatus, GatewayError, LegacyInfo, ModelRecord, Provider, Result, Tier,
};
use crate::storage::ModelStore;

pub const CACHE_TTL: Duration = Duration::from_secs(300);

/// Listing filters for `/v1/models`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelFilter {
    pub available: Option<bool>,
    pub capability: Option<String>,
    pub provider: Option<Provider>,
    /// Admin only; enforced by the handler.
    #[serde(default, alias = "includeArchived")]
    pub include_archived: bool,
}

/// A catalog entry decorated with the caller's access verdict.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelListing {
    #[serde(flatten)]
    pub model: ModelRecord,
    pub access_status: AccessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_info: Option<LegacyInfo>,
}

struct CacheEntry {
    model: Option<ModelRecord>,
    fetched_at: Instant,
}

pub struct ModelRegistry {
    store: Arc<dyn ModelStore>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    list_cache: RwLock<Option<(Vec<ModelRecord>, Instant)>>,
    ttl: Duration,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn ModelStore>) -> Self {
        Self::with_ttl(store, CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn ModelStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            list_cache: RwLock::new(None),
            ttl,
        }
    }

    /// Fetch a model through the cache; negative results are cached too so a
    /// storm of unknown-model requests stays off the database.
    pub async fn get(&self, model_id: &str) -> Result<Option<ModelRecord>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(model_id) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.model.clone());
                }
            }
        }

        let model = self.store.get(model_id).await?;
        let mut cache = self.cache.write().await;
        cache.insert(
            model_id.to_string(),
            CacheEntry {
                model: model.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(model)
    }

    /// Fetch a model and require it to exist.
    pub async fn require(&self, model_id: &str) -> Result<ModelRecord> {
        self.get(model_id)
            .await?
            .ok_or_else(|| GatewayError::ModelNotFound(model_id.to_string()))
    }

    /// Public listing. Archived models only appear when the (admin-gated)
    /// `include_archived` filter asks for them.
    pub async fn list(&self, filter: &ModelFilter, user_tier: Tier) -> Result<Vec<ModelListing>> {
        let models = self.list_all().await?;

        let listings = models
            .into_iter()
            .filter(|m| filter.include_archived || !m.is_archived)
            .filter(|m| filter.available.map_or(true, |a| m.is_available == a))
            .filter(|m| filter.provider.map_or(true, |p| m.provider == p))
            .filter(|m| {
                filter
                    .capability
                    .as_deref()
                    .map_or(true, |c| m.supports(c))
            })
            .map(|model| {
                let access_status = model.access_status(user_tier);
                let legacy_info = model.legacy_info();
                ModelListing {
                    model,
                    access_status,
                    legacy_info,
                }
            })
            .collect();

        Ok(listings)
    }

    async fn list_all(&self) -> Result<Vec<ModelRecord>> {
        {
            let cache = self.list_cache.read().await;
            if let Some((models, fetched_at)) = cache.as_ref() {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(models.clone());
                }
            }
        }

        let models = self.store.list(true).await?;
        let mut cache = self.list_cache.write().await;
        *cache = Some((models.clone(), Instant::now()));
        Ok(models)
    }

    /// Drop one cached model (admin write path calls this).
    pub async fn invalidate(&self, model_id: &str) {
        self.cache.write().await.remove(model_id);
        *self.list_cache.write().await = None;
        debug!(model_id, "model cache invalidated");
    }

    /// Drop everything cached.
    pub async fn refresh(&self) {
        self.cache.write().await.clear();
        *self.list_cache.write().await = None;
    }
}
