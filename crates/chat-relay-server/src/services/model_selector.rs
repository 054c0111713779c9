use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::completion_client::UpstreamError;
use crate::config::{ModelConfig, UpstreamConfig};

pub const TRAIT_MOST_INTELLIGENT: &str = "most_intelligent";
pub const TRAIT_DEFAULT: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    pub id: String,
    #[serde(default)]
    pub traits: BTreeSet<String>,
}

impl ModelCatalogEntry {
    pub fn has_trait(&self, name: &str) -> bool {
        self.traits.contains(name)
    }
}

/// Source of the upstream model catalog.
#[async_trait::async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn fetch_catalog(&self) -> Result<Vec<ModelCatalogEntry>, UpstreamError>;
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    data: Vec<ModelCatalogEntry>,
}

/// GET client for the provider's model listing.
#[derive(Clone)]
pub struct CatalogClient {
    client: Client,
    url: String,
    api_key: String,
}

impl CatalogClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.catalog_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            url: config.catalog_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait::async_trait]
impl CatalogProvider for CatalogClient {
    async fn fetch_catalog(&self) -> Result<Vec<ModelCatalogEntry>, UpstreamError> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let catalog: CatalogResponse = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::MalformedBody(e.to_string()))?;
        Ok(catalog.data)
    }
}

/// Preference chain: configured id present in the catalog, first
/// `most_intelligent`, first `default`, then the hardcoded fallback.
pub fn select_model(catalog: &[ModelCatalogEntry], preferred: Option<&str>, fallback: &str) -> String {
    if let Some(preferred) = preferred {
        if catalog.iter().any(|entry| entry.id == preferred) {
            return preferred.to_string();
        }
    }

    catalog
        .iter()
        .find(|entry| entry.has_trait(TRAIT_MOST_INTELLIGENT))
        .or_else(|| catalog.iter().find(|entry| entry.has_trait(TRAIT_DEFAULT)))
        .map(|entry| entry.id.clone())
        .unwrap_or_else(|| fallback.to_string())
}

#[derive(Debug, Clone)]
struct Selection {
    model_id: String,
    catalog: Vec<ModelCatalogEntry>,
    resolved_at: Instant,
    valid_for: Duration,
}

impl Selection {
    fn is_fresh(&self) -> bool {
        self.resolved_at.elapsed() < self.valid_for
    }
}

/// Resolves and caches the upstream model id.
///
/// The cache slot is an async mutex held across the catalog fetch, so callers
/// arriving while a fetch is in flight wait for it and reuse its result
/// instead of issuing their own request.
pub struct ModelSelector {
    catalog: Arc<dyn CatalogProvider>,
    preferred: Option<String>,
    fallback_id: String,
    catalog_ttl: Duration,
    failure_backoff: Duration,
    slot: Mutex<Option<Selection>>,
}

impl ModelSelector {
    pub fn new(catalog: Arc<dyn CatalogProvider>, config: &ModelConfig) -> Self {
        Self {
            catalog,
            preferred: config.preferred.clone().filter(|id| !id.trim().is_empty()),
            fallback_id: config.fallback_id.clone(),
            catalog_ttl: config.catalog_ttl(),
            failure_backoff: config.failure_backoff(),
            slot: Mutex::new(None),
        }
    }

    /// Never fails: catalog problems degrade to the hardcoded fallback id.
    pub async fn resolve(&self) -> String {
        let mut slot = self.slot.lock().await;
        if let Some(selection) = slot.as_ref().filter(|s| s.is_fresh()) {
            return selection.model_id.clone();
        }

        let (catalog, valid_for) = match self.catalog.fetch_catalog().await {
            Ok(catalog) => {
                info!("Fetched model catalog with {} entries", catalog.len());
                (catalog, self.catalog_ttl)
            }
            Err(e) => {
                warn!(
                    "Model catalog fetch failed, using fallback chain on empty catalog: {}",
                    e
                );
                (Vec::new(), self.failure_backoff)
            }
        };

        let model_id = select_model(&catalog, self.preferred.as_deref(), &self.fallback_id);
        debug!(model = %model_id, "Resolved upstream model");

        *slot = Some(Selection {
            model_id: model_id.clone(),
            catalog,
            resolved_at: Instant::now(),
            valid_for,
        });
        model_id
    }

    /// Catalog from the current epoch, if any.
    pub async fn cached_catalog(&self) -> Option<Vec<ModelCatalogEntry>> {
        self.slot
            .lock()
            .await
            .as_ref()
            .filter(|s| s.is_fresh())
            .map(|s| s.catalog.clone())
    }

    /// Forget the cached selection so the next `resolve` fetches again.
    pub async fn reset(&self) {
        *self.slot.lock().await = None;
    }
}
