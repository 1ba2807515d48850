use crate::metrics;
use crate::models::RetailerLink;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};
use urlencoding::encode;

pub const DEFAULT_FALLBACK_TEMPLATE: &str = "https://source.unsplash.com/300x400/?fashion,{query}";

#[derive(Debug, Clone)]
pub struct OpenGraphConfig {
    pub base_url: String,
    pub app_id: Option<String>,
}

impl Default for OpenGraphConfig {
    fn default() -> Self {
        Self {
            base_url: "https://opengraph.io/api/1.1".into(),
            app_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreviewConfig {
    pub timeout: Duration,
    pub concurrency: usize,
    pub fallback_template: String,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            concurrency: 1,
            fallback_template: DEFAULT_FALLBACK_TEMPLATE.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("metadata lookup disabled")]
    Disabled,
    #[error("request failed: {0}")]
    Http(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("no preview image")]
    MissingImage,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl PreviewError {
    pub fn reason(&self) -> &'static str {
        match self {
            PreviewError::Disabled => "disabled",
            PreviewError::Http(_) => "http",
            PreviewError::Status(_) => "status",
            PreviewError::InvalidResponse(_) => "invalid_response",
            PreviewError::MissingImage => "missing_image",
            PreviewError::Timeout(_) => "timeout",
        }
    }
}

/// Link-metadata lookup. `Ok(None)` means the service answered but had no
/// image for the page.
#[async_trait]
pub trait LinkMetadata: Send + Sync {
    async fn preview_image(&self, url: &str) -> Result<Option<String>, PreviewError>;
}

pub struct OpenGraphClient {
    http: Client,
    base_url: String,
    app_id: String,
}

impl OpenGraphClient {
    /// `None` when no app id is configured; previews then always fall back.
    pub fn from_config(http: Client, config: &OpenGraphConfig) -> Option<Self> {
        let app_id = config.app_id.clone()?;
        Some(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_id,
        })
    }
}

#[async_trait]
impl LinkMetadata for OpenGraphClient {
    async fn preview_image(&self, url: &str) -> Result<Option<String>, PreviewError> {
        let endpoint = format!("{}/site/{}", self.base_url, encode(url));
        let response = self
            .http
            .get(endpoint)
            .query(&[("app_id", self.app_id.as_str())])
            .send()
            .await
            .map_err(|err| PreviewError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(PreviewError::Status(response.status().as_u16()));
        }

        let payload: SiteResponse = response
            .json()
            .await
            .map_err(|err| PreviewError::InvalidResponse(err.to_string()))?;
        Ok(payload.hybrid_graph.and_then(|graph| graph.image))
    }
}

#[derive(Debug, Deserialize)]
struct SiteResponse {
    #[serde(rename = "hybridGraph", default)]
    hybrid_graph: Option<HybridGraph>,
}

#[derive(Debug, Deserialize)]
struct HybridGraph {
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewSource {
    Live,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub url: String,
    pub source: PreviewSource,
}

#[derive(Clone)]
pub struct PreviewResolver {
    metadata: Option<Arc<dyn LinkMetadata>>,
    fallback_template: String,
    timeout: Duration,
}

impl PreviewResolver {
    pub fn new(metadata: Option<Arc<dyn LinkMetadata>>, config: &PreviewConfig) -> Self {
        Self {
            metadata,
            fallback_template: config.fallback_template.clone(),
            timeout: config.timeout,
        }
    }

    /// Always yields a displayable image URL. Lookup failures are logged and
    /// replaced with the placeholder for the link's item text.
    pub async fn resolve(&self, link: &RetailerLink) -> Preview {
        match self.lookup(&link.url).await {
            Ok(image) => {
                debug!(target = "outfit.preview", url = %link.url, image = %image, "preview_resolved");
                Preview {
                    url: image,
                    source: PreviewSource::Live,
                }
            }
            Err(err) => {
                let url = fallback_preview(&self.fallback_template, link.item.as_str());
                match err {
                    PreviewError::Disabled => {
                        debug!(target = "outfit.preview", url = %link.url, "preview_lookup_disabled")
                    }
                    _ => warn!(
                        target = "outfit.preview",
                        url = %link.url,
                        retailer = %link.retailer,
                        error = %err,
                        "preview_lookup_failed"
                    ),
                }
                metrics::preview_fallback(link.retailer, err.reason());
                Preview {
                    url,
                    source: PreviewSource::Fallback,
                }
            }
        }
    }

    async fn lookup(&self, url: &str) -> Result<String, PreviewError> {
        let metadata = self.metadata.as_ref().ok_or(PreviewError::Disabled)?;
        let image = tokio::time::timeout(self.timeout, metadata.preview_image(url))
            .await
            .map_err(|_| PreviewError::Timeout(self.timeout))??;
        image
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(PreviewError::MissingImage)
    }
}

/// Placeholder keyed only by item text, so every retailer link for the same
/// item falls back to the same image.
pub fn fallback_preview(template: &str, item_text: &str) -> String {
    template.replace("{query}", &encode(item_text))
}
