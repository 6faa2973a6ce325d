use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use crate::config::CdnSection;

use super::{CdnInvalidator, RemoteError, RemoteResult};

/// Purges URLs through the zone `purge_cache` endpoint of the CDN API.
#[derive(Debug, Clone)]
pub struct HttpCdnPurger {
    client: Client,
    api_base: String,
    zone_id: String,
    api_token_path: PathBuf,
}

impl HttpCdnPurger {
    pub fn new(
        client: Client,
        api_base: impl Into<String>,
        zone_id: impl Into<String>,
        api_token_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            zone_id: zone_id.into(),
            api_token_path: api_token_path.into(),
        }
    }

    /// `None` when the section is disabled or incomplete.
    pub fn from_config(client: Client, section: &CdnSection) -> Option<Self> {
        if !section.enabled {
            return None;
        }
        let api_base = section.api_base.as_deref().filter(|v| !v.is_empty())?;
        let zone_id = section.zone_id.as_deref().filter(|v| !v.is_empty())?;
        let token_path = section.api_token_path.as_deref().filter(|v| !v.is_empty())?;
        Some(Self::new(client, api_base, zone_id, token_path))
    }

    fn load_token(&self) -> RemoteResult<String> {
        let token = fs::read_to_string(&self.api_token_path)
            .map_err(|_| RemoteError::MissingToken(self.api_token_path.clone()))?;
        Ok(token.trim().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct PurgeResponse {
    success: bool,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[async_trait]
impl CdnInvalidator for HttpCdnPurger {
    async fn invalidate(&self, urls: &[String]) -> RemoteResult<()> {
        let token = self.load_token()?;
        let url = format!("{}/zones/{}/purge_cache", self.api_base, self.zone_id);
        let response: PurgeResponse = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "files": urls }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !response.success {
            return Err(RemoteError::Config(format!(
                "purge rejected: {}",
                serde_json::Value::from(response.errors)
            )));
        }
        Ok(())
    }
}

/// Stand-in when no CDN is configured.
#[derive(Debug, Clone, Default)]
pub struct NoopInvalidator;

#[async_trait]
impl CdnInvalidator for NoopInvalidator {
    async fn invalidate(&self, urls: &[String]) -> RemoteResult<()> {
        warn!(count = urls.len(), "cdn not configured; skipping invalidation");
        Ok(())
    }
}
