use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;

use crate::config::ProviderSection;
use crate::language::Language;

use super::{DubbingProvider, JobState, JobStatus, ProviderError, ProviderResult};

pub const API_KEY_ENV: &str = "DUBCAST_PROVIDER_API_KEY";
const API_KEY_HEADER: &str = "xi-api-key";

/// ElevenLabs dubbing API client.
#[derive(Debug, Clone)]
pub struct ElevenLabsProvider {
    client: Client,
    api_base: String,
    api_key: String,
}

impl ElevenLabsProvider {
    pub fn new(client: Client, api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// The key comes from `DUBCAST_PROVIDER_API_KEY` when set, else from
    /// `api_key_path`.
    pub fn from_config(client: Client, section: &ProviderSection) -> ProviderResult<Self> {
        let api_key = match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => key.trim().to_string(),
            _ => match section.api_key_path.as_deref() {
                Some(path) => load_key(Path::new(path))?,
                None => return Err(ProviderError::MissingApiKey),
            },
        };
        Ok(Self::new(client, section.api_base.clone(), api_key))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }
}

fn load_key(path: &Path) -> ProviderResult<String> {
    let key = std::fs::read_to_string(path).map_err(|source| ProviderError::KeyFile {
        path: path.to_path_buf(),
        source,
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ProviderError::MissingApiKey);
    }
    Ok(key.to_string())
}

async fn checked(response: Response) -> ProviderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        body,
    })
}

#[derive(Debug, Deserialize)]
struct CreateDubbingResponse {
    #[serde(alias = "dubbingId")]
    dubbing_id: String,
}

#[derive(Debug, Deserialize)]
struct DubbingMetadata {
    #[serde(alias = "dubbingId")]
    dubbing_id: String,
    status: String,
    #[serde(default, alias = "targetLanguages")]
    target_languages: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

impl From<DubbingMetadata> for JobState {
    fn from(meta: DubbingMetadata) -> Self {
        let status = match meta.status.as_str() {
            "dubbed" => JobStatus::Completed,
            "failed" => JobStatus::Failed(meta.error),
            _ => JobStatus::InProgress,
        };
        JobState {
            job_id: meta.dubbing_id,
            status,
            target_languages: meta.target_languages,
        }
    }
}

#[async_trait]
impl DubbingProvider for ElevenLabsProvider {
    async fn submit(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        language: &Language,
    ) -> ProviderResult<String> {
        let part = Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str("audio/mp4")?;
        let form = Form::new()
            .part("file", part)
            .text("target_lang", language.as_str().to_string());
        let response = self
            .client
            .post(self.url("/v1/dubbing"))
            .header(API_KEY_HEADER, &self.api_key)
            .multipart(form)
            .send()
            .await?;
        let created: CreateDubbingResponse = checked(response).await?.json().await?;
        Ok(created.dubbing_id)
    }

    async fn poll(&self, job_id: &str) -> ProviderResult<JobState> {
        let response = self
            .client
            .get(self.url(&format!("/v1/dubbing/{job_id}")))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let meta: DubbingMetadata = checked(response).await?.json().await?;
        Ok(meta.into())
    }

    async fn fetch_audio(&self, job_id: &str, language: &Language) -> ProviderResult<Vec<u8>> {
        let response = self
            .client
            .get(self.url(&format!("/v1/dubbing/{job_id}/audio/{}", language.as_str())))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let bytes = checked(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}
