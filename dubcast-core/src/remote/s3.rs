use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::types::MetadataDirective;
use aws_sdk_s3::Client;
use tracing::debug;

use crate::config::StorageSection;

use super::{ObjectMetadata, ObjectStore, RemoteError, RemoteResult};

/// S3-compatible object store.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub async fn from_config(section: &StorageSection) -> RemoteResult<Self> {
        if section.bucket.trim().is_empty() {
            return Err(RemoteError::Config("bucket name cannot be empty".into()));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(section.region.clone()));
        if let (Some(key_id), Some(secret)) = (&section.access_key_id, &section.secret_access_key)
        {
            let credentials = Credentials::new(key_id, secret, None, None, "dubcast-storage");
            loader = loader.credentials_provider(credentials);
        }
        if let Some(endpoint) = &section.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(section.endpoint_url.is_some())
            .build();
        Ok(Self::new(Client::from_conf(config), section.bucket.clone()))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> RemoteResult<Option<Vec<u8>>> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key())
                {
                    return Ok(None);
                }
                return Err(RemoteError::storage(key, DisplayErrorContext(&err).to_string()));
            }
        };
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|err| RemoteError::storage(key, err.to_string()))?;
        Ok(Some(bytes.into_bytes().to_vec()))
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        cache_control: &str,
    ) -> RemoteResult<()> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body.into())
            .content_type(content_type)
            .cache_control(cache_control)
            .send()
            .await
            .map_err(|err| RemoteError::storage(key, DisplayErrorContext(&err).to_string()))?;
        debug!(bucket = %self.bucket, key, size, "put object");
        Ok(())
    }

    async fn exists(&self, key: &str) -> RemoteResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_not_found())
                {
                    Ok(false)
                } else {
                    Err(RemoteError::storage(key, DisplayErrorContext(&err).to_string()))
                }
            }
        }
    }

    async fn copy(
        &self,
        source_key: &str,
        dest_key: &str,
        metadata: Option<&ObjectMetadata>,
    ) -> RemoteResult<()> {
        let mut request = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(dest_key)
            .copy_source(format!("{}/{}", self.bucket, source_key));
        if let Some(metadata) = metadata {
            request = request
                .metadata_directive(MetadataDirective::Replace)
                .content_type(&metadata.content_type)
                .cache_control(&metadata.cache_control);
        }
        request
            .send()
            .await
            .map_err(|err| RemoteError::storage(dest_key, DisplayErrorContext(&err).to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> RemoteResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| RemoteError::storage(key, DisplayErrorContext(&err).to_string()))?;
        Ok(())
    }
}
