//! Versioned S3 bucket

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;

use super::ObjectStore;
use crate::error::{GrafanaLambdaError, Result};

/// S3 bucket with versioning enabled
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(config: &SdkConfig, bucket: impl Into<String>) -> Self {
        Self {
            client: S3Client::new(config),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str, version: Option<&str>) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_version_id(version.map(String::from))
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key()
                    || service_error.code() == Some("NoSuchVersion")
                {
                    GrafanaLambdaError::ObjectMissing {
                        key: key.to_string(),
                        version: version.map(String::from),
                    }
                } else {
                    GrafanaLambdaError::Store(service_error.to_string())
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| GrafanaLambdaError::Store(e.to_string()))?
            .into_bytes();

        tracing::debug!(
            "Downloaded {} bytes from s3://{}/{}",
            data.len(),
            self.bucket,
            key
        );
        Ok(data.to_vec())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<String> {
        let size = body.len();
        let response = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| GrafanaLambdaError::Store(e.into_service_error().to_string()))?;

        let version = response.version_id().ok_or_else(|| {
            GrafanaLambdaError::Store(format!(
                "s3://{} returned no version id; bucket versioning must be enabled",
                self.bucket
            ))
        })?;

        tracing::debug!("Uploaded {} bytes to s3://{}/{}", size, self.bucket, key);
        Ok(version.to_string())
    }
}
