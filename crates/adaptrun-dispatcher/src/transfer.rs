//! Artifact transfer between object storage and the local scratch area.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::StorageSettings;

/// Validity window of the presigned URL carried by the reply.
pub const OUTPUT_URL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Transfer errors. None of these are retried here; retry policy belongs to
/// the dispatcher core.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("fetch from '{url}' failed: {source}")]
    Fetch { url: String, source: reqwest::Error },

    #[error("failed to write artifact to '{path}': {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("upload of '{path}' failed: {message}")]
    Upload { path: PathBuf, message: String },

    #[error("presigning output URL failed: {0}")]
    Presign(String),
}

/// Moves artifacts between object storage and the local scratch area.
#[async_trait]
pub trait ArtifactTransfer: Send + Sync {
    /// Stream the artifact behind `url` to `local_path`, creating any
    /// missing directories on the way.
    async fn fetch(&self, url: &str, local_path: &Path) -> Result<(), TransferError>;

    /// Upload the artifact at `local_path` and return a presigned URL valid
    /// for `ttl`.
    ///
    /// The local file is only guaranteed to exist if the execution unit
    /// produced output; calling this on a missing file is a documented
    /// failure mode, surfaced as [`TransferError::Upload`].
    async fn publish(&self, local_path: &Path, ttl: Duration) -> Result<String, TransferError>;
}

/// Object-storage client pair: plain HTTP for presigned downloads, S3 API
/// for uploads and presigning. Both inner clients are cheaply cloneable and
/// safe for concurrent use across in-flight requests.
#[derive(Clone)]
pub struct ArtifactStore {
    http: reqwest::Client,
    s3: aws_sdk_s3::Client,
    bucket: String,
}

impl ArtifactStore {
    pub fn new(storage: &StorageSettings) -> Self {
        let credentials = aws_sdk_s3::config::Credentials::new(
            storage.access_key.clone(),
            storage.secret_key.clone(),
            None,
            None,
            "adaptrun",
        );

        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .endpoint_url(&storage.endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            http: reqwest::Client::new(),
            s3: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: storage.source_bucket.clone(),
        }
    }
}

#[async_trait]
impl ArtifactTransfer for ArtifactStore {
    async fn fetch(&self, url: &str, local_path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).await.map_err(|source| TransferError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| TransferError::Fetch {
                url: url.to_string(),
                source,
            })?;

        let mut file = fs::File::create(local_path)
            .await
            .map_err(|source| TransferError::Io {
                path: local_path.to_path_buf(),
                source,
            })?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| TransferError::Fetch {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|source| TransferError::Io {
                    path: local_path.to_path_buf(),
                    source,
                })?;
        }

        file.flush().await.map_err(|source| TransferError::Io {
            path: local_path.to_path_buf(),
            source,
        })?;

        debug!(url = %url, path = %local_path.display(), "fetched source artifact");
        Ok(())
    }

    async fn publish(&self, local_path: &Path, ttl: Duration) -> Result<String, TransferError> {
        let key = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::Upload {
                path: local_path.to_path_buf(),
                message: "output path has no file name".to_string(),
            })?;

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| TransferError::Upload {
                path: local_path.to_path_buf(),
                message: e.to_string(),
            })?;

        self.s3
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| TransferError::Upload {
                path: local_path.to_path_buf(),
                message: e.to_string(),
            })?;

        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| TransferError::Presign(e.to_string()))?;

        let presigned = self
            .s3
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(presigning)
            .await
            .map_err(|e| TransferError::Presign(e.to_string()))?;

        debug!(key = %key, "published output artifact");
        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ArtifactStore {
        ArtifactStore::new(&StorageSettings {
            endpoint: "http://localhost:9000".to_string(),
            access_key: "minio".to_string(),
            secret_key: "miniostorage".to_string(),
            source_bucket: "source".to_string(),
        })
    }

    #[tokio::test]
    async fn test_publish_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("output").join("abc123");

        let err = store().publish(&missing, OUTPUT_URL_TTL).await.unwrap_err();
        assert!(matches!(err, TransferError::Upload { .. }));
    }

    #[tokio::test]
    async fn test_publish_rejects_path_without_file_name() {
        let err = store()
            .publish(Path::new("/"), OUTPUT_URL_TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Upload { .. }));
    }
}
