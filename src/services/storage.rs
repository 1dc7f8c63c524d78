use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use uuid::Uuid;

use crate::models::job::StageId;

/// Object storage for source images and stage candidates.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// Key of a stage candidate, e.g. `outputs/{job}/1b/attempt-2.png`.
pub fn candidate_key(job_id: Uuid, stage: StageId, attempt: i32, content_type: &str) -> String {
    format!(
        "outputs/{job_id}/{}/attempt-{attempt}.{}",
        stage.slug(),
        extension_for(content_type)
    )
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

/// Sniff the content type of encoded image bytes.
pub fn content_type_of(data: &[u8]) -> &'static str {
    match image::guess_format(data) {
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::WebP) => "image/webp",
        _ => "image/png",
    }
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

#[async_trait]
impl ImageStore for R2Client {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        if response.status_code() == 404 {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(response.to_vec())
    }
}

/// Map-backed image store for tests.
#[derive(Debug, Default)]
pub struct InMemoryImageStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

fn poison_err<T>(_: PoisonError<T>) -> StorageError {
    StorageError::Config("image store lock poisoned".to_string())
}

impl InMemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<_> = self.objects.read().map_err(poison_err)?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl ImageStore for InMemoryImageStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        self.objects
            .write()
            .map_err(poison_err)?
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .map_err(poison_err)?
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_key_layout() {
        let job_id = Uuid::nil();
        assert_eq!(
            candidate_key(job_id, StageId::Stage1B, 2, "image/jpeg"),
            "outputs/00000000-0000-0000-0000-000000000000/1b/attempt-2.jpg"
        );
        assert!(candidate_key(job_id, StageId::Stage2, 0, "application/octet-stream")
            .ends_with("/2/attempt-0.png"));
    }

    #[tokio::test]
    async fn test_in_memory_missing_key() {
        let store = InMemoryImageStore::new();
        tokio_test::assert_ok!(store.put("a", b"bytes", "image/png").await);
        assert_eq!(store.get("a").await.unwrap(), b"bytes");
        assert!(matches!(
            store.get("b").await.unwrap_err(),
            StorageError::NotFound(_)
        ));
    }
}
