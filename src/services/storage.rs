use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::time::Duration;

/// Expiry applied to every image link handed to the alert receiver.
pub const PRESIGN_EXPIRY: Duration = Duration::from_secs(6 * 60 * 60);

/// Produces time-limited, self-authenticating GET links for stored objects.
#[async_trait]
pub trait Presigner: Send + Sync {
    async fn presign_get(&self, key: &str, expiry: Duration) -> Result<String, StorageError>;
}

/// Client for the S3-compatible image store (Wasabi).
pub struct ObjectStore {
    bucket: Box<Bucket>,
}

impl ObjectStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }

    pub fn bucket_name(&self) -> String {
        self.bucket.name()
    }
}

#[async_trait]
impl Presigner for ObjectStore {
    async fn presign_get(&self, key: &str, expiry: Duration) -> Result<String, StorageError> {
        let expiry_secs = u32::try_from(expiry.as_secs())
            .map_err(|_| StorageError::Config(format!("presign expiry too large: {:?}", expiry)))?;

        let url = self
            .bucket
            .presign_get(key, expiry_secs, None)
            .await
            .map_err(StorageError::S3)?;
        Ok(url)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
