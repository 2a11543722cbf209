//! Object-storage bucket lister
//!
//! The storage client itself is supplied by the caller through
//! [`ObjectLister`]; keys ending in `/` are treated as containers.

use std::sync::Arc;

use super::{ManifestEntry, ManifestSource};
use crate::error::GenerationError;

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

/// Storage client handle able to list a bucket
#[async_trait::async_trait]
pub trait ObjectLister: Send + Sync {
    /// List every object key in `bucket`
    async fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectSummary>, String>;
}

/// Manifest source over an object-storage bucket
pub struct BucketLister {
    bucket: String,
    client: Arc<dyn ObjectLister>,
}

impl BucketLister {
    pub fn new(bucket: &str, client: Arc<dyn ObjectLister>) -> Self {
        Self {
            bucket: bucket.to_string(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl ManifestSource for BucketLister {
    fn describe(&self) -> String {
        format!("bucket listing of {}", self.bucket)
    }

    async fn produce(&self) -> Result<Vec<ManifestEntry>, GenerationError> {
        let objects = self
            .client
            .list_objects(&self.bucket)
            .await
            .map_err(|reason| GenerationError::ListingFailed {
                bucket: self.bucket.clone(),
                reason,
            })?;

        Ok(objects
            .into_iter()
            .filter(|o| !o.key.is_empty())
            .map(|o| {
                if o.key.ends_with('/') {
                    ManifestEntry::container(o.key)
                } else {
                    ManifestEntry::file(o.key, o.size)
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLister(Result<Vec<ObjectSummary>, String>);

    #[async_trait::async_trait]
    impl ObjectLister for FixedLister {
        async fn list_objects(&self, _bucket: &str) -> Result<Vec<ObjectSummary>, String> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_keys_map_to_entries() {
        let lister = BucketLister::new(
            "media",
            Arc::new(FixedLister(Ok(vec![
                ObjectSummary { key: "photos/".into(), size: 0 },
                ObjectSummary { key: "photos/cat.jpg".into(), size: 2048 },
            ]))),
        );

        let entries = lister.produce().await.unwrap();
        assert_eq!(entries[0], ManifestEntry::container("/photos"));
        assert_eq!(entries[1], ManifestEntry::file("/photos/cat.jpg", 2048));
    }

    #[tokio::test]
    async fn test_listing_failure_is_generation_error() {
        let lister = BucketLister::new("media", Arc::new(FixedLister(Err("access denied".into()))));
        match lister.produce().await {
            Err(GenerationError::ListingFailed { bucket, reason }) => {
                assert_eq!(bucket, "media");
                assert_eq!(reason, "access denied");
            }
            other => panic!("unexpected result: {:?}", other.map(|e| e.len())),
        }
    }
}
