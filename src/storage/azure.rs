//! Azure Blob Storage backend using block blobs
//!
//! Blocks are staged with `Put Block` under their content-derived IDs and
//! committed with `Put Block List`. IDs are committed as `Latest`, so an ID
//! that belongs to the currently committed blob resolves without staging the
//! data again.

use super::{Metadata, ObjectStore};
use crate::error::{Error, Result};
use crate::retry::{with_retry, RetryConfig};
use async_trait::async_trait;
use azure_storage::prelude::*;
use azure_storage_blobs::prelude::*;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::env;

/// Azure Blob Storage object store
#[derive(Clone)]
pub struct AzureStore {
    service: BlobServiceClient,
    retry: RetryConfig,
}

impl AzureStore {
    /// Create a store for `account` using an access key
    pub fn new(account: String, access_key: String, retry: RetryConfig) -> Self {
        let credentials = StorageCredentials::access_key(account.clone(), access_key);
        Self {
            service: BlobServiceClient::new(account, credentials),
            retry,
        }
    }

    /// Create a store from `AZURE_STORAGE_ACCOUNT` / `AZURE_STORAGE_ACCESS_KEY`.
    /// An explicit account name takes precedence over the environment.
    pub fn from_env(account: Option<String>, retry: RetryConfig) -> Result<Self> {
        let account = match account {
            Some(account) => account,
            None => env::var("AZURE_STORAGE_ACCOUNT")
                .map_err(|_| Error::config("AZURE_STORAGE_ACCOUNT environment variable not set"))?,
        };
        let access_key = env::var("AZURE_STORAGE_ACCESS_KEY")
            .map_err(|_| Error::config("AZURE_STORAGE_ACCESS_KEY environment variable not set"))?;

        Ok(Self::new(account, access_key, retry))
    }

    fn blob(&self, container: &str, name: &str) -> BlobClient {
        self.service.container_client(container).blob_client(name)
    }

    /// Fail with a configuration error if the container is missing
    async fn require_container(&self, container: &str) -> Result<()> {
        if self.container_exists(container).await? {
            Ok(())
        } else {
            Err(Error::config(format!("container '{}' does not exist", container)))
        }
    }
}

fn is_not_found(e: &azure_core::Error) -> bool {
    let text = e.to_string();
    text.contains("404") || text.contains("NotFound") || text.contains("BlobNotFound")
}

/// Map an SDK error: 404 becomes `NotFound`, everything else is transport
fn map_error(e: azure_core::Error, what: &str, container: &str, name: &str) -> Error {
    if is_not_found(&e) {
        Error::not_found(container, name)
    } else {
        Error::transport(format!("{} {}/{}: {}", what, container, name, e))
    }
}

#[async_trait]
impl ObjectStore for AzureStore {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        let client = self.service.container_client(container);
        with_retry(&self.retry, "container_exists", || {
            let client = client.clone();
            async move {
                client
                    .exists()
                    .await
                    .map_err(|e| Error::transport(format!("checking container {}: {}", container, e)))
            }
        })
        .await
    }

    async fn object_exists(&self, container: &str, name: &str) -> Result<bool> {
        self.require_container(container).await?;
        let blob = self.blob(container, name);
        with_retry(&self.retry, "object_exists", || {
            let blob = blob.clone();
            async move {
                blob.exists()
                    .await
                    .map_err(|e| map_error(e, "checking", container, name))
            }
        })
        .await
    }

    async fn get_object_metadata(&self, container: &str, name: &str) -> Result<Metadata> {
        let blob = self.blob(container, name);
        with_retry(&self.retry, "get_object_metadata", || {
            let blob = blob.clone();
            async move {
                let props = blob
                    .get_properties()
                    .await
                    .map_err(|e| map_error(e, "reading properties of", container, name))?;
                Ok(props.blob.metadata.unwrap_or_default().into_iter().collect())
            }
        })
        .await
    }

    async fn set_object_metadata(&self, container: &str, name: &str, metadata: Metadata) -> Result<()> {
        let blob = self.blob(container, name);
        with_retry(&self.retry, "set_object_metadata", || {
            let blob = blob.clone();
            let mut sdk_metadata = azure_core::request_options::Metadata::new();
            for (key, value) in &metadata {
                sdk_metadata.insert(key.clone(), value.clone());
            }
            async move {
                blob.set_metadata(sdk_metadata)
                    .await
                    .map(|_| ())
                    .map_err(|e| map_error(e, "setting metadata of", container, name))
            }
        })
        .await
    }

    async fn put_block(&self, container: &str, name: &str, block_id: &str, data: Bytes) -> Result<()> {
        let blob = self.blob(container, name);
        with_retry(&self.retry, "put_block", || {
            let blob = blob.clone();
            let id = BlockId::new(block_id.to_string());
            let data = data.clone();
            async move {
                blob.put_block(id, data)
                    .await
                    .map(|_| ())
                    .map_err(|e| map_error(e, "staging block for", container, name))
            }
        })
        .await
    }

    async fn put_block_list(&self, container: &str, name: &str, block_ids: &[String]) -> Result<()> {
        let blob = self.blob(container, name);
        with_retry(&self.retry, "put_block_list", || {
            let blob = blob.clone();
            let list = BlockList {
                blocks: block_ids
                    .iter()
                    .map(|id| BlobBlockType::Latest(BlockId::new(id.clone())))
                    .collect(),
            };
            async move {
                blob.put_block_list(list)
                    .await
                    .map(|_| ())
                    .map_err(|e| map_error(e, "committing block list of", container, name))
            }
        })
        .await?;

        tracing::debug!(container, name, blocks = block_ids.len(), "Committed block list");
        Ok(())
    }

    async fn put_object(&self, container: &str, name: &str, data: Bytes) -> Result<()> {
        let blob = self.blob(container, name);
        with_retry(&self.retry, "put_object", || {
            let blob = blob.clone();
            let data = data.clone();
            async move {
                blob.put_block_blob(data)
                    .await
                    .map(|_| ())
                    .map_err(|e| map_error(e, "uploading", container, name))
            }
        })
        .await
    }

    async fn download_range(&self, container: &str, name: &str, begin: u64, end: u64) -> Result<Bytes> {
        let blob = self.blob(container, name);
        let data = with_retry(&self.retry, "download_range", || {
            let blob = blob.clone();
            async move {
                // The SDK may split one range into several responses
                let mut content = BytesMut::with_capacity((end - begin + 1) as usize);
                let mut responses = blob.get().range(begin..end + 1).into_stream();
                while let Some(response) = responses.next().await {
                    let response = response.map_err(|e| map_error(e, "downloading range of", container, name))?;
                    let mut body = response.data;
                    while let Some(chunk) = body.next().await {
                        let chunk = chunk.map_err(|e| map_error(e, "reading range of", container, name))?;
                        content.extend_from_slice(&chunk);
                    }
                }
                Ok(content.freeze())
            }
        })
        .await?;

        let expected = end - begin + 1;
        if data.len() as u64 != expected {
            return Err(Error::storage(format!(
                "range {}-{} of {}/{} returned {} bytes, expected {}",
                begin,
                end,
                container,
                name,
                data.len(),
                expected
            )));
        }
        Ok(data)
    }

    async fn download_full(&self, container: &str, name: &str) -> Result<Bytes> {
        let blob = self.blob(container, name);
        with_retry(&self.retry, "download_full", || {
            let blob = blob.clone();
            async move {
                blob.get_content()
                    .await
                    .map(Bytes::from)
                    .map_err(|e| map_error(e, "downloading", container, name))
            }
        })
        .await
    }
}
